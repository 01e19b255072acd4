use crate::cli::Context;
use crate::error::CalibanError;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct JsonResult<T: Serialize> {
    pub ok: bool,
    pub result: Option<T>,
    pub error: Option<String>,
}

impl JsonResult<Value> {
    pub fn failure(error: &CalibanError) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

pub fn output(ctx: &Context, payload: Value) -> Result<(), CalibanError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", human(&payload));
    }
    Ok(())
}

pub fn print_json<T: Serialize>(payload: &T) -> Result<(), CalibanError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

fn human(payload: &Value) -> String {
    match payload.get("stdout").and_then(Value::as_str) {
        Some(stdout) => stdout.to_string(),
        None => serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string()),
    }
}
