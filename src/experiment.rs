use crate::error::CalibanError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub type Experiment = BTreeMap<String, Value>;

pub fn load_experiment_config(path: &Path) -> Result<Value, CalibanError> {
    let content = fs::read_to_string(path).map_err(|err| {
        CalibanError::Config(format!(
            "cannot read experiment config {}: {err}",
            path.display()
        ))
    })?;
    let value: Value = serde_json::from_str(&content)?;
    // Reject malformed configs before any backend runs.
    expand_experiment_config(&value)?;
    Ok(value)
}

pub fn expand_experiment_config(value: &Value) -> Result<Vec<Experiment>, CalibanError> {
    match value {
        Value::Object(map) => Ok(expand_object(map)),
        Value::Array(items) => {
            let mut experiments = Vec::new();
            for item in items {
                match item {
                    Value::Object(map) => experiments.extend(expand_object(map)),
                    other => {
                        return Err(CalibanError::Config(format!(
                            "experiment config entries must be objects, got {other}"
                        )))
                    }
                }
            }
            Ok(experiments)
        }
        other => Err(CalibanError::Config(format!(
            "experiment config must be an object or a list of objects, got {other}"
        ))),
    }
}

fn expand_object(map: &serde_json::Map<String, Value>) -> Vec<Experiment> {
    let mut expanded = vec![Experiment::new()];
    for (key, value) in map {
        let options = match value {
            Value::Array(items) => items.clone(),
            other => vec![other.clone()],
        };
        expanded = expanded
            .into_iter()
            .flat_map(|base| {
                options.iter().map(move |option| {
                    let mut next = base.clone();
                    next.insert(key.clone(), option.clone());
                    next
                })
            })
            .collect();
    }
    expanded
}

pub fn experiment_to_args(experiment: &Experiment) -> Vec<String> {
    let mut args = Vec::new();
    for (key, value) in experiment {
        match value {
            Value::Bool(true) => args.push(format!("--{key}")),
            Value::Bool(false) | Value::Null => {}
            other => {
                args.push(format!("--{key}"));
                args.push(value_to_arg(other));
            }
        }
    }
    args
}

pub fn value_to_arg(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
