use crate::error::CalibanError;
use std::collections::BTreeMap;
use std::io;
use std::path::Path;
use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

pub trait CommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error>;
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        env_overrides: &BTreeMap<String, String>,
        capture_output: bool,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(cwd);
        for (key, value) in env_overrides {
            cmd.env(key, value);
        }
        if capture_output {
            let output = cmd.output()?;
            let status_code =
                output
                    .status
                    .code()
                    .unwrap_or(if output.status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            let status = cmd.status()?;
            let status_code = status
                .code()
                .unwrap_or(if status.success() { 0 } else { 1 });
            Ok(CommandOutput {
                status_code,
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }
}

pub fn render_command(program: &str, args: &[String]) -> String {
    let mut parts = vec![program.to_string()];
    for arg in args {
        if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
            parts.push(format!("'{}'", arg.replace('\'', r"'\''")));
        } else {
            parts.push(arg.clone());
        }
    }
    parts.join(" ")
}

fn failure_hint(program: &str, stderr: &str) -> Option<String> {
    let lower = stderr.to_lowercase();
    if lower.contains("denied") || lower.contains("unauthorized") || lower.contains("authentication")
    {
        return Some(match program {
            "docker" => "authenticate with `gcloud auth configure-docker` for gcr.io images"
                .to_string(),
            _ => "authenticate with `gcloud auth login`".to_string(),
        });
    }
    if program == "docker" && lower.contains("cannot connect to the docker daemon") {
        return Some("start the docker daemon and try again".to_string());
    }
    None
}

pub fn execute<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[String],
    cwd: &Path,
    env_overrides: &BTreeMap<String, String>,
    capture_output: bool,
) -> Result<CommandOutput, CalibanError> {
    let command = render_command(program, args);
    debug!(%command, "running");
    let cmd_output = runner
        .run(program, args, cwd, env_overrides, capture_output)
        .map_err(|err| {
            let mut message = format!("failed to run command `{command}`: {err}");
            if err.kind() == io::ErrorKind::NotFound {
                message = format!("{message}\nHint: `{program}` was not found on PATH");
            }
            CalibanError::Process(message)
        })?;
    if !cmd_output.success() {
        let stderr = String::from_utf8_lossy(&cmd_output.stderr)
            .trim()
            .to_string();
        let mut message = format!(
            "command failed with status {} while running `{}`",
            cmd_output.status_code, command
        );
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        if let Some(hint) = failure_hint(program, &stderr) {
            message = format!("{message}\nHint: {hint}");
        }
        return Err(CalibanError::Process(message));
    }
    Ok(cmd_output)
}
