mod cli;
mod config;
mod docker;
mod error;
mod experiment;
mod history;
mod interrupt;
mod job;
mod launcher;
mod output;
mod resources;
mod router;
mod runner;

use clap::Parser;
use cli::{build_context, Cli};
use docker::DockerBackend;
use error::CalibanError;
use interrupt::{Interrupt, INTERRUPTED_EXIT_CODE};
use output::{output, print_json, JsonResult};
use runner::SystemRunner;
use std::io;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_ENV: &str = "CALIBAN_LOG";

fn init_tracing(verbose: u8) {
    let env_filter = match verbose {
        0 => EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("caliban=warn")),
        1 => EnvFilter::new("caliban=info"),
        _ => EnvFilter::new("caliban=debug"),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_target(false),
        )
        .init();
}

fn run(cli: Cli, interrupt: Interrupt) -> Result<(), CalibanError> {
    let ctx = build_context(&cli)?;
    let backend = DockerBackend::new(SystemRunner, &ctx).with_interrupt(interrupt);
    let payload = router::dispatch(&ctx, cli.command, &backend)?;
    output(&ctx, payload)
}

fn exit_code(err: &CalibanError, interrupt: &Interrupt) -> i32 {
    if matches!(err, CalibanError::Interrupted) || interrupt.is_set() {
        INTERRUPTED_EXIT_CODE
    } else {
        1
    }
}

fn main() -> Result<(), CalibanError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json = cli.json;
    let interrupt = Interrupt::register().unwrap_or_else(|err| {
        warn!(error = %err, "failed to register signal handlers");
        Interrupt::default()
    });

    if let Err(err) = run(cli, interrupt.clone()) {
        if json {
            print_json(&JsonResult::failure(&err))?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(exit_code(&err, &interrupt));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupted_runs_exit_130() {
        let interrupt = Interrupt::default();
        assert_eq!(exit_code(&CalibanError::Interrupted, &interrupt), 130);
        let failed = CalibanError::Process("docker exited".to_string());
        assert_eq!(exit_code(&failed, &interrupt), 1);
        interrupt.raise();
        assert_eq!(exit_code(&failed, &interrupt), 130);
    }
}
