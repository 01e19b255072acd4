use crate::config::{caliban_home, resolve_config_path};
use crate::error::CalibanError;
use crate::resources::ResourceRoot;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::env;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "caliban", version, about = "Run experiments in docker containers")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub json: bool,
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    #[command(flatten)]
    Job(JobCommand),
    Cluster {
        #[arg(long = "project_id", global = true)]
        project_id: Option<String>,
        #[command(subcommand)]
        command: ClusterCommand,
    },
    #[command(external_subcommand)]
    External(Vec<String>),
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum JobCommand {
    Shell {
        #[command(flatten)]
        job: JobArgs,
        #[arg(long)]
        bare: bool,
        #[arg(long, value_enum, default_value_t = Shell::Bash)]
        shell: Shell,
        #[arg(long = "image_id")]
        image_id: Option<String>,
    },
    Notebook {
        #[command(flatten)]
        job: JobArgs,
        #[arg(long)]
        bare: bool,
        #[arg(short, long, default_value_t = 8888)]
        port: u16,
        #[arg(long)]
        lab: bool,
        #[arg(long = "jupyter_version")]
        jupyter_version: Option<String>,
    },
    Build {
        #[command(flatten)]
        job: JobArgs,
        module: String,
    },
    Status {
        #[arg(long)]
        xgroup: Option<String>,
        #[arg(long = "max_jobs", default_value_t = 8)]
        max_jobs: usize,
    },
    Stop {
        #[arg(long)]
        xgroup: Option<String>,
        #[arg(long = "dry_run")]
        dry_run: bool,
    },
    Resubmit {
        #[arg(long)]
        xgroup: Option<String>,
        #[arg(long = "dry_run")]
        dry_run: bool,
        #[arg(long = "all_jobs")]
        all_jobs: bool,
    },
    Run {
        #[command(flatten)]
        job: JobArgs,
        module: String,
        #[arg(long = "dry_run")]
        dry_run: bool,
        #[arg(long = "image_id")]
        image_id: Option<String>,
        #[arg(long = "experiment_config")]
        experiment_config: Option<PathBuf>,
        #[arg(long)]
        xgroup: Option<String>,
        #[arg(last = true)]
        script_args: Vec<String>,
    },
    Cloud {
        #[command(flatten)]
        job: JobArgs,
        module: String,
        #[arg(long = "dry_run")]
        dry_run: bool,
        #[arg(long = "project_id")]
        project_id: Option<String>,
        #[arg(long)]
        region: Option<String>,
        #[arg(long = "cloud_key")]
        cloud_key: Option<String>,
        #[arg(long = "image_tag")]
        image_tag: Option<String>,
        #[arg(long = "experiment_config")]
        experiment_config: Option<PathBuf>,
        #[arg(long)]
        xgroup: Option<String>,
        #[arg(long = "tpu_spec")]
        tpu_spec: Option<String>,
        #[arg(last = true)]
        script_args: Vec<String>,
    },
}

#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct JobArgs {
    #[arg(long)]
    pub nogpu: bool,
    #[arg(short = 'd', long = "dir")]
    pub dirs: Vec<String>,
    #[arg(long)]
    pub extras: Vec<String>,
    #[arg(long = "no_cache")]
    pub no_cache: bool,
    #[arg(long = "docker_run_args")]
    pub docker_run_args: Option<String>,
}

impl JobArgs {
    pub fn run_args(&self) -> Vec<String> {
        self.docker_run_args
            .as_deref()
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

impl JobCommand {
    pub fn name(&self) -> &'static str {
        match self {
            JobCommand::Shell { .. } => "shell",
            JobCommand::Notebook { .. } => "notebook",
            JobCommand::Build { .. } => "build",
            JobCommand::Status { .. } => "status",
            JobCommand::Stop { .. } => "stop",
            JobCommand::Resubmit { .. } => "resubmit",
            JobCommand::Run { .. } => "run",
            JobCommand::Cloud { .. } => "cloud",
        }
    }

    pub fn job_args(&self) -> Option<&JobArgs> {
        match self {
            JobCommand::Shell { job, .. }
            | JobCommand::Notebook { job, .. }
            | JobCommand::Build { job, .. }
            | JobCommand::Run { job, .. }
            | JobCommand::Cloud { job, .. } => Some(job),
            JobCommand::Status { .. } | JobCommand::Stop { .. } | JobCommand::Resubmit { .. } => {
                None
            }
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    Bash,
    Zsh,
}

impl Shell {
    pub fn executable(&self) -> &'static str {
        match self {
            Shell::Bash => "/bin/bash",
            Shell::Zsh => "/bin/zsh",
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ClusterCommand {
    Ls,
    PodLs,
    JobLs,
}

#[derive(Debug, Clone)]
pub struct Context {
    pub config_path: PathBuf,
    pub build_path: PathBuf,
    pub caliban_home: PathBuf,
    pub resources: ResourceRoot,
    pub json: bool,
}

impl Context {
    pub fn history_path(&self) -> PathBuf {
        self.caliban_home.join("history.json")
    }
}

pub fn build_context(cli: &Cli) -> Result<Context, CalibanError> {
    let build_path = env::current_dir()?;
    let config_path = resolve_config_path(cli.config.as_ref(), &build_path);
    Ok(Context {
        config_path,
        build_path,
        caliban_home: caliban_home(),
        resources: ResourceRoot::from_env(),
        json: cli.json,
    })
}
