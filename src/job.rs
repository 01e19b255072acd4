use crate::cli::{Context, JobCommand};
use crate::config::{read_caliban_config, BaseImage, CalibanConfig};
use crate::error::CalibanError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const CPU_BASE_IMAGE: &str = "gcr.io/blueshift-playground/blueshift:cpu";
const GPU_BASE_IMAGE: &str = "gcr.io/blueshift-playground/blueshift:gpu";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    Cpu,
    Gpu,
    Tpu,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Cpu => "cpu",
            JobMode::Gpu => "gpu",
            JobMode::Tpu => "tpu",
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, JobMode::Gpu)
    }

    pub fn is_tpu(&self) -> bool {
        matches!(self, JobMode::Tpu)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Platform {
    Local,
    Cloud,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Local => "LOCAL",
            Platform::Cloud => "CLOUD",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DockerArgs {
    pub build_path: PathBuf,
    pub base_image: String,
    pub extra_dirs: Vec<String>,
    pub setup_extras: Vec<String>,
    pub no_cache: bool,
    pub requirements_path: Option<PathBuf>,
    pub conda_env_path: Option<PathBuf>,
    pub setup_path: Option<PathBuf>,
    pub caliban_config: CalibanConfig,
}

pub fn resolve_job_mode(command: &JobCommand) -> JobMode {
    if let JobCommand::Cloud {
        tpu_spec: Some(_), ..
    } = command
    {
        return JobMode::Tpu;
    }
    match command.job_args() {
        Some(job) if job.nogpu => JobMode::Cpu,
        _ => JobMode::Gpu,
    }
}

pub fn generate_docker_args(
    mode: JobMode,
    command: &JobCommand,
    ctx: &Context,
) -> Result<DockerArgs, CalibanError> {
    let caliban_config = read_caliban_config(&ctx.config_path)?;
    let (extra_dirs, setup_extras, no_cache) = match command.job_args() {
        Some(job) => (job.dirs.clone(), job.extras.clone(), job.no_cache),
        None => (Vec::new(), Vec::new(), false),
    };
    for dir in &extra_dirs {
        if !ctx.build_path.join(dir).is_dir() {
            return Err(CalibanError::Config(format!(
                "directory {dir} does not exist under {}",
                ctx.build_path.display()
            )));
        }
    }
    let existing = |name: &str| {
        let path = ctx.build_path.join(name);
        path.is_file().then_some(path)
    };
    Ok(DockerArgs {
        build_path: ctx.build_path.clone(),
        base_image: base_image_for(mode, caliban_config.base_image.as_ref()),
        extra_dirs,
        setup_extras,
        no_cache,
        requirements_path: existing("requirements.txt"),
        conda_env_path: existing("environment.yml"),
        setup_path: existing("setup.py"),
        caliban_config,
    })
}

fn base_image_for(mode: JobMode, configured: Option<&BaseImage>) -> String {
    let default = if mode.is_gpu() {
        GPU_BASE_IMAGE
    } else {
        CPU_BASE_IMAGE
    };
    match configured {
        Some(BaseImage::Single(image)) => image.clone(),
        Some(BaseImage::PerMode { cpu, gpu }) => {
            let picked = if mode.is_gpu() { gpu } else { cpu };
            picked.clone().unwrap_or_else(|| default.to_string())
        }
        None => default.to_string(),
    }
}
