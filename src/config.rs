use crate::error::CalibanError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub mod consts {
    pub const CONFIG_FILE: &str = ".calibanconfig.json";
    pub const RESOURCE_DIR: &str = "/.resources";
    pub const LAUNCHER_SCRIPT: &str = "caliban_launcher.py";
    pub const CLOUD_SQL_WRAPPER_SCRIPT: &str = "cloud_sql_proxy.py";
    pub const LAUNCHER_CONFIG_FILE: &str = "caliban_launcher_cfg.json";
    pub const GPU_ENABLED_TAG: &str = "gpu_enabled";
    pub const TPU_ENABLED_TAG: &str = "tpu_enabled";
    pub const JOB_NAME_TAG: &str = "job_name";
    pub const DOCKER_IMAGE_TAG: &str = "docker_image";
    pub const PLATFORM_TAG: &str = "platform";
    pub const DEFAULT_REGION: &str = "us-central1";
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CalibanConfig {
    pub apt_packages: Vec<String>,
    pub base_image: Option<BaseImage>,
    pub mlflow_config: Option<MlflowConfig>,
    pub uv: Option<UvConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum BaseImage {
    Single(String),
    PerMode {
        cpu: Option<String>,
        gpu: Option<String>,
    },
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MlflowConfig {
    pub user: String,
    pub password: String,
    pub db: String,
    pub project: String,
    pub region: String,
    pub artifact_root: String,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct UvConfig {
    pub mlflow: Option<UvMlflowConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct UvMlflowConfig {
    pub pubsub_project: Option<String>,
    pub pubsub_topic: Option<String>,
}

impl MlflowConfig {
    pub fn validate(&self) -> Result<(), CalibanError> {
        let fields = [
            ("user", &self.user),
            ("password", &self.password),
            ("db", &self.db),
            ("project", &self.project),
            ("region", &self.region),
            ("artifact_root", &self.artifact_root),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(CalibanError::Config(format!(
                    "mlflow_config.{name} must not be empty"
                )));
            }
        }
        Ok(())
    }
}

impl CalibanConfig {
    pub fn validate(&self) -> Result<(), CalibanError> {
        if let Some(mlflow) = &self.mlflow_config {
            mlflow.validate()?;
        }
        Ok(())
    }
}

pub fn read_caliban_config(path: &Path) -> Result<CalibanConfig, CalibanError> {
    if !path.exists() {
        return Ok(CalibanConfig::default());
    }
    let content = fs::read_to_string(path)?;
    read_caliban_config_from_str(&content).map_err(|err| {
        CalibanError::Config(format!("invalid config {}: {err}", path.display()))
    })
}

pub fn read_caliban_config_from_str(content: &str) -> Result<CalibanConfig, CalibanError> {
    if content.trim().is_empty() {
        return Ok(CalibanConfig::default());
    }
    // YAML is a superset of JSON, so both spellings of the config parse here.
    let cfg: CalibanConfig = serde_yaml::from_str(content)?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn resolve_config_path(override_path: Option<&PathBuf>, build_path: &Path) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("CALIBAN_CONFIG") {
        return PathBuf::from(path);
    }
    build_path.join(consts::CONFIG_FILE)
}

pub fn caliban_home() -> PathBuf {
    if let Ok(path) = env::var("CALIBAN_HOME") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".caliban");
    base
}

pub fn current_user() -> String {
    ["USER", "LOGNAME", "USERNAME"]
        .iter()
        .filter_map(|key| env::var(key).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn resolve_project_id(
    flag: Option<String>,
    env_value: Option<String>,
) -> Result<String, CalibanError> {
    flag.or(env_value)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            CalibanError::Config(
                "no project id found; pass --project_id or set $PROJECT_ID".to_string(),
            )
        })
}

pub fn resolve_region(flag: Option<String>, env_value: Option<String>) -> String {
    flag.or(env_value)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| consts::DEFAULT_REGION.to_string())
}

pub fn resolve_cloud_key(flag: Option<String>, env_value: Option<String>) -> Option<String> {
    flag.or(env_value).filter(|value| !value.trim().is_empty())
}
