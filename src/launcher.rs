use crate::config::consts::{CLOUD_SQL_WRAPPER_SCRIPT, LAUNCHER_CONFIG_FILE, RESOURCE_DIR};
use crate::config::{current_user, CalibanConfig, MlflowConfig};
use crate::error::CalibanError;
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const TRACKING_URI_ENV: &str = "MLFLOW_TRACKING_URI";
pub const ARTIFACT_ROOT_ENV: &str = "MLFLOW_ARTIFACT_ROOT";
pub const PUBSUB_PROJECT_ENV: &str = "UV_MLFLOW_PUBSUB_PROJECT";
pub const PUBSUB_TOPIC_ENV: &str = "UV_MLFLOW_PUBSUB_TOPIC";
pub const EXPERIMENT_NAME_ENV: &str = "MLFLOW_EXPERIMENT_NAME";
pub const RUN_NAME_ENV: &str = "MLFLOW_RUN_NAME";
pub const TAG_ENV_PREFIX: &str = "ENVVAR_";
pub const LAUNCHER_CONFIG_FLAG: &str = "--caliban_config";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherSettings {
    pub resource_dir: String,
    pub interpreter: String,
    pub proxy_binary: String,
    pub socket_dir: String,
    pub credentials_path: String,
    pub default_pubsub_topic: String,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            resource_dir: RESOURCE_DIR.to_string(),
            interpreter: "python".to_string(),
            proxy_binary: "/usr/bin/cloud_sql_proxy".to_string(),
            socket_dir: "/tmp/cloudsql".to_string(),
            credentials_path: "~/.config/gcloud/application_default_credentials.json"
                .to_string(),
            default_pubsub_topic: "mlflow".to_string(),
        }
    }
}

impl LauncherSettings {
    pub fn container_config_path(&self) -> String {
        format!("{}/{}", self.resource_dir, LAUNCHER_CONFIG_FILE)
    }

    pub fn container_resource_path(&self, name: &str) -> String {
        format!("{}/{}", self.resource_dir, name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherConfig {
    pub services: Vec<Vec<String>>,
    pub env: BTreeMap<String, String>,
}

impl LauncherConfig {
    fn merge(&mut self, other: LauncherConfig) {
        self.services.extend(other.services);
        self.env.extend(other.env);
    }
}

#[derive(Debug, Serialize)]
struct ProxyConfig<'a> {
    proxy: &'a str,
    path: &'a str,
    project: &'a str,
    region: &'a str,
    db: &'a str,
    creds: &'a str,
    debug: bool,
}

pub fn tracking_uri(settings: &LauncherSettings, mlflow: &MlflowConfig) -> String {
    format!(
        "postgresql+pg8000://{user}:{password}@/{db}?unix_sock={socket}/{project}:{region}:{db}/.s.PGSQL.5432",
        user = mlflow.user,
        password = mlflow.password,
        db = mlflow.db,
        socket = settings.socket_dir,
        project = mlflow.project,
        region = mlflow.region,
    )
}

fn tracking_config(
    settings: &LauncherSettings,
    caliban: &CalibanConfig,
) -> Result<LauncherConfig, CalibanError> {
    let Some(mlflow) = caliban.mlflow_config.as_ref() else {
        return Ok(LauncherConfig::default());
    };
    mlflow.validate()?;

    let overrides = caliban.uv.as_ref().and_then(|uv| uv.mlflow.as_ref());
    let pubsub_project = overrides
        .and_then(|uv| uv.pubsub_project.clone())
        .unwrap_or_else(|| mlflow.project.clone());
    let pubsub_topic = overrides
        .and_then(|uv| uv.pubsub_topic.clone())
        .unwrap_or_else(|| settings.default_pubsub_topic.clone());

    let proxy_config = serde_json::to_string(&ProxyConfig {
        proxy: &settings.proxy_binary,
        path: &settings.socket_dir,
        project: &mlflow.project,
        region: &mlflow.region,
        db: &mlflow.db,
        creds: &settings.credentials_path,
        debug: mlflow.debug,
    })?;
    let proxy_cmd = vec![
        settings.interpreter.clone(),
        settings.container_resource_path(CLOUD_SQL_WRAPPER_SCRIPT),
        proxy_config,
    ];

    let mut env = BTreeMap::new();
    env.insert(TRACKING_URI_ENV.to_string(), tracking_uri(settings, mlflow));
    env.insert(ARTIFACT_ROOT_ENV.to_string(), mlflow.artifact_root.clone());
    env.insert(PUBSUB_PROJECT_ENV.to_string(), pubsub_project);
    env.insert(PUBSUB_TOPIC_ENV.to_string(), pubsub_topic);

    Ok(LauncherConfig {
        services: vec![proxy_cmd],
        env,
    })
}

pub fn launcher_config(
    settings: &LauncherSettings,
    caliban: &CalibanConfig,
) -> Result<LauncherConfig, CalibanError> {
    let mut config = LauncherConfig::default();
    config.merge(tracking_config(settings, caliban)?);
    Ok(config)
}

// Removed on drop, or earlier through `cleanup`.
#[derive(Debug)]
pub struct LauncherConfigFile {
    path: PathBuf,
}

impl LauncherConfigFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cleanup(&self) -> Result<(), CalibanError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "removed launcher config");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for LauncherConfigFile {
    fn drop(&mut self) {
        if let Err(err) = self.cleanup() {
            warn!(path = %self.path.display(), error = %err, "failed to remove launcher config");
        }
    }
}

pub fn synthesize(
    dir: &Path,
    settings: &LauncherSettings,
    caliban: &CalibanConfig,
) -> Result<LauncherConfigFile, CalibanError> {
    let config = launcher_config(settings, caliban)?;
    let path = dir.join(LAUNCHER_CONFIG_FILE);
    let text = serde_json::to_string_pretty(&config)?;
    fs::write(&path, text)?;
    debug!(
        path = %path.display(),
        services = config.services.len(),
        env = config.env.len(),
        "wrote launcher config"
    );
    Ok(LauncherConfigFile { path })
}

pub fn with_launcher_config_file<T, F>(
    dir: &Path,
    settings: &LauncherSettings,
    caliban: &CalibanConfig,
    f: F,
) -> Result<T, CalibanError>
where
    F: FnOnce(&Path) -> Result<T, CalibanError>,
{
    let file = synthesize(dir, settings, caliban)?;
    let result = f(file.path());
    let cleanup = file.cleanup();
    let value = result?;
    cleanup?;
    Ok(value)
}

pub fn run_name(user: &str, index: usize) -> String {
    let timestamp = Local::now().format("%Y%m%d%H%M%S");
    format!("{user}-{timestamp}-{index}")
}

pub fn run_environment_additions(
    caliban: &CalibanConfig,
    experiment_name: &str,
    index: usize,
    tags: &BTreeMap<String, String>,
) -> Result<Vec<String>, CalibanError> {
    if caliban.mlflow_config.is_none() {
        return Ok(Vec::new());
    }

    let mut env: BTreeMap<String, String> = tags
        .iter()
        .map(|(key, value)| (format!("{TAG_ENV_PREFIX}{key}"), value.clone()))
        .collect();
    env.insert(EXPERIMENT_NAME_ENV.to_string(), experiment_name.to_string());
    env.insert(RUN_NAME_ENV.to_string(), run_name(&current_user(), index));

    let payload = serde_json::to_string(&json!({ "env": env }))?;
    Ok(vec![LAUNCHER_CONFIG_FLAG.to_string(), payload])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{UvConfig, UvMlflowConfig};
    use serde_json::Value;
    use tempfile::tempdir;

    fn mlflow() -> MlflowConfig {
        MlflowConfig {
            user: "alice".to_string(),
            password: "secret".to_string(),
            db: "runs".to_string(),
            project: "proj".to_string(),
            region: "us-central1".to_string(),
            artifact_root: "gs://bucket/artifacts".to_string(),
            debug: true,
        }
    }

    fn tracking() -> CalibanConfig {
        CalibanConfig {
            mlflow_config: Some(mlflow()),
            ..CalibanConfig::default()
        }
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn default_config_is_written_and_removed() {
        let dir = tempdir().unwrap();
        let path = {
            let file = synthesize(
                dir.path(),
                &LauncherSettings::default(),
                &CalibanConfig::default(),
            )
            .unwrap();
            assert_eq!(file.path(), dir.path().join(LAUNCHER_CONFIG_FILE));
            assert_eq!(
                read_json(file.path()),
                serde_json::json!({"services": [], "env": {}})
            );
            file.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn tracking_config_adds_proxy_service_and_env() {
        let dir = tempdir().unwrap();
        let file = synthesize(dir.path(), &LauncherSettings::default(), &tracking()).unwrap();
        let config: LauncherConfig =
            serde_json::from_str(&fs::read_to_string(file.path()).unwrap()).unwrap();

        assert_eq!(config.services.len(), 1);
        let service = &config.services[0];
        assert_eq!(service.len(), 3);
        assert_eq!(service[0], "python");
        assert_eq!(service[1], "/.resources/cloud_sql_proxy.py");
        let proxy: Value = serde_json::from_str(&service[2]).unwrap();
        assert_eq!(proxy["proxy"], "/usr/bin/cloud_sql_proxy");
        assert_eq!(proxy["path"], "/tmp/cloudsql");
        assert_eq!(proxy["project"], "proj");
        assert_eq!(proxy["region"], "us-central1");
        assert_eq!(proxy["db"], "runs");
        assert_eq!(proxy["debug"], true);

        assert_eq!(config.env.len(), 4);
        assert!(config.env.values().all(|value| !value.is_empty()));
        let uri = &config.env[TRACKING_URI_ENV];
        assert!(uri.starts_with("postgresql+pg8000://alice:secret@/runs?"));
        assert!(uri.contains("unix_sock=/tmp/cloudsql/proj:us-central1:runs/.s.PGSQL.5432"));
        assert_eq!(config.env[ARTIFACT_ROOT_ENV], "gs://bucket/artifacts");
        assert_eq!(config.env[PUBSUB_PROJECT_ENV], "proj");
        assert_eq!(config.env[PUBSUB_TOPIC_ENV], "mlflow");
        assert_eq!(
            config,
            launcher_config(&LauncherSettings::default(), &tracking()).unwrap()
        );
    }

    #[test]
    fn pubsub_overrides_are_respected() {
        let mut caliban = tracking();
        caliban.uv = Some(UvConfig {
            mlflow: Some(UvMlflowConfig {
                pubsub_project: Some("metrics-proj".to_string()),
                pubsub_topic: Some("runs-topic".to_string()),
            }),
        });
        let config = launcher_config(&LauncherSettings::default(), &caliban).unwrap();
        assert_eq!(config.env[PUBSUB_PROJECT_ENV], "metrics-proj");
        assert_eq!(config.env[PUBSUB_TOPIC_ENV], "runs-topic");
    }

    #[test]
    fn custom_settings_flow_into_descriptor() {
        let settings = LauncherSettings {
            resource_dir: "/opt/res".to_string(),
            socket_dir: "/run/sql".to_string(),
            ..LauncherSettings::default()
        };
        let config = launcher_config(&settings, &tracking()).unwrap();
        assert_eq!(config.services[0][1], "/opt/res/cloud_sql_proxy.py");
        assert!(config.env[TRACKING_URI_ENV].contains("unix_sock=/run/sql/proj:"));
        assert_eq!(settings.container_config_path(), "/opt/res/caliban_launcher_cfg.json");
    }

    #[test]
    fn invalid_tracking_config_writes_nothing() {
        let dir = tempdir().unwrap();
        let mut caliban = tracking();
        if let Some(mlflow) = caliban.mlflow_config.as_mut() {
            mlflow.password = String::new();
        }
        let err = synthesize(dir.path(), &LauncherSettings::default(), &caliban).unwrap_err();
        assert!(matches!(err, CalibanError::Config(_)));
        assert!(!dir.path().join(LAUNCHER_CONFIG_FILE).exists());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let dir = tempdir().unwrap();
        let file = synthesize(dir.path(), &LauncherSettings::default(), &tracking()).unwrap();
        file.cleanup().unwrap();
        file.cleanup().unwrap();
        assert!(!file.path().exists());
        drop(file);
    }

    #[test]
    fn scoped_file_is_removed_when_body_fails() {
        let dir = tempdir().unwrap();
        let mut seen = None;
        let result: Result<(), CalibanError> = with_launcher_config_file(
            dir.path(),
            &LauncherSettings::default(),
            &CalibanConfig::default(),
            |path| {
                assert!(path.exists());
                seen = Some(path.to_path_buf());
                Err(CalibanError::Process("container exited with 1".to_string()))
            },
        );
        let err = result.unwrap_err();
        assert!(err.to_string().contains("container exited with 1"));
        assert!(!seen.expect("body ran").exists());
    }

    #[test]
    fn scoped_file_tolerates_body_removing_it() {
        let dir = tempdir().unwrap();
        let value = with_launcher_config_file(
            dir.path(),
            &LauncherSettings::default(),
            &CalibanConfig::default(),
            |path| {
                fs::remove_file(path)?;
                Ok(7)
            },
        )
        .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn additions_are_empty_without_tracking() {
        let mut tags = BTreeMap::new();
        tags.insert("a".to_string(), "1".to_string());
        let caliban = CalibanConfig::default();
        assert!(run_environment_additions(&caliban, "exp", 0, &tags)
            .unwrap()
            .is_empty());
        assert!(run_environment_additions(&caliban, "", 9, &BTreeMap::new())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn additions_carry_tags_experiment_and_run_name() {
        let mut tags = BTreeMap::new();
        tags.insert("a".to_string(), "1".to_string());
        let args = run_environment_additions(&tracking(), "exp", 3, &tags).unwrap();

        assert_eq!(args.len(), 2);
        assert_eq!(args[0], LAUNCHER_CONFIG_FLAG);
        let payload: Value = serde_json::from_str(&args[1]).unwrap();
        let env = &payload["env"];
        assert_eq!(env["ENVVAR_a"], "1");
        assert_eq!(env[EXPERIMENT_NAME_ENV], "exp");
        assert!(env.get("a").is_none());

        let run_name = env[RUN_NAME_ENV].as_str().unwrap();
        let prefix = format!("{}-", current_user());
        let middle = run_name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix("-3"))
            .expect("run name shape");
        assert_eq!(middle.len(), 14);
        assert!(middle.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn run_names_differ_by_index() {
        assert_ne!(run_name("bob", 0), run_name("bob", 1));
        assert!(run_name("bob", 12).ends_with("-12"));
    }
}
