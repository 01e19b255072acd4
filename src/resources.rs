use crate::config::consts;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRoot {
    dirs: Vec<PathBuf>,
}

impl ResourceRoot {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn from_env() -> Self {
        let mut dirs = Vec::new();
        if let Ok(path) = env::var("CALIBAN_RESOURCE_DIR") {
            dirs.push(PathBuf::from(path));
        }
        if let Ok(exe) = env::current_exe() {
            if let Some(dir) = exe.parent() {
                dirs.push(dir.join("resources"));
            }
        }
        if let Ok(cwd) = env::current_dir() {
            dirs.push(cwd.join("resources"));
        }
        Self::new(dirs)
    }

    pub fn resource(&self, name: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
    }

    pub fn cloud_sql_proxy_path(&self) -> Option<PathBuf> {
        self.resource(consts::CLOUD_SQL_WRAPPER_SCRIPT)
    }

    pub fn launcher_path(&self) -> Option<PathBuf> {
        self.resource(consts::LAUNCHER_SCRIPT)
    }
}
