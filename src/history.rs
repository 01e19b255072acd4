use crate::error::CalibanError;
use crate::job::{JobMode, Platform};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Submitted | JobStatus::Running)
    }

    pub fn is_resubmittable(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Stopped)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudTarget {
    pub project_id: String,
    pub region: String,
    #[serde(default)]
    pub cloud_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub mode: JobMode,
    pub platform: Platform,
    pub image_id: String,
    pub package: String,
    pub script_args: Vec<String>,
    #[serde(default)]
    pub run_args: Vec<String>,
    pub experiment_name: String,
    pub index: usize,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub cloud: Option<CloudTarget>,
    // Image entrypoint is the in-container launcher.
    #[serde(default)]
    pub launcher: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: u64,
    pub xgroup: String,
    pub job_name: String,
    pub status: JobStatus,
    pub created_at: String,
    pub spec: JobSpec,
}

#[derive(Debug)]
pub struct History {
    path: PathBuf,
    records: Vec<JobRecord>,
}

impl History {
    pub fn open(path: &Path) -> Result<Self, CalibanError> {
        let records = if path.exists() {
            let content = fs::read_to_string(path)?;
            if content.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            Vec::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            records,
        })
    }

    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    pub fn add(&mut self, xgroup: &str, job_name: &str, status: JobStatus, spec: JobSpec) -> u64 {
        let id = self.records.iter().map(|r| r.id).max().unwrap_or(0) + 1;
        self.records.push(JobRecord {
            id,
            xgroup: xgroup.to_string(),
            job_name: job_name.to_string(),
            status,
            created_at: Utc::now().to_rfc3339(),
            spec,
        });
        id
    }

    pub fn set_status(&mut self, id: u64, status: JobStatus) {
        if let Some(record) = self.records.iter_mut().find(|r| r.id == id) {
            record.status = status;
        }
    }

    pub fn in_group(&self, xgroup: Option<&str>) -> Vec<&JobRecord> {
        self.records
            .iter()
            .filter(|r| xgroup.map_or(true, |group| r.xgroup == group))
            .collect()
    }

    // Most recently created first.
    pub fn groups(&self) -> Vec<String> {
        let mut latest: BTreeMap<&str, u64> = BTreeMap::new();
        for record in &self.records {
            let entry = latest.entry(record.xgroup.as_str()).or_insert(record.id);
            *entry = (*entry).max(record.id);
        }
        let mut groups: Vec<(&str, u64)> = latest.into_iter().collect();
        groups.sort_by(|a, b| b.1.cmp(&a.1));
        groups.into_iter().map(|(name, _)| name.to_string()).collect()
    }

    pub fn save(&self) -> Result<(), CalibanError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&self.records)?;
        fs::write(&self.path, text)?;
        Ok(())
    }
}

#[cfg(test)]
pub fn sample_spec(index: usize) -> JobSpec {
    JobSpec {
        mode: JobMode::Cpu,
        platform: Platform::Local,
        image_id: "sha256:abc".to_string(),
        package: "trainer.train".to_string(),
        script_args: vec!["--epochs".to_string(), "1".to_string()],
        run_args: Vec::new(),
        experiment_name: "group".to_string(),
        index,
        tags: BTreeMap::new(),
        cloud: None,
        launcher: false,
    }
}
