use crate::cli::{ClusterCommand, Context};
use crate::config::consts::{
    CLOUD_SQL_WRAPPER_SCRIPT, DOCKER_IMAGE_TAG, GPU_ENABLED_TAG, JOB_NAME_TAG, LAUNCHER_SCRIPT,
    PLATFORM_TAG, TPU_ENABLED_TAG,
};
use crate::config::{current_user, CalibanConfig};
use crate::error::CalibanError;
use crate::experiment::{expand_experiment_config, experiment_to_args, value_to_arg, Experiment};
use crate::history::{CloudTarget, History, JobRecord, JobSpec, JobStatus};
use crate::interrupt::Interrupt;
use crate::job::{DockerArgs, JobMode, Platform};
use crate::launcher::{run_environment_additions, with_launcher_config_file, LauncherSettings};
use crate::resources::ResourceRoot;
use crate::router::{
    Backend, CloudRequest, NotebookRequest, ResubmitRequest, RunRequest, ShellRequest,
    StatusQuery, StopRequest,
};
use crate::runner::{execute, render_command, CommandRunner};
use chrono::Local;
use dirs::home_dir;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const CONTAINER_WORKDIR: &str = "/usr/app";
const CLOUD_CREDENTIALS_ENV: &str = "CLOUDSDK_AUTH_CREDENTIAL_FILE_OVERRIDE";
const RESOURCE_BUILD_CONTEXT: &str = "caliban_resources";

pub struct DockerBackend<R: CommandRunner> {
    runner: R,
    resources: ResourceRoot,
    history_path: PathBuf,
    home: Option<PathBuf>,
    cwd: PathBuf,
    settings: LauncherSettings,
    interrupt: Interrupt,
}

struct JobTemplate {
    mode: JobMode,
    platform: Platform,
    image_id: String,
    package: String,
    run_args: Vec<String>,
    script_args: Vec<String>,
    experiment_name: String,
    cloud: Option<CloudTarget>,
    launcher: bool,
}

impl JobTemplate {
    fn specs(&self, experiment_config: Option<&Value>) -> Result<Vec<JobSpec>, CalibanError> {
        let experiments = match experiment_config {
            Some(config) => expand_experiment_config(config)?,
            None => vec![Experiment::new()],
        };
        Ok(experiments
            .iter()
            .enumerate()
            .map(|(index, experiment)| self.spec(index, experiment))
            .collect())
    }

    fn spec(&self, index: usize, experiment: &Experiment) -> JobSpec {
        let mut script_args = self.script_args.clone();
        script_args.extend(experiment_to_args(experiment));

        let mut tags = BTreeMap::new();
        tags.insert(GPU_ENABLED_TAG.to_string(), self.mode.is_gpu().to_string());
        tags.insert(TPU_ENABLED_TAG.to_string(), self.mode.is_tpu().to_string());
        tags.insert(PLATFORM_TAG.to_string(), self.platform.as_str().to_string());
        tags.insert(DOCKER_IMAGE_TAG.to_string(), self.image_id.clone());
        for (key, value) in experiment {
            tags.insert(key.clone(), value_to_arg(value));
        }

        JobSpec {
            mode: self.mode,
            platform: self.platform,
            image_id: self.image_id.clone(),
            package: self.package.clone(),
            script_args,
            run_args: self.run_args.clone(),
            experiment_name: self.experiment_name.clone(),
            index,
            tags,
            cloud: self.cloud.clone(),
            launcher: self.launcher,
        }
    }
}

impl<R: CommandRunner> DockerBackend<R> {
    pub fn new(runner: R, ctx: &Context) -> Self {
        Self {
            runner,
            resources: ctx.resources.clone(),
            history_path: ctx.history_path(),
            home: home_dir(),
            cwd: ctx.build_path.clone(),
            settings: LauncherSettings::default(),
            interrupt: Interrupt::default(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    fn build_image_id(
        &self,
        docker_args: &DockerArgs,
        package: Option<&str>,
        notebook: Option<&NotebookRequest>,
        launcher_context: Option<&Path>,
    ) -> Result<String, CalibanError> {
        let scratch = tempfile::tempdir()?;
        let dockerfile_path = scratch.path().join("Dockerfile");
        let text = dockerfile(
            docker_args,
            package,
            notebook,
            launcher_context.map(|_| &self.settings),
        )?;
        fs::write(&dockerfile_path, text)?;

        let mut args = vec![
            "build".to_string(),
            "-q".to_string(),
            "-f".to_string(),
            dockerfile_path.display().to_string(),
        ];
        if let Some(context) = launcher_context {
            args.push("--build-context".to_string());
            args.push(format!("{RESOURCE_BUILD_CONTEXT}={}", context.display()));
        }
        if docker_args.no_cache {
            args.push("--no-cache".to_string());
        }
        args.push(docker_args.build_path.display().to_string());

        let output = execute(
            &self.runner,
            "docker",
            &args,
            &docker_args.build_path,
            &BTreeMap::new(),
            true,
        )?;
        let stdout = output.stdout_text();
        let image_id = stdout.lines().last().unwrap_or_default().trim().to_string();
        if image_id.is_empty() {
            return Err(CalibanError::Process(
                "docker build did not report an image id".to_string(),
            ));
        }
        info!(%image_id, "built image");
        Ok(image_id)
    }

    // Bakes the launcher, proxy wrapper and synthesized config into /.resources.
    fn build_tracking_image(
        &self,
        docker_args: &DockerArgs,
        package: &str,
    ) -> Result<String, CalibanError> {
        let missing = |name: &str| {
            CalibanError::Config(format!(
                "mlflow_config is set but {name} was not found; set CALIBAN_RESOURCE_DIR"
            ))
        };
        let launcher = self
            .resources
            .launcher_path()
            .ok_or_else(|| missing(LAUNCHER_SCRIPT))?;
        let proxy = self
            .resources
            .cloud_sql_proxy_path()
            .ok_or_else(|| missing(CLOUD_SQL_WRAPPER_SCRIPT))?;

        let staging = tempfile::tempdir()?;
        fs::copy(&launcher, staging.path().join(LAUNCHER_SCRIPT))?;
        fs::copy(&proxy, staging.path().join(CLOUD_SQL_WRAPPER_SCRIPT))?;
        with_launcher_config_file(
            staging.path(),
            &self.settings,
            &docker_args.caliban_config,
            |_| self.build_image_id(docker_args, Some(package), None, Some(staging.path())),
        )
    }

    fn workdir_mounts(&self, docker_args: &DockerArgs, mount_home: bool) -> Vec<String> {
        let mut args = vec![
            "-v".to_string(),
            format!("{}:{}", docker_args.build_path.display(), CONTAINER_WORKDIR),
            "-w".to_string(),
            CONTAINER_WORKDIR.to_string(),
        ];
        if mount_home {
            match &self.home {
                Some(home) => {
                    let home = home.display();
                    args.push("-v".to_string());
                    args.push(format!("{home}:{home}"));
                    args.push("-e".to_string());
                    args.push(format!("HOME={home}"));
                }
                None => warn!("home directory not found; skipping home mount"),
            }
        }
        args
    }

    // Returns the launcher's path inside the container.
    fn launcher_mounts(&self, args: &mut Vec<String>) -> Option<String> {
        match self.resources.cloud_sql_proxy_path() {
            Some(proxy) => {
                args.push("-v".to_string());
                args.push(format!(
                    "{}:{}:ro",
                    proxy.display(),
                    self.settings.container_resource_path(CLOUD_SQL_WRAPPER_SCRIPT)
                ));
            }
            None => warn!("{CLOUD_SQL_WRAPPER_SCRIPT} not found; the tracking proxy will not start"),
        }
        let Some(launcher) = self.resources.launcher_path() else {
            warn!("{LAUNCHER_SCRIPT} not found; running without tracking");
            return None;
        };
        let target = self.settings.container_resource_path(LAUNCHER_SCRIPT);
        args.push("-v".to_string());
        args.push(format!("{}:{}:ro", launcher.display(), target));
        Some(target)
    }

    fn local_run_args(
        &self,
        spec: &JobSpec,
        job_name: &str,
        config_path: &Path,
        caliban: &CalibanConfig,
    ) -> Result<Vec<String>, CalibanError> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            job_name.to_string(),
        ];
        args.extend(gpu_args(spec.mode));
        args.extend(spec.run_args.iter().cloned());
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}:ro",
            config_path.display(),
            self.settings.container_config_path()
        ));

        let launcher_args =
            run_environment_additions(caliban, &spec.experiment_name, spec.index, &spec.tags)?;
        let launcher = if launcher_args.is_empty() {
            None
        } else {
            self.launcher_mounts(&mut args)
        };
        match launcher {
            Some(launcher) => {
                args.push("--entrypoint".to_string());
                args.push(self.settings.interpreter.clone());
                args.push(spec.image_id.clone());
                args.push(launcher);
                args.extend(launcher_args);
                args.push("--".to_string());
                args.extend(package_command(&spec.package));
            }
            None => args.push(spec.image_id.clone()),
        }
        args.extend(spec.script_args.iter().cloned());
        Ok(args)
    }

    fn record_job(
        &self,
        xgroup: &str,
        job_name: &str,
        status: JobStatus,
        spec: JobSpec,
    ) -> Result<u64, CalibanError> {
        let mut history = History::open(&self.history_path)?;
        let id = history.add(xgroup, job_name, status, spec);
        history.save()?;
        Ok(id)
    }

    // A job stopped from another invocation keeps its Stopped status.
    fn finish_job(&self, id: u64, outcome: JobStatus) -> Result<JobStatus, CalibanError> {
        let mut history = History::open(&self.history_path)?;
        let current = history
            .records()
            .iter()
            .find(|record| record.id == id)
            .map(|record| record.status);
        let status = match current {
            Some(JobStatus::Stopped) => JobStatus::Stopped,
            _ => outcome,
        };
        history.set_status(id, status);
        history.save()?;
        Ok(status)
    }

    fn execute_local(
        &self,
        specs: Vec<JobSpec>,
        xgroup: &str,
        caliban: &CalibanConfig,
        dry_run: bool,
    ) -> Result<Vec<Value>, CalibanError> {
        let scratch = tempfile::tempdir()?;
        with_launcher_config_file(scratch.path(), &self.settings, caliban, |config_path| {
            let mut jobs = Vec::new();
            for mut spec in specs {
                let job_name = container_name(xgroup, spec.index);
                spec.tags.insert(JOB_NAME_TAG.to_string(), job_name.clone());
                let args = self.local_run_args(&spec, &job_name, config_path, caliban)?;
                let command = render_command("docker", &args);
                if dry_run {
                    info!(%command, "dry run");
                    jobs.push(json!({"job_name": job_name, "command": command, "status": "DRY_RUN"}));
                    continue;
                }

                self.interrupt.check()?;
                let id = self.record_job(xgroup, &job_name, JobStatus::Running, spec)?;
                info!(%job_name, id, "starting local job");
                let result = execute(&self.runner, "docker", &args, &self.cwd, &BTreeMap::new(), false);
                let outcome = if self.interrupt.is_set() {
                    JobStatus::Stopped
                } else if result.is_ok() {
                    JobStatus::Succeeded
                } else {
                    JobStatus::Failed
                };
                let status = self.finish_job(id, outcome)?;
                if self.interrupt.is_set() {
                    warn!(%job_name, id, "interrupted; job marked stopped");
                    return Err(CalibanError::Interrupted);
                }
                if status != JobStatus::Stopped {
                    result?;
                }
                jobs.push(json!({"id": id, "job_name": job_name, "command": command, "status": status}));
            }
            Ok(jobs)
        })
    }

    fn execute_cloud(
        &self,
        specs: Vec<JobSpec>,
        xgroup: &str,
        caliban: &CalibanConfig,
        dry_run: bool,
    ) -> Result<Vec<Value>, CalibanError> {
        let mut jobs = Vec::new();
        for mut spec in specs {
            self.interrupt.check()?;
            let job_name = cloud_job_name(&current_user(), spec.index);
            spec.tags.insert(JOB_NAME_TAG.to_string(), job_name.clone());
            let target = spec.cloud.clone().ok_or_else(|| {
                CalibanError::Config(format!("cloud job {job_name} has no project"))
            })?;

            let mut args: Vec<String> = [
                "ai-platform",
                "jobs",
                "submit",
                "training",
                job_name.as_str(),
                "--project",
                target.project_id.as_str(),
                "--region",
                target.region.as_str(),
                "--master-image-uri",
                spec.image_id.as_str(),
                "--scale-tier",
                scale_tier(spec.mode),
            ]
            .iter()
            .map(|arg| arg.to_string())
            .collect();
            let mut job_args = Vec::new();
            if spec.launcher {
                job_args.extend(run_environment_additions(
                    caliban,
                    &spec.experiment_name,
                    spec.index,
                    &spec.tags,
                )?);
                job_args.push("--".to_string());
                job_args.extend(package_command(&spec.package));
            }
            job_args.extend(spec.script_args.iter().cloned());
            if !job_args.is_empty() {
                args.push("--".to_string());
                args.extend(job_args);
            }
            let command = render_command("gcloud", &args);
            if dry_run {
                info!(%command, "dry run");
                jobs.push(json!({"job_name": job_name, "command": command, "status": "DRY_RUN"}));
                continue;
            }

            execute(
                &self.runner,
                "gcloud",
                &args,
                &self.cwd,
                &credentials_env(&target),
                true,
            )?;
            let id = self.record_job(xgroup, &job_name, JobStatus::Submitted, spec)?;
            info!(%job_name, id, "submitted cloud job");
            jobs.push(json!({"id": id, "job_name": job_name, "command": command, "status": JobStatus::Submitted}));
        }
        Ok(jobs)
    }
}

impl<R: CommandRunner> Backend for DockerBackend<R> {
    fn run_interactive(
        &self,
        mode: JobMode,
        request: ShellRequest,
        docker_args: &DockerArgs,
    ) -> Result<Value, CalibanError> {
        let image_id = match request.image_id {
            Some(id) => id,
            None => self.build_image_id(docker_args, None, None, None)?,
        };
        let mut args = vec!["run".to_string(), "-it".to_string(), "--rm".to_string()];
        args.extend(gpu_args(mode));
        args.extend(request.run_args);
        args.extend(self.workdir_mounts(docker_args, request.mount_home));
        args.push("--entrypoint".to_string());
        args.push(request.shell.executable().to_string());
        args.push(image_id.clone());
        execute(&self.runner, "docker", &args, &self.cwd, &BTreeMap::new(), false)?;
        Ok(json!({"image_id": image_id}))
    }

    fn run_notebook(
        &self,
        mode: JobMode,
        request: NotebookRequest,
        docker_args: &DockerArgs,
    ) -> Result<Value, CalibanError> {
        let image_id = self.build_image_id(docker_args, None, Some(&request), None)?;
        let port = request.port;
        let mut args = vec!["run".to_string(), "-it".to_string(), "--rm".to_string()];
        args.extend(gpu_args(mode));
        args.push("-p".to_string());
        args.push(format!("{port}:{port}"));
        args.extend(request.run_args.iter().cloned());
        args.extend(self.workdir_mounts(docker_args, request.mount_home));
        args.push("--entrypoint".to_string());
        args.push("jupyter".to_string());
        args.push(image_id.clone());
        args.push(if request.lab { "lab" } else { "notebook" }.to_string());
        args.push("--ip=0.0.0.0".to_string());
        args.push(format!("--port={port}"));
        args.push("--no-browser".to_string());
        args.push("--allow-root".to_string());
        execute(&self.runner, "docker", &args, &self.cwd, &BTreeMap::new(), false)?;
        Ok(json!({"image_id": image_id, "port": port}))
    }

    fn build_image(
        &self,
        mode: JobMode,
        package: &str,
        docker_args: &DockerArgs,
    ) -> Result<Value, CalibanError> {
        let image_id = self.build_image_id(docker_args, Some(package), None, None)?;
        Ok(json!({"image_id": image_id, "mode": mode.as_str()}))
    }

    fn run_experiments(
        &self,
        mode: JobMode,
        request: RunRequest,
        docker_args: &DockerArgs,
    ) -> Result<Value, CalibanError> {
        let image_id = match request.image_id.clone() {
            Some(id) => id,
            None => self.build_image_id(docker_args, Some(&request.package), None, None)?,
        };
        let xgroup = request.xgroup.clone().unwrap_or_else(default_xgroup);
        let template = JobTemplate {
            mode,
            platform: Platform::Local,
            image_id: image_id.clone(),
            package: request.package.clone(),
            run_args: request.run_args.clone(),
            script_args: request.script_args.clone(),
            experiment_name: xgroup.clone(),
            cloud: None,
            launcher: false,
        };
        let specs = template.specs(request.experiment_config.as_ref())?;
        let jobs = self.execute_local(
            specs,
            &xgroup,
            &docker_args.caliban_config,
            request.dry_run,
        )?;
        Ok(json!({"xgroup": xgroup, "image_id": image_id, "jobs": jobs}))
    }

    fn submit_cloud(
        &self,
        mode: JobMode,
        request: CloudRequest,
        docker_args: &DockerArgs,
    ) -> Result<Value, CalibanError> {
        let launcher = docker_args.caliban_config.mlflow_config.is_some();
        let image_id = if launcher {
            self.build_tracking_image(docker_args, &request.package)?
        } else {
            self.build_image_id(docker_args, Some(&request.package), None, None)?
        };
        let image_tag = request
            .image_tag
            .clone()
            .unwrap_or_else(|| default_image_tag(&request.project_id, &image_id));
        let target = CloudTarget {
            project_id: request.project_id.clone(),
            region: request.region.clone(),
            cloud_key: request.cloud_key.clone(),
        };

        let tag_args = vec!["tag".to_string(), image_id.clone(), image_tag.clone()];
        let push_args = vec!["push".to_string(), image_tag.clone()];
        if request.dry_run {
            info!(
                tag = %render_command("docker", &tag_args),
                push = %render_command("docker", &push_args),
                "dry run"
            );
        } else {
            execute(&self.runner, "docker", &tag_args, &self.cwd, &BTreeMap::new(), true)?;
            execute(&self.runner, "docker", &push_args, &self.cwd, &BTreeMap::new(), false)?;
        }

        let xgroup = request.xgroup.clone().unwrap_or_else(default_xgroup);
        let template = JobTemplate {
            mode,
            platform: Platform::Cloud,
            image_id: image_tag.clone(),
            package: request.package.clone(),
            run_args: Vec::new(),
            script_args: request.script_args.clone(),
            experiment_name: xgroup.clone(),
            cloud: Some(target),
            launcher,
        };
        let specs = template.specs(request.experiment_config.as_ref())?;
        let jobs = self.execute_cloud(
            specs,
            &xgroup,
            &docker_args.caliban_config,
            request.dry_run,
        )?;
        Ok(json!({"xgroup": xgroup, "image_tag": image_tag, "jobs": jobs}))
    }

    fn get_status(&self, query: StatusQuery) -> Result<Value, CalibanError> {
        let history = History::open(&self.history_path)?;
        let groups = match &query.xgroup {
            Some(group) => vec![group.clone()],
            None => history.groups(),
        };
        let groups: Vec<Value> = groups
            .iter()
            .map(|group| {
                let records = history.in_group(Some(group.as_str()));
                let skip = records.len().saturating_sub(query.max_jobs);
                let jobs: Vec<Value> = records[skip..].iter().map(|r| job_summary(r)).collect();
                json!({"xgroup": group, "total": records.len(), "jobs": jobs})
            })
            .collect();
        Ok(json!({"groups": groups}))
    }

    fn stop(&self, request: StopRequest) -> Result<Value, CalibanError> {
        let mut history = History::open(&self.history_path)?;
        let targets: Vec<JobRecord> = history
            .in_group(request.xgroup.as_deref())
            .into_iter()
            .filter(|record| record.status.is_active())
            .cloned()
            .collect();

        let mut jobs = Vec::new();
        for record in targets {
            let (program, args, env) = stop_command(&record);
            let command = render_command(program, &args);
            if request.dry_run {
                info!(%command, "dry run");
                jobs.push(json!({"id": record.id, "job_name": record.job_name, "command": command}));
                continue;
            }
            execute(&self.runner, program, &args, &self.cwd, &env, true)?;
            history.set_status(record.id, JobStatus::Stopped);
            history.save()?;
            info!(job_name = %record.job_name, "stopped job");
            jobs.push(json!({"id": record.id, "job_name": record.job_name, "command": command}));
        }
        Ok(json!({"stopped": jobs, "dry_run": request.dry_run}))
    }

    fn resubmit(
        &self,
        request: ResubmitRequest,
        docker_args: &DockerArgs,
    ) -> Result<Value, CalibanError> {
        let history = History::open(&self.history_path)?;
        let xgroup = match request.xgroup {
            Some(group) => group,
            None => history.groups().into_iter().next().ok_or_else(|| {
                CalibanError::Config("no jobs recorded; nothing to resubmit".to_string())
            })?,
        };
        let specs: Vec<JobSpec> = history
            .in_group(Some(xgroup.as_str()))
            .into_iter()
            .filter(|record| request.all_jobs || record.status.is_resubmittable())
            .map(|record| record.spec.clone())
            .collect();
        drop(history);

        let (local, cloud): (Vec<JobSpec>, Vec<JobSpec>) = specs
            .into_iter()
            .partition(|spec| spec.platform == Platform::Local);
        let mut jobs = Vec::new();
        if !local.is_empty() {
            jobs.extend(self.execute_local(
                local,
                &xgroup,
                &docker_args.caliban_config,
                request.dry_run,
            )?);
        }
        if !cloud.is_empty() {
            jobs.extend(self.execute_cloud(
                cloud,
                &xgroup,
                &docker_args.caliban_config,
                request.dry_run,
            )?);
        }
        Ok(json!({"xgroup": xgroup, "jobs": jobs}))
    }

    fn run_cli_command(
        &self,
        project_id: Option<&str>,
        command: &ClusterCommand,
    ) -> Result<Value, CalibanError> {
        let (program, base): (&str, &[&str]) = match command {
            ClusterCommand::Ls => ("gcloud", &["container", "clusters", "list"][..]),
            ClusterCommand::PodLs => ("kubectl", &["get", "pods"][..]),
            ClusterCommand::JobLs => ("kubectl", &["get", "jobs"][..]),
        };
        let mut args: Vec<String> = base.iter().map(|arg| arg.to_string()).collect();
        if let (Some(project), "gcloud") = (project_id, program) {
            args.push("--project".to_string());
            args.push(project.to_string());
        }
        let output = execute(&self.runner, program, &args, &self.cwd, &BTreeMap::new(), true)?;
        Ok(json!({
            "command": render_command(program, &args),
            "stdout": output.stdout_text(),
        }))
    }
}

fn gpu_args(mode: JobMode) -> Vec<String> {
    if mode.is_gpu() {
        vec!["--gpus".to_string(), "all".to_string()]
    } else {
        Vec::new()
    }
}

fn scale_tier(mode: JobMode) -> &'static str {
    match mode {
        JobMode::Cpu => "BASIC",
        JobMode::Gpu => "BASIC_GPU",
        JobMode::Tpu => "BASIC_TPU",
    }
}

fn package_command(package: &str) -> Vec<String> {
    if package.ends_with(".py") {
        vec!["python".to_string(), package.to_string()]
    } else {
        vec!["python".to_string(), "-m".to_string(), package.to_string()]
    }
}

fn package_copy_path(package: &str, build_path: &Path) -> String {
    if package.ends_with(".py") {
        return package.to_string();
    }
    let top = package.split('.').next().unwrap_or(package);
    if build_path.join(top).is_dir() {
        top.to_string()
    } else {
        format!("{top}.py")
    }
}

fn dockerfile(
    docker_args: &DockerArgs,
    package: Option<&str>,
    notebook: Option<&NotebookRequest>,
    launcher: Option<&LauncherSettings>,
) -> Result<String, CalibanError> {
    let mut lines = vec![format!("FROM {}", docker_args.base_image)];
    let apt = &docker_args.caliban_config.apt_packages;
    if !apt.is_empty() {
        lines.push(format!(
            "RUN apt-get update && apt-get install -y --no-install-recommends {} && rm -rf /var/lib/apt/lists/*",
            apt.join(" ")
        ));
    }
    lines.push(format!("WORKDIR {CONTAINER_WORKDIR}"));
    if docker_args.conda_env_path.is_some() {
        lines.push(format!("COPY environment.yml {CONTAINER_WORKDIR}/environment.yml"));
        lines.push(format!(
            "RUN conda env update --quiet --name base --file {CONTAINER_WORKDIR}/environment.yml"
        ));
    }
    if docker_args.requirements_path.is_some() {
        lines.push(format!("COPY requirements.txt {CONTAINER_WORKDIR}/requirements.txt"));
        lines.push(format!(
            "RUN pip install --no-cache-dir -r {CONTAINER_WORKDIR}/requirements.txt"
        ));
    }
    if docker_args.setup_path.is_some() {
        let target = if docker_args.setup_extras.is_empty() {
            ".".to_string()
        } else {
            format!(".[{}]", docker_args.setup_extras.join(","))
        };
        lines.push(format!("COPY . {CONTAINER_WORKDIR}"));
        lines.push(format!("RUN pip install --no-cache-dir '{target}'"));
    }
    if let Some(notebook) = notebook {
        let name = if notebook.lab { "jupyterlab" } else { "jupyter" };
        let requirement = match &notebook.version {
            Some(version) => format!("{name}=={version}"),
            None => name.to_string(),
        };
        lines.push(format!("RUN pip install --no-cache-dir {requirement}"));
    }
    for dir in &docker_args.extra_dirs {
        lines.push(format!("COPY {dir} {CONTAINER_WORKDIR}/{dir}"));
    }
    if let Some(package) = package {
        let copy_path = package_copy_path(package, &docker_args.build_path);
        lines.push(format!("COPY {copy_path} {CONTAINER_WORKDIR}/{copy_path}"));
        let entrypoint = match launcher {
            Some(settings) => {
                lines.push(format!(
                    "COPY --from={RESOURCE_BUILD_CONTEXT} . {}/",
                    settings.resource_dir
                ));
                vec![
                    settings.interpreter.clone(),
                    settings.container_resource_path(LAUNCHER_SCRIPT),
                ]
            }
            None => package_command(package),
        };
        lines.push(format!("ENTRYPOINT {}", serde_json::to_string(&entrypoint)?));
    }
    let mut text = lines.join("\n");
    text.push('\n');
    Ok(text)
}

fn default_xgroup() -> String {
    format!(
        "{}-xgroup-{}",
        current_user(),
        Local::now().format("%Y-%m-%d-%H-%M-%S")
    )
}

fn default_image_tag(project_id: &str, image_id: &str) -> String {
    let short: String = image_id
        .trim_start_matches("sha256:")
        .chars()
        .take(12)
        .collect();
    format!("gcr.io/{project_id}/{short}:latest")
}

// Docker container names allow `[a-zA-Z0-9_.-]`.
fn container_name(xgroup: &str, index: usize) -> String {
    let raw = format!("caliban-{xgroup}-{index}");
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

// AI Platform job ids allow letters, digits and underscores only.
fn cloud_job_name(user: &str, index: usize) -> String {
    let raw = format!(
        "caliban_{user}_{}_{index}",
        Local::now().format("%Y%m%d_%H%M%S")
    );
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn credentials_env(target: &CloudTarget) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    if let Some(key) = &target.cloud_key {
        env.insert(CLOUD_CREDENTIALS_ENV.to_string(), key.clone());
    }
    env
}

fn stop_command(record: &JobRecord) -> (&'static str, Vec<String>, BTreeMap<String, String>) {
    match (&record.spec.platform, &record.spec.cloud) {
        (Platform::Cloud, Some(target)) => (
            "gcloud",
            vec![
                "ai-platform".to_string(),
                "jobs".to_string(),
                "cancel".to_string(),
                record.job_name.clone(),
                "--project".to_string(),
                target.project_id.clone(),
            ],
            credentials_env(target),
        ),
        _ => (
            "docker",
            vec!["stop".to_string(), record.job_name.clone()],
            BTreeMap::new(),
        ),
    }
}

fn job_summary(record: &JobRecord) -> Value {
    json!({
        "id": record.id,
        "job_name": record.job_name,
        "platform": record.spec.platform,
        "status": record.status,
        "created_at": record.created_at,
        "image_id": record.spec.image_id,
        "script_args": record.spec.script_args,
    })
}
