use crate::cli::{ClusterCommand, Command, Context, JobArgs, JobCommand, Shell};
use crate::config::{resolve_cloud_key, resolve_project_id, resolve_region};
use crate::error::CalibanError;
use crate::experiment::load_experiment_config;
use crate::job::{generate_docker_args, resolve_job_mode, DockerArgs, JobMode};
use serde_json::Value;
use std::env;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct ShellRequest {
    pub image_id: Option<String>,
    pub run_args: Vec<String>,
    pub mount_home: bool,
    pub shell: Shell,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotebookRequest {
    pub port: u16,
    pub lab: bool,
    pub version: Option<String>,
    pub run_args: Vec<String>,
    pub mount_home: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub run_args: Vec<String>,
    pub script_args: Vec<String>,
    pub image_id: Option<String>,
    pub experiment_config: Option<Value>,
    pub dry_run: bool,
    pub package: String,
    pub xgroup: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloudRequest {
    pub project_id: String,
    pub region: String,
    pub cloud_key: Option<String>,
    pub image_tag: Option<String>,
    pub script_args: Vec<String>,
    pub experiment_config: Option<Value>,
    pub dry_run: bool,
    pub package: String,
    pub xgroup: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusQuery {
    pub xgroup: Option<String>,
    pub max_jobs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopRequest {
    pub xgroup: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResubmitRequest {
    pub xgroup: Option<String>,
    pub dry_run: bool,
    pub all_jobs: bool,
}

pub trait Backend {
    fn run_interactive(
        &self,
        mode: JobMode,
        request: ShellRequest,
        docker_args: &DockerArgs,
    ) -> Result<Value, CalibanError>;

    fn run_notebook(
        &self,
        mode: JobMode,
        request: NotebookRequest,
        docker_args: &DockerArgs,
    ) -> Result<Value, CalibanError>;

    fn build_image(
        &self,
        mode: JobMode,
        package: &str,
        docker_args: &DockerArgs,
    ) -> Result<Value, CalibanError>;

    fn run_experiments(
        &self,
        mode: JobMode,
        request: RunRequest,
        docker_args: &DockerArgs,
    ) -> Result<Value, CalibanError>;

    fn submit_cloud(
        &self,
        mode: JobMode,
        request: CloudRequest,
        docker_args: &DockerArgs,
    ) -> Result<Value, CalibanError>;

    fn get_status(&self, query: StatusQuery) -> Result<Value, CalibanError>;

    fn stop(&self, request: StopRequest) -> Result<Value, CalibanError>;

    fn resubmit(
        &self,
        request: ResubmitRequest,
        docker_args: &DockerArgs,
    ) -> Result<Value, CalibanError>;

    fn run_cli_command(
        &self,
        project_id: Option<&str>,
        command: &ClusterCommand,
    ) -> Result<Value, CalibanError>;
}

pub fn dispatch<B: Backend>(
    ctx: &Context,
    command: Command,
    backend: &B,
) -> Result<Value, CalibanError> {
    match command {
        // Cluster operations are not tied to one job's compute target.
        Command::Cluster {
            project_id,
            command,
        } => {
            info!(?command, "dispatching cluster command");
            backend.run_cli_command(project_id.as_deref(), &command)
        }
        Command::External(argv) => {
            let name = argv.first().cloned().unwrap_or_default();
            Err(CalibanError::Config(format!("unrecognized command: {name}")))
        }
        Command::Job(command) => dispatch_job(ctx, command, backend),
    }
}

fn dispatch_job<B: Backend>(
    ctx: &Context,
    command: JobCommand,
    backend: &B,
) -> Result<Value, CalibanError> {
    let mode = resolve_job_mode(&command);
    let docker_args = generate_docker_args(mode, &command, ctx)?;
    let run_args = command
        .job_args()
        .map(JobArgs::run_args)
        .unwrap_or_default();
    info!(
        command = command.name(),
        mode = mode.as_str(),
        base_image = %docker_args.base_image,
        "dispatching"
    );

    match command {
        JobCommand::Shell {
            bare,
            shell,
            image_id,
            ..
        } => backend.run_interactive(
            mode,
            ShellRequest {
                image_id,
                run_args,
                mount_home: !bare,
                shell,
            },
            &docker_args,
        ),
        JobCommand::Notebook {
            bare,
            port,
            lab,
            jupyter_version,
            ..
        } => backend.run_notebook(
            mode,
            NotebookRequest {
                port,
                lab,
                version: jupyter_version,
                run_args,
                mount_home: !bare,
            },
            &docker_args,
        ),
        JobCommand::Build { module, .. } => backend.build_image(mode, &module, &docker_args),
        JobCommand::Status { xgroup, max_jobs } => {
            backend.get_status(StatusQuery { xgroup, max_jobs })
        }
        JobCommand::Stop { xgroup, dry_run } => backend.stop(StopRequest { xgroup, dry_run }),
        JobCommand::Resubmit {
            xgroup,
            dry_run,
            all_jobs,
        } => backend.resubmit(
            ResubmitRequest {
                xgroup,
                dry_run,
                all_jobs,
            },
            &docker_args,
        ),
        JobCommand::Run {
            module,
            dry_run,
            image_id,
            experiment_config,
            xgroup,
            script_args,
            ..
        } => {
            let experiment_config = experiment_config
                .as_deref()
                .map(load_experiment_config)
                .transpose()?;
            backend.run_experiments(
                mode,
                RunRequest {
                    run_args,
                    script_args,
                    image_id,
                    experiment_config,
                    dry_run,
                    package: module,
                    xgroup,
                },
                &docker_args,
            )
        }
        JobCommand::Cloud {
            module,
            dry_run,
            project_id,
            region,
            cloud_key,
            image_tag,
            experiment_config,
            xgroup,
            script_args,
            ..
        } => {
            let project_id = resolve_project_id(project_id, env::var("PROJECT_ID").ok())?;
            let region = resolve_region(region, env::var("REGION").ok());
            let cloud_key = resolve_cloud_key(
                cloud_key,
                env::var("GOOGLE_APPLICATION_CREDENTIALS").ok(),
            );
            let experiment_config = experiment_config
                .as_deref()
                .map(load_experiment_config)
                .transpose()?;
            backend.submit_cloud(
                mode,
                CloudRequest {
                    project_id,
                    region,
                    cloud_key,
                    image_tag,
                    script_args,
                    experiment_config,
                    dry_run,
                    package: module,
                    xgroup,
                },
                &docker_args,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceRoot;
    use serde_json::json;
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Interactive(JobMode, ShellRequest),
        Notebook(JobMode, NotebookRequest),
        Build(JobMode, String, DockerArgs),
        Run(JobMode, RunRequest),
        Cloud(JobMode, CloudRequest),
        Status(StatusQuery),
        Stop(StopRequest),
        Resubmit(ResubmitRequest),
        Cluster(Option<String>, ClusterCommand),
    }

    impl Call {
        fn name(&self) -> &'static str {
            match self {
                Call::Interactive(..) => "shell",
                Call::Notebook(..) => "notebook",
                Call::Build(..) => "build",
                Call::Run(..) => "run",
                Call::Cloud(..) => "cloud",
                Call::Status(..) => "status",
                Call::Stop(..) => "stop",
                Call::Resubmit(..) => "resubmit",
                Call::Cluster(..) => "cluster",
            }
        }
    }

    #[derive(Default)]
    struct MockBackend {
        calls: RefCell<Vec<Call>>,
        fail_with: Option<String>,
    }

    impl MockBackend {
        fn record(&self, call: Call) -> Result<Value, CalibanError> {
            self.calls.borrow_mut().push(call);
            match &self.fail_with {
                Some(message) => Err(CalibanError::Process(message.clone())),
                None => Ok(json!({})),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.borrow().clone()
        }
    }

    impl Backend for MockBackend {
        fn run_interactive(
            &self,
            mode: JobMode,
            request: ShellRequest,
            _docker_args: &DockerArgs,
        ) -> Result<Value, CalibanError> {
            self.record(Call::Interactive(mode, request))
        }

        fn run_notebook(
            &self,
            mode: JobMode,
            request: NotebookRequest,
            _docker_args: &DockerArgs,
        ) -> Result<Value, CalibanError> {
            self.record(Call::Notebook(mode, request))
        }

        fn build_image(
            &self,
            mode: JobMode,
            package: &str,
            docker_args: &DockerArgs,
        ) -> Result<Value, CalibanError> {
            self.record(Call::Build(mode, package.to_string(), docker_args.clone()))
        }

        fn run_experiments(
            &self,
            mode: JobMode,
            request: RunRequest,
            _docker_args: &DockerArgs,
        ) -> Result<Value, CalibanError> {
            self.record(Call::Run(mode, request))
        }

        fn submit_cloud(
            &self,
            mode: JobMode,
            request: CloudRequest,
            _docker_args: &DockerArgs,
        ) -> Result<Value, CalibanError> {
            self.record(Call::Cloud(mode, request))
        }

        fn get_status(&self, query: StatusQuery) -> Result<Value, CalibanError> {
            self.record(Call::Status(query))
        }

        fn stop(&self, request: StopRequest) -> Result<Value, CalibanError> {
            self.record(Call::Stop(request))
        }

        fn resubmit(
            &self,
            request: ResubmitRequest,
            _docker_args: &DockerArgs,
        ) -> Result<Value, CalibanError> {
            self.record(Call::Resubmit(request))
        }

        fn run_cli_command(
            &self,
            project_id: Option<&str>,
            command: &ClusterCommand,
        ) -> Result<Value, CalibanError> {
            self.record(Call::Cluster(
                project_id.map(str::to_string),
                command.clone(),
            ))
        }
    }

    fn make_context(dir: &Path) -> Context {
        Context {
            config_path: dir.join(".calibanconfig.json"),
            build_path: dir.to_path_buf(),
            caliban_home: dir.join("home"),
            resources: ResourceRoot::default(),
            json: true,
        }
    }

    fn module() -> String {
        "trainer.train".to_string()
    }

    fn run_command() -> JobCommand {
        JobCommand::Run {
            job: JobArgs::default(),
            module: module(),
            dry_run: true,
            image_id: Some("img".to_string()),
            experiment_config: None,
            xgroup: Some("sweep".to_string()),
            script_args: vec!["--epochs".to_string(), "2".to_string()],
        }
    }

    fn all_commands() -> Vec<(Command, &'static str)> {
        vec![
            (
                Command::Job(JobCommand::Shell {
                    job: JobArgs::default(),
                    bare: false,
                    shell: Shell::Bash,
                    image_id: None,
                }),
                "shell",
            ),
            (
                Command::Job(JobCommand::Notebook {
                    job: JobArgs::default(),
                    bare: false,
                    port: 8888,
                    lab: true,
                    jupyter_version: None,
                }),
                "notebook",
            ),
            (
                Command::Job(JobCommand::Build {
                    job: JobArgs::default(),
                    module: module(),
                }),
                "build",
            ),
            (
                Command::Job(JobCommand::Status {
                    xgroup: None,
                    max_jobs: 8,
                }),
                "status",
            ),
            (
                Command::Job(JobCommand::Stop {
                    xgroup: None,
                    dry_run: true,
                }),
                "stop",
            ),
            (
                Command::Job(JobCommand::Resubmit {
                    xgroup: None,
                    dry_run: true,
                    all_jobs: false,
                }),
                "resubmit",
            ),
            (Command::Job(run_command()), "run"),
            (
                Command::Job(JobCommand::Cloud {
                    job: JobArgs::default(),
                    module: module(),
                    dry_run: true,
                    project_id: Some("proj".to_string()),
                    region: Some("us-east1".to_string()),
                    cloud_key: Some("key.json".to_string()),
                    image_tag: None,
                    experiment_config: None,
                    xgroup: None,
                    tpu_spec: None,
                    script_args: Vec::new(),
                }),
                "cloud",
            ),
            (
                Command::Cluster {
                    project_id: None,
                    command: ClusterCommand::Ls,
                },
                "cluster",
            ),
        ]
    }

    #[test]
    fn every_command_reaches_exactly_one_backend() {
        let dir = tempdir().unwrap();
        let ctx = make_context(dir.path());
        for (command, expected) in all_commands() {
            let backend = MockBackend::default();
            dispatch(&ctx, command, &backend).unwrap();
            let calls = backend.calls();
            assert_eq!(calls.len(), 1, "{expected}");
            assert_eq!(calls[0].name(), expected);
        }
    }

    #[test]
    fn unknown_command_is_config_error_without_side_effects() {
        let dir = tempdir().unwrap();
        let ctx = make_context(dir.path());
        let backend = MockBackend::default();
        let err = dispatch(
            &ctx,
            Command::External(vec!["frobnicate".to_string()]),
            &backend,
        )
        .unwrap_err();
        assert!(matches!(err, CalibanError::Config(_)));
        assert!(err.to_string().contains("frobnicate"));
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn mount_home_is_negation_of_bare() {
        let dir = tempdir().unwrap();
        let ctx = make_context(dir.path());
        for bare in [true, false] {
            let backend = MockBackend::default();
            let shell = JobCommand::Shell {
                job: JobArgs::default(),
                bare,
                shell: Shell::Zsh,
                image_id: None,
            };
            dispatch(&ctx, Command::Job(shell), &backend).unwrap();
            let notebook = JobCommand::Notebook {
                job: JobArgs::default(),
                bare,
                port: 9999,
                lab: false,
                jupyter_version: Some("3.0".to_string()),
            };
            dispatch(&ctx, Command::Job(notebook), &backend).unwrap();

            match &backend.calls()[..] {
                [Call::Interactive(_, shell), Call::Notebook(_, notebook)] => {
                    assert_eq!(shell.mount_home, !bare);
                    assert_eq!(shell.shell, Shell::Zsh);
                    assert_eq!(notebook.mount_home, !bare);
                    assert_eq!(notebook.port, 9999);
                    assert_eq!(notebook.version.as_deref(), Some("3.0"));
                }
                other => panic!("unexpected calls {other:?}"),
            }
        }
    }

    #[test]
    fn build_receives_mode_and_args_from_same_input() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(".calibanconfig.json"),
            r#"{"apt_packages": ["libsm6"]}"#,
        )
        .unwrap();
        let ctx = make_context(dir.path());
        let command = JobCommand::Build {
            job: JobArgs {
                nogpu: true,
                ..JobArgs::default()
            },
            module: module(),
        };
        let expected_mode = resolve_job_mode(&command);
        let expected_args = generate_docker_args(expected_mode, &command, &ctx).unwrap();

        let backend = MockBackend::default();
        dispatch(&ctx, Command::Job(command), &backend).unwrap();

        assert_eq!(
            backend.calls(),
            vec![Call::Build(JobMode::Cpu, module(), expected_args.clone())]
        );
        assert_eq!(expected_mode, JobMode::Cpu);
        assert_eq!(expected_args.caliban_config.apt_packages, vec!["libsm6"]);
    }

    #[test]
    fn cluster_skips_job_resolution() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".calibanconfig.json"), "{\"bogus\": 1}").unwrap();
        let ctx = make_context(dir.path());

        let backend = MockBackend::default();
        let err = dispatch(
            &ctx,
            Command::Job(JobCommand::Build {
                job: JobArgs::default(),
                module: module(),
            }),
            &backend,
        )
        .unwrap_err();
        assert!(matches!(err, CalibanError::Config(_)));
        assert!(backend.calls().is_empty());

        dispatch(
            &ctx,
            Command::Cluster {
                project_id: Some("proj".to_string()),
                command: ClusterCommand::JobLs,
            },
            &backend,
        )
        .unwrap();
        assert_eq!(
            backend.calls(),
            vec![Call::Cluster(Some("proj".to_string()), ClusterCommand::JobLs)]
        );
    }

    #[test]
    fn run_forwards_fields_and_loads_experiment_config() {
        let dir = tempdir().unwrap();
        let exp = dir.path().join("exp.json");
        fs::write(&exp, r#"{"lr": [0.1, 0.2]}"#).unwrap();
        let ctx = make_context(dir.path());
        let mut command = run_command();
        if let JobCommand::Run {
            experiment_config,
            job,
            ..
        } = &mut command
        {
            *experiment_config = Some(exp.clone());
            job.docker_run_args = Some("--ipc host".to_string());
        }

        let backend = MockBackend::default();
        dispatch(&ctx, Command::Job(command), &backend).unwrap();
        match &backend.calls()[..] {
            [Call::Run(mode, request)] => {
                assert_eq!(*mode, JobMode::Gpu);
                assert_eq!(request.package, "trainer.train");
                assert_eq!(request.image_id.as_deref(), Some("img"));
                assert_eq!(request.xgroup.as_deref(), Some("sweep"));
                assert!(request.dry_run);
                assert_eq!(request.run_args, vec!["--ipc", "host"]);
                assert_eq!(request.script_args, vec!["--epochs", "2"]);
                assert_eq!(request.experiment_config, Some(json!({"lr": [0.1, 0.2]})));
            }
            other => panic!("unexpected calls {other:?}"),
        }
    }

    #[test]
    fn bad_experiment_config_fails_before_backend() {
        let dir = tempdir().unwrap();
        let exp = dir.path().join("exp.json");
        fs::write(&exp, "[1, 2]").unwrap();
        let ctx = make_context(dir.path());
        let mut command = run_command();
        if let JobCommand::Run {
            experiment_config, ..
        } = &mut command
        {
            *experiment_config = Some(exp);
        }
        let backend = MockBackend::default();
        assert!(dispatch(&ctx, Command::Job(command), &backend).is_err());
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn cloud_forwards_resolved_settings() {
        let dir = tempdir().unwrap();
        let ctx = make_context(dir.path());
        let backend = MockBackend::default();
        let (command, _) = all_commands().remove(7);
        dispatch(&ctx, command, &backend).unwrap();
        match &backend.calls()[..] {
            [Call::Cloud(mode, request)] => {
                assert_eq!(*mode, JobMode::Gpu);
                assert_eq!(request.project_id, "proj");
                assert_eq!(request.region, "us-east1");
                assert_eq!(request.cloud_key.as_deref(), Some("key.json"));
                assert!(request.dry_run);
            }
            other => panic!("unexpected calls {other:?}"),
        }
    }

    #[test]
    fn backend_errors_propagate_unchanged() {
        let dir = tempdir().unwrap();
        let ctx = make_context(dir.path());
        let backend = MockBackend {
            fail_with: Some("docker build exploded".to_string()),
            ..MockBackend::default()
        };
        let err = dispatch(&ctx, Command::Job(run_command()), &backend).unwrap_err();
        match err {
            CalibanError::Process(message) => assert_eq!(message, "docker build exploded"),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(backend.calls().len(), 1);
    }
}
