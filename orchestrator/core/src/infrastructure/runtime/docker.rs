// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bollard::container::{Config, CreateContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{browse, control_action_rejected, replace_once, slice_lines, truncate_output};
use crate::domain::config::DockerRuntimeConfig;
use crate::domain::events::{
    Action, ActionId, ActionKind, FileEdit, Observation, ObservationErrorKind, ObservationKind, SessionId,
};
use crate::domain::path_sanitizer::PathSanitizer;
use crate::domain::runtime::{Runtime, RuntimeError, RuntimeKind};

/// Reads `$2` bytes of base64 from stdin into path `$1`, creating parent
/// directories.
const WRITE_FILE_SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" && head -c "$2" | base64 -d > "$1""#;

/// Exit status of `timeout -s KILL` when it had to kill the command.
const KILLED_EXIT_CODE: i64 = 137;

/// Extra time the client waits past the in-container deadline before giving up
/// on the exec stream.
const EXEC_KILL_GRACE: Duration = Duration::from_secs(5);

struct ExecOutput {
    exit_code: i64,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// One container per session, created on the first action and kept alive
/// with `tail -f /dev/null`. Actions run through `docker exec`.
pub struct DockerRuntime {
    docker: Docker,
    session_id: SessionId,
    config: DockerRuntimeConfig,
    container: Mutex<Option<String>>,
    sanitizer: PathSanitizer,
    http: reqwest::Client,
    disposed: AtomicBool,
}

impl DockerRuntime {
    pub fn connect(session_id: SessionId, config: DockerRuntimeConfig) -> Result<Self, RuntimeError> {
        let docker = match &config.socket {
            Some(path) => {
                #[cfg(unix)]
                let result = Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION);

                #[cfg(windows)]
                let result = Docker::connect_with_named_pipe(path, 120, bollard::API_DEFAULT_VERSION);

                result.map_err(|e| {
                    RuntimeError::EnvironmentUnavailable(format!(
                        "Failed to connect to Docker at {}: {}\n\n\
                         Ensure Docker is running and the socket path is correct.",
                        path, e
                    ))
                })?
            }
            None => Docker::connect_with_local_defaults().map_err(|e| {
                RuntimeError::EnvironmentUnavailable(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Common causes:\n\
                     - Docker daemon not running (check: docker ps)\n\
                     - Permission denied accessing Docker socket",
                    e
                ))
            })?,
        };

        let http = reqwest::Client::builder()
            .timeout(config.command_timeout)
            .build()
            .map_err(|e| RuntimeError::EnvironmentUnavailable(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            docker,
            session_id,
            config,
            container: Mutex::new(None),
            sanitizer: PathSanitizer::new(),
            http,
            disposed: AtomicBool::new(false),
        })
    }

    /// Verify Docker daemon is accessible
    pub async fn healthcheck(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(|e| {
            RuntimeError::EnvironmentUnavailable(format!("Cannot connect to Docker daemon: {}", e))
        })?;
        Ok(())
    }

    async fn ensure_image(&self) -> Result<(), RuntimeError> {
        let image = &self.config.image;
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("Pulling image: {}", image);
        let options = Some(CreateImageOptions {
            from_image: image.clone(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(RuntimeError::EnvironmentUnavailable(format!(
                    "Failed to pull image {}: {}\n\nTry manually: docker pull {}",
                    image, e, image
                )));
            }
        }
        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    /// Container id for this session, creating and starting it if needed.
    async fn container_id(&self) -> Result<String, RuntimeError> {
        let mut container = self.container.lock().await;
        if let Some(id) = container.as_ref() {
            return Ok(id.clone());
        }

        self.ensure_image().await?;

        let mut host_config = bollard::service::HostConfig {
            network_mode: self.config.network_mode.clone(),
            ..Default::default()
        };
        if let Some(memory_bytes) = self.config.memory_bytes {
            host_config.memory = Some(memory_bytes);
        }

        let options = CreateContainerOptions {
            name: format!("conductor-session-{}", self.session_id),
            platform: None,
        };
        let env_vars: Vec<String> = self
            .config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        let container_config = Config {
            image: Some(self.config.image.clone()),
            tty: Some(true),
            cmd: Some(vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]),
            env: Some(env_vars),
            working_dir: Some(self.config.workdir.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| RuntimeError::EnvironmentUnavailable(format!("Failed to create container: {}", e)))?;
        let id = created.id;

        self.docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::EnvironmentUnavailable(format!("Failed to start container: {}", e)))?;

        info!(session_id = %self.session_id, container_id = %id, "Started session container");
        *container = Some(id.clone());
        Ok(id)
    }

    async fn exec(&self, cmd: Vec<String>, working_dir: Option<String>) -> Result<ExecOutput, RuntimeError> {
        self.exec_with_input(cmd, working_dir, None).await
    }

    async fn exec_with_input(
        &self,
        cmd: Vec<String>,
        working_dir: Option<String>,
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput, RuntimeError> {
        let container_id = self.container_id().await?;
        let exec_config = CreateExecOptions {
            attach_stdin: Some(stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(cmd),
            working_dir,
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&container_id, exec_config)
            .await
            .map_err(map_docker_error)?;

        let start_opts = StartExecOptions {
            detach: false,
            ..Default::default()
        };
        let res = self
            .docker
            .start_exec(&exec.id, Some(start_opts))
            .await
            .map_err(map_docker_error)?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, mut input } = res {
            if let Some(bytes) = stdin {
                input.write_all(bytes).await.map_err(|e| RuntimeError::Transient(e.to_string()))?;
                input.flush().await.map_err(|e| RuntimeError::Transient(e.to_string()))?;
                // The script reads exactly the announced length.
                let _ = input.shutdown().await;
            }
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                    Ok(_) => {}
                    Err(e) => return Err(map_docker_error(e)),
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await.map_err(map_docker_error)?;
        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, RuntimeError> {
        self.sanitizer
            .resolve(path, Path::new(&self.config.workdir))
            .map_err(|e| RuntimeError::ActionRejected(e.to_string()))
    }

    fn display_path(&self, resolved: &Path) -> String {
        self.sanitizer
            .relative_to_workspace(resolved, Path::new(&self.config.workdir))
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| resolved.display().to_string())
    }

    async fn run_command(
        &self,
        action_id: ActionId,
        command: &str,
        cwd: Option<&str>,
    ) -> Result<Observation, RuntimeError> {
        let working_dir = match cwd {
            Some(cwd) => self.resolve(cwd)?,
            None => PathBuf::from(&self.config.workdir),
        };
        let limit = self.config.command_timeout;
        let started = Instant::now();

        // `timeout` kills the command inside the container; the client-side
        // deadline only covers a daemon that stops answering.
        match tokio::time::timeout(
            limit + EXEC_KILL_GRACE,
            self.exec(command_argv(command, limit), Some(working_dir.display().to_string())),
        )
        .await
        {
            Ok(output) => {
                let output = output?;
                if output.exit_code == KILLED_EXIT_CODE && started.elapsed() >= limit {
                    warn!(session_id = %self.session_id, timeout = ?limit, "Container command killed after timeout");
                    return Ok(Observation::error(
                        action_id,
                        ObservationErrorKind::Timeout,
                        format!("command exceeded {:?} and was killed", limit),
                    ));
                }
                Ok(Observation::new(
                    action_id,
                    ObservationKind::CommandResult {
                        exit_code: output.exit_code,
                        stdout: truncate_output(&output.stdout, self.config.max_output_bytes),
                        stderr: truncate_output(&output.stderr, self.config.max_output_bytes),
                    },
                ))
            }
            Err(_) => {
                warn!(session_id = %self.session_id, timeout = ?limit, "Container exec did not return after timeout");
                Ok(Observation::error(
                    action_id,
                    ObservationErrorKind::Timeout,
                    format!("command exceeded {:?}", limit),
                ))
            }
        }
    }

    async fn cat(&self, resolved: &Path) -> Result<String, RuntimeError> {
        let output = self
            .exec(vec!["cat".to_string(), resolved.display().to_string()], None)
            .await?;
        if output.exit_code != 0 {
            return Err(RuntimeError::ActionRejected(format!(
                "cannot read {}: {}",
                self.display_path(resolved),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn write(&self, resolved: &Path, content: &str) -> Result<(), RuntimeError> {
        let encoded = STANDARD.encode(content.as_bytes());
        let cmd = write_file_argv(resolved, encoded.len());
        let output = self.exec_with_input(cmd, None, Some(encoded.as_bytes())).await?;
        if output.exit_code != 0 {
            return Err(RuntimeError::ActionRejected(format!(
                "cannot write {}: {}",
                self.display_path(resolved),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn remove_container(&self) -> Result<(), RuntimeError> {
        let Some(id) = self.container.lock().await.take() else {
            return Ok(());
        };
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&id, Some(options)).await {
            Ok(()) => {
                info!(session_id = %self.session_id, container_id = %id, "Removed session container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(RuntimeError::Transient(format!("Failed to remove container {}: {}", id, e))),
        }
    }
}

/// Runs `command` through the shell under a `timeout` that sends SIGKILL once
/// `limit` (rounded up to whole seconds) has passed.
fn command_argv(command: &str, limit: Duration) -> Vec<String> {
    let secs = limit.as_millis().div_ceil(1000).max(1);
    vec![
        "timeout".to_string(),
        "-s".to_string(),
        "KILL".to_string(),
        secs.to_string(),
        "sh".to_string(),
        "-c".to_string(),
        command.to_string(),
    ]
}

/// File content travels over stdin; only the path and length are arguments.
fn write_file_argv(resolved: &Path, encoded_len: usize) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        WRITE_FILE_SCRIPT.to_string(),
        "sh".to_string(),
        resolved.display().to_string(),
        encoded_len.to_string(),
    ]
}

fn map_docker_error(e: bollard::errors::Error) -> RuntimeError {
    match e {
        // Container gone or no longer running.
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 409,
            message,
        } => RuntimeError::EnvironmentUnavailable(message),
        other => RuntimeError::Transient(other.to_string()),
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn execute(&self, action: &Action) -> Result<Observation, RuntimeError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RuntimeError::EnvironmentUnavailable("runtime has been disposed".to_string()));
        }
        let id = action.action_id;
        debug!(session_id = %self.session_id, action = action.kind.name(), "Executing in container");

        match &action.kind {
            ActionKind::RunCommand { command, cwd } => self.run_command(id, command, cwd.as_deref()).await,
            ActionKind::ReadFile {
                path,
                start_line,
                end_line,
            } => {
                let resolved = self.resolve(path)?;
                let content = self.cat(&resolved).await?;
                Ok(Observation::new(
                    id,
                    ObservationKind::FileContent {
                        path: self.display_path(&resolved),
                        content: slice_lines(&content, *start_line, *end_line),
                    },
                ))
            }
            ActionKind::EditFile { path, edit } => {
                let resolved = self.resolve(path)?;
                let content = match edit {
                    FileEdit::Overwrite { content } => content.clone(),
                    FileEdit::Replace { old, new } => replace_once(&self.cat(&resolved).await?, old, new)?,
                };
                self.write(&resolved, &content).await?;
                Ok(Observation::new(
                    id,
                    ObservationKind::FileEdited {
                        path: self.display_path(&resolved),
                        bytes_written: content.len() as u64,
                    },
                ))
            }
            // Fetched from the host; the container's network mode does not apply.
            ActionKind::Browse { url } => browse(&self.http, id, url, self.config.max_output_bytes).await,
            ActionKind::FinishTask { .. } | ActionKind::AskUser { .. } => Err(control_action_rejected()),
        }
    }

    /// Throw the container away; the next action starts a fresh one.
    async fn reset(&self) -> Result<(), RuntimeError> {
        self.remove_container()
            .await
            .map_err(|e| RuntimeError::EnvironmentUnavailable(e.to_string()))
    }

    async fn dispose(&self) -> Result<(), RuntimeError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.remove_container().await
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Docker
    }
}
