// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Local Process Runtime
//
// Executes actions on the host. Each session gets its own workspace
// directory; commands run through the configured shell with that directory
// as their working directory, and file actions are confined to it by the
// PathSanitizer. This is the lightest backend and offers no isolation
// beyond the workspace boundary for file actions.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{browse, control_action_rejected, replace_once, slice_lines, truncate_output};
use crate::domain::config::ProcessRuntimeConfig;
use crate::domain::events::{
    Action, ActionId, ActionKind, FileEdit, Observation, ObservationErrorKind, ObservationKind, SessionId,
};
use crate::domain::path_sanitizer::PathSanitizer;
use crate::domain::runtime::{Runtime, RuntimeError, RuntimeKind};

pub struct LocalProcessRuntime {
    session_id: SessionId,
    workspace: PathBuf,
    config: ProcessRuntimeConfig,
    sanitizer: PathSanitizer,
    http: reqwest::Client,
    disposed: AtomicBool,
}

impl LocalProcessRuntime {
    /// Create the session workspace under `workspace_root`, or under the
    /// system temp directory when none is configured.
    pub async fn create(session_id: SessionId, config: ProcessRuntimeConfig) -> Result<Self, RuntimeError> {
        let root = config
            .workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("conductor"));
        let workspace = root.join(session_id.to_string());
        tokio::fs::create_dir_all(&workspace).await.map_err(|e| {
            RuntimeError::EnvironmentUnavailable(format!(
                "failed to create workspace {}: {}",
                workspace.display(),
                e
            ))
        })?;

        let http = reqwest::Client::builder()
            .timeout(config.browse_timeout)
            .build()
            .map_err(|e| RuntimeError::EnvironmentUnavailable(format!("failed to build http client: {}", e)))?;

        info!(session_id = %session_id, workspace = %workspace.display(), "Created process workspace");
        Ok(Self {
            session_id,
            workspace,
            config,
            sanitizer: PathSanitizer::new(),
            http,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, RuntimeError> {
        self.sanitizer
            .resolve(path, &self.workspace)
            .map_err(|e| RuntimeError::ActionRejected(e.to_string()))
    }

    fn display_path(&self, resolved: &Path) -> String {
        self.sanitizer
            .relative_to_workspace(resolved, &self.workspace)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| resolved.display().to_string())
    }

    async fn run_command(
        &self,
        action_id: ActionId,
        command: &str,
        cwd: Option<&str>,
    ) -> Result<Observation, RuntimeError> {
        let dir = match cwd {
            Some(cwd) => self.resolve(cwd)?,
            None => self.workspace.clone(),
        };
        if !dir.is_dir() {
            return Err(RuntimeError::ActionRejected(format!(
                "working directory does not exist: {}",
                self.display_path(&dir)
            )));
        }

        debug!(session_id = %self.session_id, command = %command, "Running command");
        let child = Command::new(&self.config.shell)
            .arg("-c")
            .arg(command)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RuntimeError::EnvironmentUnavailable(format!("failed to spawn {}: {}", self.config.shell, e))
            })?;

        // Dropping the child on timeout kills it.
        match tokio::time::timeout(self.config.command_timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(Observation::new(
                action_id,
                ObservationKind::CommandResult {
                    exit_code: output.status.code().map(i64::from).unwrap_or(-1),
                    stdout: truncate_output(&output.stdout, self.config.max_output_bytes),
                    stderr: truncate_output(&output.stderr, self.config.max_output_bytes),
                },
            )),
            Ok(Err(e)) => Err(RuntimeError::Transient(format!("failed to collect command output: {}", e))),
            Err(_) => {
                warn!(
                    session_id = %self.session_id,
                    timeout = ?self.config.command_timeout,
                    "Command timed out and was killed"
                );
                Ok(Observation::error(
                    action_id,
                    ObservationErrorKind::Timeout,
                    format!("command exceeded {:?} and was killed", self.config.command_timeout),
                ))
            }
        }
    }

    async fn read_file(
        &self,
        action_id: ActionId,
        path: &str,
        start_line: Option<usize>,
        end_line: Option<usize>,
    ) -> Result<Observation, RuntimeError> {
        let resolved = self.resolve(path)?;
        let content = read_existing(&resolved).await?;
        Ok(Observation::new(
            action_id,
            ObservationKind::FileContent {
                path: self.display_path(&resolved),
                content: slice_lines(&content, start_line, end_line),
            },
        ))
    }

    async fn edit_file(&self, action_id: ActionId, path: &str, edit: &FileEdit) -> Result<Observation, RuntimeError> {
        let resolved = self.resolve(path)?;
        let content = match edit {
            FileEdit::Overwrite { content } => {
                if let Some(parent) = resolved.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| io_failure("create directory", parent, e))?;
                }
                content.clone()
            }
            FileEdit::Replace { old, new } => replace_once(&read_existing(&resolved).await?, old, new)?,
        };

        tokio::fs::write(&resolved, content.as_bytes())
            .await
            .map_err(|e| io_failure("write", &resolved, e))?;

        Ok(Observation::new(
            action_id,
            ObservationKind::FileEdited {
                path: self.display_path(&resolved),
                bytes_written: content.len() as u64,
            },
        ))
    }

    fn ensure_live(&self) -> Result<(), RuntimeError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RuntimeError::EnvironmentUnavailable("runtime has been disposed".to_string()));
        }
        Ok(())
    }
}

async fn read_existing(path: &Path) -> Result<String, RuntimeError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RuntimeError::ActionRejected(format!(
            "no such file: {}",
            path.display()
        ))),
        Err(e) if path.is_dir() => Err(RuntimeError::ActionRejected(format!(
            "{} is a directory: {}",
            path.display(),
            e
        ))),
        Err(e) => Err(io_failure("read", path, e)),
    }
}

fn io_failure(op: &str, path: &Path, e: std::io::Error) -> RuntimeError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            RuntimeError::ActionRejected(format!("permission denied: {} {}", op, path.display()))
        }
        _ => RuntimeError::Transient(format!("failed to {} {}: {}", op, path.display(), e)),
    }
}

#[async_trait]
impl Runtime for LocalProcessRuntime {
    async fn execute(&self, action: &Action) -> Result<Observation, RuntimeError> {
        self.ensure_live()?;
        let id = action.action_id;
        match &action.kind {
            ActionKind::RunCommand { command, cwd } => self.run_command(id, command, cwd.as_deref()).await,
            ActionKind::ReadFile {
                path,
                start_line,
                end_line,
            } => self.read_file(id, path, *start_line, *end_line).await,
            ActionKind::EditFile { path, edit } => self.edit_file(id, path, edit).await,
            ActionKind::Browse { url } => browse(&self.http, id, url, self.config.max_output_bytes).await,
            ActionKind::FinishTask { .. } | ActionKind::AskUser { .. } => Err(control_action_rejected()),
        }
    }

    async fn reset(&self) -> Result<(), RuntimeError> {
        self.ensure_live()?;
        info!(session_id = %self.session_id, "Resetting process workspace");
        match tokio::fs::remove_dir_all(&self.workspace).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(RuntimeError::EnvironmentUnavailable(format!(
                    "failed to clear workspace: {}",
                    e
                )))
            }
        }
        tokio::fs::create_dir_all(&self.workspace)
            .await
            .map_err(|e| RuntimeError::EnvironmentUnavailable(format!("failed to recreate workspace: {}", e)))
    }

    async fn dispose(&self) -> Result<(), RuntimeError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.config.keep_workspace {
            info!(session_id = %self.session_id, workspace = %self.workspace.display(), "Keeping workspace");
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.workspace).await {
            Ok(()) => {
                debug!(session_id = %self.session_id, "Removed process workspace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RuntimeError::Transient(format!("failed to remove workspace: {}", e))),
        }
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Process
    }
}
