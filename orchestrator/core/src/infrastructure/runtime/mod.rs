// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Runtime backends.
//!
//! - [`process::LocalProcessRuntime`] runs commands with the host shell inside
//!   a per-session workspace directory.
//! - [`docker::DockerRuntime`] runs them inside a per-session container.
//! - [`remote::RemoteRuntime`] forwards actions to an HTTP executor service.
//!
//! [`ConfiguredRuntimeFactory`] picks the backend from
//! [`RuntimeBackendConfig`] and creates one runtime per session.

pub mod docker;
pub mod process;
pub mod remote;

use async_trait::async_trait;
use tracing::info;

use crate::domain::config::RuntimeBackendConfig;
use crate::domain::events::{ActionId, Observation, ObservationErrorKind, ObservationKind, SessionId};
use crate::domain::runtime::{Runtime, RuntimeError, RuntimeFactory};

pub use docker::DockerRuntime;
pub use process::LocalProcessRuntime;
pub use remote::RemoteRuntime;

pub struct ConfiguredRuntimeFactory {
    config: RuntimeBackendConfig,
}

impl ConfiguredRuntimeFactory {
    pub fn new(config: RuntimeBackendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RuntimeBackendConfig {
        &self.config
    }
}

#[async_trait]
impl RuntimeFactory for ConfiguredRuntimeFactory {
    async fn create(&self, session_id: SessionId) -> Result<Box<dyn Runtime>, RuntimeError> {
        info!(session_id = %session_id, backend = self.config.name(), "Creating runtime");
        let runtime: Box<dyn Runtime> = match &self.config {
            RuntimeBackendConfig::Process(config) => {
                Box::new(LocalProcessRuntime::create(session_id, config.clone()).await?)
            }
            RuntimeBackendConfig::Docker(config) => Box::new(DockerRuntime::connect(session_id, config.clone())?),
            RuntimeBackendConfig::Remote(config) => Box::new(RemoteRuntime::new(session_id, config.clone())?),
        };
        Ok(runtime)
    }
}

/// Decode process output lossily and cap it at `max_bytes`, cutting on a
/// char boundary.
pub(crate) fn truncate_output(bytes: &[u8], max_bytes: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    truncate_text(&text, max_bytes)
}

pub(crate) fn truncate_text(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[output truncated: {} bytes omitted]", &text[..cut], text.len() - cut)
}

/// Apply a `Replace` edit. The old text must occur exactly once.
pub(crate) fn replace_once(content: &str, old: &str, new: &str) -> Result<String, RuntimeError> {
    match content.matches(old).count() {
        1 => Ok(content.replacen(old, new, 1)),
        0 => Err(RuntimeError::ActionRejected(
            "text to replace was not found in the file".to_string(),
        )),
        n => Err(RuntimeError::ActionRejected(format!(
            "text to replace is ambiguous: found {} occurrences",
            n
        ))),
    }
}

/// Select 1-based inclusive lines. Open ends run to the start / end of the
/// file.
pub(crate) fn slice_lines(content: &str, start_line: Option<usize>, end_line: Option<usize>) -> String {
    if start_line.is_none() && end_line.is_none() {
        return content.to_string();
    }
    let start = start_line.unwrap_or(1).max(1);
    let end = end_line.unwrap_or(usize::MAX);
    content
        .lines()
        .enumerate()
        .filter(|(i, _)| (start..=end).contains(&(i + 1)))
        .map(|(_, line)| line)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Fetch a page for a `Browse` action. HTML is converted to Markdown.
/// Unreachable or failing sites are reported as error observations; the
/// runtime itself is still healthy.
pub(crate) async fn browse(
    client: &reqwest::Client,
    action_id: ActionId,
    url: &str,
    max_bytes: usize,
) -> Result<Observation, RuntimeError> {
    let parsed = url::Url::parse(url).map_err(|e| RuntimeError::ActionRejected(format!("invalid url {}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RuntimeError::ActionRejected(format!(
            "unsupported url scheme: {}",
            parsed.scheme()
        )));
    }

    let response = match client.get(parsed).send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() => {
            return Ok(Observation::error(
                action_id,
                ObservationErrorKind::Timeout,
                format!("request to {} timed out", url),
            ))
        }
        Err(e) => {
            return Ok(Observation::error(
                action_id,
                ObservationErrorKind::Failed,
                format!("request to {} failed: {}", url, e),
            ))
        }
    };

    let status = response.status().as_u16();
    let is_html = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("html"));
    let body = match response.text().await {
        Ok(body) => body,
        Err(e) => {
            return Ok(Observation::error(
                action_id,
                ObservationErrorKind::Failed,
                format!("failed to read response from {}: {}", url, e),
            ))
        }
    };
    let content = if is_html { html2md::parse_html(&body) } else { body };

    Ok(Observation::new(
        action_id,
        ObservationKind::BrowseResult {
            url: url.to_string(),
            status,
            content: truncate_text(&content, max_bytes),
        },
    ))
}

pub(crate) fn control_action_rejected() -> RuntimeError {
    RuntimeError::ActionRejected("finish_task and ask_user are handled by the controller".to_string())
}
