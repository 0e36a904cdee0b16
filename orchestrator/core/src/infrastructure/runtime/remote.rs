// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Remote Runtime
//
// Forwards actions to an executor service over HTTP:
//
//   POST   {endpoint}/sessions/{session_id}/execute   Action JSON -> Observation JSON
//   POST   {endpoint}/sessions/{session_id}/reset
//   DELETE {endpoint}/sessions/{session_id}
//
// Status mapping for execute:
//   2xx            -> observation from the body
//   408            -> ExecutionTimeout
//   404 / 410      -> EnvironmentUnavailable (executor lost the sandbox)
//   other 4xx      -> ActionRejected
//   5xx, I/O error -> Transient
//   client timeout -> Timeout observation

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::domain::config::RemoteRuntimeConfig;
use crate::domain::events::{Action, Observation, ObservationErrorKind, SessionId};
use crate::domain::runtime::{Runtime, RuntimeError, RuntimeKind};

pub struct RemoteRuntime {
    session_id: SessionId,
    base_url: String,
    client: reqwest::Client,
    config: RemoteRuntimeConfig,
    disposed: AtomicBool,
}

impl RemoteRuntime {
    pub fn new(session_id: SessionId, config: RemoteRuntimeConfig) -> Result<Self, RuntimeError> {
        let endpoint = url::Url::parse(&config.endpoint).map_err(|e| {
            RuntimeError::EnvironmentUnavailable(format!("invalid executor endpoint '{}': {}", config.endpoint, e))
        })?;
        let base_url = format!(
            "{}/sessions/{}",
            endpoint.as_str().trim_end_matches('/'),
            session_id
        );

        let mut builder = reqwest::Client::builder();
        if !config.request_timeout.is_zero() {
            builder = builder.timeout(config.request_timeout);
        }
        let client = builder
            .build()
            .map_err(|e| RuntimeError::EnvironmentUnavailable(format!("failed to build http client: {}", e)))?;

        info!(session_id = %session_id, endpoint = %config.endpoint, "Created remote runtime");
        Ok(Self {
            session_id,
            base_url,
            client,
            config,
            disposed: AtomicBool::new(false),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn failure(response: Response) -> RuntimeError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = if body.is_empty() {
            status.to_string()
        } else {
            format!("{}: {}", status, body)
        };
        match status {
            StatusCode::REQUEST_TIMEOUT => RuntimeError::ExecutionTimeout(detail),
            StatusCode::NOT_FOUND | StatusCode::GONE => RuntimeError::EnvironmentUnavailable(detail),
            s if s.is_client_error() => RuntimeError::ActionRejected(detail),
            _ => RuntimeError::Transient(detail),
        }
    }
}

#[async_trait]
impl Runtime for RemoteRuntime {
    async fn execute(&self, action: &Action) -> Result<Observation, RuntimeError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(RuntimeError::EnvironmentUnavailable("runtime has been disposed".to_string()));
        }

        debug!(session_id = %self.session_id, action = action.kind.name(), "Forwarding action to executor");
        let request = self
            .authorize(self.client.post(format!("{}/execute", self.base_url)))
            .json(action);

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Ok(Observation::error(
                    action.action_id,
                    ObservationErrorKind::Timeout,
                    format!("executor did not answer within {:?}", self.config.request_timeout),
                ))
            }
            Err(e) => return Err(RuntimeError::Transient(format!("executor request failed: {}", e))),
        };

        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }

        let observation: Observation = response
            .json()
            .await
            .map_err(|e| RuntimeError::Transient(format!("malformed executor response: {}", e)))?;
        if observation.action_id != action.action_id {
            return Err(RuntimeError::Transient(format!(
                "executor answered for action {} instead of {}",
                observation.action_id, action.action_id
            )));
        }
        Ok(observation)
    }

    async fn reset(&self) -> Result<(), RuntimeError> {
        info!(session_id = %self.session_id, "Resetting remote environment");
        let response = self
            .authorize(self.client.post(format!("{}/reset", self.base_url)))
            .send()
            .await
            .map_err(|e| RuntimeError::EnvironmentUnavailable(format!("executor reset failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(match Self::failure(response).await {
                RuntimeError::Transient(detail) => RuntimeError::EnvironmentUnavailable(detail),
                other => other,
            });
        }
        Ok(())
    }

    async fn dispose(&self) -> Result<(), RuntimeError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let response = self
            .authorize(self.client.delete(&self.base_url))
            .send()
            .await
            .map_err(|e| RuntimeError::Transient(format!("executor dispose failed: {}", e)))?;
        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            s => {
                warn!(session_id = %self.session_id, status = %s, "Executor refused to dispose session");
                Err(Self::failure(response).await)
            }
        }
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Remote
    }
}
