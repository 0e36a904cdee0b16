// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Scripted Thinker and Planners
//
// Deterministic implementations of the reasoning capabilities. The CLI uses
// them to replay a decision script, and tests use them to drive the
// controller through exact sequences.
//
// A script is a YAML document:
//
//   steps:
//     - decision: act
//       action:
//         action: run_command
//         command: cargo test
//     - decision: terminate
//       signal:
//         outcome: success
//         reason: tests pass

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::domain::events::SessionId;
use crate::domain::thinker::{Decision, Planner, PlannerError, Thinker, ThinkerError, ThinkingContext};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkerScript {
    pub steps: Vec<Decision>,
}

/// Replays a fixed list of steps. Each session gets its own cursor, so one
/// instance can drive every session of a swarm. Cursors are dropped when
/// their session ends.
pub struct ScriptedThinker {
    steps: Vec<Result<Decision, ThinkerError>>,
    cursors: Mutex<HashMap<SessionId, usize>>,
    when_exhausted: Decision,
}

impl ScriptedThinker {
    pub fn new(steps: Vec<Decision>) -> Self {
        Self::with_outcomes(steps.into_iter().map(Ok).collect())
    }

    /// Steps may also be errors, returned in place of a decision.
    pub fn with_outcomes(steps: Vec<Result<Decision, ThinkerError>>) -> Self {
        Self {
            steps,
            cursors: Mutex::new(HashMap::new()),
            when_exhausted: Decision::give_up("decision script exhausted"),
        }
    }

    /// Decision returned once a session has consumed every step.
    pub fn when_exhausted(mut self, decision: Decision) -> Self {
        self.when_exhausted = decision;
        self
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let script: ThinkerScript = serde_yaml::from_str(yaml)?;
        Ok(Self::new(script.steps))
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read script {}: {}", path.display(), e))?;
        Self::from_yaml_str(&content)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// How many steps `session_id` has consumed.
    pub fn position(&self, session_id: SessionId) -> usize {
        self.cursors.lock().get(&session_id).copied().unwrap_or(0)
    }

    /// Sessions that still hold a cursor.
    pub fn tracked_sessions(&self) -> usize {
        self.cursors.lock().len()
    }
}

#[async_trait]
impl Thinker for ScriptedThinker {
    async fn decide(&self, context: ThinkingContext<'_>) -> Result<Decision, ThinkerError> {
        let index = {
            let mut cursors = self.cursors.lock();
            let cursor = cursors.entry(context.session_id).or_insert(0);
            let index = *cursor;
            *cursor += 1;
            index
        };

        debug!(
            session_id = %context.session_id,
            step = index,
            history_len = context.history.len(),
            attempt = context.attempt,
            "Scripted decision"
        );
        match self.steps.get(index) {
            Some(step) => step.clone(),
            None => Ok(self.when_exhausted.clone()),
        }
    }

    fn end_session(&self, session_id: SessionId) {
        self.cursors.lock().remove(&session_id);
    }
}

/// One subtask per non-empty line of the goal, with list markers (`-`, `*`,
/// `1.`, `2)`) stripped. A single-line goal becomes a single subtask.
#[derive(Debug, Clone, Default)]
pub struct LinePlanner;

impl LinePlanner {
    pub fn new() -> Self {
        Self
    }

    fn strip_marker(line: &str) -> &str {
        let line = line.trim();
        for marker in ['-', '*'] {
            if let Some(rest) = line.strip_prefix(marker) {
                if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                    return rest.trim();
                }
            }
        }
        let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits > 0 {
            let rest = &line[digits..];
            if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
                return rest.trim();
            }
        }
        line
    }
}

#[async_trait]
impl Planner for LinePlanner {
    async fn plan(&self, goal: &str) -> Result<Vec<String>, PlannerError> {
        let subtasks: Vec<String> = goal
            .lines()
            .map(Self::strip_marker)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if subtasks.is_empty() {
            return Err(PlannerError::Unplannable("goal is empty".to_string()));
        }
        Ok(subtasks)
    }
}

/// Always returns the same subtasks, whatever the goal.
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    subtasks: Vec<String>,
}

impl StaticPlanner {
    pub fn new<I, S>(subtasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subtasks: subtasks.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Planner for StaticPlanner {
    async fn plan(&self, _goal: &str) -> Result<Vec<String>, PlannerError> {
        Ok(self.subtasks.clone())
    }
}
