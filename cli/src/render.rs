// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Human readable rendering of events, reports and swarm tasks.

use colored::Colorize;
use conductor_core::domain::events::{
    ActionKind, ControlSignal, Event, EventPayload, EventSource, FileEdit, ObservationKind,
};
use conductor_core::domain::session::{SessionReport, SessionStatus};
use conductor_swarm::{SubtaskState, SwarmOutcome, SwarmTask};

const PREVIEW_CHARS: usize = 200;

fn preview(text: &str) -> String {
    let text = text.trim_end();
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

fn source_label(source: EventSource) -> &'static str {
    match source {
        EventSource::Agent => "agent",
        EventSource::Runtime => "runtime",
        EventSource::System => "system",
        EventSource::User => "user",
    }
}

/// One-line summary of an action.
pub fn describe_action(action: &ActionKind) -> String {
    match action {
        ActionKind::RunCommand { command, cwd: Some(cwd) } => format!("run `{}` in {}", command, cwd),
        ActionKind::RunCommand { command, cwd: None } => format!("run `{}`", command),
        ActionKind::EditFile {
            path,
            edit: FileEdit::Overwrite { content },
        } => format!("write {} ({} bytes)", path, content.len()),
        ActionKind::EditFile {
            path,
            edit: FileEdit::Replace { .. },
        } => format!("edit {}", path),
        ActionKind::ReadFile {
            path,
            start_line,
            end_line,
        } => match (start_line, end_line) {
            (None, None) => format!("read {}", path),
            (start, end) => format!(
                "read {} lines {}-{}",
                path,
                start.unwrap_or(1),
                end.map(|e| e.to_string()).unwrap_or_default()
            ),
        },
        ActionKind::Browse { url } => format!("browse {}", url),
        ActionKind::FinishTask { summary } => format!("finish: {}", summary),
        ActionKind::AskUser { question } => format!("ask: {}", question),
    }
}

/// Render a log entry for `--follow` output.
pub fn describe_event(event: &Event) -> String {
    let prefix = format!("[{:>4}] {:<7}", event.sequence_id, source_label(event.source)).dimmed();
    let body = match &event.payload {
        EventPayload::Action(action) => format!("{} {}", "→".cyan(), describe_action(&action.kind)),
        EventPayload::Observation(observation) => match &observation.kind {
            ObservationKind::CommandResult {
                exit_code,
                stdout,
                stderr,
            } => {
                let status = if *exit_code == 0 {
                    format!("exit {}", exit_code).green()
                } else {
                    format!("exit {}", exit_code).red()
                };
                let output = if stdout.trim().is_empty() { stderr } else { stdout };
                if output.trim().is_empty() {
                    format!("← {}", status)
                } else {
                    format!("← {} {}", status, preview(output))
                }
            }
            ObservationKind::FileContent { path, content } => {
                format!("← {} ({} lines)", path, content.lines().count())
            }
            ObservationKind::FileEdited { path, bytes_written } => {
                format!("← wrote {} bytes to {}", bytes_written, path)
            }
            ObservationKind::BrowseResult { url, status, content } => {
                format!("← {} {} ({} chars)", status, url, content.chars().count())
            }
            ObservationKind::UserResponse { text } => format!("← answer: {}", preview(text)),
            ObservationKind::Acknowledged { summary } => format!("← {}", summary.green()),
            ObservationKind::Error { error, message } => {
                format!("← {} {}", format!("{:?}", error).to_lowercase().red(), preview(message))
            }
        },
        EventPayload::Error(record) => format!("{} {}: {}", "✗".red(), record.kind, preview(&record.message)),
        EventPayload::Control(ControlSignal::Cancel { reason }) => format!(
            "{} cancel requested{}",
            "■".yellow(),
            reason.as_ref().map(|r| format!(": {}", r)).unwrap_or_default()
        ),
    };
    format!("{} {}", prefix, body)
}

pub fn status_label(status: SessionStatus) -> String {
    match status {
        SessionStatus::Finished => status.to_string().green().bold().to_string(),
        SessionStatus::Failed => status.to_string().red().bold().to_string(),
        SessionStatus::Cancelled => status.to_string().yellow().bold().to_string(),
        _ => status.to_string(),
    }
}

/// Multi-line summary of a finished session.
pub fn describe_report(report: &SessionReport) -> String {
    let mut out = format!(
        "Session {} {} after {} step(s) in {:.1}s",
        report.session_id,
        status_label(report.status),
        report.step_count,
        report.elapsed.as_secs_f64()
    );
    if let Some(failure) = &report.failure {
        out.push_str(&format!("\n  {}: {}", failure.kind.to_string().red(), failure.reason));
        if !failure.recent_events.is_empty() {
            out.push_str(&format!("\n  {}", "Last events:".dimmed()));
            for event in &failure.recent_events {
                out.push_str(&format!("\n    {}", describe_event(event)));
            }
        }
    }
    out
}

pub fn subtask_label(state: &SubtaskState) -> String {
    match state {
        SubtaskState::Queued => "queued".dimmed().to_string(),
        SubtaskState::Running => "running".cyan().to_string(),
        SubtaskState::Finished => "finished".green().to_string(),
        SubtaskState::Failed { kind, .. } => format!("failed ({})", kind).red().to_string(),
        SubtaskState::Cancelled => "cancelled".yellow().to_string(),
    }
}

/// Per-subtask table plus the aggregate verdict.
pub fn describe_swarm(task: &SwarmTask) -> String {
    let mut out = format!("Swarm task {}: {}", task.id, task.parent_goal.bold());
    for subtask in &task.subtasks {
        out.push_str(&format!(
            "\n  {:>2}. {:<12} {}",
            subtask.index + 1,
            subtask_label(&subtask.state),
            subtask.description
        ));
        if let Some(session_id) = subtask.assigned_session_id {
            out.push_str(&format!(" {}", format!("[{}]", session_id).dimmed()));
        }
        if let SubtaskState::Failed { reason, .. } = &subtask.state {
            out.push_str(&format!("\n      {}", reason));
        }
    }
    match task.outcome() {
        Some(SwarmOutcome::Success) => out.push_str(&format!("\n{}", "✓ All subtasks finished".green())),
        Some(SwarmOutcome::PartialFailure { failures }) => out.push_str(&format!(
            "\n{}",
            format!("✗ {} of {} subtasks did not finish", failures.len(), task.subtasks.len()).red()
        )),
        None => {}
    }
    out
}
