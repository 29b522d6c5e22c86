//! Per-task progress snapshot kept by the session store.

use crate::verdict::Verdict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Where a task-run stands inside the iteration controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Init,
    Running,
    Retry,
    Completed,
    AskHuman,
    Aborted,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Retry => "retry",
            Self::Completed => "completed",
            Self::AskHuman => "ask_human",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifacts touched by the most recent worker invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Commit the working tree was at before the worker ran, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_ref: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

/// The mutable head of a task's session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub task_id: String,
    pub iteration_count: u32,
    pub phase: RunPhase,
    #[serde(default)]
    pub narrative: String,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_verdict: Option<Verdict>,
    pub updated_at: DateTime<Utc>,
    /// Number of sealed historical segments behind this head.
    #[serde(default)]
    pub segment_count: u32,
    /// Guardrail triggers cleared by an OVERRIDE; consumed by the next verification.
    #[serde(default)]
    pub waivers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change_set: Option<ChangeSet>,
}

impl SessionRecord {
    pub fn fresh(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            iteration_count: 0,
            phase: RunPhase::Init,
            narrative: String::new(),
            next_steps: Vec::new(),
            last_verdict: None,
            updated_at: Utc::now(),
            segment_count: 0,
            waivers: Vec::new(),
            last_change_set: None,
        }
    }

    /// The last `max_chars` characters of the narrative, cut on a line
    /// boundary when one is available.
    pub fn summary(&self, max_chars: usize) -> String {
        tail_chars(&self.narrative, max_chars)
    }

    pub fn append_narrative(&mut self, entry: &str) {
        if !self.narrative.is_empty() && !self.narrative.ends_with('\n') {
            self.narrative.push('\n');
        }
        self.narrative.push_str(entry.trim_end());
        self.narrative.push('\n');
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A sealed, byte-for-byte copy of a head as it was before a split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSegment {
    /// 1-based.
    pub index: u32,
    pub sealed_at: DateTime<Utc>,
    pub record: SessionRecord,
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let skip = total - max_chars;
    let start = text
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let tail = &text[start..];
    // Prefer starting on a fresh line so the summary does not open mid-entry.
    match tail.find('\n') {
        Some(nl) if nl + 1 < tail.len() => tail[nl + 1..].to_string(),
        _ => tail.to_string(),
    }
}
