use crate::verdict::Verdict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Controller transition recorded by a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Retry,
    Completed,
    AskHuman,
    Aborted,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Completed => "completed",
            Self::AskHuman => "ask_human",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retry" => Ok(Self::Retry),
            "completed" => Ok(Self::Completed),
            "ask_human" => Ok(Self::AskHuman),
            "aborted" => Ok(Self::Aborted),
            _ => Err(format!("Invalid transition: {}", s)),
        }
    }
}

/// Immutable record of one iteration's outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub task_id: String,
    pub iteration: u32,
    pub transition: Transition,
    /// Absent when no oracle verdict exists (infra exhaustion, cancellation).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// True when the run can continue from here without human input.
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(task_id: &str, iteration: u32, transition: Transition) -> Self {
        Self {
            task_id: task_id.to_string(),
            iteration,
            transition,
            verdict: None,
            reason: None,
            recoverable: matches!(transition, Transition::Retry | Transition::Aborted),
            timestamp: Utc::now(),
        }
    }

    pub fn with_verdict(mut self, verdict: Verdict) -> Self {
        self.verdict = Some(verdict);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_follows_transition() {
        assert!(Checkpoint::new("t", 1, Transition::Retry).recoverable);
        assert!(Checkpoint::new("t", 1, Transition::Aborted).recoverable);
        assert!(!Checkpoint::new("t", 1, Transition::AskHuman).recoverable);
        assert!(!Checkpoint::new("t", 1, Transition::Completed).recoverable);
    }

    #[test]
    fn transition_parses() {
        assert_eq!("ask_human".parse::<Transition>().unwrap(), Transition::AskHuman);
        assert!("ASK_HUMAN".parse::<Transition>().is_err());
    }
}
