use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionKind {
    /// Accept the escalation: revert the last change set and fail the task.
    Approve,
    /// Waive the trigger and resume at the current iteration.
    Override,
    /// Fail the task permanently.
    Abort,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::Override => "OVERRIDE",
            Self::Abort => "ABORT",
        }
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "APPROVE" => Ok(Self::Approve),
            "OVERRIDE" => Ok(Self::Override),
            "ABORT" => Ok(Self::Abort),
            _ => Err(format!("Invalid decision kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Human,
    System,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::System => "system",
        }
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Actor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid actor: {}", s)),
        }
    }
}

/// Immutable audit entry for one resolved escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub request_id: i64,
    pub task_id: String,
    pub kind: DecisionKind,
    pub actor: Actor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A persisted ask for human judgment, resolved exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub id: i64,
    pub task_id: String,
    pub reason: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub iteration: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<DecisionKind>,
}

impl DecisionRequest {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}
