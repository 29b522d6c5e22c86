use serde::{Deserialize, Serialize};
use std::fmt;

/// Judgment kinds the verification engine can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VerdictKind {
    Pass,
    Fail,
    Blocked,
}

impl VerdictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one verification call. Never mutated after it is returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub kind: VerdictKind,
    #[serde(default)]
    pub reason: String,
    /// References to logs, reports or files backing the judgment.
    #[serde(default)]
    pub evidence: Vec<String>,
}

impl Verdict {
    pub fn new(kind: VerdictKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            evidence: Vec::new(),
        }
    }

    pub fn pass(reason: impl Into<String>) -> Self {
        Self::new(VerdictKind::Pass, reason)
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self::new(VerdictKind::Fail, reason)
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self::new(VerdictKind::Blocked, reason)
    }

    pub fn with_evidence<I, S>(mut self, evidence: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.evidence = evidence.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_pass(&self) -> bool {
        self.kind == VerdictKind::Pass
    }

    pub fn is_blocked(&self) -> bool {
        self.kind == VerdictKind::Blocked
    }

    /// Key a guardrail trigger is escalated and waived under: the trimmed
    /// reason, or `blocked` when the verifier gave none.
    pub fn trigger(&self) -> &str {
        match self.reason.trim() {
            "" => crate::reasons::BLOCKED,
            reason => reason,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}({})", self.kind, self.reason)
        }
    }
}
