//! Session state store: one mutable head per task plus sealed historical
//! segments, independent of the queue's coarse status field.

mod file;

pub use file::FileSessionStore;

use async_trait::async_trait;
use ratchet_common::SessionRecord;

use crate::errors::SessionError;

/// What a save actually wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    /// The head as persisted. Differs from the input only when a split
    /// replaced the narrative with its summary.
    pub head: SessionRecord,
    /// Index of the segment sealed by this save, if the record was split.
    pub sealed_segment: Option<u32>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Durably replace the head for `record.task_id` (last writer wins).
    async fn save(&self, record: &SessionRecord) -> Result<SaveOutcome, SessionError>;

    /// The current head, or `SessionError::NotFound`.
    async fn load(&self, task_id: &str) -> Result<SessionRecord, SessionError>;

    /// Sealed segment `index` (1-based): the full record as it was before the
    /// split that produced it.
    async fn load_segment(&self, task_id: &str, index: u32) -> Result<SessionRecord, SessionError>;

    async fn exists(&self, task_id: &str) -> Result<bool, SessionError>;

    /// Move the head and all segments out of the active set. Nothing is deleted.
    async fn archive(&self, task_id: &str) -> Result<(), SessionError>;
}

/// Path-safe directory name for a session key such as `task:fix-lint-001`.
///
/// ASCII alphanumerics, `-`, `_` and `.` pass through; every other byte is
/// written as `%XX`, so distinct keys never collide.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => out.push(b as char),
            b'.' if !out.is_empty() => out.push('.'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
