//! File-backed session store.
//!
//! Layout under the sessions root:
//!
//! ```text
//! active/<encoded key>/head.json
//! active/<encoded key>/segments/000001.json
//! active/<encoded key>/.lock
//! archive/<encoded key>/...
//! ```
//!
//! Writes go to a temp file, are fsynced and renamed over the target while
//! an exclusive `fs2` lock on `.lock` is held, so a reader only ever sees a
//! complete head.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use ratchet_common::{SessionRecord, SessionSegment, session_key};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{SaveOutcome, SessionStore, encode_key};
use crate::errors::SessionError;

const HEAD_FILE: &str = "head.json";
const SEGMENTS_DIR: &str = "segments";
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Clone)]
pub struct FileSessionStore {
    root: PathBuf,
    /// Narrative size in bytes above which a save seals a segment.
    segment_threshold: usize,
    /// Characters of narrative kept in the head after a split.
    summary_chars: usize,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>, segment_threshold: usize, summary_chars: usize) -> Self {
        Self {
            root: root.into(),
            segment_threshold: segment_threshold.max(1),
            summary_chars,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn active_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("active").join(encode_key(&session_key(task_id)))
    }

    fn archive_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("archive").join(encode_key(&session_key(task_id)))
    }

    fn segment_path(dir: &Path, index: u32) -> PathBuf {
        dir.join(SEGMENTS_DIR).join(format!("{:06}.json", index))
    }

    /// Summary length that always fits under the split threshold, whatever
    /// the UTF-8 width of the narrative.
    fn summary_budget(&self) -> usize {
        self.summary_chars.min(self.segment_threshold / 4)
    }

    pub fn save_sync(&self, record: &SessionRecord) -> Result<SaveOutcome, SessionError> {
        let dir = self.active_dir(&record.task_id);
        create_dir(&dir)?;
        let _lock = DirLock::acquire(&dir)?;

        let mut head = record.clone();
        let mut sealed_segment = None;
        if record.narrative.len() > self.segment_threshold {
            let index = record.segment_count + 1;
            let segment = SessionSegment {
                index,
                sealed_at: Utc::now(),
                record: record.clone(),
            };
            let path = Self::segment_path(&dir, index);
            create_dir(path.parent().unwrap_or(&dir))?;
            write_json_atomic(&path, &segment)?;

            head.narrative = record.summary(self.summary_budget());
            head.segment_count = index;
            sealed_segment = Some(index);
            info!(
                task_id = %record.task_id,
                segment = index,
                narrative_bytes = record.narrative.len(),
                "sealed session segment"
            );
        }

        write_json_atomic(&dir.join(HEAD_FILE), &head)?;
        debug!(
            task_id = %head.task_id,
            iteration = head.iteration_count,
            phase = %head.phase,
            "saved session head"
        );
        Ok(SaveOutcome {
            head,
            sealed_segment,
        })
    }

    pub fn load_sync(&self, task_id: &str) -> Result<SessionRecord, SessionError> {
        let path = self.active_dir(task_id).join(HEAD_FILE);
        read_json_opt(&path)?.ok_or_else(|| SessionError::NotFound {
            task_id: task_id.to_string(),
        })
    }

    pub fn load_segment_sync(&self, task_id: &str, index: u32) -> Result<SessionRecord, SessionError> {
        for dir in [self.active_dir(task_id), self.archive_dir(task_id)] {
            let path = Self::segment_path(&dir, index);
            if let Some(segment) = read_json_opt::<SessionSegment>(&path)? {
                return Ok(segment.record);
            }
        }
        Err(SessionError::SegmentNotFound {
            task_id: task_id.to_string(),
            index,
        })
    }

    /// Head of an archived session.
    pub fn load_archived(&self, task_id: &str) -> Result<SessionRecord, SessionError> {
        let path = self.archive_dir(task_id).join(HEAD_FILE);
        read_json_opt(&path)?.ok_or_else(|| SessionError::NotFound {
            task_id: task_id.to_string(),
        })
    }

    /// Head from the active set, falling back to the archive.
    pub fn load_any(&self, task_id: &str) -> Result<SessionRecord, SessionError> {
        match self.load_sync(task_id) {
            Err(SessionError::NotFound { .. }) => self.load_archived(task_id),
            other => other,
        }
    }

    /// Indices of all sealed segments, active or archived, ascending.
    pub fn list_segments(&self, task_id: &str) -> Result<Vec<u32>, SessionError> {
        let mut indices = Vec::new();
        for dir in [self.active_dir(task_id), self.archive_dir(task_id)] {
            let seg_dir = dir.join(SEGMENTS_DIR);
            let entries = match fs::read_dir(&seg_dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(SessionError::Io { path: seg_dir, source }),
            };
            for entry in entries {
                let entry = entry.map_err(|source| SessionError::Io {
                    path: seg_dir.clone(),
                    source,
                })?;
                let name = entry.file_name();
                if let Some(index) = name
                    .to_str()
                    .and_then(|n| n.strip_suffix(".json"))
                    .and_then(|n| n.parse::<u32>().ok())
                {
                    indices.push(index);
                }
            }
        }
        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }

    pub fn exists_sync(&self, task_id: &str) -> bool {
        self.active_dir(task_id).join(HEAD_FILE).exists()
    }

    pub fn archive_sync(&self, task_id: &str) -> Result<(), SessionError> {
        let from = self.active_dir(task_id);
        if !from.exists() {
            return Err(SessionError::NotFound {
                task_id: task_id.to_string(),
            });
        }
        let to = self.archive_dir(task_id);
        if to.exists() {
            // Earlier history for the same id moves aside; the newest archive
            // always sits at the plain name.
            let stamp = Utc::now().timestamp_millis();
            let name = format!("{}.{}", encode_key(&session_key(task_id)), stamp);
            let aside = self.root.join("archive").join(name);
            fs::rename(&to, &aside).map_err(|source| SessionError::Io {
                path: aside.clone(),
                source,
            })?;
        }
        create_dir(to.parent().unwrap_or(&self.root))?;
        {
            let _lock = DirLock::acquire(&from)?;
            fs::rename(&from, &to).map_err(|source| SessionError::Io {
                path: to.clone(),
                source,
            })?;
        }
        info!(task_id = %task_id, path = %to.display(), "archived session");
        Ok(())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, record: &SessionRecord) -> Result<SaveOutcome, SessionError> {
        let store = self.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || store.save_sync(&record)).await?
    }

    async fn load(&self, task_id: &str) -> Result<SessionRecord, SessionError> {
        let store = self.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || store.load_sync(&task_id)).await?
    }

    async fn load_segment(&self, task_id: &str, index: u32) -> Result<SessionRecord, SessionError> {
        let store = self.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || store.load_segment_sync(&task_id, index)).await?
    }

    async fn exists(&self, task_id: &str) -> Result<bool, SessionError> {
        Ok(self.exists_sync(task_id))
    }

    async fn archive(&self, task_id: &str) -> Result<(), SessionError> {
        let store = self.clone();
        let task_id = task_id.to_string();
        tokio::task::spawn_blocking(move || store.archive_sync(&task_id)).await?
    }
}

/// Exclusive advisory lock on a session directory, released on drop.
struct DirLock {
    file: File,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self, SessionError> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|source| SessionError::Io {
                path: path.clone(),
                source,
            })?;
        file.lock_exclusive()
            .map_err(|source| SessionError::Io { path, source })?;
        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn create_dir(dir: &Path) -> Result<(), SessionError> {
    fs::create_dir_all(dir).map_err(|source| SessionError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

/// Temp file + fsync + rename, then fsync the directory so the rename itself
/// survives a crash.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), SessionError> {
    let mut buf = serde_json::to_vec_pretty(value).map_err(SessionError::Serialize)?;
    buf.push(b'\n');

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut tmp = File::create(&tmp_path).map_err(io_err(&tmp_path))?;
        tmp.write_all(&buf).map_err(io_err(&tmp_path))?;
        tmp.sync_all().map_err(io_err(&tmp_path))?;
    }
    fs::rename(&tmp_path, path).map_err(io_err(path))?;

    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        File::open(parent)
            .and_then(|d| d.sync_all())
            .map_err(io_err(parent))?;
    }
    Ok(())
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SessionError {
    let path = path.to_path_buf();
    move |source| SessionError::Io { path, source }
}

fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SessionError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SessionError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| SessionError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}
