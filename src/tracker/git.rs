use git2::{Delta, DiffOptions, Oid, Repository, Signature, build::CheckoutBuilder};
use std::path::{Path, PathBuf};

use super::TrackerError;

/// Directory ratchet keeps its own state in; never reported as a change.
const STATE_DIR: &str = ".ratchet";

pub struct GitTracker {
    repo: Repository,
    workdir: PathBuf,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Result<Self, TrackerError> {
        let repo = Repository::open(project_dir)?;
        let workdir = repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| TrackerError::Bare(project_dir.to_path_buf()))?;
        Ok(Self { repo, workdir })
    }

    /// Record the working tree (tracked and untracked files) as a commit
    /// object and return its sha.
    ///
    /// The commit is not attached to any ref and the on-disk index is left
    /// untouched, so the user's branch and staging area stay as they were.
    pub fn snapshot(&self, label: &str) -> Result<String, TrackerError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;

        let sig = Signature::now("ratchet", "ratchet@localhost")?;
        let message = format!("[ratchet] snapshot {}", label);
        let commit_id = match self.head_commit() {
            Some(parent) => self
                .repo
                .commit(None, &sig, &sig, &message, &tree, &[&parent])?,
            None => self.repo.commit(None, &sig, &sig, &message, &tree, &[])?,
        };

        Ok(commit_id.to_string())
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Paths (relative to the work tree) that differ from the snapshot.
    pub fn changed_since(&self, snapshot: &str) -> Result<Vec<PathBuf>, TrackerError> {
        let commit = self.repo.find_commit(Oid::from_str(snapshot)?)?;
        let tree = commit.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);

        let diff = self.repo.diff_tree_to_workdir(Some(&tree), Some(&mut opts))?;

        let mut changed = Vec::new();
        for delta in diff.deltas() {
            let file = match delta.status() {
                Delta::Deleted => delta.old_file(),
                Delta::Added
                | Delta::Untracked
                | Delta::Modified
                | Delta::Renamed
                | Delta::Typechange => delta.new_file(),
                _ => continue,
            };
            if let Some(path) = file.path()
                && !path.starts_with(STATE_DIR)
            {
                changed.push(path.to_path_buf());
            }
        }
        changed.sort();
        changed.dedup();
        Ok(changed)
    }

    /// Put `paths` back to their content in `snapshot`. Files the snapshot
    /// does not contain are removed.
    pub fn restore(&self, snapshot: &str, paths: &[PathBuf]) -> Result<(), TrackerError> {
        if paths.is_empty() {
            return Ok(());
        }
        let commit = self.repo.find_commit(Oid::from_str(snapshot)?)?;
        let tree = commit.tree()?;

        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        let mut any_tracked = false;
        for path in paths {
            if tree.get_path(path).is_ok() {
                checkout.path(path);
                any_tracked = true;
            } else {
                let full = self.workdir.join(path);
                match std::fs::remove_file(&full) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(TrackerError::Io { path: full, source: e }),
                }
            }
        }
        if any_tracked {
            self.repo
                .checkout_tree(tree.as_object(), Some(&mut checkout))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use std::fs;
    use tempfile::tempdir;

    fn setup_repo() -> (GitTracker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        let tracker = GitTracker::new(dir.path()).unwrap();
        (tracker, dir)
    }

    fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) {
        let repo = Repository::open(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        if let Ok(head) = repo.head() {
            let parent = head.peel_to_commit().unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
                .unwrap();
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[])
                .unwrap();
        }
    }

    #[test]
    fn test_snapshot_leaves_head_alone() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "readme.txt", "hello", "init");
        let head_before = tracker.head_commit().unwrap().id();
        let sha = tracker.snapshot("t1-1").unwrap();
        assert_eq!(sha.len(), 40);
        assert_eq!(tracker.head_commit().unwrap().id(), head_before);
    }

    #[test]
    fn test_snapshot_on_unborn_branch() {
        let (tracker, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let sha = tracker.snapshot("t1-1").unwrap();
        assert!(tracker.changed_since(&sha).unwrap().is_empty());
    }

    #[test]
    fn test_changed_since_reports_added_modified_deleted() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "keep.txt", "one\n", "init");
        commit_file(dir.path(), "gone.txt", "bye\n", "second");
        let sha = tracker.snapshot("t1-1").unwrap();

        fs::write(dir.path().join("keep.txt"), "one\ntwo\n").unwrap();
        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        fs::write(dir.path().join("new.rs"), "fn main() {}").unwrap();

        let changed = tracker.changed_since(&sha).unwrap();
        assert_eq!(
            changed,
            vec![
                PathBuf::from("gone.txt"),
                PathBuf::from("keep.txt"),
                PathBuf::from("new.rs")
            ]
        );
    }

    #[test]
    fn test_untracked_file_present_at_snapshot_is_not_a_change() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "a.txt", "a", "init");
        fs::write(dir.path().join("scratch.txt"), "notes").unwrap();
        let sha = tracker.snapshot("t1-1").unwrap();
        assert!(tracker.changed_since(&sha).unwrap().is_empty());
    }

    #[test]
    fn test_state_dir_is_ignored() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "a.txt", "a", "init");
        let sha = tracker.snapshot("t1-1").unwrap();
        fs::create_dir_all(dir.path().join(".ratchet")).unwrap();
        fs::write(dir.path().join(".ratchet/queue.db"), "x").unwrap();
        assert!(tracker.changed_since(&sha).unwrap().is_empty());
    }

    #[test]
    fn test_restore_reverts_changes() {
        let (tracker, dir) = setup_repo();
        commit_file(dir.path(), "src.rs", "fn old() {}\n", "init");
        let sha = tracker.snapshot("t1-1").unwrap();

        fs::write(dir.path().join("src.rs"), "fn new() {}\n").unwrap();
        fs::write(dir.path().join("added.rs"), "fn added() {}\n").unwrap();
        let changed = tracker.changed_since(&sha).unwrap();

        tracker.restore(&sha, &changed).unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("src.rs")).unwrap(),
            "fn old() {}\n"
        );
        assert!(!dir.path().join("added.rs").exists());
        assert!(tracker.changed_since(&sha).unwrap().is_empty());
    }
}
