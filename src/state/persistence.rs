//! Atomic, versioned persistence of the run state.
//!
//! Every save writes the whole state to a temporary sibling, syncs it and
//! renames it over the state file, so the file on disk is always either the
//! previous checkpoint or the new one. The envelope carries a SHA-256 of the
//! state payload; a document whose checksum, version or shape does not match
//! is reported as corrupt instead of being loaded.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::RunState;
use crate::error::{IntoLoopError, LoopError, Result};

/// Current schema version for the state document.
pub const STATE_VERSION: u32 = 1;

/// Minimum supported schema version.
pub const MIN_STATE_VERSION: u32 = 1;

/// Default state file name.
pub const STATE_FILE: &str = "loop_state.json";

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent access prevention.
const LOCK_SUFFIX: &str = ".lock";

/// Why a checkpoint was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointReason {
    Checkpoint,
    AggregationComplete,
    DiagnosticsComplete,
    ImplementationComplete,
    ImplementationFailed,
    TestingComplete,
    Decision,
    WaitingForRetest,
    CollaboratorFailure,
    Interrupted,
    Final,
}

impl std::fmt::Display for CheckpointReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Checkpoint => "checkpoint",
            Self::AggregationComplete => "aggregation_complete",
            Self::DiagnosticsComplete => "diagnostics_complete",
            Self::ImplementationComplete => "implementation_complete",
            Self::ImplementationFailed => "implementation_failed",
            Self::TestingComplete => "testing_complete",
            Self::Decision => "decision",
            Self::WaitingForRetest => "waiting_for_retest",
            Self::CollaboratorFailure => "collaborator_failure",
            Self::Interrupted => "interrupted",
            Self::Final => "final",
        };
        f.write_str(s)
    }
}

/// On-disk envelope around the state.
#[derive(Debug, Serialize, Deserialize)]
struct StateDocument {
    version: u32,
    saved_at: DateTime<Utc>,
    reason: CheckpointReason,
    checksum: String,
    state: serde_json::Value,
}

/// Metadata of the last checkpoint, as read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub saved_at: DateTime<Utc>,
    pub reason: CheckpointReason,
}

fn checksum(payload: &serde_json::Value) -> Result<String> {
    let canonical = serde_json::to_string(payload)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Write `contents` to `path` through a synced temp file and a rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(TMP_SUFFIX);
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(contents)?;
        tmp_file.sync_all()?;
    }

    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Persistence manager for one state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store for an explicit state file path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Store for the default state file inside `dir`.
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(STATE_FILE))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn tmp_file_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(TMP_SUFFIX);
        PathBuf::from(name)
    }

    #[must_use]
    pub fn lock_file_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(LOCK_SUFFIX);
        PathBuf::from(name)
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write the entire state, replacing any previous checkpoint.
    pub fn save(&self, state: &RunState, reason: CheckpointReason) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = File::create(self.lock_file_path())?;
        FileExt::lock_exclusive(&lock_file).map_err(|_| LoopError::StateLocked {
            path: self.path.clone(),
        })?;

        let payload = serde_json::to_value(state)?;
        let document = StateDocument {
            version: STATE_VERSION,
            saved_at: Utc::now(),
            reason,
            checksum: checksum(&payload)?,
            state: payload,
        };
        let json = serde_json::to_string_pretty(&document)?;

        let result = write_atomic(&self.path, json.as_bytes());
        let _ = FileExt::unlock(&lock_file);
        result?;

        info!(
            "Loop state saved: {} (reason: {}, iteration {})",
            self.path.display(),
            reason,
            state.iteration
        );
        Ok(())
    }

    /// Load the persisted state.
    ///
    /// Returns `Ok(None)` when no state file exists and
    /// [`LoopError::StateCorrupt`] when the file is not a well-formed state
    /// document.
    pub fn load(&self) -> Result<Option<RunState>> {
        Ok(self.load_with_info()?.map(|(state, _)| state))
    }

    /// Load the state together with the metadata of the checkpoint.
    pub fn load_with_info(&self) -> Result<Option<(RunState, CheckpointInfo)>> {
        if !self.path.exists() {
            return Ok(None);
        }

        // Read under the shared lock.
        let lock_path = self.lock_file_path();
        let lock_file = if lock_path.exists() {
            let lock_file = File::open(&lock_path)?;
            FileExt::lock_shared(&lock_file).map_err(|_| LoopError::StateLocked {
                path: self.path.clone(),
            })?;
            Some(lock_file)
        } else {
            None
        };

        let read = fs::read_to_string(&self.path);
        if let Some(lock_file) = &lock_file {
            let _ = FileExt::unlock(lock_file);
        }
        let contents = match read {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        self.parse(&contents).map(Some)
    }

    fn parse(&self, contents: &str) -> Result<(RunState, CheckpointInfo)> {
        let document: StateDocument =
            serde_json::from_str(contents).into_state_corrupt(&self.path)?;

        if document.version < MIN_STATE_VERSION || document.version > STATE_VERSION {
            return Err(LoopError::state_corrupt(
                &self.path,
                format!(
                    "unsupported state version {} (supported: {}..={})",
                    document.version, MIN_STATE_VERSION, STATE_VERSION
                ),
            ));
        }

        let expected = checksum(&document.state)?;
        if expected != document.checksum {
            return Err(LoopError::state_corrupt(
                &self.path,
                "checksum mismatch; the state payload was modified or truncated",
            ));
        }

        let state: RunState =
            serde_json::from_value(document.state).into_state_corrupt(&self.path)?;
        state
            .check_invariants()
            .map_err(|reason| LoopError::state_corrupt(&self.path, reason))?;

        debug!(
            "Loaded state from {} (saved {}, reason {})",
            self.path.display(),
            document.saved_at,
            document.reason
        );

        Ok((
            state,
            CheckpointInfo {
                saved_at: document.saved_at,
                reason: document.reason,
            },
        ))
    }

    /// Load the persisted state or start a fresh one when none exists.
    pub fn load_or_fresh(&self, max_iterations: u32) -> Result<RunState> {
        match self.load()? {
            Some(state) => Ok(state),
            None => Ok(RunState::new(max_iterations)),
        }
    }

    /// Delete the state file if it exists.
    pub fn delete(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{TestVerdict, Verdict};
    use crate::metrics::MetricsSnapshot;
    use crate::state::{ExitCondition, FixCandidate, PhaseResults};
    use tempfile::TempDir;

    fn test_store() -> (StateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = StateStore::in_dir(temp_dir.path().join("run"));
        (store, temp_dir)
    }

    fn populated_state() -> RunState {
        let mut state = RunState::new(7);
        state.begin_iteration();
        let snapshot = MetricsSnapshot::new(100)
            .with_titles_found(50)
            .with_title_failures(50)
            .with_url_errors(20)
            .with_model_errors(10);
        state.record_metrics(snapshot);
        state.push_record(PhaseResults::Aggregation {
            report: PathBuf::from("iteration_1/aggregation.json"),
            metrics: snapshot,
        });
        state.set_candidates(vec![FixCandidate::high("Enhanced Headers")
            .with_expected_improvement("20-30% error reduction")]);
        state.mark_attempted("Enhanced Headers");
        state.push_record(PhaseResults::Testing {
            fix: "Enhanced Headers".to_string(),
            report: PathBuf::from("iteration_1/test_Enhanced_Headers.json"),
            post_fix_metrics: MetricsSnapshot::new(20).with_title_failures(5),
            verdict: TestVerdict {
                success_rate: 75.0,
                success_count: 3,
                total_indicators: 4,
                decision: Verdict::Keep,
                reason: "Met >=75% of success criteria".to_string(),
                alternative_solution: None,
            },
            retest: false,
        });
        state.mark_successful("Enhanced Headers");
        state
    }

    #[test]
    fn test_load_returns_none_when_missing() {
        let (store, _temp_dir) = test_store();
        assert!(store.load().expect("load should not error").is_none());
    }

    #[test]
    fn test_load_or_fresh_starts_fresh() {
        let (store, _temp_dir) = test_store();
        let state = store.load_or_fresh(4).expect("fresh state");
        assert_eq!(state.max_iterations, 4);
        assert_eq!(state.iteration, 0);
    }

    #[test]
    fn test_roundtrip_empty_state() {
        let (store, _temp_dir) = test_store();
        let state = RunState::new(10);

        store.save(&state, CheckpointReason::Checkpoint).expect("save");
        let loaded = store.load().expect("load").expect("state present");

        assert_eq!(loaded, state);
        assert!(loaded.exit_condition.is_none());
        assert!(loaded.fixes_attempted.is_empty());
    }

    #[test]
    fn test_roundtrip_populated_state() {
        let (store, _temp_dir) = test_store();
        let mut state = populated_state();
        state.set_exit_condition(ExitCondition::Success);

        store.save(&state, CheckpointReason::Final).expect("save");
        let (loaded, info) = store
            .load_with_info()
            .expect("load")
            .expect("state present");

        assert_eq!(loaded, state);
        assert_eq!(info.reason, CheckpointReason::Final);
    }

    #[test]
    fn test_atomic_write_leaves_no_tmp_file() {
        let (store, _temp_dir) = test_store();
        store
            .save(&RunState::default(), CheckpointReason::Checkpoint)
            .expect("save");
        assert!(store.exists());
        assert!(!store.tmp_file_path().exists());
    }

    #[test]
    fn test_save_overwrites_previous_checkpoint() {
        let (store, _temp_dir) = test_store();
        let mut state = RunState::default();
        store.save(&state, CheckpointReason::Checkpoint).expect("first");

        state.begin_iteration();
        state.begin_iteration();
        store.save(&state, CheckpointReason::Decision).expect("second");

        let loaded = store.load().expect("load").expect("present");
        assert_eq!(loaded.iteration, 2);
    }

    #[test]
    fn test_invalid_json_is_corrupt_and_kept() {
        let (store, _temp_dir) = test_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "not valid json {{{").unwrap();

        let err = store.load().expect_err("corrupt file must error");
        assert!(matches!(err, LoopError::StateCorrupt { .. }));
        assert!(store.exists(), "corrupt file must not be deleted");
    }

    #[test]
    fn test_truncated_file_is_corrupt() {
        let (store, _temp_dir) = test_store();
        store
            .save(&populated_state(), CheckpointReason::Checkpoint)
            .expect("save");

        let contents = fs::read_to_string(store.path()).unwrap();
        fs::write(store.path(), &contents[..contents.len() / 2]).unwrap();

        assert!(matches!(
            store.load(),
            Err(LoopError::StateCorrupt { .. })
        ));
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        let (store, _temp_dir) = test_store();
        store
            .save(&populated_state(), CheckpointReason::Checkpoint)
            .expect("save");

        let contents = fs::read_to_string(store.path()).unwrap();
        let tampered = contents.replace("\"max_iterations\": 7", "\"max_iterations\": 70");
        assert_ne!(contents, tampered);
        fs::write(store.path(), tampered).unwrap();

        match store.load() {
            Err(LoopError::StateCorrupt { reason, .. }) => assert!(reason.contains("checksum")),
            other => panic!("expected checksum failure, got {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_version_is_corrupt() {
        let (store, _temp_dir) = test_store();
        let payload = serde_json::to_value(RunState::default()).unwrap();
        let document = serde_json::json!({
            "version": 999,
            "saved_at": "2024-01-01T00:00:00Z",
            "reason": "checkpoint",
            "checksum": checksum(&payload).unwrap(),
            "state": payload,
        });
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), document.to_string()).unwrap();

        match store.load() {
            Err(LoopError::StateCorrupt { reason, .. }) => assert!(reason.contains("999")),
            other => panic!("expected version failure, got {other:?}"),
        }
    }

    #[test]
    fn test_invariant_violation_is_corrupt() {
        let (store, _temp_dir) = test_store();
        let mut state = RunState::default();
        state.fixes_failed.push("Never attempted".to_string());
        store.save(&state, CheckpointReason::Checkpoint).expect("save");

        assert!(matches!(
            store.load(),
            Err(LoopError::StateCorrupt { .. })
        ));
    }

    #[test]
    fn test_load_waits_for_writer_lock() {
        let (store, _temp_dir) = test_store();
        let first = RunState::new(5);
        store.save(&first, CheckpointReason::Checkpoint).unwrap();

        let (other, _other_dir) = test_store();
        let second = RunState::new(7);
        other.save(&second, CheckpointReason::Checkpoint).unwrap();
        let replacement = fs::read(other.path()).unwrap();

        let lock_file = File::open(store.lock_file_path()).expect("open lock file");
        FileExt::lock_exclusive(&lock_file).expect("acquire lock");

        let reader = StateStore::new(store.path());
        let handle = std::thread::spawn(move || reader.load());
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!handle.is_finished());

        write_atomic(store.path(), &replacement).unwrap();
        FileExt::unlock(&lock_file).expect("release lock");

        let loaded = handle.join().unwrap().unwrap().expect("state present");
        assert_eq!(loaded.run_id, second.run_id);
        assert_eq!(loaded.max_iterations, 7);
    }

    #[test]
    fn test_delete_removes_file() {
        let (store, _temp_dir) = test_store();
        store
            .save(&RunState::default(), CheckpointReason::Checkpoint)
            .expect("save");
        store.delete().expect("delete");
        assert!(!store.exists());
        store.delete().expect("delete when missing");
    }

    #[test]
    fn test_write_atomic_creates_parents() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("deep/nested/report.md");
        write_atomic(&path, b"# Report").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "# Report");
    }
}
