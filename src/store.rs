// =============================================================================
// Run store — on-disk layout for sessions, analyses and snapshots
// =============================================================================
//
// Per run:
//   <root>/<id>/input/...
//   <root>/<id>/NextGenAnalysis.json
//   <root>/<id>/output/*.csv
//   <root>/<id>/snapshots/*.csv     (each <= 10 MiB, <= 100 per run)
//
// Run ids are sanitized so no path component can escape the root. Snapshot
// ids must match `snap_` + 8 lowercase hex characters exactly; anything
// else is rejected. JSON lands via write-temp-then-rename so a reader never
// sees a half-written file.
// =============================================================================

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::errors::{EngineError, EngineResult};
use crate::tuning::export::write_json_atomic;

/// Snapshot size ceiling.
pub const MAX_SNAPSHOT_BYTES: usize = 10 * 1024 * 1024;
/// Snapshot count ceiling per run.
pub const MAX_SNAPSHOTS_PER_RUN: usize = 100;

/// Strip a run id down to safe characters. Alphanumerics, underscore and
/// hyphen survive; everything else becomes an underscore, and leading
/// separator characters are removed.
pub fn sanitize_run_id(run_id: &str) -> EngineResult<String> {
    if run_id.is_empty() {
        return Err(EngineError::Validation("run_id cannot be empty".into()));
    }
    let cleaned: String = run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches(['_', '-', '.']).to_string();
    if cleaned.is_empty() {
        return Err(EngineError::Validation(format!(
            "run_id '{run_id}' is empty after sanitization"
        )));
    }
    Ok(cleaned)
}

/// Canonical snapshot id: `snap_` followed by exactly 8 lowercase hex
/// characters.
pub fn is_valid_snapshot_id(id: &str) -> bool {
    let Some(hex) = id.strip_prefix("snap_") else {
        return false;
    };
    hex.len() == 8
        && hex
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Filesystem layout for all runs under one root.
pub struct RunStore {
    root: PathBuf,
}

impl RunStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir_checked(&self, run_id: &str) -> EngineResult<PathBuf> {
        Ok(self.root.join(sanitize_run_id(run_id)?))
    }

    /// Create the run's directory skeleton.
    pub fn create_run(&self, run_id: &str) -> EngineResult<PathBuf> {
        let dir = self.run_dir_checked(run_id)?;
        for sub in ["input", "output", "snapshots"] {
            std::fs::create_dir_all(dir.join(sub)).map_err(|e| {
                EngineError::Internal(format!("cannot create run dir {}: {e}", dir.display()))
            })?;
        }
        info!(run = %run_id, dir = %dir.display(), "run directory created");
        Ok(dir)
    }

    pub fn run_exists(&self, run_id: &str) -> bool {
        self.run_dir_checked(run_id)
            .map(|d| d.is_dir())
            .unwrap_or(false)
    }

    /// Output directory for export artifacts.
    pub fn output_dir(&self, run_id: &str) -> EngineResult<PathBuf> {
        let dir = self.run_dir_checked(run_id)?;
        if !dir.is_dir() {
            return Err(EngineError::NotFound {
                resource: "run".into(),
                id: run_id.into(),
            });
        }
        Ok(dir.join("output"))
    }

    /// Write the NextGen analysis payload atomically.
    pub fn write_nextgen_analysis(
        &self,
        run_id: &str,
        payload: &serde_json::Value,
    ) -> EngineResult<PathBuf> {
        let dir = self.run_dir_checked(run_id)?;
        if !dir.is_dir() {
            return Err(EngineError::NotFound {
                resource: "run".into(),
                id: run_id.into(),
            });
        }
        let path = dir.join("NextGenAnalysis.json");
        write_json_atomic(&path, payload)
            .map_err(|e| EngineError::Internal(format!("cannot write analysis: {e}")))?;
        debug!(run = %run_id, "NextGen analysis written");
        Ok(path)
    }

    /// Store one capture snapshot, enforcing the id format and the size and
    /// count caps.
    pub fn write_snapshot(
        &self,
        run_id: &str,
        snapshot_id: &str,
        content: &[u8],
    ) -> EngineResult<PathBuf> {
        if !is_valid_snapshot_id(snapshot_id) {
            return Err(EngineError::Validation(format!(
                "snapshot id '{snapshot_id}' must match snap_ + 8 lowercase hex characters"
            )));
        }
        if content.len() > MAX_SNAPSHOT_BYTES {
            return Err(EngineError::Validation(format!(
                "snapshot {snapshot_id} is {} bytes, cap is {MAX_SNAPSHOT_BYTES}",
                content.len()
            )));
        }

        let dir = self.run_dir_checked(run_id)?.join("snapshots");
        if !dir.is_dir() {
            return Err(EngineError::NotFound {
                resource: "run".into(),
                id: run_id.into(),
            });
        }
        if self.list_snapshots(run_id)?.len() >= MAX_SNAPSHOTS_PER_RUN {
            return Err(EngineError::Validation(format!(
                "run {run_id} already holds {MAX_SNAPSHOTS_PER_RUN} snapshots"
            )));
        }

        let path = dir.join(format!("{snapshot_id}.csv"));
        std::fs::write(&path, content)
            .map_err(|e| EngineError::Internal(format!("cannot write snapshot: {e}")))?;
        Ok(path)
    }

    /// Snapshot ids present for a run, sorted.
    pub fn list_snapshots(&self, run_id: &str) -> EngineResult<Vec<String>> {
        let dir = self.run_dir_checked(run_id)?.join("snapshots");
        if !dir.is_dir() {
            return Err(EngineError::NotFound {
                resource: "run".into(),
                id: run_id.into(),
            });
        }
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| EngineError::Internal(format!("cannot list snapshots: {e}")))?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = name.strip_suffix(".csv") {
                if is_valid_snapshot_id(stem) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Read a snapshot back.
    pub fn read_snapshot(&self, run_id: &str, snapshot_id: &str) -> EngineResult<Vec<u8>> {
        if !is_valid_snapshot_id(snapshot_id) {
            return Err(EngineError::Validation(format!(
                "snapshot id '{snapshot_id}' must match snap_ + 8 lowercase hex characters"
            )));
        }
        let path = self
            .run_dir_checked(run_id)?
            .join("snapshots")
            .join(format!("{snapshot_id}.csv"));
        std::fs::read(&path).map_err(|_| EngineError::NotFound {
            resource: "snapshot".into(),
            id: snapshot_id.into(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (RunStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (RunStore::new(dir.path()), dir)
    }

    #[test]
    fn sanitize_keeps_safe_characters_and_rejects_empties() {
        assert_eq!(sanitize_run_id("run_2025-01").unwrap(), "run_2025-01");
        assert_eq!(sanitize_run_id("../../etc/passwd").unwrap(), "etc_passwd");
        assert_eq!(sanitize_run_id("a/b\\c").unwrap(), "a_b_c");
        assert!(sanitize_run_id("").is_err());
        assert!(sanitize_run_id("...").is_err());
    }

    #[test]
    fn snapshot_id_format_is_canonical() {
        assert!(is_valid_snapshot_id("snap_00ff00ff"));
        assert!(is_valid_snapshot_id("snap_deadbeef"));
        // Everything else is rejected.
        assert!(!is_valid_snapshot_id("snap_DEADBEEF")); // upper case
        assert!(!is_valid_snapshot_id("snap_1234567")); // too short
        assert!(!is_valid_snapshot_id("snap_123456789")); // too long
        assert!(!is_valid_snapshot_id("snapshot_12345678"));
        assert!(!is_valid_snapshot_id("snap_gggggggg")); // not hex
        assert!(!is_valid_snapshot_id(""));
    }

    #[test]
    fn create_run_builds_the_layout() {
        let (store, _tmp) = store();
        let dir = store.create_run("run_1").unwrap();
        assert!(dir.join("input").is_dir());
        assert!(dir.join("output").is_dir());
        assert!(dir.join("snapshots").is_dir());
        assert!(store.run_exists("run_1"));
        assert!(!store.run_exists("run_2"));
    }

    #[test]
    fn nextgen_analysis_is_written_atomically() {
        let (store, _tmp) = store();
        store.create_run("run_1").unwrap();
        let payload = serde_json::json!({"schema": "dynoai.nextgen@1", "run_id": "run_1"});
        let path = store.write_nextgen_analysis("run_1", &payload).unwrap();

        assert!(path.ends_with("NextGenAnalysis.json"));
        let read: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read["run_id"], "run_1");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_run_is_not_found() {
        let (store, _tmp) = store();
        let err = store.write_nextgen_analysis("run_x", &serde_json::json!({})).unwrap_err();
        assert_eq!(err.kind(), "not_found");
        assert_eq!(store.list_snapshots("run_x").unwrap_err().kind(), "not_found");
    }

    #[test]
    fn snapshots_round_trip_with_valid_ids_only() {
        let (store, _tmp) = store();
        store.create_run("run_1").unwrap();

        store
            .write_snapshot("run_1", "snap_0a1b2c3d", b"rpm,afr\n3000,13.1\n")
            .unwrap();
        assert_eq!(store.list_snapshots("run_1").unwrap(), vec!["snap_0a1b2c3d"]);
        let content = store.read_snapshot("run_1", "snap_0a1b2c3d").unwrap();
        assert!(content.starts_with(b"rpm,afr"));

        let err = store
            .write_snapshot("run_1", "snapshot-1", b"x")
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn oversized_snapshot_is_rejected() {
        let (store, _tmp) = store();
        store.create_run("run_1").unwrap();
        let big = vec![0u8; MAX_SNAPSHOT_BYTES + 1];
        let err = store.write_snapshot("run_1", "snap_00000000", &big).unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert!(err.to_string().contains("cap"));
    }

    #[test]
    fn snapshot_count_is_capped() {
        let (store, _tmp) = store();
        store.create_run("run_1").unwrap();
        for i in 0..MAX_SNAPSHOTS_PER_RUN {
            let id = format!("snap_{i:08x}");
            store.write_snapshot("run_1", &id, b"x").unwrap();
        }
        let err = store
            .write_snapshot("run_1", "snap_ffffffff", b"x")
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
