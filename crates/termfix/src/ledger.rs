//! Deduplication gate for detected faults.
//!
//! A fault that keeps scrolling through the tail window must be handled at
//! most once per session. The ledger marks faults handled at dispatch time
//! (not completion time), so re-detections during an in-flight remediation
//! are dropped. A second gate suppresses faults against files that were
//! already patched and have not changed on disk since - those are stale
//! echoes of the fixed error, not new faults.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::debug;

use crate::classify::{FaultKind, FaultRecord};

/// Stable dedup identity of a fault.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FaultKey {
    kind: FaultKind,
    file_path: String,
    line_number: Option<u32>,
    matched_text: String,
}

impl FaultKey {
    /// Derive the key from a record. Two records with equal keys are the
    /// same fault even when detected on different scan passes.
    #[must_use]
    pub fn of(record: &FaultRecord) -> Self {
        Self {
            kind: record.kind,
            file_path: record
                .file_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            line_number: record.line_number,
            matched_text: record.matched_text.clone(),
        }
    }
}

/// Files patched this session, keyed by the mtime recorded right after the
/// write. Shared between the control loop (suppression checks) and the
/// remediation task (recording patches).
#[derive(Debug, Default)]
pub struct FixedFileRegistry {
    inner: Mutex<HashMap<PathBuf, SystemTime>>,
}

impl FixedFileRegistry {
    /// Record a freshly patched file with its current mtime.
    pub fn record(&self, path: &Path) {
        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .insert(path.to_path_buf(), mtime);
    }

    /// Whether a fault against `path` is a stale echo: the file was
    /// patched and its on-disk mtime has not advanced past the recorded
    /// value. Unreadable metadata never suppresses.
    #[must_use]
    pub fn is_stale(&self, path: &Path) -> bool {
        let recorded = {
            let map = self.inner.lock().expect("registry lock poisoned");
            map.get(path).copied()
        };
        let Some(recorded) = recorded else {
            return false;
        };
        match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(current) => current <= recorded,
            Err(_) => false,
        }
    }
}

/// Session-lifetime dedup gate. Handled keys are never evicted: the policy
/// is at most one remediation per distinct fault per session, not retry
/// forever.
pub struct FaultLedger {
    handled: HashSet<FaultKey>,
    registry: std::sync::Arc<FixedFileRegistry>,
}

impl FaultLedger {
    #[must_use]
    pub fn new(registry: std::sync::Arc<FixedFileRegistry>) -> Self {
        Self {
            handled: HashSet::new(),
            registry,
        }
    }

    /// Decide whether a fault should be dispatched. Marks the fault
    /// handled before remediation begins so a fault lingering in the tail
    /// window is never double-dispatched.
    pub fn should_process(&mut self, record: &FaultRecord) -> bool {
        let key = FaultKey::of(record);

        if self.handled.contains(&key) {
            return false;
        }

        if let Some(path) = &record.file_path {
            if self.registry.is_stale(path) {
                debug!(path = %path.display(), "Fault suppressed: file unchanged since last patch");
                return false;
            }
        }

        self.handled.insert(key);
        true
    }

    /// Number of distinct faults dispatched so far.
    #[must_use]
    pub fn handled_count(&self) -> usize {
        self.handled.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(kind: FaultKind, path: Option<&str>, line: Option<u32>, text: &str) -> FaultRecord {
        FaultRecord {
            kind,
            file_path: path.map(PathBuf::from),
            line_number: line,
            module: None,
            matched_text: text.to_string(),
            context_window: String::new(),
        }
    }

    #[test]
    fn test_same_fault_processed_at_most_once() {
        let mut ledger = FaultLedger::new(Arc::new(FixedFileRegistry::default()));
        let fault = record(FaultKind::SyntaxError, Some("app.py"), Some(42), "SyntaxError");

        assert!(ledger.should_process(&fault));
        assert!(!ledger.should_process(&fault));
        assert!(!ledger.should_process(&fault.clone()));
        assert_eq!(ledger.handled_count(), 1);
    }

    #[test]
    fn test_distinct_faults_each_pass() {
        let mut ledger = FaultLedger::new(Arc::new(FixedFileRegistry::default()));

        assert!(ledger.should_process(&record(
            FaultKind::SyntaxError,
            Some("app.py"),
            Some(42),
            "SyntaxError"
        )));
        // Different line number is a different fault
        assert!(ledger.should_process(&record(
            FaultKind::SyntaxError,
            Some("app.py"),
            Some(43),
            "SyntaxError"
        )));
        // Different kind against the same location is a different fault
        assert!(ledger.should_process(&record(
            FaultKind::RuntimeError,
            Some("app.py"),
            Some(42),
            "TypeError"
        )));
    }

    #[test]
    fn test_unchanged_patched_file_suppresses_any_fault() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app.py");
        std::fs::write(&target, "print('ok')\n").unwrap();

        let registry = Arc::new(FixedFileRegistry::default());
        registry.record(&target);

        let mut ledger = FaultLedger::new(registry.clone());
        let path = target.to_str().unwrap();

        // Suppressed regardless of matched text while the file is unchanged
        assert!(!ledger.should_process(&record(
            FaultKind::SyntaxError,
            Some(path),
            Some(1),
            "SyntaxError"
        )));
        assert!(!ledger.should_process(&record(
            FaultKind::RuntimeError,
            Some(path),
            Some(9),
            "NameError"
        )));

        // Advance the mtime past the recorded value; faults flow again
        let later = SystemTime::now() + std::time::Duration::from_secs(5);
        let file = std::fs::File::options().write(true).open(&target).unwrap();
        file.set_modified(later).unwrap();

        assert!(ledger.should_process(&record(
            FaultKind::SyntaxError,
            Some(path),
            Some(1),
            "SyntaxError"
        )));
    }

    #[test]
    fn test_suppression_does_not_mark_handled() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app.py");
        std::fs::write(&target, "x = 1\n").unwrap();

        let registry = Arc::new(FixedFileRegistry::default());
        registry.record(&target);

        let mut ledger = FaultLedger::new(registry);
        let fault = record(
            FaultKind::SyntaxError,
            Some(target.to_str().unwrap()),
            Some(1),
            "SyntaxError",
        );

        assert!(!ledger.should_process(&fault));
        assert_eq!(ledger.handled_count(), 0);

        // Once the file changes, the same fault is dispatchable exactly once
        let later = SystemTime::now() + std::time::Duration::from_secs(5);
        let file = std::fs::File::options().write(true).open(&target).unwrap();
        file.set_modified(later).unwrap();

        assert!(ledger.should_process(&fault));
        assert!(!ledger.should_process(&fault));
    }

    #[test]
    fn test_faults_without_paths_ignore_registry() {
        let registry = Arc::new(FixedFileRegistry::default());
        let mut ledger = FaultLedger::new(registry);

        let fault = record(FaultKind::ModuleNotFound, None, None, "No module named 'cv2'");
        assert!(ledger.should_process(&fault));
        assert!(!ledger.should_process(&fault));
    }
}
