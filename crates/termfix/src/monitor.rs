//! The monitor control loop.
//!
//! One loop reads the tailer and drives classification synchronously per
//! line, so faults are handled in the order their triggering line
//! appeared. Remediation runs on a spawned task so tailing continues
//! while a fix is computed; the loop holds the task handle and will not
//! dispatch another fault until it completes. Faults that pass the dedup
//! gate while a remediation is in flight are queued, not lost.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::classify::{FaultClassifier, FaultRecord};
use crate::command::CommandTracker;
use crate::engine::{resolve_target, Outcome, RemediationEngine, RemediationReport};
use crate::ledger::FaultLedger;
use crate::tailer::{ansi_pattern, LineSource, TailConfig};

/// Configuration for the monitor loop.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Capture file to tail
    pub log_file: PathBuf,
    /// Tailer settings (poll interval, create timeout)
    pub tail: TailConfig,
    /// Trailing lines consulted for command recognition
    pub command_window: usize,
    /// Trailing lines consulted for fault classification
    pub fault_window: usize,
    /// Retained line buffer size
    pub buffer_cap: usize,
    /// Echo monitored lines to the operator
    pub echo_lines: bool,
}

impl MonitorConfig {
    /// Defaults for a capture file path.
    #[must_use]
    pub fn new(log_file: PathBuf) -> Self {
        Self {
            log_file,
            tail: TailConfig::default(),
            command_window: 20,
            fault_window: 10,
            buffer_cap: 200,
            echo_lines: true,
        }
    }
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// When monitoring started
    pub started_at: DateTime<Utc>,
    /// Distinct faults dispatched
    pub faults_detected: u64,
    /// Remediations that ended `Fixed`
    pub fixes_applied: u64,
    /// Commands relaunched after a fix
    pub restarts: u64,
}

impl SessionStats {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            faults_detected: 0,
            fixes_applied: 0,
            restarts: 0,
        }
    }
}

/// Full-agent monitor session.
pub struct Monitor {
    config: MonitorConfig,
    classifier: FaultClassifier,
    tracker: CommandTracker,
    ledger: FaultLedger,
    engine: Arc<RemediationEngine>,
    buffer: VecDeque<String>,
    pending: VecDeque<FaultRecord>,
    inflight: Option<JoinHandle<RemediationReport>>,
    stats: SessionStats,
}

impl Monitor {
    #[must_use]
    pub fn new(config: MonitorConfig, ledger: FaultLedger, engine: Arc<RemediationEngine>) -> Self {
        Self {
            config,
            classifier: FaultClassifier::new(),
            tracker: CommandTracker::new(),
            ledger,
            engine,
            buffer: VecDeque::new(),
            pending: VecDeque::new(),
            inflight: None,
            stats: SessionStats::new(),
        }
    }

    /// Run until the operator interrupts. Per-iteration failures are
    /// transient: logged and retried, never fatal to the loop.
    ///
    /// # Errors
    /// Returns an error only when the capture file never appears.
    pub async fn run(&mut self) -> Result<SessionStats> {
        let mut source = LineSource::open(&self.config.log_file, &self.config.tail)
            .await
            .context("Failed to open capture file for tailing")?;

        info!(log_file = %self.config.log_file.display(), "Full-agent monitoring started");
        println!("{}", "Monitoring started!".white().bold());
        println!();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Operator interrupt, stopping monitor");
                    break;
                }
                () = tokio::time::sleep(self.config.tail.poll_interval) => {
                    if let Err(e) = self.poll_once(&mut source).await {
                        warn!(error = %e, "Monitor iteration failed, continuing");
                    }
                }
            }
        }

        // Whole-file writes mean an abandoned remediation is either fully
        // absent or fully applied; nothing to unwind.
        if let Some(handle) = self.inflight.take() {
            info!("Abandoning in-flight remediation");
            handle.abort();
        }

        Ok(self.stats.clone())
    }

    /// One poll pass: reap a finished remediation, ingest new lines,
    /// dispatch the next deferred fault when the gate is free.
    async fn poll_once(&mut self, source: &mut LineSource) -> Result<()> {
        self.reap_inflight().await;

        for line in source.poll_lines().await {
            self.ingest(&line);
        }

        self.dispatch_next();
        Ok(())
    }

    /// Process one line: echo, track commands, classify, dedup, queue.
    fn ingest(&mut self, line: &str) {
        if self.config.echo_lines {
            println!("{}", line.dimmed());
        }

        let command_window = self.tail_window(self.config.command_window);
        self.tracker.observe(line, &command_window);

        let fault_window = self.tail_window(self.config.fault_window);
        let mut window_text = fault_window.join("\n");
        if !window_text.is_empty() {
            window_text.push('\n');
        }
        window_text.push_str(line);

        if let Some(mut record) = self.classifier.classify(&window_text) {
            // Resolve the path before dedup so the key is stable no
            // matter where in the output the fault was seen
            if let Some(path) = record.file_path.take() {
                let working_dir = self.tracker.working_dir().map(PathBuf::as_path);
                record.file_path = Some(resolve_target(&path, working_dir));
            }

            if self.ledger.should_process(&record) {
                self.stats.faults_detected += 1;
                println!();
                println!(
                    "{}",
                    format!(
                        "{} #{} detected: {}",
                        capitalize(record.kind.label()),
                        self.stats.faults_detected,
                        truncate(&record.matched_text, 200)
                    )
                    .yellow()
                );
                self.pending.push_back(record);
            }
        }

        self.buffer.push_back(line.to_string());
        while self.buffer.len() > self.config.buffer_cap {
            self.buffer.pop_front();
        }
    }

    /// Dispatch the oldest deferred fault, but only while no remediation
    /// is in flight - the single-flight gate.
    fn dispatch_next(&mut self) {
        if self.inflight.is_some() || self.engine.is_busy() {
            return;
        }
        let Some(record) = self.pending.pop_front() else {
            return;
        };

        // Snapshot the context at dispatch time
        let context = self.tracker.context().cloned();
        let engine = Arc::clone(&self.engine);
        self.inflight = Some(tokio::spawn(async move {
            engine.handle(record, context).await
        }));
    }

    /// Collect the result of a finished remediation task.
    async fn reap_inflight(&mut self) {
        let Some(handle) = self.inflight.take() else {
            return;
        };
        if !handle.is_finished() {
            self.inflight = Some(handle);
            return;
        }

        match handle.await {
            Ok(report) => {
                if report.outcome == Outcome::Fixed {
                    self.stats.fixes_applied += 1;
                }
                if report.restarted {
                    self.stats.restarts += 1;
                    // Fresh timestamp so lingering traceback lines from
                    // the fixed fault cannot trigger a second restart
                    self.tracker.touch();
                }
            }
            Err(e) => {
                warn!(error = %e, "Remediation task failed");
            }
        }
    }

    fn tail_window(&self, n: usize) -> Vec<String> {
        let skip = self.buffer.len().saturating_sub(n);
        self.buffer.iter().skip(skip).cloned().collect()
    }
}

/// Report from a one-shot scan of an existing capture file.
#[derive(Debug, Serialize)]
pub struct ScanReport {
    /// When the scan was performed
    pub scan_time: DateTime<Utc>,
    /// File that was scanned
    pub log_file: PathBuf,
    /// Lines examined
    pub lines_scanned: usize,
    /// Distinct faults found
    pub faults: Vec<FaultRecord>,
}

/// Scan an existing capture file once and report the distinct faults in
/// it, without remediating. Operator triage aid.
///
/// # Errors
/// Returns an error if the file cannot be read.
pub fn scan_file(path: &Path, fault_window: usize) -> Result<ScanReport> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read capture file {}", path.display()))?;
    let content = String::from_utf8_lossy(&bytes);
    let ansi = ansi_pattern();

    let classifier = FaultClassifier::new();
    let registry = Arc::new(crate::ledger::FixedFileRegistry::default());
    let mut ledger = FaultLedger::new(registry);

    let mut window: VecDeque<String> = VecDeque::new();
    let mut faults = Vec::new();
    let mut lines_scanned = 0usize;

    for raw in content.lines() {
        let line = ansi.replace_all(raw, "").trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        lines_scanned += 1;

        window.push_back(line);
        while window.len() > fault_window {
            window.pop_front();
        }

        let window_text = window.iter().cloned().collect::<Vec<_>>().join("\n");
        if let Some(record) = classifier.classify(&window_text) {
            if ledger.should_process(&record) {
                faults.push(record);
            }
        }
    }

    Ok(ScanReport {
        scan_time: Utc::now(),
        log_file: path.to_path_buf(),
        lines_scanned,
        faults,
    })
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().collect::<String>() + chars.as_str()
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_scan_file_finds_distinct_faults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "$ python app.py").unwrap();
        writeln!(file, "Traceback (most recent call last):").unwrap();
        writeln!(file, "  File \"app.py\", line 42").unwrap();
        writeln!(file, "SyntaxError: invalid syntax").unwrap();
        // Enough ordinary output that the traceback scrolls out of the
        // window before the second fault appears
        for i in 0..12 {
            writeln!(file, "app output line {i}").unwrap();
        }
        writeln!(file, "$ python other.py").unwrap();
        writeln!(file, "ModuleNotFoundError: No module named 'cv2'").unwrap();

        let report = scan_file(&path, 10).unwrap();
        assert_eq!(report.faults.len(), 2);
        assert_eq!(report.faults[0].kind, crate::classify::FaultKind::SyntaxError);
        assert_eq!(report.faults[1].kind, crate::classify::FaultKind::ModuleNotFound);
    }

    #[test]
    fn test_scan_file_dedups_repeated_fault() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let traceback = "  File \"app.py\", line 42\nSyntaxError: invalid syntax\n";
        std::fs::write(&path, format!("{traceback}{traceback}")).unwrap();

        let report = scan_file(&path, 10).unwrap();
        assert_eq!(report.faults.len(), 1);
    }

    #[test]
    fn test_scan_file_strips_ansi_before_matching() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        std::fs::write(
            &path,
            "\x1b[31mModuleNotFoundError\x1b[0m: No module named 'yaml'\n",
        )
        .unwrap();

        let report = scan_file(&path, 10).unwrap();
        assert_eq!(report.faults.len(), 1);
        assert_eq!(report.faults[0].module.as_deref(), Some("yaml"));
    }
}
