//! Single-flight remediation engine.
//!
//! Given a fresh fault and the most recent command context, the engine
//! produces and applies a fix: a whole-file rewrite for syntax/runtime
//! faults, an installer invocation for missing dependencies, or a
//! command extracted from remote analysis for anything else. At most one
//! remediation runs at a time; the gate is held for the full lifetime of
//! the remote call and released on every exit path.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info, warn};

use crate::classify::{FaultKind, FaultRecord};
use crate::client::FixClient;
use crate::command::CommandContext;
use crate::launcher::Launch;
use crate::ledger::FixedFileRegistry;
use crate::translate::package_for_module;

/// How much trailing output is quoted back to the fix service.
const PROMPT_CONTEXT_CHARS: usize = 800;

/// Configuration for the remediation engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How recently the last command must have started for a restart
    pub restart_window: Duration,
    /// Reject patched file content shorter than this (garbage floor)
    pub min_patch_chars: usize,
    /// Installer used for missing dependencies
    pub installer: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            restart_window: Duration::from_secs(30),
            min_patch_chars: 50,
            installer: "pip".to_string(),
        }
    }
}

/// Result of one remediation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The fix was applied (file patched, or fix command exited zero)
    Fixed,
    /// A fix was attempted and did not stick
    Failed,
    /// No fix was attempted
    Skipped,
}

/// What happened during a remediation, for the control loop.
#[derive(Debug, Clone)]
pub struct RemediationReport {
    pub outcome: Outcome,
    /// Whether the tracked command was relaunched
    pub restarted: bool,
    /// The fix command that ran, when one did
    pub fix_command: Option<String>,
}

impl RemediationReport {
    fn skipped() -> Self {
        Self {
            outcome: Outcome::Skipped,
            restarted: false,
            fix_command: None,
        }
    }
}

/// Releases the single-flight gate on every exit path, panics included.
struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Single-flight remediation engine.
pub struct RemediationEngine {
    config: EngineConfig,
    client: FixClient,
    registry: Arc<FixedFileRegistry>,
    launcher: Box<dyn Launch>,
    in_flight: AtomicBool,
}

impl RemediationEngine {
    #[must_use]
    pub fn new(
        config: EngineConfig,
        client: FixClient,
        registry: Arc<FixedFileRegistry>,
        launcher: Box<dyn Launch>,
    ) -> Self {
        Self {
            config,
            client,
            registry,
            launcher,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Whether a remediation is currently in flight.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Handle one fault. The caller dispatches only while the gate is
    /// free; if a second dispatch races in anyway it is skipped, never
    /// run concurrently.
    pub async fn handle(
        &self,
        record: FaultRecord,
        context: Option<CommandContext>,
    ) -> RemediationReport {
        let Some(_guard) = self.try_acquire() else {
            warn!("Remediation already in flight, skipping dispatch");
            return RemediationReport::skipped();
        };

        info!(kind = ?record.kind, "Remediation started");

        let working_dir = context.as_ref().and_then(|c| c.working_dir.clone());

        let (outcome, fix_command) = if record.kind.is_file_fault() {
            (self.patch_file(&record, working_dir.as_deref()).await, None)
        } else {
            match self.resolve_fix_command(&record, working_dir.as_deref()).await {
                Some(command) => {
                    let outcome = self
                        .run_fix_command(&command, working_dir.as_deref())
                        .await
                        .unwrap_or_else(|e| {
                            println!("{}", format!("Error executing fix: {e}").yellow());
                            Outcome::Failed
                        });
                    (outcome, Some(command))
                }
                None => {
                    println!("{}", "Could not determine fix command".yellow());
                    (Outcome::Skipped, None)
                }
            }
        };

        let mut restarted = false;
        if outcome == Outcome::Fixed {
            restarted = self.maybe_restart(context.as_ref());
        }

        info!(outcome = ?outcome, restarted, "Remediation finished");
        RemediationReport {
            outcome,
            restarted,
            fix_command,
        }
    }

    fn try_acquire(&self) -> Option<FlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| FlightGuard {
                flag: &self.in_flight,
            })
    }

    /// Whole-file patch branch for syntax and runtime faults.
    async fn patch_file(&self, record: &FaultRecord, working_dir: Option<&Path>) -> Outcome {
        let Some(raw_path) = &record.file_path else {
            println!("{}", "Could not determine file path from error".yellow());
            return Outcome::Failed;
        };
        let target = resolve_target(raw_path, working_dir);

        if !target.exists() {
            println!(
                "{}",
                format!("File not found: {}", target.display()).yellow()
            );
            return Outcome::Failed;
        }

        let content = match tokio::fs::read(&target).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                println!(
                    "{}",
                    format!("Failed to read {}: {e}", target.display()).yellow()
                );
                return Outcome::Failed;
            }
        };

        println!(
            "Detected {} in: {}",
            record.kind.label(),
            target.display().to_string().white()
        );
        if let Some(line) = record.line_number {
            println!("Line: {}", line.to_string().white());
        }

        let prompt = patch_prompt(record, &target, &content);
        let context = serde_json::json!({
            "error_type": record.kind,
            "file_path": target.display().to_string(),
            "line_number": record.line_number,
            "error_text": record.matched_text,
        });

        let analysis = match self
            .client
            .analyze(&prompt, context, self.client.patch_timeout())
            .await
        {
            Ok(response) => response.analysis,
            Err(e) => {
                println!("{}", format!("Fix analysis failed: {e}").yellow());
                return Outcome::Skipped;
            }
        };

        let Some(patched) = clean_patch(&analysis, self.config.min_patch_chars) else {
            println!(
                "{}",
                "Service did not return valid code. Manual fix required.".yellow()
            );
            return Outcome::Failed;
        };

        if let Err(e) = tokio::fs::write(&target, patched).await {
            println!(
                "{}",
                format!("Failed to write {}: {e}", target.display()).yellow()
            );
            return Outcome::Failed;
        }
        self.registry.record(&target);

        println!(
            "{}",
            format!(
                "{} fixed! File updated: {}",
                record.kind.label(),
                target.display()
            )
            .green()
        );
        Outcome::Fixed
    }

    /// Produce the fix command for non-file faults. Missing dependencies
    /// with a known token go straight to the installer - no remote call.
    /// Everything else asks the service and extracts an installer phrase
    /// from the response, degrading to the static translation when the
    /// service is unavailable and a token is known.
    async fn resolve_fix_command(
        &self,
        record: &FaultRecord,
        working_dir: Option<&Path>,
    ) -> Option<String> {
        if matches!(
            record.kind,
            FaultKind::ModuleNotFound | FaultKind::PackageNotFound | FaultKind::CommandNotFound
        ) {
            if let Some(module) = &record.module {
                return Some(self.installer_command(module));
            }
        }

        let mut description = format!("Error detected: {}", record.matched_text);
        if let Some(module) = &record.module {
            description.push_str(&format!("\nMissing module/package: {module}"));
        }
        let context = serde_json::json!({
            "error_type": record.kind,
            "module_name": record.module,
            "working_directory": working_dir.map(|d| d.display().to_string()),
            "output": record.context_window,
        });

        println!("{}", "Analyzing error with fix service...".dimmed());

        match self
            .client
            .analyze(
                &format!("Fix this error automatically:\n\n{description}"),
                context,
                self.client.command_timeout(),
            )
            .await
        {
            Ok(response) => extract_installer_command(&response.analysis),
            Err(e) if e.is_degradable() => {
                println!(
                    "{}",
                    format!("Fix service unavailable ({e}), using fallback").dimmed()
                );
                record
                    .module
                    .as_ref()
                    .map(|module| self.installer_command(module))
            }
            Err(e) => {
                println!("{}", format!("Fix analysis failed: {e}").yellow());
                None
            }
        }
    }

    /// Installer invocation for a raw module token.
    fn installer_command(&self, module: &str) -> String {
        format!(
            "{} install {}",
            self.config.installer,
            package_for_module(module)
        )
    }

    /// Run a fix command synchronously, streaming combined output to the
    /// operator. Success is exit code zero.
    async fn run_fix_command(&self, command: &str, working_dir: Option<&Path>) -> Result<Outcome> {
        println!();
        println!("Executing fix command: {}", command.white());
        if let Some(dir) = working_dir {
            println!("Working directory: {}", dir.display().to_string().white());
        }

        let mut cmd = shell_async_command(command);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn fix command: {command}"))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_task = stdout.map(|s| tokio::spawn(stream_output(s)));
        let err_task = stderr.map(|s| tokio::spawn(stream_output(s)));

        let status = child
            .wait()
            .await
            .context("Failed to wait for fix command")?;

        if let Some(task) = out_task {
            let _ = task.await;
        }
        if let Some(task) = err_task {
            let _ = task.await;
        }

        if status.success() {
            println!("{}", "Fix command completed successfully".green());
            Ok(Outcome::Fixed)
        } else {
            println!(
                "{}",
                format!("Fix command failed with {status}").yellow()
            );
            Ok(Outcome::Failed)
        }
    }

    /// Relaunch the tracked command when it started recently enough.
    /// Launch failures are reported but do not unwind the fix.
    fn maybe_restart(&self, context: Option<&CommandContext>) -> bool {
        let Some(ctx) = context else {
            return false;
        };
        if !ctx.is_recent(self.config.restart_window) {
            debug!(command = %ctx.command, "Command too old to restart");
            return false;
        }

        println!();
        println!(
            "Error fixed! Restarting command: {}",
            ctx.command.white()
        );
        match self
            .launcher
            .launch(&ctx.command, ctx.working_dir.as_deref())
        {
            Ok(()) => true,
            Err(e) => {
                println!("{}", format!("Error restarting command: {e}").yellow());
                false
            }
        }
    }
}

/// Resolve a fault's file path against the tracked working directory.
#[must_use]
pub fn resolve_target(path: &Path, working_dir: Option<&Path>) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match working_dir {
        Some(dir) => dir.join(path),
        None => path.to_path_buf(),
    }
}

/// Build the whole-file fix request. The shape is part of the service
/// contract: it must state the fault, quote the surrounding output, carry
/// the complete current content, and demand complete code with no prose.
fn patch_prompt(record: &FaultRecord, target: &Path, content: &str) -> String {
    let kind = record.kind.label();
    let line = record
        .line_number
        .map_or_else(|| "Unknown".to_string(), |l| l.to_string());
    let context_tail: String = {
        let chars: Vec<char> = record.context_window.chars().collect();
        let start = chars.len().saturating_sub(PROMPT_CONTEXT_CHARS);
        chars[start..].iter().collect()
    };

    format!(
        "You are a Python code fixer. Fix the {kind} in the following Python code.\n\n\
         ERROR DETAILS:\n\
         - File: {path}\n\
         - Line: {line}\n\
         - Error message: {matched}\n\n\
         FULL ERROR OUTPUT:\n{context_tail}\n\n\
         CURRENT CODE (with error):\n{content}\n\n\
         INSTRUCTIONS:\n\
         1. Identify the exact {kind} in the code\n\
         2. Fix ONLY the error - do not change the logic or functionality unnecessarily\n\
         3. Return the COMPLETE corrected code\n\
         4. Do NOT include any explanations, comments, or markdown formatting\n\
         5. Return ONLY the Python code, nothing else\n\n\
         IMPORTANT: Return the entire fixed file content, not just the fixed line.",
        path = target.display(),
        matched = record.matched_text,
    )
}

/// Clean a service response down to file content: strip fenced blocks,
/// drop leading prose up to the first line that looks like code, and
/// reject anything under the plausibility floor.
fn clean_patch(analysis: &str, min_chars: usize) -> Option<String> {
    let mut code = analysis;

    if let Some(idx) = code.find("```python") {
        code = &code[idx + "```python".len()..];
        if let Some(end) = code.find("```") {
            code = &code[..end];
        }
    } else if let Some(idx) = code.find("```") {
        code = &code[idx + 3..];
        // Possible language tag on the fence line
        if let Some(nl) = code.find('\n') {
            let first = code[..nl].trim();
            if !first.is_empty() && first.chars().all(char::is_alphanumeric) {
                code = &code[nl + 1..];
            }
        }
        if let Some(end) = code.find("```") {
            code = &code[..end];
        }
    }

    let code = code.trim();
    let lines: Vec<&str> = code.lines().collect();
    let start = lines
        .iter()
        .position(|line| looks_like_code(line.trim()))
        .unwrap_or(0);
    let cleaned = lines[start..].join("\n");
    let cleaned = cleaned.trim().to_string();

    if cleaned.chars().count() < min_chars {
        return None;
    }
    Some(cleaned)
}

/// Heuristic for the first real code line in a prose-prefixed response.
fn looks_like_code(line: &str) -> bool {
    if line.is_empty() {
        return false;
    }
    if line.starts_with("#!")
        || line.starts_with("import ")
        || line.starts_with("from ")
        || line.starts_with("def ")
        || line.starts_with("class ")
        || line.starts_with("\"\"\"")
        || line.starts_with("'''")
    {
        return true;
    }
    // A bare identifier line counts unless it reads like an explanation
    line.chars().next().is_some_and(char::is_alphabetic)
        && !line.starts_with("Here")
        && !line.starts_with("The")
        && !line.starts_with("This")
}

/// Pull an installer invocation out of free-form analysis text.
fn extract_installer_command(analysis: &str) -> Option<String> {
    let pattern = regex::Regex::new(r"(?i)pip install\s+(\S+)").ok()?;
    pattern
        .captures(analysis)
        .and_then(|caps| caps.get(1))
        .map(|package| format!("pip install {}", package.as_str()))
}

fn shell_async_command(command: &str) -> AsyncCommand {
    #[cfg(windows)]
    {
        let mut cmd = AsyncCommand::new("cmd");
        cmd.args(["/C", command]);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = AsyncCommand::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

async fn stream_output(reader: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            println!("{}", line.white());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_target_relative_uses_working_dir() {
        let resolved = resolve_target(Path::new("app.py"), Some(Path::new("/srv/app")));
        assert_eq!(resolved, PathBuf::from("/srv/app/app.py"));
    }

    #[test]
    fn test_resolve_target_absolute_wins() {
        let resolved = resolve_target(Path::new("/opt/tool.py"), Some(Path::new("/srv/app")));
        assert_eq!(resolved, PathBuf::from("/opt/tool.py"));
    }

    #[test]
    fn test_clean_patch_strips_python_fence() {
        let analysis = "Here is the corrected code:\n```python\nimport os\n\ndef main():\n    print(os.getcwd())\n\nmain()\n```\nLet me know if this helps!";
        let cleaned = clean_patch(analysis, 10).expect("code");
        assert!(cleaned.starts_with("import os"));
        assert!(!cleaned.contains("```"));
        assert!(!cleaned.contains("Let me know"));
    }

    #[test]
    fn test_clean_patch_strips_bare_fence_with_tag() {
        let analysis = "```py\nimport sys\nprint(sys.argv[0], 'started up')\n```";
        let cleaned = clean_patch(analysis, 10).expect("code");
        assert!(cleaned.starts_with("import sys"));
    }

    #[test]
    fn test_clean_patch_cuts_leading_prose() {
        let analysis = "Here is the fix.\nThe problem was a missing colon.\ndef main():\n    return 1\n\nif __name__ == '__main__':\n    main()";
        let cleaned = clean_patch(analysis, 10).expect("code");
        assert!(cleaned.starts_with("def main():"));
    }

    #[test]
    fn test_clean_patch_rejects_short_output() {
        assert!(clean_patch("ok", 50).is_none());
        assert!(clean_patch("```python\nx = 1\n```", 50).is_none());
    }

    #[test]
    fn test_clean_patch_accepts_docstring_start() {
        let analysis = "\"\"\"Utility module.\"\"\"\nimport json\n\ndef load(path):\n    with open(path) as f:\n        return json.load(f)";
        let cleaned = clean_patch(analysis, 50).expect("code");
        assert!(cleaned.starts_with("\"\"\"Utility module.\"\"\""));
    }

    #[test]
    fn test_extract_installer_command() {
        assert_eq!(
            extract_installer_command("You should run pip install requests and retry."),
            Some("pip install requests".to_string())
        );
        assert_eq!(extract_installer_command("restart the server"), None);
    }

    #[test]
    fn test_installer_command_translates_import_names() {
        let engine = test_engine(EngineConfig::default());
        // Scenario: cv2 resolves to its distributable package, locally
        assert_eq!(engine.installer_command("cv2"), "pip install opencv-python");
        assert_eq!(engine.installer_command("numpy"), "pip install numpy");
    }

    #[test]
    fn test_installer_is_configurable() {
        let engine = test_engine(EngineConfig {
            installer: "pip3".to_string(),
            ..EngineConfig::default()
        });
        assert_eq!(engine.installer_command("yaml"), "pip3 install pyyaml");
    }

    fn test_engine(config: EngineConfig) -> RemediationEngine {
        RemediationEngine::new(
            config,
            FixClient::new(crate::client::FixServiceConfig::default()),
            Arc::new(FixedFileRegistry::default()),
            Box::new(crate::launcher::ProcessLauncher),
        )
    }
}
