//! Best-effort tracking of the command currently running in the monitored
//! terminal.
//!
//! Commands are recognized from their shape in the output stream (the
//! capture includes the operator's typed line). Recognition is heuristic:
//! the tracker scans a short trailing window in reverse so the most recent
//! candidate wins, and separately watches `cd` invocations to keep a guess
//! at the working directory.

use regex::Regex;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, warn};

/// Shortest string accepted as a command (filters stray prompt fragments).
const MIN_COMMAND_LEN: usize = 4;

/// The most recently recognized command and where/when it started.
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// The command line as it appeared in the stream
    pub command: String,
    /// Working directory in effect when the command was seen
    pub working_dir: Option<PathBuf>,
    /// When the command was recognized
    pub started_at: Instant,
}

impl CommandContext {
    /// Whether the command started within the given window.
    #[must_use]
    pub fn is_recent(&self, window: std::time::Duration) -> bool {
        self.started_at.elapsed() <= window
    }
}

/// Recognizes invoked commands from the line stream.
pub struct CommandTracker {
    patterns: Vec<Regex>,
    cd_pattern: Regex,
    working_dir: Option<PathBuf>,
    context: Option<CommandContext>,
}

impl Default for CommandTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTracker {
    /// Build the tracker with the built-in command shapes. Order matters:
    /// interpreter invocations with an explicit script path come before
    /// their looser variants, and local executables come last.
    #[must_use]
    pub fn new() -> Self {
        // The \b keeps shapes from matching inside longer words ("cargo
        // run" must not satisfy the "go run" shape).
        let shapes = [
            r"\b(python3?\s+\S+\.py(?:\s+[^\n]*)?)",
            r"\b(python3?\s+\S+(?:\s+[^\n]*)?)",
            r"\b(node\s+\S+\.js(?:\s+[^\n]*)?)",
            r"\b(node\s+\S+(?:\s+[^\n]*)?)",
            r"\b(npm\s+(?:run|start|test|build|install|dev)[^\n]*)",
            r"\b(npm\s+\S+[^\n]*)",
            r"\b(yarn\s+[^\n]*)",
            r"\b(go\s+run\s+[^\n]*)",
            r"\b(cargo\s+(?:run|build|test)[^\n]*)",
            r"\b(ruby\s+\S+\.rb[^\n]*)",
            r"\b(perl\s+\S+\.pl[^\n]*)",
            r"\b(bash\s+\S+\.sh[^\n]*)",
            r"\b(sh\s+\S+\.sh[^\n]*)",
            r"(\./\S+[^\n]*)",
        ];

        let patterns = shapes
            .iter()
            .map(|shape| {
                Regex::new(&format!("(?i){shape}")).unwrap_or_else(|e| {
                    warn!(pattern = %shape, error = %e, "Failed to compile command pattern");
                    Regex::new("^$").unwrap()
                })
            })
            .collect();

        Self {
            patterns,
            cd_pattern: Regex::new(r"(?i)\bcd\s+(\S+)").unwrap(),
            working_dir: None,
            context: None,
        }
    }

    /// Current best guess at the running command, if any.
    #[must_use]
    pub fn context(&self) -> Option<&CommandContext> {
        self.context.as_ref()
    }

    /// Current best guess at the working directory.
    #[must_use]
    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    /// Refresh the context timestamp, e.g. after the engine restarted the
    /// command, so lingering traceback lines do not trigger a second
    /// restart.
    pub fn touch(&mut self) {
        if let Some(ctx) = &mut self.context {
            ctx.started_at = Instant::now();
        }
    }

    /// Feed the newest line plus a trailing window of prior lines.
    ///
    /// Updates the working directory from `cd` occurrences and overwrites
    /// the command context when a command shape is recognized. No match
    /// leaves the context unchanged.
    pub fn observe(&mut self, newest: &str, window: &[String]) {
        if let Some(caps) = self.cd_pattern.captures(newest) {
            if let Some(dir) = caps.get(1) {
                self.working_dir = Some(PathBuf::from(dir.as_str()));
                debug!(dir = %dir.as_str(), "Working directory updated");
            }
        }

        if let Some(command) = self.detect(newest, window) {
            debug!(command = %command, "Command recognized");
            self.context = Some(CommandContext {
                command,
                working_dir: self.working_dir.clone(),
                started_at: Instant::now(),
            });
        }
    }

    /// Scan the window in reverse (most recent candidate nearest the end
    /// wins) for the first line matching a command shape.
    fn detect(&self, newest: &str, window: &[String]) -> Option<String> {
        let lines = window
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(newest));

        for line in lines.collect::<Vec<_>>().into_iter().rev() {
            let mut candidate = line.trim();
            if candidate.is_empty() {
                continue;
            }

            // Shell prompt prefixes show up in captured output
            if let Some(stripped) = candidate
                .strip_prefix('$')
                .or_else(|| candidate.strip_prefix('>'))
                .or_else(|| candidate.strip_prefix('#'))
            {
                candidate = stripped.trim();
            }

            // Banner lines from the capture utility itself
            if candidate.contains("Script started") || candidate.contains("Script done") {
                continue;
            }

            for pattern in &self.patterns {
                let Some(caps) = pattern.captures(candidate) else {
                    continue;
                };
                let command = caps.get(1).map_or("", |m| m.as_str()).trim();
                if command.len() < MIN_COMMAND_LEN
                    || command.starts_with("cd ")
                    || command.starts_with('#')
                {
                    continue;
                }
                return Some(command.to_string());
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_recognizes_python_script() {
        let mut tracker = CommandTracker::new();
        tracker.observe("$ python app.py --verbose", &[]);

        let ctx = tracker.context().expect("context");
        assert_eq!(ctx.command, "python app.py --verbose");
    }

    #[test]
    fn test_recognizes_common_tools() {
        for (line, expected) in [
            ("$ npm run dev", "npm run dev"),
            ("> node server.js", "node server.js"),
            ("$ cargo run --release", "cargo run --release"),
            ("$ go run main.go", "go run main.go"),
            ("$ ./build.sh --fast", "./build.sh --fast"),
        ] {
            let mut tracker = CommandTracker::new();
            tracker.observe(line, &[]);
            assert_eq!(
                tracker.context().map(|c| c.command.as_str()),
                Some(expected),
                "line: {line}"
            );
        }
    }

    #[test]
    fn test_most_recent_candidate_wins() {
        let mut tracker = CommandTracker::new();
        let window = vec![
            "$ python old.py".to_string(),
            "output from old run".to_string(),
            "$ python new.py".to_string(),
        ];
        tracker.observe("some trailing output", &window);

        assert_eq!(
            tracker.context().map(|c| c.command.as_str()),
            Some("python new.py")
        );
    }

    #[test]
    fn test_no_match_leaves_context_unchanged() {
        let mut tracker = CommandTracker::new();
        tracker.observe("$ python app.py", &[]);
        tracker.observe("Traceback (most recent call last):", &[]);

        assert_eq!(
            tracker.context().map(|c| c.command.as_str()),
            Some("python app.py")
        );
    }

    #[test]
    fn test_tracks_working_directory() {
        let mut tracker = CommandTracker::new();
        tracker.observe("$ cd /srv/app", &[]);
        tracker.observe("$ python app.py", &[]);

        let ctx = tracker.context().expect("context");
        assert_eq!(ctx.working_dir.as_deref(), Some(std::path::Path::new("/srv/app")));
    }

    #[test]
    fn test_skips_capture_utility_banner() {
        let mut tracker = CommandTracker::new();
        tracker.observe("Script started, output log file is /tmp/agent.log", &[]);
        assert!(tracker.context().is_none());
    }

    #[test]
    fn test_recency_window() {
        let mut tracker = CommandTracker::new();
        tracker.observe("$ python app.py", &[]);

        let ctx = tracker.context().expect("context");
        assert!(ctx.is_recent(Duration::from_secs(30)));
        assert!(!ctx.is_recent(Duration::ZERO));
    }
}
