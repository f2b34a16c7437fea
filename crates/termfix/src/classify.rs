//! Fault classification over a rolling window of terminal output.
//!
//! Tracebacks span several lines and arrive in more than one shape, so
//! classification runs against a concatenated trailing window rather than
//! single lines. The pattern table is ordered and the order is contract:
//! syntax/indentation patterns must be tried before the looser module and
//! generic patterns, because stack-trace text for a syntax error can also
//! satisfy those.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Matched text is capped at this many characters so the same fault yields
/// the same record text on every scan pass, even as the window slides.
const MATCHED_TEXT_CAP: usize = 150;

/// Context retained for file-level faults (patch requests need more of the
/// traceback than dependency faults do).
const FILE_FAULT_CONTEXT_CHARS: usize = 1000;

/// Context retained for dependency and generic faults.
const DEP_FAULT_CONTEXT_CHARS: usize = 500;

/// Closed set of recognizable fault kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    SyntaxError,
    RuntimeError,
    ModuleNotFound,
    PackageNotFound,
    CommandNotFound,
    Generic,
}

impl FaultKind {
    /// Whether this kind is fixed by rewriting a source file.
    #[must_use]
    pub fn is_file_fault(self) -> bool {
        matches!(self, Self::SyntaxError | Self::RuntimeError)
    }

    /// Operator-facing label.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::SyntaxError => "syntax error",
            Self::RuntimeError => "runtime error",
            Self::ModuleNotFound => "missing module",
            Self::PackageNotFound => "missing package",
            Self::CommandNotFound => "missing command",
            Self::Generic => "error",
        }
    }
}

/// A normalized fault extracted from terminal output. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRecord {
    /// Kind of fault
    pub kind: FaultKind,
    /// Source file the fault points at, if the pattern carries one
    pub file_path: Option<PathBuf>,
    /// Line number within `file_path`
    pub line_number: Option<u32>,
    /// Raw module/package/command token, untranslated
    pub module: Option<String>,
    /// The text the pattern matched (capped for stable identity)
    pub matched_text: String,
    /// Trailing output surrounding the fault
    pub context_window: String,
}

/// What a pattern's capture groups mean.
#[derive(Debug, Clone, Copy)]
enum Capture {
    /// Group 1 is a file path, group 2 a line number
    FileLine,
    /// Group 1 is a module/package/command token
    Token,
    /// No groups; the token is known from the pattern itself
    Fixed(&'static str),
    /// No extraction beyond the matched text
    None,
}

/// One entry in the ordered fault table.
struct FaultPattern {
    description: &'static str,
    pattern: Regex,
    kind: FaultKind,
    capture: Capture,
}

/// Ordered fault classifier.
pub struct FaultClassifier {
    patterns: Vec<FaultPattern>,
}

impl Default for FaultClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultClassifier {
    /// Build the classifier with the built-in pattern table.
    #[must_use]
    pub fn new() -> Self {
        let runtime_errors = "AttributeError|NameError|TypeError|ValueError|KeyError|IndexError\
                              |ZeroDivisionError|FileNotFoundError|PermissionError|OSError\
                              |IOError|UnboundLocalError|RuntimeError";

        let patterns = vec![
            // Syntax and indentation faults first. Python emits both
            // "File ..., line N ... SyntaxError" and the reverse order
            // depending on version and context, so both shapes are here,
            // .py-anchored variants before the looser catch-alls.
            fault(
                "syntax error (file first)",
                r#"(?is)File ['"]([^'"]+\.py)['"].*?line (\d+).*?SyntaxError:"#,
                FaultKind::SyntaxError,
                Capture::FileLine,
            ),
            fault(
                "indentation error (file first)",
                r#"(?is)File ['"]([^'"]+\.py)['"].*?line (\d+).*?IndentationError:"#,
                FaultKind::SyntaxError,
                Capture::FileLine,
            ),
            fault(
                "syntax error (error first)",
                r#"(?is)SyntaxError:.*?File ['"]([^'"]+\.py)['"].*?line (\d+)"#,
                FaultKind::SyntaxError,
                Capture::FileLine,
            ),
            fault(
                "indentation error (error first)",
                r#"(?is)IndentationError:.*?File ['"]([^'"]+\.py)['"].*?line (\d+)"#,
                FaultKind::SyntaxError,
                Capture::FileLine,
            ),
            fault(
                "syntax error (any file)",
                r#"(?is)SyntaxError.*?File ['"]([^'"]+)['"].*?line (\d+)"#,
                FaultKind::SyntaxError,
                Capture::FileLine,
            ),
            fault(
                "indentation error (any file)",
                r#"(?is)IndentationError.*?File ['"]([^'"]+)['"].*?line (\d+)"#,
                FaultKind::SyntaxError,
                Capture::FileLine,
            ),
            // Runtime faults with a file and line, both traceback orders.
            fault(
                "runtime error (file first)",
                &format!(
                    r#"(?is)File ['"]([^'"]+\.py)['"].*?line (\d+).*?(?:{runtime_errors}):"#
                ),
                FaultKind::RuntimeError,
                Capture::FileLine,
            ),
            fault(
                "runtime error (error first)",
                &format!(
                    r#"(?is)(?:{runtime_errors}):.*?File ['"]([^'"]+\.py)['"].*?line (\d+)"#
                ),
                FaultKind::RuntimeError,
                Capture::FileLine,
            ),
            // Missing dependencies. The captured token is the raw import
            // name; translating it to an installable package name is the
            // remediation engine's job, not the classifier's.
            fault(
                "module not found",
                r#"(?is)ModuleNotFoundError.*?No module named ['"]([^'"]+)['"]"#,
                FaultKind::ModuleNotFound,
                Capture::Token,
            ),
            fault(
                "import error (no module)",
                r#"(?is)ImportError.*?No module named ['"]([^'"]+)['"]"#,
                FaultKind::ModuleNotFound,
                Capture::Token,
            ),
            fault(
                "import error (cannot import name)",
                r#"(?is)ImportError.*?cannot import name.*?from ['"]([^'"]+)['"]"#,
                FaultKind::ModuleNotFound,
                Capture::Token,
            ),
            fault(
                "package not found",
                r#"(?is)PackageNotFoundError.*?Could not find.*?package.*?['"]([^'"]+)['"]"#,
                FaultKind::PackageNotFound,
                Capture::Token,
            ),
            // OpenCV surfaces under both its project and import names;
            // either way the import token is cv2.
            fault(
                "opencv not found",
                r"(?is)opencv.*?not found",
                FaultKind::ModuleNotFound,
                Capture::Fixed("cv2"),
            ),
            fault(
                "cv2 not found",
                r"(?is)cv2.*?not found",
                FaultKind::ModuleNotFound,
                Capture::Fixed("cv2"),
            ),
            fault(
                "pip not found",
                r"(?is)pip.*?not found",
                FaultKind::CommandNotFound,
                Capture::None,
            ),
            fault(
                "command not found",
                r#"(?is)command not found.*?['"]([^'"]+)['"]"#,
                FaultKind::CommandNotFound,
                Capture::Token,
            ),
            // Loosest pattern last: anything that looks like "Error ...
            // <token> ... not found".
            fault(
                "generic not found",
                r"(?is)Error.*?([A-Za-z0-9_-]+).*?not found",
                FaultKind::Generic,
                Capture::Token,
            ),
        ];

        Self { patterns }
    }

    /// Classify a trailing output window. First matching pattern wins;
    /// returns `None` when no fault is present.
    #[must_use]
    pub fn classify(&self, window: &str) -> Option<FaultRecord> {
        for entry in &self.patterns {
            let Some(caps) = entry.pattern.captures(window) else {
                continue;
            };

            let matched = caps.get(0).map_or("", |m| m.as_str());
            let matched_text: String = matched.chars().take(MATCHED_TEXT_CAP).collect();

            let (file_path, line_number, module) = match entry.capture {
                Capture::FileLine => {
                    let path = caps.get(1).map(|m| PathBuf::from(m.as_str()));
                    let line = caps.get(2).and_then(|m| m.as_str().parse::<u32>().ok());
                    (path, line, None)
                }
                Capture::Token => {
                    let token = caps.get(1).map(|m| m.as_str().to_string());
                    (None, None, token)
                }
                Capture::Fixed(token) => (None, None, Some(token.to_string())),
                Capture::None => (None, None, None),
            };

            let context_chars = if entry.kind.is_file_fault() {
                FILE_FAULT_CONTEXT_CHARS
            } else {
                DEP_FAULT_CONTEXT_CHARS
            };

            debug!(
                pattern = entry.description,
                kind = ?entry.kind,
                "Fault pattern matched"
            );

            return Some(FaultRecord {
                kind: entry.kind,
                file_path,
                line_number,
                module,
                matched_text,
                context_window: tail_chars(window, context_chars),
            });
        }

        None
    }
}

/// Last `n` characters of `s`, respecting char boundaries.
fn tail_chars(s: &str, n: usize) -> String {
    let count = s.chars().count();
    if count <= n {
        return s.to_string();
    }
    s.chars().skip(count - n).collect()
}

/// Helper to create a fault pattern
fn fault(
    description: &'static str,
    regex: &str,
    kind: FaultKind,
    capture: Capture,
) -> FaultPattern {
    FaultPattern {
        description,
        pattern: Regex::new(regex).unwrap_or_else(|e| {
            warn!(pattern = %regex, error = %e, "Failed to compile fault pattern");
            Regex::new("^$").unwrap() // Match nothing as fallback
        }),
        kind,
        capture,
    }
}
