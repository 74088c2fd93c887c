//! Architectural Enforcement Integration Tests
//!
//! Source-scanning checks that keep the relay crates honest:
//! - No sleep() calls outside the injected clock
//! - No blocking I/O inside async functions
//! - No ambient global state in the core library
//!
//! This library holds the shared scanning helpers; the checks themselves live
//! under `tests/`.

use std::fs;
use std::path::{Path, PathBuf};

/// Workspace root, two levels above this package
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// A Rust source file split into lines
#[derive(Debug)]
pub struct SourceFile {
    pub path: PathBuf,
    pub lines: Vec<String>,
}

impl SourceFile {
    pub fn from_lines(path: impl Into<PathBuf>, lines: &[&str]) -> Self {
        Self {
            path: path.into(),
            lines: lines.iter().map(|l| (*l).to_string()).collect(),
        }
    }

    /// File name without directories
    pub fn file_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    /// Index of the first line of the trailing `#[cfg(test)]` module
    ///
    /// Unit tests sit at the bottom of each file, so everything from the
    /// first top-level `#[cfg(test)]` onward is test code.
    pub fn test_region_start(&self) -> usize {
        self.lines
            .iter()
            .position(|l| l.starts_with("#[cfg(test)]"))
            .unwrap_or(self.lines.len())
    }

    /// `(index, code without trailing comment)` for every non-test line
    pub fn production_lines(&self) -> impl Iterator<Item = (usize, &str)> {
        self.lines[..self.test_region_start()]
            .iter()
            .enumerate()
            .map(|(idx, line)| (idx, strip_comment(line)))
    }

    /// Whether the function enclosing `idx` is `async`
    ///
    /// `None` outside any function.
    pub fn enclosing_fn_is_async(&self, idx: usize) -> Option<bool> {
        self.lines[..=idx.min(self.lines.len().saturating_sub(1))]
            .iter()
            .rev()
            .find_map(|line| fn_signature(line))
    }

    /// `path:line - code` for reports
    pub fn describe(&self, idx: usize) -> String {
        format!(
            "{}:{} - {}",
            self.path.display(),
            idx + 1,
            self.lines.get(idx).map_or("", |l| l.trim())
        )
    }
}

/// Code part of a line, dropping `//` comments
pub fn strip_comment(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// `Some(is_async)` when the line opens a function
pub fn fn_signature(line: &str) -> Option<bool> {
    let mut rest = line.trim_start();
    for prefix in ["pub(crate) ", "pub(super) ", "pub "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    if rest.starts_with("async fn ") {
        Some(true)
    } else if rest.starts_with("fn ") {
        Some(false)
    } else {
        None
    }
}

/// Every `.rs` file under `dir` (relative to the workspace root)
pub fn rust_sources(dir: &str) -> Vec<SourceFile> {
    let root = workspace_root().join(dir);
    if !root.exists() {
        return Vec::new();
    }

    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .filter_map(|e| {
            let content = fs::read_to_string(e.path()).ok()?;
            Some(SourceFile {
                path: e.path().to_path_buf(),
                lines: content.lines().map(str::to_string).collect(),
            })
        })
        .collect()
}

/// Production source directories checked by every policy
pub const PRODUCTION_DIRS: [&str; 2] = ["relay/core/src", "relay/daemon/src"];

/// Print violations and fail the calling test
pub fn report(title: &str, violations: &[String], guidance: &[&str]) {
    if violations.is_empty() {
        return;
    }

    eprintln!("\n❌ {title}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    eprintln!();
    for line in guidance {
        eprintln!("  {line}");
    }

    panic!(
        "\nFound {} violation(s).\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_signature_detection() {
        assert_eq!(fn_signature("    pub async fn invoke(&self) {"), Some(true));
        assert_eq!(fn_signature("pub(crate) fn map_status(s: u16) -> X {"), Some(false));
        assert_eq!(fn_signature("fn main() {"), Some(false));
        assert_eq!(fn_signature("    let f = 1;"), None);
        assert_eq!(fn_signature("    // fn commented()"), None);
    }

    #[test]
    fn test_test_region_start() {
        let file = SourceFile::from_lines(
            "x.rs",
            &["fn a() {}", "", "#[cfg(test)]", "mod tests {", "}"],
        );
        assert_eq!(file.test_region_start(), 2);
        assert_eq!(file.production_lines().count(), 2);
    }

    #[test]
    fn test_enclosing_fn() {
        let file = SourceFile::from_lines(
            "x.rs",
            &[
                "fn load() {",
                "    std::fs::read_to_string(p);",
                "}",
                "pub async fn run() {",
                "    work().await;",
                "}",
            ],
        );
        assert_eq!(file.enclosing_fn_is_async(1), Some(false));
        assert_eq!(file.enclosing_fn_is_async(4), Some(true));
    }

    #[test]
    fn test_strip_comment() {
        assert_eq!(strip_comment("let x = 1; // sleep(5)"), "let x = 1; ");
        assert_eq!(strip_comment("/// docs"), "");
    }
}
