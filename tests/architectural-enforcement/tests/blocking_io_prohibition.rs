//! Architectural Enforcement: Blocking I/O Prohibition
//!
//! Async functions must never block the runtime with synchronous file or
//! network I/O. Synchronous loaders (the registry document reader) are fine
//! as long as they are plain `fn`s called before or outside the hot path.
//!
//! FORBIDDEN inside `async fn`:
//! - `std::fs::*`
//! - `std::net::*`
//! - `std::io::stdin()`
//! - `reqwest::blocking`

use architectural_enforcement::{report, rust_sources, SourceFile, PRODUCTION_DIRS};

const BLOCKING_PATTERNS: [&str; 4] = ["std::fs::", "std::net::", "std::io::stdin()", "reqwest::blocking"];

fn blocking_violations(file: &SourceFile) -> Vec<String> {
    file.production_lines()
        .filter(|(_, code)| BLOCKING_PATTERNS.iter().any(|p| code.contains(p)))
        .filter(|(idx, _)| file.enclosing_fn_is_async(*idx) == Some(true))
        .map(|(idx, _)| file.describe(idx))
        .collect()
}

#[test]
fn test_no_blocking_io_in_async_functions() {
    let violations: Vec<String> = PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| rust_sources(dir))
        .flat_map(|file| blocking_violations(&file))
        .collect();

    report(
        "BLOCKING I/O VIOLATIONS",
        &violations,
        &[
            "Use the async equivalents inside async functions:",
            "  tokio::fs instead of std::fs",
            "  reqwest::Client instead of reqwest::blocking",
            "Or move the work into tokio::task::spawn_blocking.",
        ],
    );
}

#[test]
fn test_detector_flags_fs_in_async_fn() {
    let file = SourceFile::from_lines(
        "relay/daemon/src/server.rs",
        &[
            "pub async fn reload(&self) {",
            "    let text = std::fs::read_to_string(&self.path)?;",
            "}",
        ],
    );
    assert_eq!(blocking_violations(&file).len(), 1);
}

#[test]
fn test_detector_allows_sync_loader() {
    let file = SourceFile::from_lines(
        "relay/core/src/config/mod.rs",
        &[
            "pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {",
            "    let content = std::fs::read_to_string(&path)?;",
            "}",
        ],
    );
    assert!(blocking_violations(&file).is_empty());
}
