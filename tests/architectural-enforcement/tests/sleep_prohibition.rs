//! Architectural Enforcement: Sleep Prohibition
//!
//! All waiting in production code goes through the injected `Clock` so that
//! backoff and probe scheduling stay deterministic under `ManualClock`.
//!
//! ALLOWED:
//! - `clock.rs` (the `SystemClock` implementation itself)
//! - `test_utils.rs` (scripted adapter delays)
//! - Calls through an injected clock: `clock.sleep(...)`
//! - Anything inside `#[cfg(test)]` modules
//!
//! FORBIDDEN:
//! - `tokio::time::sleep` / `std::thread::sleep` anywhere else

use architectural_enforcement::{report, rust_sources, SourceFile, PRODUCTION_DIRS};

const ALLOWED_FILES: [&str; 2] = ["clock.rs", "test_utils.rs"];

fn sleep_violations(file: &SourceFile) -> Vec<String> {
    if ALLOWED_FILES.contains(&file.file_name()) {
        return Vec::new();
    }

    file.production_lines()
        .filter(|(_, code)| code.contains("::sleep(") || code.contains(".sleep("))
        .filter(|(_, code)| !code.contains("clock.sleep("))
        .map(|(idx, _)| file.describe(idx))
        .collect()
}

#[test]
fn test_no_sleep_outside_clock() {
    let violations: Vec<String> = PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| rust_sources(dir))
        .flat_map(|file| sleep_violations(&file))
        .collect();

    report(
        "SLEEP PROHIBITION VIOLATIONS",
        &violations,
        &[
            "Production code must wait through the injected clock:",
            "  self.clock.sleep(delay).await",
            "Periodic work uses tokio::time::interval instead of sleep loops.",
        ],
    );
}

#[test]
fn test_production_dirs_are_scanned() {
    let files: usize = PRODUCTION_DIRS
        .iter()
        .map(|dir| rust_sources(dir).len())
        .sum();
    assert!(files > 0, "no sources found; scanner paths are wrong");
}

#[test]
fn test_detector_flags_direct_sleep() {
    let file = SourceFile::from_lines(
        "relay/core/src/router.rs",
        &[
            "async fn wait() {",
            "    tokio::time::sleep(Duration::from_millis(10)).await;",
            "}",
        ],
    );
    assert_eq!(sleep_violations(&file).len(), 1);
}

#[test]
fn test_detector_allows_clock_and_tests() {
    let file = SourceFile::from_lines(
        "relay/core/src/dispatcher.rs",
        &[
            "async fn backoff(&self) {",
            "    self.clock.sleep(delay).await;",
            "    // tokio::time::sleep(d) in a comment",
            "}",
            "#[cfg(test)]",
            "mod tests {",
            "    async fn t() { tokio::time::sleep(d).await; }",
            "}",
        ],
    );
    assert!(sleep_violations(&file).is_empty());

    let clock = SourceFile::from_lines(
        "relay/core/src/clock.rs",
        &["    tokio::time::sleep(duration).await;"],
    );
    assert!(sleep_violations(&clock).is_empty());
}
