//! Architectural Enforcement: No Global State
//!
//! Every gateway owns its registry, health table, cache and metrics, so two
//! gateways in one process never share state. The core library therefore
//! declares no process-wide mutable statics.
//!
//! FORBIDDEN in relay/core/src:
//! - `static mut`
//! - `static` items holding locks, cells or atomics
//! - `lazy_static!` and `thread_local!`

use architectural_enforcement::{report, rust_sources, SourceFile};

const SHARED_STATE_MARKERS: [&str; 7] = [
    "Mutex", "RwLock", "OnceLock", "OnceCell", "Lazy", "Atomic", "RefCell",
];

fn is_static_item(code: &str) -> bool {
    let mut rest = code.trim_start();
    for prefix in ["pub(crate) ", "pub(super) ", "pub "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    rest.starts_with("static ")
}

fn global_state_violations(file: &SourceFile) -> Vec<String> {
    file.production_lines()
        .filter(|(_, code)| {
            code.contains("static mut ")
                || code.contains("lazy_static!")
                || code.contains("thread_local!")
                || (is_static_item(code)
                    && SHARED_STATE_MARKERS.iter().any(|m| code.contains(m)))
        })
        .map(|(idx, _)| file.describe(idx))
        .collect()
}

#[test]
fn test_core_has_no_global_state() {
    let violations: Vec<String> = rust_sources("relay/core/src")
        .iter()
        .flat_map(global_state_violations)
        .collect();

    report(
        "GLOBAL STATE VIOLATIONS",
        &violations,
        &[
            "State belongs to a Gateway component, shared through Arc:",
            "  registry, health monitor, cache, metrics collector",
        ],
    );
}

#[test]
fn test_detector_flags_static_lock() {
    let file = SourceFile::from_lines(
        "relay/core/src/cache.rs",
        &[
            "static CACHE: OnceLock<Mutex<HashMap<String, Value>>> = OnceLock::new();",
            "pub static mut HITS: u64 = 0;",
        ],
    );
    assert_eq!(global_state_violations(&file).len(), 2);
}

#[test]
fn test_detector_ignores_static_lifetimes_and_consts() {
    let file = SourceFile::from_lines(
        "relay/core/src/registry.rs",
        &[
            "pub fn as_str(&self) -> &'static str {",
            "const DEFAULT_PRIORITY: u32 = 100;",
            "}",
        ],
    );
    assert!(global_state_violations(&file).is_empty());
}
