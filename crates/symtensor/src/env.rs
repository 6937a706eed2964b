use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

static LIVECHECK: OnceLock<AtomicBool> = OnceLock::new();

fn parse_flag(value: &str) -> bool {
    let trimmed = value.trim();
    !(trimmed.is_empty() || trimmed == "0")
}

fn flag() -> &'static AtomicBool {
    LIVECHECK.get_or_init(|| {
        let enabled = match env::var("LIVECHECK") {
            Ok(value) => parse_flag(&value),
            Err(_) => false,
        };
        AtomicBool::new(enabled)
    })
}

/// Reports whether live-check mode is active.
///
/// Under live-check, run paths skip backend materialization entirely and
/// return zeroed placeholders of the declared shape, so programs can be
/// shape-checked without a working backend.
pub fn live_check_enabled() -> bool {
    flag().load(Ordering::Relaxed)
}

/// Overrides the live-check flag for the whole process.
///
/// The flag is initialized once from the `LIVECHECK` environment variable;
/// this setter exists so embedding hosts and tests can toggle the mode
/// without re-executing.
pub fn set_live_check(enabled: bool) {
    flag().store(enabled, Ordering::Relaxed);
}
