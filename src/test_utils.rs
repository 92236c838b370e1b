//! Test logging infrastructure for unit tests.
//!
//! Installs a `tracing` subscriber once per process so test runs can be
//! debugged with `TEST_LOG=trace cargo test -- --nocapture`. Integration
//! tests carry their own copy in `tests/common`.

use std::sync::Once;

/// Installs the test subscriber. Idempotent.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = std::env::var("TEST_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".to_owned());
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .without_time()
            .try_init();
    });
}

/// Marks the start of a named test phase in the log.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = $name, "=== test phase ===");
    };
}

/// Marks a named section within a test.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::info!(section = $name, "--- section ---");
    };
}

/// Marks successful completion of a named test.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "test complete");
    };
}

/// Asserts a condition, logging expected and actual values on failure.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $what:expr, $expected:expr, $actual:expr) => {
        if $cond {
            tracing::debug!(check = $what, "check held");
        } else {
            tracing::error!(
                check = $what,
                expected = ?$expected,
                actual = ?$actual,
                "check failed"
            );
            panic!("{}: expected {:?}, got {:?}", $what, $expected, $actual);
        }
    };
}
