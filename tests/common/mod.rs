//! Shared helpers for the end-to-end suites.

#![allow(dead_code, unused_macros)]

use soloio::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::Once;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, Error>>>>;

/// Boxes a future so heterogeneous computations can share one `gather`
/// call.
pub fn boxed<T, F>(future: F) -> BoxFuture<T>
where
    F: Future<Output = Result<T, Error>> + 'static,
{
    Box::pin(future)
}

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

macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = $name, "=== test phase ===");
    };
}

macro_rules! test_section {
    ($name:expr) => {
        tracing::info!(section = $name, "--- section ---");
    };
}

macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "test complete");
    };
}
