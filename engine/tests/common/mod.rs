#![allow(dead_code)]

use fanout_engine::Conductor;
use std::sync::Once;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialise tracing for tests, logs are captured per test.
///
/// Enable levels with e.g. `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// the process wide conductor, with tracing set up
pub fn conductor() -> Conductor {
    init_tracing();
    Conductor::global().expect("conductor should start")
}
