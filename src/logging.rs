//! Log output setup
//!
//! The engine only emits through the `log` facade; embedding applications
//! pick the subscriber. These helpers install the `tracing-subscriber`
//! formatter, which also captures `log` records.

use once_cell::sync::OnceCell;
use tracing_subscriber::filter::LevelFilter;

/// Install the default formatter. Does nothing if a subscriber is already set.
pub fn init() {
    let _ = tracing_subscriber::fmt().try_init();
}

/// Idempotent setup for tests, routed through the test writer.
pub fn init_for_tests() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(LevelFilter::DEBUG)
            .with_test_writer()
            .try_init();
    });
}
