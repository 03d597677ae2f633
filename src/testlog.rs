//! Logging setup for the test binaries.

use std::sync::Once;

static INIT: Once = Once::new();

/// Route `log` output through env_logger, once per test binary.  Pass
/// `RUST_LOG=warn` to see what the engines complain about.
pub fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}
