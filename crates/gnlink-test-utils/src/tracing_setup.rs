//! Tracing initialisation for tests.
//!
//! [`init_test_tracing`] is idempotent, so every test may call it.

use tracing_subscriber::EnvFilter;

/// Install a subscriber that writes through the test harness and honours
/// `RUST_LOG` (default `info`). Later calls are ignored.
///
/// ```ignore
/// #[tokio::test]
/// async fn my_test() {
///     gnlink_test_utils::tracing_setup::init_test_tracing();
///     tracing::debug!("visible with RUST_LOG=debug");
/// }
/// ```
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
