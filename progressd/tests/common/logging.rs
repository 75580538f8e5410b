use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Daemon crates log at debug unless `RUST_LOG` says otherwise.
const DEFAULT_TEST_FILTER: &str = "warn,progressd=debug,progress_common=debug,test=info";

/// Route daemon logs through the test harness so they show only on failure.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_TEST_FILTER));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_test_writer()
                .with_target(true)
                .compact(),
        )
        .try_init();
}

/// Milestone line for a test, under the `test` target.
#[macro_export]
macro_rules! test_log {
    ($($arg:tt)*) => {
        tracing::info!(target: "test", $($arg)*)
    };
}
