pub mod fixtures;
pub mod logging;

pub use fixtures::{TestDaemon, git_available, serve_manifest};
pub use logging::init_test_logging;
