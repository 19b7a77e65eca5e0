//! Test logging setup
//!
//! Run the suite with `--features test-logging` to see the client's tracing
//! output; `RUST_LOG` narrows it as usual.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Install a test-writer subscriber once per test binary
    ///
    /// ```bash
    /// RUST_LOG=mcp_stdio_client::rpc=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }

    // Every test in the binary logs once the feature is on
    #[ctor::ctor]
    fn init_test_logging() {
        init();
    }
}
