//! Logging initialization.
//!
//! Controlled by `MERGEQ_LOG` (an `EnvFilter` directive string):
//! - unset → warnings and errors only, compact format to stderr
//! - e.g. `MERGEQ_LOG=mergeq=debug` → verbose module-scoped output
//!
//! `MERGEQ_LOG_FORMAT=json` switches to the JSON formatter for log
//! collectors; the default compact format is for humans.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const FILTER_ENV: &str = "MERGEQ_LOG";
const FORMAT_ENV: &str = "MERGEQ_LOG_FORMAT";

/// Install the global subscriber. Call once, at the top of `main`.
pub fn init() {
    let filter = EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    let json = std::env::var(FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .without_time()
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
