use getset::CopyGetters;
use std::time::Duration;

/// Tunables not exposed on the command line.
#[derive(Debug, CopyGetters, PartialEq, Eq)]
pub struct Options {
    /// Read and write timeout of one runtime socket exchange.
    #[getset(get_copy = "pub")]
    runtime_timeout: Duration,

    /// Time the controller gets to drain events and stop HAProxy on shutdown.
    #[getset(get_copy = "pub")]
    shutdown_grace: Duration,

    #[getset(get_copy = "pub")]
    health_check_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            runtime_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(3),
        }
    }
}
