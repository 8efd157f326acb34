use opentelemetry::global::meter;
use opentelemetry::metrics::Meter;
use std::sync::{LazyLock, Once};
use tracing_subscriber::EnvFilter;

pub static METER: LazyLock<Meter> = LazyLock::new(|| meter("haproxy-ingress"));

static INIT: Once = Once::new();

/// Maps the controller's log level names onto tracing filter directives.
/// `warning` is accepted as an alias of `warn`.
pub fn filter_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => "info",
    }
}

pub fn init_instrumentation(level: &str) {
    let directive = filter_directive(level);

    INIT.call_once(|| {
        #[cfg(debug_assertions)]
        unsafe {
            backtrace_on_stack_overflow::enable();
        };

        if std::env::var("TOKIO_CONSOLE_BIND").is_ok() {
            console_subscriber::init();
            return;
        }

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)),
            )
            .with_target(false)
            .with_thread_ids(true)
            .with_level(true)
            .finish();

        if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("unable to install tracing subscriber: {err}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("trace", "trace")]
    #[case("DEBUG", "debug")]
    #[case("warning", "warn")]
    #[case("warn", "warn")]
    #[case(" error ", "error")]
    #[case("info", "info")]
    #[case("bogus", "info")]
    fn test_filter_directive(#[case] level: &str, #[case] expected: &str) {
        assert_eq!(filter_directive(level), expected);
    }
}
