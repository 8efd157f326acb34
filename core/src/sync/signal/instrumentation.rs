use crate::instrumentation::METER;
use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;
use std::sync::LazyLock;
use tracing::trace;

static SET_APPLIED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("signal_set_applied")
        .with_description("Number of times a signal value changed")
        .build()
});

static SET_SKIPPED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("signal_set_skipped")
        .with_description("Number of times a signal write carried an unchanged value")
        .build()
});

#[inline]
pub fn record_set_applied(name: &'static str) {
    trace!(signal = name, "Signal value changed");
    SET_APPLIED.add(1, &[KeyValue::new("signal", name)]);
}

#[inline]
pub fn record_set_skipped(name: &'static str) {
    trace!(signal = name, "Signal value unchanged");
    SET_SKIPPED.add(1, &[KeyValue::new("signal", name)]);
}
