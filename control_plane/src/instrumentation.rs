use haproxy_ingress_core::instrumentation::METER;
use opentelemetry::metrics::Counter;
use std::sync::LazyLock;

static RECONCILE_PASSES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("reconcile_passes")
        .with_description("Number of reconcile passes")
        .build()
});

static RECONCILE_FAILURES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("reconcile_failures")
        .with_description("Number of reconcile passes that were not committed")
        .build()
});

pub(crate) fn record_reconcile(ok: bool) {
    RECONCILE_PASSES.add(1, &[]);
    if !ok {
        RECONCILE_FAILURES.add(1, &[]);
    }
}
