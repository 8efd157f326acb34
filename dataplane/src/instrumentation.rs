use haproxy_ingress_core::instrumentation::METER;
use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;
use std::sync::LazyLock;

static RELOADS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("haproxy_reloads")
        .with_description("Number of HAProxy reloads")
        .build()
});

static RESTARTS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("haproxy_restarts")
        .with_description("Number of HAProxy restarts")
        .build()
});

static RUNTIME_COMMANDS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("runtime_commands")
        .with_description("Number of commands sent to the HAProxy runtime socket")
        .build()
});

pub fn record_reload() {
    RELOADS.add(1, &[]);
}

pub fn record_restart() {
    RESTARTS.add(1, &[]);
}

pub fn record_runtime_command(object: &'static str, ok: bool) {
    RUNTIME_COMMANDS.add(
        1,
        &[
            KeyValue::new("object", object),
            KeyValue::new("result", if ok { "ok" } else { "error" }),
        ],
    );
}
