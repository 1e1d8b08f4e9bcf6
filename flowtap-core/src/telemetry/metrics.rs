use opentelemetry::global;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};

/// Counters for the per-packet hot path.
///
/// Unlike the teacher's HTTP-facing metrics, every counter here is driven
/// from inside mutex-protected engine code, so increments are cheap atomic
/// adds with no async plumbing involved.
#[derive(Clone)]
pub struct Metrics {
    pub frames_total: Counter<u64>,
    pub fragments_reassembled_total: Counter<u64>,
    pub fragments_dropped_total: Counter<u64>,
    pub flows_opened_total: Counter<u64>,
    pub flows_expired_total: Counter<u64>,
    pub flows_terminated_total: Counter<u64>,
    pub parse_errors_total: Counter<u64>,
    pub netmatch_invocations_total: Counter<u64>,
}

impl Metrics {
    fn new(meter: Meter) -> Self {
        Self {
            frames_total: meter
                .u64_counter("flowtap_frames_total")
                .with_description("Total number of frames seen by the engine")
                .build(),
            fragments_reassembled_total: meter
                .u64_counter("flowtap_fragments_reassembled_total")
                .with_description("Total number of IP datagrams successfully reassembled")
                .build(),
            fragments_dropped_total: meter
                .u64_counter("flowtap_fragments_dropped_total")
                .with_description("Total number of fragments dropped by timeout or slot eviction")
                .build(),
            flows_opened_total: meter
                .u64_counter("flowtap_flows_opened_total")
                .with_description("Total number of sub-parsers created")
                .build(),
            flows_expired_total: meter
                .u64_counter("flowtap_flows_expired_total")
                .with_description("Total number of sub-parsers evicted on idle timeout")
                .build(),
            flows_terminated_total: meter
                .u64_counter("flowtap_flows_terminated_total")
                .with_description("Total number of TCP flows terminated by FIN/ACK")
                .build(),
            parse_errors_total: meter
                .u64_counter("flowtap_parse_errors_total")
                .with_description("Total number of parse errors recovered from")
                .build(),
            netmatch_invocations_total: meter
                .u64_counter("flowtap_netmatch_invocations_total")
                .with_description("Total number of netmatch filter invocations")
                .build(),
        }
    }
}

/// Builds the metrics struct and the registry backing its Prometheus export.
///
/// The core never binds a socket; callers decide how to expose the
/// registry (the `flowtap` binary renders it periodically to stdout or a
/// file, a host process can instead scrape [`render_prometheus`] itself).
pub fn init_metrics() -> crate::error::Result<(Metrics, Registry)> {
    let registry = Registry::new();

    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .map_err(|e| crate::error::EngineError::Config(format!("metrics init failed: {e}")))?;

    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(meter_provider);

    let meter = global::meter("flowtap");
    Ok((Metrics::new(meter), registry))
}

/// Renders the current metric values in Prometheus text exposition format.
pub fn render_prometheus(registry: &Registry) -> String {
    let metric_families = registry.gather();
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    let _ = encoder.encode(&metric_families, &mut buf);
    String::from_utf8(buf).unwrap_or_default()
}
