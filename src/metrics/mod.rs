//! Metrics exported through the global OpenTelemetry meter.
//!
//! Instruments are created where they are used with
//! `opentelemetry::global::meter("stateflow")`. Until
//! [`initialize_metrics`] installs a provider they are no-ops.

use opentelemetry::global;
use opentelemetry_sdk::metrics::{new_view, Aggregation, Instrument, MeterProvider, Stream};
use prometheus::{default_registry, Encoder, TextEncoder};

use crate::errors::{EngineError, EngineException, EngineResult};

/// Name of the meter every instrument is created on.
pub const METER_NAME: &str = "stateflow";

/// Time `$body` and record the seconds it took in `$histogram`.
#[macro_export]
macro_rules! with_timer {
    ($histogram: expr, $labels: expr, $body: expr) => {{
        let now = std::time::Instant::now();
        let res = $body;
        $histogram.record(now.elapsed().as_secs_f64(), &$labels);
        res
    }};
}

/// Initialize the global registry for Prometheus metrics,
/// and create a global MeterProvider.
pub fn initialize_metrics() -> EngineResult<()> {
    // Initialize the global default registry for prometheus metrics
    // as internally it's a lazy static.
    let registry = default_registry();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .with_namespace(METER_NAME)
        .build()
        .reraise("error building prometheus exporter")?;

    let provider = MeterProvider::builder()
        .with_reader(exporter)
        .with_view(
            new_view(
                Instrument::new().name("*duration*"), // Must match histogram name
                Stream::new().aggregation(Aggregation::ExplicitBucketHistogram {
                    boundaries: vec![
                        0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0,
                        2.5, 5.0, 7.5, 10.0,
                    ],
                    record_min_max: true,
                }),
            )
            .reraise("error building duration histogram view")?,
        )
        .build();
    global::set_meter_provider(provider);
    Ok(())
}

/// Render everything in the default Prometheus registry in the text
/// exposition format.
pub fn render_metrics() -> EngineResult<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&default_registry().gather(), &mut buffer)
        .map_err(|err| EngineError::Telemetry(format!("error encoding metrics: {err}")))?;
    String::from_utf8(buffer)
        .map_err(|err| EngineError::Telemetry(format!("metrics are not utf-8: {err}")))
}

#[test]
fn timer_returns_body_value() {
    let histogram = global::meter(METER_NAME)
        .f64_histogram("test_duration_seconds")
        .init();
    let labels = vec![opentelemetry::KeyValue::new("test", "timer")];
    let value = with_timer!(histogram, labels, { 40 + 2 });
    assert_eq!(value, 42);
}
