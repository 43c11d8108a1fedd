use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;

pub struct Metrics {
    request_counter: Counter<u64>,
    prediction_duration: Histogram<u64>,
    detection_counter: Counter<u64>,
    pub registry: Registry,
    // Held so that replacing the global provider does not shut this one down.
    _provider: SdkMeterProvider,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("pest_detection");
        global::set_meter_provider(provider.clone());

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let prediction_duration = meter
            .u64_histogram("prediction_duration_ms")
            .with_boundaries(latency_boundaries(&[(50, 500, 50), (500, 2000, 250), (2000, 10000, 2000)]))
            .with_description("Duration of Custom Vision prediction calls in milliseconds")
            .build();

        let detection_counter = meter
            .u64_counter("detections_total")
            .with_description("Detections above the confidence threshold, by tag")
            .build();

        Ok(Metrics {
            request_counter,
            prediction_duration,
            detection_counter,
            registry,
            _provider: provider,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = [KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_prediction_duration(&self, duration_ms: u64, route: &str) {
        let attributes = [KeyValue::new("route", route.to_string())];
        self.prediction_duration.record(duration_ms, &attributes);
    }

    pub fn record_detection(&self, tag: &str) {
        let attributes = [KeyValue::new("tag", tag.to_string())];
        self.detection_counter.add(1, &attributes);
    }
}

/// Concatenates `(start, end, step)` ranges into sorted, deduplicated
/// histogram boundaries.
fn latency_boundaries(ranges: &[(u64, u64, usize)]) -> Vec<f64> {
    let mut boundaries: Vec<u64> = ranges
        .iter()
        .flat_map(|&(start, end, step)| (start..=end).step_by(step))
        .collect();
    boundaries.sort_unstable();
    boundaries.dedup();
    boundaries.into_iter().map(|x| x as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_boundaries() {
        let get = latency_boundaries(&[(10, 30, 10), (30, 100, 35), (100, 300, 200)]);
        let expected = vec![10.0, 20.0, 30.0, 65.0, 100.0, 300.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_recorded_metrics_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request("/detect");
        metrics.record_detection("aphid");
        metrics.record_prediction_duration(120, "/detect");

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        assert!(names.iter().any(|name| name.starts_with("requests_total")));
        assert!(names.iter().any(|name| name.starts_with("detections_total")));
        assert!(names
            .iter()
            .any(|name| name.starts_with("prediction_duration_ms")));
    }
}
