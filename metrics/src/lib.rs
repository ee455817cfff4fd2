use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0,
    ]
}

/// Installs the global meter provider. Meters created before or without
/// this call are no-ops.
pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
) -> Result<Option<SdkMeterProvider>> {
    if !enable_metrics {
        return Ok(None);
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "artifacts"))
        .with_attribute(KeyValue::new("service.name", "artifact-server"))
        .with_attribute(KeyValue::new(
            "artifacts.instance.id",
            instance_id.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    tracing::info!("metrics exporter initialized");
    Ok(Some(provider))
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Counter<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        Counter::add(self, duration.as_secs_f64(), labels);
    }
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the elapsed time into `metric` when dropped.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: Vec<KeyValue>,
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    pub fn start_with_labels(metric: &'a T, labels: &[KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels: labels.to_vec(),
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), &self.labels);
    }
}

pub mod blob_storage {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Debug, Clone)]
    pub struct Metrics {
        pub operations: Histogram<f64>,
        pub errors: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("blob-storage");
            let operations = meter
                .f64_histogram("artifacts.blob_storage.operation_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("blob storage operation latencies in seconds")
                .build();
            let errors = meter
                .u64_counter("artifacts.blob_storage.errors")
                .with_description("number of failed blob storage operations")
                .build();
            Metrics { operations, errors }
        }
    }
}

pub mod api_io_stats {
    use opentelemetry::metrics::Counter;

    #[derive(Debug)]
    pub struct Metrics {
        pub artifacts_created: Counter<u64>,
        pub artifacts_finalized: Counter<u64>,
        pub finalize_failures: Counter<u64>,
        pub upload_bytes: Counter<u64>,
        pub downloads: Counter<u64>,
        pub download_bytes: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("artifact-api");
            let artifacts_created = meter
                .u64_counter("artifacts.created")
                .with_description("number of artifact records created")
                .build();
            let artifacts_finalized = meter
                .u64_counter("artifacts.finalized")
                .with_description("number of artifacts committed after verification")
                .build();
            let finalize_failures = meter
                .u64_counter("artifacts.finalize_failures")
                .with_description("number of finalize calls rejected by integrity checks")
                .build();
            let upload_bytes = meter
                .u64_counter("artifacts.upload_bytes")
                .with_description("bytes written through chunk uploads")
                .build();
            let downloads = meter
                .u64_counter("artifacts.downloads")
                .with_description("number of download responses served")
                .build();
            let download_bytes = meter
                .u64_counter("artifacts.download_bytes")
                .with_description("bytes served by download responses")
                .build();
            Metrics {
                artifacts_created,
                artifacts_finalized,
                finalize_failures,
                upload_bytes,
                downloads,
                download_bytes,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    struct Recorder(Arc<Mutex<Vec<(Duration, usize)>>>);

    impl TimerUpdate for Recorder {
        fn add(&self, duration: Duration, labels: &[KeyValue]) {
            self.0.lock().unwrap().push((duration, labels.len()));
        }
    }

    #[test]
    fn test_timer_records_on_drop() {
        let samples = Arc::new(Mutex::new(Vec::new()));
        let recorder = Recorder(samples.clone());
        {
            let _timer = Timer::start_with_labels(&recorder, &[KeyValue::new("op", "get")]);
            assert!(samples.lock().unwrap().is_empty());
        }
        let samples = samples.lock().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].1, 1);
    }

    #[test]
    fn test_disabled_provider_is_noop() {
        let provider = init_provider(false, None, Duration::from_secs(10), "test").unwrap();
        assert!(provider.is_none());
    }
}
