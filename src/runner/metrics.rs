use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;

use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
};

use std::fmt::{self, Debug};

pub struct Metrics {
    registry: Registry,
    api_server_request_times: Histogram,
    total_events_received: IntCounter,
    reconcile_count_by_application: IntCounterVec,
    reconcile_errors_by_application: IntCounterVec,
    watcher_requests_by_type: IntCounterVec,
    watcher_errors_by_type: IntCounterVec,
    watch_events_by_type: IntCounterVec,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Metrics")
    }
}

fn id_labels<'a>(id: &ObjectIdRef<'a>) -> [&'a str; 2] {
    [id.namespace, id.name]
}

const NAMESPACE_AND_NAME: &[&str] = &["namespace", "name"];
const API_VERSION_AND_KIND: &[&str] = &["apiVersion", "kind"];

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    pub fn new() -> Result<Metrics, prometheus::Error> {
        let registry = Registry::new();

        // 5ms up to ~10s
        let request_time_opts = HistogramOpts::new(
            "api_server_request_time",
            "Total time from sending the request to receiving the response headers",
        )
        .subsystem("client")
        .buckets(exponential_buckets(0.005, 2.0, 12)?);
        let api_server_request_times = Histogram::with_opts(request_time_opts)?;
        registry.register(Box::new(api_server_request_times.clone()))?;

        let total_events_received = IntCounter::with_opts(Opts::new(
            "events_received",
            "total number of events processed by the operator, including watch events and resyncs",
        ))?;
        registry.register(Box::new(total_events_received.clone()))?;

        let reconcile_count_by_application = counter_vec(
            &registry,
            "reconcile_counts",
            "the number of times each application has been reconciled",
            NAMESPACE_AND_NAME,
        )?;
        let reconcile_errors_by_application = counter_vec(
            &registry,
            "reconcile_errors",
            "the number of failed reconciles by application",
            NAMESPACE_AND_NAME,
        )?;
        let watcher_requests_by_type = counter_vec(
            &registry,
            "watcher_requests",
            "number of requests from watchers",
            API_VERSION_AND_KIND,
        )?;
        let watcher_errors_by_type = counter_vec(
            &registry,
            "watcher_errors",
            "number of errors from watchers",
            API_VERSION_AND_KIND,
        )?;
        let watch_events_by_type = counter_vec(
            &registry,
            "watch_events",
            "number of watch events received by watchers",
            API_VERSION_AND_KIND,
        )?;

        Ok(Metrics {
            registry,
            api_server_request_times,
            total_events_received,
            reconcile_count_by_application,
            reconcile_errors_by_application,
            watcher_requests_by_type,
            watcher_errors_by_type,
            watch_events_by_type,
        })
    }

    pub fn client_metrics(&self) -> ClientMetrics {
        ClientMetrics {
            api_server_request_times: self.api_server_request_times.clone(),
        }
    }

    pub fn watcher_metrics(&self, k8s_type: &K8sType) -> WatcherMetrics {
        let labels = &[k8s_type.api_version, k8s_type.kind];
        WatcherMetrics {
            watcher_requests: self.watcher_requests_by_type.with_label_values(labels),
            watcher_errors: self.watcher_errors_by_type.with_label_values(labels),
            watch_events: self.watch_events_by_type.with_label_values(labels),
        }
    }

    pub fn application_deleted(&self, id: &ObjectIdRef<'_>) {
        let labels = id_labels(id);
        let _ = self
            .reconcile_count_by_application
            .remove_label_values(&labels);
        let _ = self
            .reconcile_errors_by_application
            .remove_label_values(&labels);
    }

    pub fn event_received(&self) {
        self.total_events_received.inc();
    }

    pub fn reconcile_started(&self, id: &ObjectIdRef<'_>) {
        self.reconcile_count_by_application
            .with_label_values(&id_labels(id))
            .inc();
    }

    pub fn reconcile_error(&self, id: &ObjectIdRef<'_>) {
        self.reconcile_errors_by_application
            .with_label_values(&id_labels(id))
            .inc();
    }

    pub fn encode_as_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(self.registry.gather().as_slice(), &mut buffer)?;
        Ok(buffer)
    }
}

pub struct ClientMetrics {
    api_server_request_times: Histogram,
}

impl Debug for ClientMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ClientMetrics")
    }
}

impl ClientMetrics {
    pub fn request_started(&self) -> prometheus::HistogramTimer {
        self.api_server_request_times.start_timer()
    }
}

pub struct WatcherMetrics {
    watcher_requests: IntCounter,
    watcher_errors: IntCounter,
    watch_events: IntCounter,
}

impl Debug for WatcherMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("WatcherMetrics")
    }
}

impl WatcherMetrics {
    pub fn request_started(&self) {
        self.watcher_requests.inc();
    }

    pub fn event_received(&self) {
        self.watch_events.inc();
    }

    pub fn error(&self) {
        self.watcher_errors.inc();
    }
}
