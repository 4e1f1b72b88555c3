use prometheus::{HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry};

/// Per-process Prometheus registry and the counters/histograms shared across
/// `identity-service`, `document-service`, and `job-worker`. Each binary
/// constructs its own instance and serves it from an `/internal/metrics`
/// endpoint the way `job-worker` already does for the audit consumer.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub registry: Registry,
    pub documents_created_total: IntCounter,
    pub documents_deleted_total: IntCounter,
    pub fields_filled_total: IntCounterVec,
    pub webhook_dispatch_total: IntCounterVec,
    pub task_executions_total: IntCounterVec,
    pub task_duration_seconds: HistogramVec,
    pub task_queue_depth: IntGauge,
    pub storage_operation_failures_total: IntCounterVec,
}

impl ServiceMetrics {
    pub fn new(service: &str) -> Self {
        let registry = Registry::new();

        let documents_created_total = IntCounter::new(
            "documents_created_total",
            "Documents created via document_post",
        )
        .unwrap();
        let documents_deleted_total = IntCounter::new(
            "documents_deleted_total",
            "Documents deleted via document_delete",
        )
        .unwrap();
        let fields_filled_total = IntCounterVec::new(
            prometheus::Opts::new("fields_filled_total", "Field fill operations by field type"),
            &["field_type"],
        )
        .unwrap();
        let webhook_dispatch_total = IntCounterVec::new(
            prometheus::Opts::new("webhook_dispatch_total", "Outbound webhook deliveries by outcome"),
            &["outcome"],
        )
        .unwrap();
        let task_executions_total = IntCounterVec::new(
            prometheus::Opts::new("job_task_executions_total", "Background task executions by kind and outcome"),
            &["kind", "outcome"],
        )
        .unwrap();
        let task_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "job_task_duration_seconds",
                "Background task execution duration by kind",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 180.0]),
            &["kind"],
        )
        .unwrap();
        let task_queue_depth = IntGauge::new(
            "job_task_queue_depth",
            "Rows currently pending in scheduled_tasks",
        )
        .unwrap();
        let storage_operation_failures_total = IntCounterVec::new(
            prometheus::Opts::new(
                "storage_operation_failures_total",
                "Storage gateway operation failures by operation",
            ),
            &["operation"],
        )
        .unwrap();

        let _ = registry.register(Box::new(documents_created_total.clone()));
        let _ = registry.register(Box::new(documents_deleted_total.clone()));
        let _ = registry.register(Box::new(fields_filled_total.clone()));
        let _ = registry.register(Box::new(webhook_dispatch_total.clone()));
        let _ = registry.register(Box::new(task_executions_total.clone()));
        let _ = registry.register(Box::new(task_duration_seconds.clone()));
        let _ = registry.register(Box::new(task_queue_depth.clone()));
        let _ = registry.register(Box::new(storage_operation_failures_total.clone()));

        tracing::info!(service, "metrics registry initialized");

        ServiceMetrics {
            registry,
            documents_created_total,
            documents_deleted_total,
            fields_filled_total,
            webhook_dispatch_total,
            task_executions_total,
            task_duration_seconds,
            task_queue_depth,
            storage_operation_failures_total,
        }
    }

    /// Render the registry in Prometheus text exposition format, the same
    /// way `job-worker`'s `/internal/metrics` handler does today.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).unwrap_or_default();
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_includes_registered_families() {
        let metrics = ServiceMetrics::new("test-svc");
        metrics.documents_created_total.inc();
        let text = metrics.encode();
        assert!(text.contains("documents_created_total"));
    }
}
