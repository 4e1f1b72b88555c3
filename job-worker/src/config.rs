use std::env;

/// Settings specific to the worker process itself. Everything describing
/// the document domain (storage, external services, secrets) comes from
/// `document_service::config::load_document_config`, which this binary
/// reuses wholesale rather than duplicating.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub poll_interval_ms: u64,
    pub ghostscript_bin: String,
    pub host: String,
    pub port: u16,
}

pub fn load_worker_config() -> WorkerConfig {
    let worker_id = env::var("WORKER_ID").unwrap_or_else(|_| format!("job-worker-{}", std::process::id()));
    let poll_interval_ms = env::var("POLL_INTERVAL_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);
    let ghostscript_bin = env::var("GHOSTSCRIPT_BIN").unwrap_or_else(|_| "gs".to_string());
    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8083);

    WorkerConfig { worker_id, poll_interval_ms, ghostscript_bin, host, port }
}
