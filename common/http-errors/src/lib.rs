use axum::{extract::Request, http::{StatusCode, HeaderValue}, middleware::Next, response::{IntoResponse, Response}, Json};
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use serde::Serialize;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")] pub missing_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub trace_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")] pub message: Option<String>,
}

#[derive(Debug)]
pub enum ApiError {
    ForbiddenMissingRole { role: &'static str, trace_id: Option<Uuid> },
    Forbidden { trace_id: Option<Uuid> },
    /// Auth failure: bad credentials, expired/invalid token, revoked access-URI.
    Unauthorized { code: &'static str, trace_id: Option<Uuid> },
    BadRequest { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    NotFound { code: &'static str, trace_id: Option<Uuid> },
    /// Content-type check failed on upload or fill.
    UnsupportedMedia { code: &'static str, trace_id: Option<Uuid> },
    /// Upload exceeded `MAX_FILE_SIZE_BYTES`.
    PayloadTooLarge { trace_id: Option<Uuid> },
    /// `Accept` header named no format the endpoint can produce.
    NotAcceptable { valid: &'static [&'static str], trace_id: Option<Uuid> },
    Internal { trace_id: Option<Uuid>, message: Option<String> },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E, trace_id: Option<Uuid>) -> Self { Self::Internal { trace_id, message: Some(e.to_string()) } }
    pub fn bad_request(code: &'static str, trace_id: Option<Uuid>) -> Self { Self::BadRequest { code, trace_id, message: None } }
    pub fn unauthorized(code: &'static str, trace_id: Option<Uuid>) -> Self { Self::Unauthorized { code, trace_id } }
    /// 400 conflict case (e.g. resurrecting a user that was never given a password).
    pub fn conflict(code: &'static str, trace_id: Option<Uuid>) -> Self { Self::BadRequest { code, trace_id, message: None } }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body, error_code) = match self {
            ApiError::ForbiddenMissingRole { role, trace_id } => (
                StatusCode::FORBIDDEN,
                ErrorBody { code: "missing_role".into(), missing_role: Some(role.into()), trace_id, message: None },
                "missing_role"
            ),
            ApiError::Forbidden { trace_id } => (
                StatusCode::FORBIDDEN,
                ErrorBody { code: "forbidden".into(), missing_role: None, trace_id, message: None },
                "forbidden"
            ),
            ApiError::Unauthorized { code, trace_id } => (
                StatusCode::UNAUTHORIZED,
                ErrorBody { code: code.into(), missing_role: None, trace_id, message: None },
                code
            ),
            ApiError::BadRequest { code, trace_id, message } => (
                StatusCode::BAD_REQUEST,
                ErrorBody { code: code.into(), missing_role: None, trace_id, message },
                code
            ),
            ApiError::NotFound { code, trace_id } => (
                StatusCode::NOT_FOUND,
                ErrorBody { code: code.into(), missing_role: None, trace_id, message: None },
                code
            ),
            ApiError::UnsupportedMedia { code, trace_id } => (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                ErrorBody { code: code.into(), missing_role: None, trace_id, message: None },
                code
            ),
            ApiError::PayloadTooLarge { trace_id } => (
                StatusCode::PAYLOAD_TOO_LARGE,
                ErrorBody { code: "payload_too_large".into(), missing_role: None, trace_id, message: None },
                "payload_too_large"
            ),
            ApiError::NotAcceptable { valid, trace_id } => (
                StatusCode::NOT_ACCEPTABLE,
                ErrorBody { code: "not_acceptable".into(), missing_role: None, trace_id, message: Some(valid.join(", ")) },
                "not_acceptable"
            ),
            ApiError::Internal { trace_id, message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorBody { code: "internal_error".into(), missing_role: None, trace_id, message },
                "internal_error"
            ),
        };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(error_code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

const MAX_ERROR_CODES: usize = 40;

static ERROR_CODE_SEEN: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

static ERROR_CODE_OVERFLOW: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "http_error_code_cardinality_overflow_total",
        "error codes dropped after the per-process label cap was reached",
        &["service"]
    )
    .expect("register http_error_code_cardinality_overflow_total")
});

static ERROR_CODE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "http_errors_total",
        "HTTP error responses by error code",
        &["service", "code"]
    )
    .expect("register http_errors_total")
});

fn record_error_code(service: &str, code: &str) {
    let mut seen = ERROR_CODE_SEEN.lock().expect("error code set poisoned");
    if !seen.contains(code) {
        if seen.len() >= MAX_ERROR_CODES {
            ERROR_CODE_OVERFLOW.with_label_values(&[service]).inc();
            return;
        }
        seen.insert(code.to_string());
    }
    drop(seen);
    ERROR_CODE_TOTAL.with_label_values(&[service, code]).inc();
}

/// Axum middleware that tags `http_errors_total` with the `X-Error-Code`
/// header left by [`ApiError::into_response`], capping distinct code labels
/// per process so a buggy handler minting unique codes per request can't
/// blow up Prometheus cardinality.
pub fn http_error_metrics_layer(
    service: &'static str,
) -> impl Fn(Request, Next) -> Pin<Box<dyn std::future::Future<Output = Response> + Send>> + Clone {
    move |req: Request, next: Next| {
        Box::pin(async move {
            let resp = next.run(req).await;
            if let Some(code) = resp.headers().get("X-Error-Code").and_then(|v| v.to_str().ok()) {
                record_error_code(service, code);
            }
            resp
        })
    }
}

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use super::*;

    pub fn simulate_error_code(code: &str) {
        record_error_code("test-svc", code);
    }

    pub fn distinct_gauge() -> i64 {
        ERROR_CODE_SEEN.lock().expect("error code set poisoned").len() as i64
    }

    pub fn overflow_count() -> i64 {
        ERROR_CODE_OVERFLOW.with_label_values(&["test-svc"]).get()
    }
}
