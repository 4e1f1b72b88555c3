use axum::http::StatusCode;
use uuid::Uuid;

use crate::AuthContext;

#[derive(Debug, Clone)]
pub enum GuardError {
    ScopeMismatch { expected: Uuid, received: Uuid },
}

impl GuardError {
    pub fn into_response(self) -> (StatusCode, String) {
        match self {
            GuardError::ScopeMismatch { expected, received } => (
                StatusCode::UNAUTHORIZED,
                format!(
                    "Token is scoped to document {expected} but {received} was requested",
                ),
            ),
        }
    }
}

impl From<GuardError> for (StatusCode, String) {
    fn from(value: GuardError) -> Self {
        value.into_response()
    }
}

/// Enforces the access-URI scope invariant from the permission check:
/// if the bearer's token names a target document, it must equal the
/// document being acted on. A plain login token (no scope) passes for any
/// document; ownership/signer-accessible checks happen separately at the
/// repository layer.
pub fn ensure_document_scope(auth: &AuthContext, requested: Uuid) -> Result<(), GuardError> {
    match auth.scoped_document() {
        Some(expected) if expected != requested => Err(GuardError::ScopeMismatch {
            expected,
            received: requested,
        }),
        _ => Ok(()),
    }
}
