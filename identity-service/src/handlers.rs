use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use common_http_errors::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app::AppState;
use crate::repo;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

/// `POST /auth`. A user with a password hash must match it; a
/// password-less (invited) user is let in by any login carrying an empty
/// password.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let user = repo::find_user_by_username(&state.db, &req.username)
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .ok_or_else(|| ApiError::unauthorized("invalid_credentials", None))?;

    if user.deleted {
        return Err(ApiError::unauthorized("invalid_credentials", None));
    }

    let password = req.password.unwrap_or_default();
    match &user.password_hash {
        Some(hash) => {
            let ok = common_crypto::verify_password(&password, hash)
                .map_err(|e| ApiError::internal(e, None))?;
            if !ok {
                return Err(ApiError::unauthorized("invalid_credentials", None));
            }
        }
        None => {
            if !password.is_empty() {
                return Err(ApiError::unauthorized("invalid_credentials", None));
            }
        }
    }

    let token = state
        .jwt_codec
        .issue_login_token(user.id)
        .map_err(|e| ApiError::internal(e, None))?;
    tracing::info!(user_id = %user.id, "login succeeded");
    Ok(Json(TokenResponse { token }))
}

/// `POST /auth/access-id`: exchanges an access-URI string carried in
/// the `accessId` header for a JWT scoped to the one document it grants.
pub async fn access_id_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<TokenResponse>> {
    let access_id = headers
        .get("accessId")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing_access_id", None))?;

    let row = repo::find_access_uri(&state.db, access_id)
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .ok_or_else(|| ApiError::unauthorized("invalid_access_id", None))?;

    if row.revoked {
        return Err(ApiError::unauthorized("invalid_access_id", None));
    }

    let token = state
        .jwt_codec
        .issue_access_token(row.user_id, row.document_id)
        .map_err(|e| ApiError::internal(e, None))?;
    Ok(Json(TokenResponse { token }))
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub username: String,
    pub password: String,
    pub business: Uuid,
}

/// `POST /account/create`. Validates email format and creates
/// the backing Business row if it doesn't already exist: a Business is
/// provisioned lazily on first account creation.
pub async fn create_account(
    State(state): State<AppState>,
    Json(req): Json<CreateAccountRequest>,
) -> ApiResult<(StatusCode, Json<TokenResponse>)> {
    if !is_valid_email(&req.username) {
        return Err(ApiError::bad_request("invalid_email", None));
    }

    if repo::find_user_by_username(&state.db, &req.username)
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .is_some()
    {
        return Err(ApiError::conflict("username_taken", None));
    }

    if !repo::find_business(&state.db, req.business)
        .await
        .map_err(|e| ApiError::internal(e, None))?
    {
        repo::create_business(&state.db, req.business, &req.username)
            .await
            .map_err(|e| ApiError::internal(e, None))?;
    }

    let password_hash =
        common_crypto::hash_password(&req.password).map_err(|e| ApiError::internal(e, None))?;
    let user_id = Uuid::new_v4();
    repo::create_user(
        &state.db,
        user_id,
        &req.username,
        Some(&password_hash),
        req.business,
    )
    .await
    .map_err(|e| ApiError::internal(e, None))?;

    let token = state
        .jwt_codec
        .issue_login_token(user_id)
        .map_err(|e| ApiError::internal(e, None))?;
    Ok((StatusCode::OK, Json(TokenResponse { token })))
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub new_password: String,
}

/// `POST /account/change-password` (JWT) → 204. Requires an active
/// (non-deleted) account.
pub async fn change_password(
    State(state): State<AppState>,
    auth: common_auth::AuthContext,
    Json(req): Json<ChangePasswordRequest>,
) -> ApiResult<StatusCode> {
    let user = repo::find_user_by_id(&state.db, auth.subject())
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .ok_or_else(|| ApiError::unauthorized("invalid_credentials", None))?;

    if user.deleted {
        return Err(ApiError::conflict("account_inactive", None));
    }

    let hash =
        common_crypto::hash_password(&req.new_password).map_err(|e| ApiError::internal(e, None))?;
    repo::set_password_hash(&state.db, user.id, &hash)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /account/delete` (JWT) → 202. Soft-deletes and bulk-revokes the
/// caller's AccessURIs in one transaction.
pub async fn delete_account(
    State(state): State<AppState>,
    auth: common_auth::AuthContext,
) -> ApiResult<StatusCode> {
    repo::soft_delete_user(&state.db, auth.subject())
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct ResurrectRequest {
    pub username: String,
    pub password: String,
}

/// `POST /account/resurrect` → 204 | 401/404. Forbidden if the account was
/// never given a password (password-less users have nothing to resurrect
/// with).
pub async fn resurrect_account(
    State(state): State<AppState>,
    Json(req): Json<ResurrectRequest>,
) -> ApiResult<StatusCode> {
    let user = repo::find_user_by_username(&state.db, &req.username)
        .await
        .map_err(|e| ApiError::internal(e, None))?
        .ok_or_else(|| ApiError::bad_request("not_found", None))?;

    let hash = user
        .password_hash
        .as_deref()
        .ok_or_else(|| ApiError::unauthorized("no_password_set", None))?;

    let ok = common_crypto::verify_password(&req.password, hash)
        .map_err(|e| ApiError::internal(e, None))?;
    if !ok {
        return Err(ApiError::unauthorized("invalid_credentials", None));
    }

    repo::resurrect_user(&state.db, user.id)
        .await
        .map_err(|e| ApiError::internal(e, None))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Permission check used by every document endpoint: caller is
/// permitted on document `D` iff they own it, or `signer_accessible` is set
/// and they have a Field on `D`. The `has_field_on_document` predicate is
/// supplied by the caller (document-service owns the Field table); this
/// function only encodes the boolean rule so both services agree on it.
pub fn is_permitted(
    owner_id: Uuid,
    caller_id: Uuid,
    signer_accessible: bool,
    has_field_on_document: bool,
) -> bool {
    owner_id == caller_id || (signer_accessible && has_field_on_document)
}

fn is_valid_email(candidate: &str) -> bool {
    let Some((local, domain)) = candidate.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !candidate.contains(' ')
        && candidate.matches('@').count() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_validation_rejects_obvious_garbage() {
        assert!(is_valid_email("a@x.com"));
        assert!(!is_valid_email("not-an-email"));
        assert!(!is_valid_email("a@"));
        assert!(!is_valid_email("@x.com"));
        assert!(!is_valid_email("a@x"));
        assert!(!is_valid_email("a b@x.com"));
        assert!(!is_valid_email("a@@x.com"));
    }

    #[test]
    fn permission_check_matches_ownership_or_signer_access() {
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        assert!(is_permitted(owner, owner, false, false));
        assert!(!is_permitted(owner, other, false, true));
        assert!(is_permitted(owner, other, true, true));
        assert!(!is_permitted(owner, other, true, false));
    }
}
