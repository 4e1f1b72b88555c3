use std::env;

use common_auth::JwtConfig;

/// Document-service runtime configuration, following identity-service's
/// env-var-loading idiom.
#[derive(Debug, Clone)]
pub struct DocumentConfig {
    pub database_url: String,
    pub secret_key: Vec<u8>,
    pub jwt_issuer: Option<String>,

    pub storage_backend: StorageBackend,
    pub storage_root: String,
    pub storage_base_url: Option<String>,

    pub max_file_size_bytes: u64,
    pub task_time_limit_secs: u64,

    pub field_locator_url: String,
    pub stamp_service_url: String,
    pub audit_renderer_url: String,
    pub concat_service_url: String,

    pub email_provider_url: Option<String>,
    pub email_api_key: Option<String>,
    pub reminder_target_url: Option<String>,

    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Disk,
    Http,
}

pub fn load_document_config() -> anyhow::Result<DocumentConfig> {
    let database_url = env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let secret_key = read_secret_env("SECRET_KEY")?
        .ok_or_else(|| anyhow::anyhow!("SECRET_KEY must be set"))?
        .into_bytes();
    let jwt_issuer = normalize_optional(env::var("JWT_ISSUER").ok());

    let storage_backend = match env::var("STORAGE_BACKEND").as_deref() {
        Ok("http") => StorageBackend::Http,
        _ => StorageBackend::Disk,
    };
    let storage_root = env::var("STORAGE_ROOT").unwrap_or_else(|_| "./data/blobs".to_string());
    let storage_base_url = normalize_optional(env::var("STORAGE_BASE_URL").ok());

    let max_file_size_bytes = int_from_env("MAX_FILE_SIZE_BYTES", 50 * 1024 * 1024) as u64;
    let task_time_limit_secs = int_from_env("TASK_TIME_LIMIT_SECS", 180) as u64;

    let field_locator_url = env::var("FIELD_LOCATOR_URL")
        .map_err(|_| anyhow::anyhow!("FIELD_LOCATOR_URL must be set"))?;
    let stamp_service_url = env::var("STAMP_SERVICE_URL")
        .map_err(|_| anyhow::anyhow!("STAMP_SERVICE_URL must be set"))?;
    let audit_renderer_url = env::var("AUDIT_RENDERER_URL")
        .map_err(|_| anyhow::anyhow!("AUDIT_RENDERER_URL must be set"))?;
    let concat_service_url = env::var("CONCAT_SERVICE_URL")
        .map_err(|_| anyhow::anyhow!("CONCAT_SERVICE_URL must be set"))?;

    let email_provider_url = normalize_optional(env::var("EMAIL_PROVIDER_URL").ok());
    let email_api_key = normalize_optional(read_secret_env("EMAIL_API_KEY")?);
    let reminder_target_url = normalize_optional(env::var("REMINDER_TARGET_URL").ok());

    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = int_from_env("PORT", 8082) as u16;

    Ok(DocumentConfig {
        database_url,
        secret_key,
        jwt_issuer,
        storage_backend,
        storage_root,
        storage_base_url,
        max_file_size_bytes,
        task_time_limit_secs,
        field_locator_url,
        stamp_service_url,
        audit_renderer_url,
        concat_service_url,
        email_provider_url,
        email_api_key,
        reminder_target_url,
        host,
        port,
    })
}

impl DocumentConfig {
    pub fn jwt_config(&self) -> JwtConfig {
        let mut config = JwtConfig::new();
        if let Some(issuer) = &self.jwt_issuer {
            config = config.with_issuer(issuer.clone());
        }
        config
    }
}

fn int_from_env(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(default)
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn read_secret_env(key: &str) -> anyhow::Result<Option<String>> {
    let file_var = format!("{key}_FILE");
    if let Ok(path) = env::var(&file_var) {
        let contents = std::fs::read_to_string(&path)
            .map_err(|err| anyhow::anyhow!("failed to read {file_var} from {path}: {err}"))?;
        return Ok(Some(contents.trim().to_string()));
    }
    Ok(env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_from_env_falls_back_to_default() {
        std::env::remove_var("DOCUMENT_TEST_INT_MISSING");
        assert_eq!(int_from_env("DOCUMENT_TEST_INT_MISSING", 7), 7);
    }

    #[test]
    fn normalize_optional_treats_blank_as_none() {
        assert_eq!(normalize_optional(Some("   ".to_string())), None);
        assert_eq!(
            normalize_optional(Some(" http://x ".to_string())),
            Some("http://x".to_string())
        );
    }
}
