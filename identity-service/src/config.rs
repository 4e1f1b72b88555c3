use std::env;

use common_auth::JwtConfig;

/// Identity-service runtime configuration, loaded once at startup.
///
/// Small parsing helpers plus a `load_*` constructor with sensible
/// defaults, trimmed to what a single-secret JWT issuer and a
/// Postgres-backed user store actually need.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    pub database_url: String,
    pub secret_key: Vec<u8>,
    pub jwt_issuer: Option<String>,
    pub login_ttl_seconds: i64,
    pub access_ttl_seconds: i64,
    pub host: String,
    pub port: u16,
}

pub fn load_identity_config() -> anyhow::Result<IdentityConfig> {
    let database_url = env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let secret_key = read_secret_env("SECRET_KEY")?
        .ok_or_else(|| anyhow::anyhow!("SECRET_KEY must be set"))?
        .into_bytes();
    let jwt_issuer = normalize_optional(env::var("JWT_ISSUER").ok());
    let login_ttl_seconds = int_from_env("LOGIN_TOKEN_TTL_SECONDS", 12 * 3600);
    let access_ttl_seconds = int_from_env("ACCESS_TOKEN_TTL_SECONDS", 3600);
    let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = int_from_env("PORT", 8081) as u16;

    Ok(IdentityConfig {
        database_url,
        secret_key,
        jwt_issuer,
        login_ttl_seconds,
        access_ttl_seconds,
        host,
        port,
    })
}

impl IdentityConfig {
    pub fn jwt_config(&self) -> JwtConfig {
        let mut config = JwtConfig::new()
            .with_login_ttl(self.login_ttl_seconds)
            .with_access_ttl(self.access_ttl_seconds);
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

/// Secret-bearing vars support a `_FILE` suffix convention for
/// container-secret mounts.
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
        std::env::remove_var("IDENTITY_TEST_INT_MISSING");
        assert_eq!(int_from_env("IDENTITY_TEST_INT_MISSING", 42), 42);
    }

    #[test]
    fn normalize_optional_treats_blank_as_none() {
        assert_eq!(normalize_optional(Some("  ".to_string())), None);
        assert_eq!(
            normalize_optional(Some(" issuer ".to_string())),
            Some("issuer".to_string())
        );
    }
}
