use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::claims::{Claims, ClaimsRepr};
use crate::config::JwtConfig;
use crate::error::{AuthError, AuthResult};

/// Signs and verifies the symmetric, single-secret tokens this system uses:
/// a plain login token carries only the user id as subject, an access-URI
/// exchange additionally scopes the token to one document. A single shared
/// secret is enough here; there's no separately-hosted auth provider that
/// would need RS256/JWKS machinery.
#[derive(Clone)]
pub struct JwtCodec {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtCodec {
    pub fn new(secret: &[u8], config: JwtConfig) -> Self {
        Self {
            config,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    pub fn builder(secret: impl Into<Vec<u8>>) -> JwtCodecBuilder {
        JwtCodecBuilder::new(secret.into())
    }

    pub fn config(&self) -> &JwtConfig {
        &self.config
    }

    /// Mint a token carrying only `subject`, e.g. after password login.
    pub fn issue_login_token(&self, subject: Uuid) -> AuthResult<String> {
        self.issue(subject, None, self.config.login_ttl_seconds)
    }

    /// Mint a token scoped to exactly one document, e.g. after an
    /// access-URI exchange.
    pub fn issue_access_token(&self, subject: Uuid, document_id: Uuid) -> AuthResult<String> {
        self.issue(subject, Some(document_id), self.config.access_ttl_seconds)
    }

    fn issue(&self, subject: Uuid, doc: Option<Uuid>, ttl_seconds: i64) -> AuthResult<String> {
        let now = Utc::now();
        let repr = ClaimsRepr {
            sub: subject.to_string(),
            doc: doc.map(|id| id.to_string()),
            exp: (now + chrono::Duration::seconds(ttl_seconds)).timestamp(),
            iat: Some(now.timestamp()),
            iss: self.config.issuer.clone(),
        };
        encode(&Header::new(Algorithm::HS256), &repr, &self.encoding_key)
            .map_err(|err| AuthError::Verification(err.to_string()))
    }

    pub fn verify(&self, token: &str) -> AuthResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = self.config.leeway_seconds.into();
        validation.set_required_spec_claims(&["sub", "exp"]);
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer.clone()]);
        }

        let token_data = decode::<ClaimsRepr>(token, &self.decoding_key, &validation)?;
        Claims::try_from(token_data.claims)
    }
}

pub struct JwtCodecBuilder {
    secret: Vec<u8>,
    config: JwtConfig,
}

impl JwtCodecBuilder {
    fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            config: JwtConfig::new(),
        }
    }

    pub fn with_config(mut self, config: JwtConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.config = self.config.with_issuer(issuer);
        self
    }

    pub fn build(self) -> JwtCodec {
        JwtCodec::new(&self.secret, self.config)
    }
}
