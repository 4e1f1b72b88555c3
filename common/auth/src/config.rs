/// Runtime configuration for the HS256 token codec.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Expected issuer claim (iss), set on tokens this process mints and
    /// checked (if present) on tokens it verifies.
    pub issuer: Option<String>,
    /// Allowable clock skew in seconds when validating `exp`.
    pub leeway_seconds: u32,
    /// Default lifetime of a login token.
    pub login_ttl_seconds: i64,
    /// Default lifetime of a scoped access-URI-exchange token.
    pub access_ttl_seconds: i64,
}

impl JwtConfig {
    /// Construct config with sensible defaults (30 second leeway, 12h login
    /// tokens, 1h access-URI tokens).
    pub fn new() -> Self {
        Self {
            issuer: None,
            leeway_seconds: 30,
            login_ttl_seconds: 12 * 3600,
            access_ttl_seconds: 3600,
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_leeway(mut self, seconds: u32) -> Self {
        self.leeway_seconds = seconds;
        self
    }

    pub fn with_login_ttl(mut self, seconds: i64) -> Self {
        self.login_ttl_seconds = seconds;
        self
    }

    pub fn with_access_ttl(mut self, seconds: i64) -> Self {
        self.access_ttl_seconds = seconds;
        self
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self::new()
    }
}
