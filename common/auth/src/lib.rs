pub mod claims;
pub mod codec;
pub mod config;
pub mod error;
pub mod extractors;
pub mod guards;

pub use claims::Claims;
pub use codec::{JwtCodec, JwtCodecBuilder};
pub use config::JwtConfig;
pub use error::{AuthError, AuthResult};
pub use extractors::AuthContext;
pub use guards::{ensure_document_scope, GuardError};
