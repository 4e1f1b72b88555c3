pub mod error;
pub mod gateway;
pub mod http;
pub mod local;

pub use error::StorageError;
pub use gateway::StorageGateway;
pub use http::HttpObjectGateway;
pub use local::LocalDiskGateway;
