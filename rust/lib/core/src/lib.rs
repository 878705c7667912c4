pub mod caller;
pub mod config;
pub mod error;
pub mod files_to_ignore;

pub use caller::Caller;
pub use config::{FileToIgnoreEntry, ServiceConfig, WebDavConfig};
pub use error::ServiceError;
pub use files_to_ignore::FilesToIgnore;
