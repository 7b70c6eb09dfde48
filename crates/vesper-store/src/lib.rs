pub mod credentials;
pub mod database;
pub mod error;
pub mod flags;
pub mod schema;

pub use credentials::{CredentialStore, Credentials, MemoryCredentialStore, SqliteCredentialStore};
pub use database::Database;
pub use error::StoreError;
pub use flags::SessionFlags;
