pub mod db;
pub mod entities;
pub mod error;
pub mod pool;
pub mod usage;

pub use db::connect_shared;
pub use error::{StorageError, StorageResult};
pub use pool::{CredentialStatus, KeyPool, SelectedCredential};
pub use usage::{QuotaDenyReason, UsageContext, UsageTracker};
