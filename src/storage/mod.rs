mod account_store;
mod database;
mod error;
mod traits;
mod transaction_log;

pub use account_store::*;
pub use database::*;
pub use error::*;
pub use traits::*;
pub use transaction_log::*;

/// SQL migration for initial schema
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");
