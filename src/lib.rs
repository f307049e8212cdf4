pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod storage;
pub mod telemetry;

pub use application::{LedgerError, LedgerService, QueryService};
pub use domain::*;
pub use storage::Database;
