// Application layer: the ledger engine and read-side queries.
// Transports (HTTP, gRPC, the CLI) call into `LedgerService` and map
// `LedgerError` to their own status codes.

pub mod error;
pub mod locks;
pub mod query;
pub mod service;

pub use error::*;
pub use locks::*;
pub use query::*;
pub use service::*;
