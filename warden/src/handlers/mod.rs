//! Per-category [`Dispatchable`](crate::dispatch::Dispatchable)
//! implementations.

pub mod audit;
pub mod compliance;
pub mod discovery;
pub mod query;

pub use audit::AuditHandler;
pub use compliance::{RunnerHandler, SummarizerHandler};
pub use discovery::{DiscoveryHandler, DiscoveryPayload};
pub use query::{QueryRunHandler, QueryValidateHandler};
