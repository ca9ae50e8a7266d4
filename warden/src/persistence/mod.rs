//! Production backends: job and workflow rows plus the work queue in
//! PostgreSQL, and the search index over HTTP.

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub mod postgres_queue;
pub mod search;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
#[cfg(feature = "postgres")]
pub use postgres_queue::PostgresWorkQueue;
pub use search::HttpResourceIndex;
