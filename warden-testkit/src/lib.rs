//! In-memory doubles of warden's store, work queue and search index, plus
//! a sample catalog, for tests that drive the scheduler without Postgres.

mod fixtures;
mod index;
mod queue;
mod store;

pub use fixtures::{
    AWS, COST_REPORT, EC2_INSTANCE, Harness, S3_BUCKET, discovery_job,
    sample_catalog,
};
pub use index::InMemoryResourceIndex;
pub use queue::{InMemoryWorkQueue, Published};
pub use store::InMemoryStore;
