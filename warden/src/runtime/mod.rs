/// Builder wiring every collaborator into a runtime.
pub mod builder;
/// Fixed-period background tasks.
pub mod periodic;
/// Cooperative cancellation.
pub mod shutdown;
/// Runtime hosting the dispatch, result, workflow and trigger loops.
pub mod supervisor;

pub use builder::WardenRuntimeBuilder;
pub use periodic::spawn_periodic;
pub use shutdown::ShutdownToken;
pub use supervisor::WardenRuntime;
