//! Job life-cycle: metadata model, frame sharding, on-disk store, the
//! leader-side coordinator and the worker-side runtime.

pub mod coordinator;
pub mod model;
pub mod shard;
pub mod store;
pub mod worker;

pub use coordinator::JobCoordinator;
pub use model::{JobMetadata, JobParams, JobStatus};
pub use store::JobStore;
pub use worker::WorkerRuntime;
