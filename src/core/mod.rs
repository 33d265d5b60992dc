//! Dispatch core: work queues, their engines and the keyed registry.
//!
//! A [`WorkQueue`] drains one FIFO with one engine task. A
//! [`KeyedQueueRegistry`] creates a reclaiming queue per key on demand and
//! recycles the idle ones.

pub mod engine;
pub mod registry;
pub mod signal;
pub mod worker;

pub use engine::{WorkQueue, WorkQueueBuilder, WorkQueueStats};
pub use registry::{KeyedQueueRegistry, RegistryMetrics};
pub use signal::WakeSignal;
pub use worker::{
    DispatchFailure, FailureKind, FailureSink, FnAction, SharedAction, WorkAction, action_fn,
};
