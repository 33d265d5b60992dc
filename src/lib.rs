//! # anvilq
//!
//! Keyed asynchronous work queues for Rust applications.
//!
//! ## Features
//!
//! - **Per-key FIFO**: Items for one key are dispatched in enqueue order
//! - **Bounded Dispatch**: Inline, pooled or dedicated-thread dispatch under a per-queue ceiling
//! - **Reclaim**: Idle engines stop themselves and restart on the next item
//! - **Pause/Resume**: Per queue or across a whole registry
//! - **Recycling**: Idle per-key queues are dropped on a configurable cadence
//! - **Observability**: Queue stats, registry metrics and a failure channel
//!
//! ## Quick Start
//!
//! ```rust
//! use anvilq::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> AnvilResult<()> {
//!     let registry = KeyedQueueRegistry::new(
//!         "mailer",
//!         action_fn(|to: String| async move {
//!             tracing::info!("sending mail to {}", to);
//!             Ok(())
//!         }),
//!     )?;
//!
//!     // Mail for the same tenant goes out in order.
//!     registry.enqueue("tenant-a".to_string(), "alice@example.com".to_string()).await?;
//!     registry.enqueue("tenant-b".to_string(), "bob@example.com".to_string()).await?;
//!
//!     registry.dispose().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::core::{
        DispatchFailure, FailureKind, FailureSink, KeyedQueueRegistry, RegistryMetrics,
        SharedAction, WorkAction, WorkQueue, WorkQueueStats, action_fn,
    };
    pub use crate::error::{AnvilError, AnvilResult};
    pub use async_trait::async_trait;

    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub use crate::metrics::AnvilMetrics;
}

pub use crate::config::*;
pub use crate::core::{
    DispatchFailure, FailureKind, FailureSink, KeyedQueueRegistry, RegistryMetrics, SharedAction,
    WorkAction, WorkQueue, WorkQueueStats, action_fn,
};
pub use crate::error::{AnvilError, AnvilResult};
pub use async_trait::async_trait;
