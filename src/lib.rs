//! # Mailhive
//!
//! Mailhive is a distributed browser fleet that extracts contact data
//! (emails, social profiles, contact pages) from websites. A coordinator
//! routes batches of URLs to workers, each worker runs them across a pool of
//! headless Chrome instances and sends back one result per batch.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mailhive::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // One process runs the coordinator...
//!     tokio::spawn(run_coordinator(CoordinatorConfig::default()));
//!
//!     // ...any number of others run workers pointed at it
//!     let config = WorkerConfig {
//!         worker_id: "worker-1".to_string(),
//!         coordinator_endpoint: "http://127.0.0.1:50051".to_string(),
//!         ..Default::default()
//!     };
//!     run_worker(config).await
//! }
//! ```
//!
//! Then `POST /api/getmails` on the coordinator's HTTP port with
//! `{ "urls": ["https://example.com"] }`.
//!
//! ## Architecture
//!
//! Mailhive consists of:
//! - **Worker**: Owns the browser pool, executes job batches, announces its free capacity
//! - **Coordinator**: Tracks workers, dispatches requests to per-worker mailboxes, correlates results
//! - **Common**: Data model, configuration and error types
//! - **Proto**: gRPC protocol definitions
//!
//! ## Features
//!
//! - `worker` (default): Include worker functionality
//! - `coordinator` (default): Include coordinator functionality
//!
//! Use `default-features = false` to include only what you need.

/// Re-export of common types
pub use mailhive_common as common;

/// Re-export of protocol definitions
pub use mailhive_proto as proto;

/// Re-export of worker functionality
#[cfg(feature = "worker")]
pub use mailhive_worker as worker;

/// Re-export of coordinator functionality
#[cfg(feature = "coordinator")]
pub use mailhive_coordinator as coordinator;

/// Convenient re-exports of commonly used types
pub mod prelude {
    // Data model
    pub use crate::common::{
        HiveError, HiveResult, JobKind, JobPayload, RequestEnvelope, ResponseEnvelope,
        SearchDomain, Website,
    };

    // Configuration types
    pub use crate::common::{
        BrowserConfig, CoordinatorConfig, PoolConfig, QueueConfig, WorkerConfig,
    };

    // Worker functionality
    #[cfg(feature = "worker")]
    pub use crate::worker::{
        run_worker, serve_worker, BrowserAction, BrowserEngine, BrowserPage, BrowserPool,
        ExtractMails, JobOrchestrator, KeywordSearch,
    };

    // Coordinator functionality
    #[cfg(feature = "coordinator")]
    pub use crate::coordinator::{run_coordinator, Coordinator, JobDispatcher, WorkerRegistry};
}
