//! Image pull exporter
//!
//! Periodically pulls a configured list of container images through Docker or
//! containerd, measures each pull, deletes the image again, and exposes the
//! results as Prometheus metrics.
//!
//! ## Architecture
//!
//! - **Scheduler**: fires pull cycles on a fixed period or a cron schedule
//! - **Orchestrator**: runs at most one cycle at a time over the fleet file
//! - **Backend**: per-image pull, speed sampling, and deletion against a runtime
//! - **Metrics**: Prometheus counters, histogram and gauge keyed by image, label and location
//! - **API**: HTTP endpoints for on-demand cycles and metric scraping

pub mod api;
pub mod backend;
pub mod config;
pub mod metrics;
pub mod orchestrator;
pub mod reference;
pub mod sampler;
pub mod scheduler;

pub use backend::{ImageBackend, PullOutcome, PullPipeline, RuntimeError};
pub use config::{BackendKind, Config, FleetConfig, ImageSpec};
pub use metrics::{PrometheusMetrics, PullMetrics};
pub use orchestrator::{CycleOutcome, Orchestrator};
pub use scheduler::{Scheduler, Trigger};
