//! Container runtime backends.
//!
//! Every backend runs the same per-image pipeline:
//!
//! ```text
//! connect ──► pull (stream of chunks) ──► sample speed ──► delete
//!    │              │                          │              │
//!    └── failure ───┴──────── metrics ─────────┴──────────────┘
//! ```
//!
//! The pipeline lives in [`PullPipeline`]; runtimes only provide a
//! [`RuntimeDriver`] that hands out short-lived [`RuntimeSession`]s.
//!
//! - `docker`: Docker Engine API over its Unix socket
//! - `containerd`: containerd gRPC API (transfer + content + images services)
//! - `mock`: scripted driver for tests

pub mod containerd;
pub mod docker;
pub mod mock;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BackendKind, Config, ImageSpec};
use crate::metrics::{ImageLabels, PullMetrics};
use crate::sampler::ThroughputSampler;

pub use containerd::ContainerdDriver;
pub use docker::DockerDriver;
pub use mock::{MockCall, MockDriver, MockPull};

/// Errors from a container runtime.
///
/// `Display` is the underlying message; it becomes the metric `reason`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime could not be reached.
    #[error("{0}")]
    Unavailable(String),

    /// The runtime rejected a request.
    #[error("{0}")]
    Api(String),

    /// A pull stream broke after it started.
    #[error("{0}")]
    Stream(String),

    /// The image does not exist in the runtime.
    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Http(#[from] hyper::Error),
}

impl RuntimeError {
    /// Whether the error means the image is already absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

impl From<tonic::Status> for RuntimeError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            tonic::Code::NotFound => RuntimeError::NotFound(message),
            tonic::Code::Unavailable => RuntimeError::Unavailable(message),
            _ => RuntimeError::Api(message),
        }
    }
}

/// Byte counts of the chunks received by a running pull.
///
/// The stream ending without an error is the success signal.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<u64, RuntimeError>> + Send>>;

/// Hands out runtime sessions.
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Short runtime name for logs.
    fn name(&self) -> &'static str;

    /// Acquire a fresh client handle. Released when the session is dropped.
    async fn connect(&self) -> Result<Box<dyn RuntimeSession>, RuntimeError>;
}

/// One client handle, used for exactly one image.
#[async_trait]
pub trait RuntimeSession: Send {
    /// Start pulling `image`; resolution failures are returned here.
    async fn pull(&mut self, image: &str) -> Result<ChunkStream, RuntimeError>;

    /// Delete `image` from the runtime.
    async fn remove(&mut self, image: &str) -> Result<(), RuntimeError>;
}

/// Whether a pull succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStatus {
    Succeeded,
    Failed,
}

/// Transient result of one pull attempt.
#[derive(Debug, Clone)]
pub struct PullOutcome {
    pub status: PullStatus,

    /// Wall-clock time from connect to end of stream (or failure).
    pub elapsed: Duration,

    /// Total bytes received from the pull stream.
    pub bytes: u64,

    /// Most recent speed estimate in bytes per second.
    pub last_speed: Option<f64>,

    /// Failure message, `None` on success.
    pub reason: Option<String>,
}

impl PullOutcome {
    pub fn is_success(&self) -> bool {
        self.status == PullStatus::Succeeded
    }
}

/// Pulls one image, measures it, and deletes it again.
///
/// Implementations never return errors: every failure ends in a metric and a
/// log line.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn pull_and_delete(&self, spec: &ImageSpec, location: &str) -> PullOutcome;
}

/// The common pull-measure-delete algorithm over a runtime driver.
pub struct PullPipeline<D> {
    driver: D,
    metrics: Arc<dyn PullMetrics>,
}

impl<D: RuntimeDriver> PullPipeline<D> {
    pub fn new(driver: D, metrics: Arc<dyn PullMetrics>) -> Self {
        Self { driver, metrics }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn pull_failed(
        &self,
        labels: &ImageLabels,
        started: Instant,
        bytes: u64,
        last_speed: Option<f64>,
        error: &RuntimeError,
    ) -> PullOutcome {
        let reason = error.to_string();
        self.metrics.pull_failure(labels, &reason);
        warn!(
            runtime = self.driver.name(),
            image = %labels.image,
            label = %labels.label,
            location = %labels.location,
            reason = %reason,
            "Image pull failed"
        );
        PullOutcome {
            status: PullStatus::Failed,
            elapsed: started.elapsed(),
            bytes,
            last_speed,
            reason: Some(reason),
        }
    }

    async fn delete(&self, session: &mut dyn RuntimeSession, labels: &ImageLabels) {
        match session.remove(&labels.image).await {
            Ok(()) => {
                self.metrics.deletion_success(labels);
                info!(image = %labels.image, "Deleted image");
            }
            Err(e) if e.is_not_found() => {
                self.metrics.deletion_success(labels);
                debug!(image = %labels.image, error = %e, "Image already absent");
            }
            Err(e) => {
                let reason = e.to_string();
                self.metrics.deletion_failure(labels, &reason);
                warn!(
                    runtime = self.driver.name(),
                    image = %labels.image,
                    reason = %reason,
                    "Image deletion failed"
                );
            }
        }
    }
}

#[async_trait]
impl<D: RuntimeDriver> ImageBackend for PullPipeline<D> {
    async fn pull_and_delete(&self, spec: &ImageSpec, location: &str) -> PullOutcome {
        let labels = ImageLabels::new(spec, location);
        let started = Instant::now();

        let mut session = match self.driver.connect().await {
            Ok(session) => session,
            Err(e) => return self.pull_failed(&labels, started, 0, None, &e),
        };

        let mut chunks = match session.pull(&spec.image).await {
            Ok(chunks) => chunks,
            Err(e) => return self.pull_failed(&labels, started, 0, None, &e),
        };

        let mut sampler = ThroughputSampler::new();
        let mut bytes = 0u64;
        let mut last_speed = None;

        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(size) => {
                    bytes += size;
                    if let Some(speed) = sampler.sample(Instant::now(), size) {
                        self.metrics.pull_speed(&labels, speed);
                        last_speed = Some(speed);
                    }
                }
                Err(e) => {
                    drop(chunks);
                    let outcome = self.pull_failed(&labels, started, bytes, last_speed, &e);
                    // Partial content may have landed; clean it up.
                    self.delete(session.as_mut(), &labels).await;
                    return outcome;
                }
            }
        }
        drop(chunks);

        let elapsed = started.elapsed();
        self.metrics.pull_duration(&labels, elapsed.as_secs_f64());
        self.metrics.pull_success(&labels);
        info!(
            runtime = self.driver.name(),
            image = %labels.image,
            label = %labels.label,
            location = %labels.location,
            elapsed_secs = elapsed.as_secs_f64(),
            bytes,
            "Pulled image"
        );

        self.delete(session.as_mut(), &labels).await;

        PullOutcome {
            status: PullStatus::Succeeded,
            elapsed,
            bytes,
            last_speed,
            reason: None,
        }
    }
}

/// Build the backend selected in the fleet file.
pub fn build(
    kind: BackendKind,
    config: &Config,
    metrics: Arc<dyn PullMetrics>,
) -> Arc<dyn ImageBackend> {
    match kind {
        BackendKind::Docker => Arc::new(PullPipeline::new(
            DockerDriver::new(&config.docker_socket),
            metrics,
        )),
        BackendKind::Containerd => Arc::new(PullPipeline::new(
            ContainerdDriver::new(
                &config.containerd_socket,
                &config.containerd_namespace,
                config.progress_interval,
            ),
            metrics,
        )),
    }
}
