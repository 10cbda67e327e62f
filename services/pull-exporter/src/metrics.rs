//! Pull metrics.
//!
//! [`PullMetrics`] is the write-only recording interface used by the backends.
//! [`PrometheusMetrics`] backs it with a `prometheus` registry scraped through
//! `/metrics`; [`MetricsLog`] keeps an ordered in-memory log for tests.
//!
//! Instrument names and label orders are a compatibility surface shared with
//! existing dashboards and must not change.

use std::sync::{Mutex, PoisonError};

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use thiserror::Error;

use crate::config::ImageSpec;

/// Buckets of `docker_pull_duration_seconds`.
pub const PULL_DURATION_BUCKETS: [f64; 6] = [1.0, 5.0, 10.0, 30.0, 60.0, 120.0];

const IMAGE_LABELS: [&str; 3] = ["image", "label", "location"];
const FAILURE_LABELS: [&str; 4] = ["image", "reason", "label", "location"];

/// Errors from the metrics registry.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("registry error: {0}")]
    Registry(#[from] prometheus::Error),

    #[error("exposition is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Dimensions shared by every metric emitted for one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLabels {
    pub image: String,
    pub label: String,
    pub location: String,
}

impl ImageLabels {
    pub fn new(spec: &ImageSpec, location: &str) -> Self {
        Self {
            image: spec.image.clone(),
            label: spec.label.clone(),
            location: location.to_string(),
        }
    }

    fn values(&self) -> [&str; 3] {
        [&self.image, &self.label, &self.location]
    }

    fn values_with_reason<'a>(&'a self, reason: &'a str) -> [&'a str; 4] {
        [&self.image, reason, &self.label, &self.location]
    }
}

/// Write-only recorder for pull and deletion outcomes.
///
/// Implementations must be safe to call from any task: speed updates arrive
/// in a tight loop while an external collector is scraping.
pub trait PullMetrics: Send + Sync {
    fn pull_success(&self, labels: &ImageLabels);

    fn pull_failure(&self, labels: &ImageLabels, reason: &str);

    fn pull_duration(&self, labels: &ImageLabels, seconds: f64);

    /// Overwrites the previous value; the gauge is point-in-time.
    fn pull_speed(&self, labels: &ImageLabels, bytes_per_second: f64);

    fn deletion_success(&self, labels: &ImageLabels);

    fn deletion_failure(&self, labels: &ImageLabels, reason: &str);
}

/// Prometheus-backed recorder owning its own registry.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    pull_success: CounterVec,
    pull_failure: CounterVec,
    pull_duration: HistogramVec,
    pull_speed: GaugeVec,
    deletion_success: CounterVec,
    deletion_failure: CounterVec,
}

impl PrometheusMetrics {
    /// Create the instruments and register them in a fresh registry.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let pull_success = CounterVec::new(
            Opts::new("docker_pull_success", "Number of successful Docker image pulls."),
            &IMAGE_LABELS,
        )?;
        let pull_failure = CounterVec::new(
            Opts::new("docker_pull_failure", "Number of failed Docker image pulls."),
            &FAILURE_LABELS,
        )?;
        let pull_duration = HistogramVec::new(
            HistogramOpts::new(
                "docker_pull_duration_seconds",
                "Histogram of Docker image pull durations in seconds.",
            )
            .buckets(PULL_DURATION_BUCKETS.to_vec()),
            &IMAGE_LABELS,
        )?;
        let pull_speed = GaugeVec::new(
            Opts::new(
                "docker_pull_speed_bytes_per_second",
                "Speed of Docker image pull in bytes per second.",
            ),
            &IMAGE_LABELS,
        )?;
        let deletion_success = CounterVec::new(
            Opts::new(
                "docker_image_deletion_success",
                "Number of successful Docker image deletions.",
            ),
            &IMAGE_LABELS,
        )?;
        let deletion_failure = CounterVec::new(
            Opts::new(
                "docker_image_deletion_failure",
                "Number of failed Docker image deletions.",
            ),
            &FAILURE_LABELS,
        )?;

        registry.register(Box::new(pull_success.clone()))?;
        registry.register(Box::new(pull_failure.clone()))?;
        registry.register(Box::new(pull_duration.clone()))?;
        registry.register(Box::new(pull_speed.clone()))?;
        registry.register(Box::new(deletion_success.clone()))?;
        registry.register(Box::new(deletion_failure.clone()))?;

        Ok(Self {
            registry,
            pull_success,
            pull_failure,
            pull_duration,
            pull_speed,
            deletion_success,
            deletion_failure,
        })
    }

    /// Get the Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn export(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Content type of [`PrometheusMetrics::export`].
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

impl PullMetrics for PrometheusMetrics {
    fn pull_success(&self, labels: &ImageLabels) {
        self.pull_success.with_label_values(&labels.values()).inc();
    }

    fn pull_failure(&self, labels: &ImageLabels, reason: &str) {
        self.pull_failure
            .with_label_values(&labels.values_with_reason(reason))
            .inc();
    }

    fn pull_duration(&self, labels: &ImageLabels, seconds: f64) {
        self.pull_duration
            .with_label_values(&labels.values())
            .observe(seconds);
    }

    fn pull_speed(&self, labels: &ImageLabels, bytes_per_second: f64) {
        self.pull_speed
            .with_label_values(&labels.values())
            .set(bytes_per_second);
    }

    fn deletion_success(&self, labels: &ImageLabels) {
        self.deletion_success.with_label_values(&labels.values()).inc();
    }

    fn deletion_failure(&self, labels: &ImageLabels, reason: &str) {
        self.deletion_failure
            .with_label_values(&labels.values_with_reason(reason))
            .inc();
    }
}

/// One recorded metric observation.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    PullSuccess { image: String },
    PullFailure { image: String, reason: String },
    PullDuration { image: String, seconds: f64 },
    PullSpeed { image: String, bytes_per_second: f64 },
    DeletionSuccess { image: String },
    DeletionFailure { image: String, reason: String },
}

impl MetricEvent {
    pub fn image(&self) -> &str {
        match self {
            MetricEvent::PullSuccess { image }
            | MetricEvent::PullFailure { image, .. }
            | MetricEvent::PullDuration { image, .. }
            | MetricEvent::PullSpeed { image, .. }
            | MetricEvent::DeletionSuccess { image }
            | MetricEvent::DeletionFailure { image, .. } => image,
        }
    }

    /// True for pull success/failure counters.
    pub fn is_pull_outcome(&self) -> bool {
        matches!(
            self,
            MetricEvent::PullSuccess { .. } | MetricEvent::PullFailure { .. }
        )
    }

    /// True for deletion success/failure counters.
    pub fn is_deletion_outcome(&self) -> bool {
        matches!(
            self,
            MetricEvent::DeletionSuccess { .. } | MetricEvent::DeletionFailure { .. }
        )
    }
}

/// In-memory recorder that keeps every observation in order.
#[derive(Debug, Default)]
pub struct MetricsLog {
    events: Mutex<Vec<(ImageLabels, MetricEvent)>>,
}

impl MetricsLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far.
    pub fn events(&self) -> Vec<MetricEvent> {
        self.lock().iter().map(|(_, event)| event.clone()).collect()
    }

    /// All events with the labels they were recorded under.
    pub fn labelled_events(&self) -> Vec<(ImageLabels, MetricEvent)> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn push(&self, labels: &ImageLabels, event: MetricEvent) {
        self.lock().push((labels.clone(), event));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ImageLabels, MetricEvent)>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PullMetrics for MetricsLog {
    fn pull_success(&self, labels: &ImageLabels) {
        let image = labels.image.clone();
        self.push(labels, MetricEvent::PullSuccess { image });
    }

    fn pull_failure(&self, labels: &ImageLabels, reason: &str) {
        let image = labels.image.clone();
        let reason = reason.to_string();
        self.push(labels, MetricEvent::PullFailure { image, reason });
    }

    fn pull_duration(&self, labels: &ImageLabels, seconds: f64) {
        let image = labels.image.clone();
        self.push(labels, MetricEvent::PullDuration { image, seconds });
    }

    fn pull_speed(&self, labels: &ImageLabels, bytes_per_second: f64) {
        let image = labels.image.clone();
        self.push(
            labels,
            MetricEvent::PullSpeed {
                image,
                bytes_per_second,
            },
        );
    }

    fn deletion_success(&self, labels: &ImageLabels) {
        let image = labels.image.clone();
        self.push(labels, MetricEvent::DeletionSuccess { image });
    }

    fn deletion_failure(&self, labels: &ImageLabels, reason: &str) {
        let image = labels.image.clone();
        let reason = reason.to_string();
        self.push(labels, MetricEvent::DeletionFailure { image, reason });
    }
}
