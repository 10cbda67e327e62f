//! Instantaneous throughput estimation from stream reads.

use tokio::time::Instant;

/// Two-sample throughput estimator.
///
/// Each estimate covers the current chunk plus the previous one over the time
/// since the previous chunk arrived. It is not a moving average; single
/// readings are noisy but react immediately.
#[derive(Debug, Default)]
pub struct ThroughputSampler {
    previous: Option<(Instant, u64)>,
}

impl ThroughputSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns bytes per second when an estimate is possible.
    ///
    /// The first chunk and chunks arriving with no elapsed time yield `None`.
    /// The previous sample is replaced either way.
    pub fn sample(&mut self, now: Instant, chunk_size: u64) -> Option<f64> {
        let speed = self.previous.and_then(|(previous_at, previous_size)| {
            let elapsed = now.saturating_duration_since(previous_at).as_secs_f64();
            (elapsed > 0.0).then(|| (chunk_size + previous_size) as f64 / elapsed)
        });
        self.previous = Some((now, chunk_size));
        speed
    }
}
