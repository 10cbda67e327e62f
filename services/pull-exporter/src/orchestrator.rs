//! Pull cycle orchestration.
//!
//! A cycle pulls every configured image once, in order, through the selected
//! backend. At most one cycle runs at a time: a trigger arriving while a cycle
//! is in flight is skipped, not queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::backend::ImageBackend;
use crate::config::FleetConfig;

/// What happened to a cycle trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was in flight; nothing was done.
    Skipped,

    /// Every configured image was attempted.
    Completed { succeeded: usize, failed: usize },
}

/// Runs pull cycles over the fleet with a single-flight guard.
pub struct Orchestrator {
    fleet: Arc<FleetConfig>,
    backend: Arc<dyn ImageBackend>,
    in_flight: AtomicBool,
}

impl Orchestrator {
    pub fn new(fleet: Arc<FleetConfig>, backend: Arc<dyn ImageBackend>) -> Self {
        Self {
            fleet,
            backend,
            in_flight: AtomicBool::new(false),
        }
    }

    /// The fleet this orchestrator pulls.
    pub fn fleet(&self) -> &FleetConfig {
        &self.fleet
    }

    /// Whether a cycle is currently running.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one cycle, or skip it if one is already running.
    ///
    /// Per-image failures are recorded as metrics by the backend and never
    /// stop the cycle.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Some(_guard) = CycleGuard::acquire(&self.in_flight) else {
            debug!("Pull cycle already in flight, skipping");
            return CycleOutcome::Skipped;
        };

        let images = &self.fleet.image_downloads;
        let location = &self.fleet.location;
        let started = Instant::now();
        info!(
            location = %location,
            image_count = images.len(),
            "Starting pull cycle"
        );

        let mut succeeded = 0;
        let mut failed = 0;
        for spec in images {
            let outcome = self.backend.pull_and_delete(spec, location).await;
            if outcome.is_success() {
                succeeded += 1;
            } else {
                failed += 1;
            }
        }

        info!(
            location = %location,
            succeeded,
            failed,
            duration_ms = started.elapsed().as_millis() as u64,
            "Pull cycle completed"
        );

        CycleOutcome::Completed { succeeded, failed }
    }
}

/// Holds the in-flight flag; releasing happens on drop so a panicking
/// backend cannot wedge the orchestrator.
struct CycleGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
