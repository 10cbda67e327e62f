//! Periodic cycle trigger.
//!
//! Fires on a fixed period (`minute_time_to_pull`) or on a cron schedule.
//! Each firing spawns a cycle on its own task, so a slow cycle never delays
//! the timer; overlapping firings are absorbed by the orchestrator's guard.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::FleetConfig;
use crate::orchestrator::{CycleOutcome, Orchestrator};

/// When cycles fire.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Every `period`, first firing one period after start.
    Every(Duration),

    /// On each upcoming time of a cron schedule (UTC).
    Cron {
        expression: String,
        schedule: Box<cron::Schedule>,
    },
}

impl Trigger {
    /// Derive the trigger from the fleet file.
    pub fn from_fleet(fleet: &FleetConfig) -> Result<Self> {
        match &fleet.schedule {
            Some(expr) => {
                let schedule = cron::Schedule::from_str(expr)
                    .with_context(|| format!("invalid cron schedule {expr:?}"))?;
                Ok(Trigger::Cron {
                    expression: expr.clone(),
                    schedule: Box::new(schedule),
                })
            }
            None => Ok(Trigger::Every(fleet.interval())),
        }
    }

    /// Time to wait from `now` until the next firing, if there is one.
    pub fn delay_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Trigger::Every(period) => Some(*period),
            Trigger::Cron { schedule, .. } => schedule
                .after(&now)
                .next()
                .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO)),
        }
    }
}

/// Drives the orchestrator from a timer.
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    trigger: Trigger,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, trigger: Trigger) -> Self {
        Self {
            orchestrator,
            trigger,
        }
    }

    /// Run the scheduler until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        match &self.trigger {
            Trigger::Every(period) => {
                info!(interval_secs = period.as_secs(), "Starting pull scheduler");
                let mut interval =
                    tokio::time::interval_at(tokio::time::Instant::now() + *period, *period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = interval.tick() => self.fire(),
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
            Trigger::Cron { expression, .. } => {
                info!(schedule = %expression, "Starting pull scheduler");

                loop {
                    let Some(delay) = self.trigger.delay_after(Utc::now()) else {
                        warn!("Cron schedule has no upcoming times, scheduler stopping");
                        break;
                    };
                    debug!(delay_secs = delay.as_secs(), "Next pull cycle scheduled");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => self.fire(),
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("Pull scheduler shutting down");
    }

    fn fire(&self) {
        let orchestrator = Arc::clone(&self.orchestrator);
        tokio::spawn(async move {
            if orchestrator.run_cycle().await == CycleOutcome::Skipped {
                debug!("Scheduled pull cycle skipped");
            }
        });
    }
}
