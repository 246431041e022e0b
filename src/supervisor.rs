//! Restart loop around sessions.
//!
//! Each attempt gets a brand-new `Session` (fresh sources, buffers and
//! threads). The previous session is fully drained before the backoff
//! starts, so no two sessions ever overlap.

use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::ingest::SourceFactory;
use crate::session::{Consumer, Session, SessionEnd, SessionSettings, StopSignal};

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);
pub const DEFAULT_HEALTHY_AFTER: Duration = Duration::from_secs(30);

/// Delay schedule between failed sessions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` restarts forever.
    pub max_restarts: Option<u32>,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
    /// A session that ran at least this long resets the backoff.
    pub healthy_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_restarts: None,
            jitter: true,
            healthy_after: DEFAULT_HEALTHY_AFTER,
        }
    }
}

impl RestartPolicy {
    /// Delay before the next attempt after `consecutive_failures` failed
    /// sessions in a row (1 for the first failure).
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        let delay = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let millis = delay.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(millis / 2..=millis))
    }

    pub fn allows_restart(&self, restarts: u32) -> bool {
        self.max_restarts.map_or(true, |max| restarts < max)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorExit {
    StopRequested,
    ConsumerStopped,
    RestartLimitReached,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SupervisorReport {
    pub sessions_started: u64,
    pub restarts: u32,
    pub updates_delivered: u64,
    pub last_end: Option<SessionEnd>,
    pub exit: SupervisorExit,
}

pub struct Supervisor {
    sources: Arc<dyn SourceFactory>,
    settings: SessionSettings,
    policy: RestartPolicy,
}

impl Supervisor {
    pub fn new(
        sources: Arc<dyn SourceFactory>,
        settings: SessionSettings,
        policy: RestartPolicy,
    ) -> Self {
        Self {
            sources,
            settings,
            policy,
        }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Run sessions until a stop, a consumer stop, or the restart cap.
    ///
    /// Errors only when a session cannot be constructed at all.
    pub fn run<C: Consumer + ?Sized>(
        &self,
        consumer: &mut C,
        stop: &StopSignal,
    ) -> Result<SupervisorReport> {
        let mut report = SupervisorReport {
            sessions_started: 0,
            restarts: 0,
            updates_delivered: 0,
            last_end: None,
            exit: SupervisorExit::StopRequested,
        };
        let mut consecutive_failures = 0u32;

        loop {
            if stop.is_requested() {
                report.exit = SupervisorExit::StopRequested;
                return Ok(report);
            }

            report.sessions_started += 1;
            let mut session =
                Session::start(report.sessions_started, &self.sources, self.settings.clone())?;
            let end = session.run(consumer, stop)?;
            let healthy = session.uptime() >= self.policy.healthy_after;
            report.updates_delivered += session.updates_delivered();
            drop(session);

            report.last_end = Some(end.clone());
            match end {
                SessionEnd::StopRequested => {
                    report.exit = SupervisorExit::StopRequested;
                    return Ok(report);
                }
                SessionEnd::ConsumerStopped => {
                    report.exit = SupervisorExit::ConsumerStopped;
                    return Ok(report);
                }
                SessionEnd::VideoFinished(_) | SessionEnd::TelemetryFinished(_) => {}
            }

            if !self.policy.allows_restart(report.restarts) {
                log::error!(
                    "supervisor: giving up after {} restarts (last: {})",
                    report.restarts,
                    end
                );
                report.exit = SupervisorExit::RestartLimitReached;
                return Ok(report);
            }

            consecutive_failures = if healthy { 1 } else { consecutive_failures + 1 };
            let delay = self.policy.delay_for(consecutive_failures);
            log::warn!(
                "supervisor: session {} ended ({}); restarting in {:?}",
                report.sessions_started,
                end,
                delay
            );
            report.restarts += 1;
            if stop.wait_timeout(delay) {
                report.exit = SupervisorExit::StopRequested;
                return Ok(report);
            }
        }
    }
}
