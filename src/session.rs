//! One connection attempt: two producers, one consumer loop.
//!
//! A `Session` moves through `Starting -> Running -> Draining -> Closed`.
//! It owns everything it creates (frame channel, telemetry cell, both
//! producer threads) and releases all of it before reaching `Closed`,
//! whichever way the attempt ended. Dropping a session drains it too.

use anyhow::{bail, Result};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::frame::{Frame, FrameChannel, DEFAULT_FRAME_CAPACITY};
use crate::ingest::{FrameProducer, SourceFactory, TelemetryProducer, TelemetrySettings};
use crate::producer::ProducerExit;
use crate::telemetry::{LatestTelemetryCell, TelemetryRecord};

/// Default wait for frames after the first one.
pub const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(2);

/// While waiting indefinitely for the first frame, wake this often to notice
/// stop requests and producer death.
const FIRST_PULL_WAKE: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Draining,
    Closed,
}

impl SessionState {
    /// States only move forward. `Starting` may skip `Running` when a
    /// producer cannot be started.
    pub fn can_enter(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Starting, SessionState::Running)
                | (SessionState::Starting, SessionState::Draining)
                | (SessionState::Running, SessionState::Draining)
                | (SessionState::Draining, SessionState::Closed)
        )
    }
}

/// Consumer decision after each callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Receives fused updates from a running session.
///
/// Errors are logged and the session keeps running.
pub trait Consumer {
    fn on_update(&mut self, frame: Frame, telemetry: Option<Arc<TelemetryRecord>>) -> Result<Flow>;

    /// Called when a bounded pull timed out with no frame.
    fn on_idle(&mut self) -> Result<Flow> {
        Ok(Flow::Continue)
    }
}

impl<F> Consumer for F
where
    F: FnMut(Frame, Option<Arc<TelemetryRecord>>) -> Result<Flow>,
{
    fn on_update(&mut self, frame: Frame, telemetry: Option<Arc<TelemetryRecord>>) -> Result<Flow> {
        self(frame, telemetry)
    }
}

// ----------------------------------------------------------------------------
// StopSignal
// ----------------------------------------------------------------------------

/// External stop request shared between the signal handler and the loops.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    requested: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        *self
            .inner
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.inner.wake.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self
            .inner
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep up to `timeout`, returning early once a stop is requested.
    /// Returns `is_requested()`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let requested = self
            .inner
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (requested, _) = self
            .inner
            .wake
            .wait_timeout_while(requested, timeout, |requested| !*requested)
            .unwrap_or_else(PoisonError::into_inner);
        *requested
    }
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub frame_capacity: usize,
    /// `None` waits for the first frame indefinitely.
    pub first_pull_timeout: Option<Duration>,
    pub pull_timeout: Duration,
    pub telemetry: TelemetrySettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            frame_capacity: DEFAULT_FRAME_CAPACITY,
            first_pull_timeout: None,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
            telemetry: TelemetrySettings::default(),
        }
    }
}

/// Why a session stopped running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    StopRequested,
    ConsumerStopped,
    VideoFinished(ProducerExit),
    TelemetryFinished(ProducerExit),
}

impl SessionEnd {
    /// Producer death is retried with a fresh session; explicit stops are not.
    pub fn should_restart(&self) -> bool {
        matches!(
            self,
            SessionEnd::VideoFinished(_) | SessionEnd::TelemetryFinished(_)
        )
    }
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::StopRequested => write!(f, "stop requested"),
            SessionEnd::ConsumerStopped => write!(f, "consumer stopped"),
            SessionEnd::VideoFinished(exit) => write!(f, "video producer {}", exit),
            SessionEnd::TelemetryFinished(exit) => write!(f, "telemetry producer {}", exit),
        }
    }
}

pub struct Session {
    id: u64,
    state: SessionState,
    settings: SessionSettings,
    channel: Arc<FrameChannel>,
    cell: Arc<LatestTelemetryCell>,
    video: FrameProducer,
    telemetry: TelemetryProducer,
    started_at: Instant,
    updates: u64,
    idle_pulls: u64,
    consumer_errors: u64,
}

impl Session {
    /// Build fresh buffers, start both producers, and enter `Running`.
    pub fn start(
        id: u64,
        sources: &Arc<dyn SourceFactory>,
        settings: SessionSettings,
    ) -> Result<Self> {
        log::info!("session {}: starting", id);
        let channel = Arc::new(FrameChannel::new(settings.frame_capacity));
        let cell = Arc::new(LatestTelemetryCell::new());

        let video_sources = sources.clone();
        let video =
            FrameProducer::start(move |close| video_sources.open_video(close), channel.clone())?;
        let telemetry_sources = sources.clone();
        let telemetry = TelemetryProducer::start(
            move || telemetry_sources.open_telemetry(),
            cell.clone(),
            settings.telemetry.clone(),
        )?;

        let mut session = Self {
            id,
            state: SessionState::Starting,
            settings,
            channel,
            cell,
            video,
            telemetry,
            started_at: Instant::now(),
            updates: 0,
            idle_pulls: 0,
            consumer_errors: 0,
        };
        session.enter(SessionState::Running);
        Ok(session)
    }

    fn enter(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_enter(next),
            "session {}: {:?} -> {:?}",
            self.id,
            self.state,
            next
        );
        log::debug!("session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn updates_delivered(&self) -> u64 {
        self.updates
    }

    pub fn idle_pulls(&self) -> u64 {
        self.idle_pulls
    }

    pub fn consumer_errors(&self) -> u64 {
        self.consumer_errors
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn latest_telemetry(&self) -> Option<Arc<TelemetryRecord>> {
        self.cell.latest()
    }

    pub fn video(&self) -> &FrameProducer {
        &self.video
    }

    pub fn telemetry(&self) -> &TelemetryProducer {
        &self.telemetry
    }

    /// Drive the consumer until a stop or producer death, then drain.
    pub fn run<C: Consumer + ?Sized>(
        &mut self,
        consumer: &mut C,
        stop: &StopSignal,
    ) -> Result<SessionEnd> {
        if self.state != SessionState::Running {
            bail!("session {} is {:?}, not running", self.id, self.state);
        }
        let end = self.pump(consumer, stop);
        log::info!("session {}: {}; draining", self.id, end);
        self.drain();
        Ok(end)
    }

    fn pump<C: Consumer + ?Sized>(&mut self, consumer: &mut C, stop: &StopSignal) -> SessionEnd {
        let mut awaiting_first = true;
        loop {
            if let Some(end) = self.termination(stop) {
                return end;
            }

            let Some(frame) = self.channel.pull_timeout(self.pull_timeout(awaiting_first)) else {
                if awaiting_first && self.settings.first_pull_timeout.is_none() {
                    continue;
                }
                self.idle_pulls += 1;
                match consumer.on_idle() {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Stop) => return SessionEnd::ConsumerStopped,
                    Err(err) => self.consumer_failed(err),
                }
                continue;
            };
            awaiting_first = false;

            let telemetry = self.cell.latest();
            self.updates += 1;
            match consumer.on_update(frame, telemetry) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => return SessionEnd::ConsumerStopped,
                Err(err) => self.consumer_failed(err),
            }
        }
    }

    fn pull_timeout(&self, awaiting_first: bool) -> Duration {
        if awaiting_first {
            self.settings.first_pull_timeout.unwrap_or(FIRST_PULL_WAKE)
        } else {
            self.settings.pull_timeout
        }
    }

    fn termination(&self, stop: &StopSignal) -> Option<SessionEnd> {
        if stop.is_requested() {
            return Some(SessionEnd::StopRequested);
        }
        if self.video.is_finished() {
            return Some(SessionEnd::VideoFinished(finished_exit(self.video.exit())));
        }
        if self.telemetry.is_finished() {
            return Some(SessionEnd::TelemetryFinished(finished_exit(
                self.telemetry.exit(),
            )));
        }
        None
    }

    fn consumer_failed(&mut self, err: anyhow::Error) {
        self.consumer_errors += 1;
        log::warn!("session {}: consumer error: {:#}", self.id, err);
    }

    /// Close both producers, wait for them, and release the buffers.
    ///
    /// Idempotent. Blocks until any in-flight decode or receive returns.
    pub fn drain(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.enter(SessionState::Draining);
        self.video.close();
        self.telemetry.close();
        if let Err(err) = self.telemetry.join() {
            log::warn!("session {}: {}", self.id, err);
        }
        if let Err(err) = self.video.join() {
            log::warn!("session {}: {}", self.id, err);
        }
        let released = self.channel.clear();
        let video = self.video.stats();
        let telemetry = self.telemetry.stats();
        log::info!(
            "session {}: closed after {:.1}s updates={} idle={} consumer_errors={} \
             frames_decoded={} frames_evicted={} frames_released={} telemetry_accepted={} \
             telemetry_dropped={}",
            self.id,
            self.started_at.elapsed().as_secs_f64(),
            self.updates,
            self.idle_pulls,
            self.consumer_errors,
            video.frames_decoded,
            video.frames_evicted,
            released,
            telemetry.accepted,
            telemetry.dropped
        );
        self.enter(SessionState::Closed);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.drain();
    }
}

fn finished_exit(exit: Option<ProducerExit>) -> ProducerExit {
    exit.unwrap_or_else(|| ProducerExit::Failed("finished without exit reason".to_string()))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
