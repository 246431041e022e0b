//! Producer thread lifecycle.
//!
//! Both producers run one blocking loop on a dedicated thread. Closing is
//! cooperative: `close()` only raises a flag, the loop observes it at its
//! next iteration boundary, and the thread marks itself finished after every
//! resource it owns has been dropped.
//!
//! Phases move strictly forward:
//! `Running -> CloseRequested -> CloseObserved -> Finished`, with a direct
//! `Running -> Finished` edge when the source dies on its own.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerPhase {
    Running,
    CloseRequested,
    CloseObserved,
    Finished,
}

impl ProducerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProducerPhase::Running,
            1 => ProducerPhase::CloseRequested,
            2 => ProducerPhase::CloseObserved,
            _ => ProducerPhase::Finished,
        }
    }
}

/// Why a producer loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProducerExit {
    /// `close()` was observed.
    Closed,
    /// The source reported end of stream.
    Exhausted,
    /// Open, read or decode failed, or the thread panicked.
    Failed(String),
}

impl std::fmt::Display for ProducerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProducerExit::Closed => write!(f, "closed"),
            ProducerExit::Exhausted => write!(f, "source exhausted"),
            ProducerExit::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Read-only view of a close request, for blocking calls that can poll it
/// (an FFmpeg interrupt callback, for instance).
///
/// `CloseFlag::default()` is never raised.
#[derive(Clone, Debug, Default)]
pub struct CloseFlag(Arc<AtomicBool>);

impl CloseFlag {
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Shared state between a producer thread and its handle.
#[derive(Debug)]
pub struct Lifecycle {
    phase: AtomicU8,
    close_requested: Arc<AtomicBool>,
    exit: Mutex<Option<ProducerExit>>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            phase: AtomicU8::new(ProducerPhase::Running as u8),
            close_requested: Arc::new(AtomicBool::new(false)),
            exit: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> ProducerPhase {
        ProducerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn request_close(&self) {
        self.close_requested.store(true, Ordering::Release);
        let _ = self.phase.compare_exchange(
            ProducerPhase::Running as u8,
            ProducerPhase::CloseRequested as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Flag handed to source openers so a blocking open can give up early.
    pub fn close_flag(&self) -> CloseFlag {
        CloseFlag(self.close_requested.clone())
    }

    /// Called by the loop at each iteration boundary.
    pub fn should_close(&self) -> bool {
        if !self.close_requested.load(Ordering::Acquire) {
            return false;
        }
        let _ = self.phase.compare_exchange(
            ProducerPhase::CloseRequested as u8,
            ProducerPhase::CloseObserved as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        true
    }

    fn finish(&self, exit: ProducerExit) {
        *self.exit.lock().unwrap_or_else(PoisonError::into_inner) = Some(exit);
        self.phase
            .store(ProducerPhase::Finished as u8, Ordering::Release);
    }
}

/// Marks the lifecycle finished when dropped.
///
/// Created before the producer body runs, so its `Drop` runs after the body's
/// locals (decoder, socket) on every exit path, including unwinding.
struct FinishGuard {
    lifecycle: Arc<Lifecycle>,
    exit: Option<ProducerExit>,
}

impl FinishGuard {
    fn complete(mut self, exit: ProducerExit) {
        self.exit = Some(exit);
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let exit = self
            .exit
            .take()
            .unwrap_or_else(|| ProducerExit::Failed("producer thread panicked".to_string()));
        self.lifecycle.finish(exit);
    }
}

/// Owner side of a producer thread.
///
/// Dropping the handle closes and joins the thread.
pub struct ProducerHandle {
    name: &'static str,
    lifecycle: Arc<Lifecycle>,
    join: Option<JoinHandle<()>>,
}

impl ProducerHandle {
    /// Spawn `body` on a named thread. Returns as soon as the thread exists.
    pub(crate) fn spawn<F>(name: &'static str, body: F) -> Result<Self>
    where
        F: FnOnce(&Lifecycle) -> ProducerExit + Send + 'static,
    {
        let lifecycle = Arc::new(Lifecycle::new());
        let thread_lifecycle = lifecycle.clone();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let guard = FinishGuard {
                    lifecycle: thread_lifecycle,
                    exit: None,
                };
                let exit = body(&guard.lifecycle);
                log::info!("{} exited: {}", name, exit);
                guard.complete(exit);
            })
            .with_context(|| format!("spawn {} thread", name))?;

        Ok(Self {
            name,
            lifecycle,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request a cooperative close. Does not wait.
    pub fn close(&self) {
        self.lifecycle.request_close();
    }

    pub fn close_requested(&self) -> bool {
        self.lifecycle.close_requested.load(Ordering::Acquire)
    }

    /// True once the loop has exited and its resources have been released.
    pub fn is_finished(&self) -> bool {
        self.phase() == ProducerPhase::Finished
    }

    pub fn phase(&self) -> ProducerPhase {
        self.lifecycle.phase()
    }

    /// Exit reason, available once finished.
    pub fn exit(&self) -> Option<ProducerExit> {
        self.lifecycle
            .exit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Poll until finished or `timeout` elapses. Returns `is_finished()`.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    /// Wait for the thread to exit. Does not request a close by itself.
    pub fn join(&mut self) -> Result<()> {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        join.join()
            .map_err(|_| anyhow!("{} thread panicked", self.name))
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.close();
        if let Err(err) = self.join() {
            log::warn!("{}", err);
        }
    }
}
