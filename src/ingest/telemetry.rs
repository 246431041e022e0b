//! Telemetry acquisition.
//!
//! `TelemetryProducer` owns one telemetry connection on a dedicated thread.
//! Each received message is parsed; valid `"telemetry"` messages replace the
//! session's `LatestTelemetryCell`, everything else is dropped.
//!
//! The receive wait is bounded by the poll interval so the close flag is
//! re-checked even when nothing arrives.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::producer::{Lifecycle, ProducerExit, ProducerHandle, ProducerPhase};
use crate::telemetry::{parse_telemetry, LatestTelemetryCell, TelemetryRecord};

const TELEMETRY_THREAD_NAME: &str = "telemetry-producer";

/// Default maximum size of one telemetry message.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 10 * 1024;

/// Default bound on one readability wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Message-oriented telemetry connection.
///
/// Dropping the receiver must release the underlying socket.
pub trait TelemetryReceiver: Send {
    /// Wait up to `timeout` for one message and copy it into `buf`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time. Messages longer than
    /// `buf` are truncated. Errors mean the connection is unusable.
    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>>;
}

/// UDP telemetry listener.
pub struct UdpTelemetryReceiver {
    socket: UdpSocket,
    read_timeout: Option<Duration>,
}

impl UdpTelemetryReceiver {
    pub fn bind(addr: &str) -> Result<Self> {
        let socket =
            UdpSocket::bind(addr).with_context(|| format!("bind telemetry socket on {}", addr))?;
        log::info!(
            "UdpTelemetryReceiver: listening on {}",
            socket.local_addr().context("telemetry socket address")?
        );
        Ok(Self {
            socket,
            read_timeout: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("telemetry socket address")
    }
}

impl TelemetryReceiver for UdpTelemetryReceiver {
    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        // A zero read timeout is rejected by the OS.
        let timeout = timeout.max(Duration::from_millis(1));
        if self.read_timeout != Some(timeout) {
            self.socket
                .set_read_timeout(Some(timeout))
                .context("set telemetry read timeout")?;
            self.read_timeout = Some(timeout);
        }
        match self.socket.recv_from(buf) {
            Ok((len, _)) => Ok(Some(len)),
            Err(err) if is_empty_wait(err.kind()) => Ok(None),
            Err(err) => Err(err).context("receive telemetry datagram"),
        }
    }
}

/// Receive errors that only mean "nothing arrived during this wait".
///
/// A signal landing on the receive thread interrupts `recvfrom` even with
/// `SA_RESTART`, because the socket has a receive timeout.
fn is_empty_wait(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

// ----------------------------------------------------------------------------
// TelemetryProducer
// ----------------------------------------------------------------------------

/// Receive-loop settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TelemetrySettings {
    pub max_message_bytes: usize,
    pub poll_interval: Duration,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Counters for a telemetry producer.
#[derive(Debug, Default)]
pub struct TelemetryStats {
    accepted: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TelemetryStatsSnapshot {
    pub accepted: u64,
    pub dropped: u64,
}

impl TelemetryStats {
    pub fn snapshot(&self) -> TelemetryStatsSnapshot {
        TelemetryStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Parse one message and publish it if it is valid telemetry.
///
/// Returns `true` when the cell was updated. Rejected messages leave the
/// cell untouched.
pub fn publish_message(cell: &LatestTelemetryCell, payload: &[u8]) -> bool {
    match parse_telemetry(payload) {
        Ok(record) => {
            cell.publish(record);
            true
        }
        Err(err) => {
            log::debug!("TelemetryProducer: dropped message: {}", err);
            false
        }
    }
}

/// Receives telemetry on its own thread and keeps the latest valid record.
pub struct TelemetryProducer {
    handle: ProducerHandle,
    cell: Arc<LatestTelemetryCell>,
    stats: Arc<TelemetryStats>,
}

impl TelemetryProducer {
    /// Start the receive thread and return immediately.
    ///
    /// `open` runs on the producer thread; an open failure ends the producer.
    pub fn start<F>(
        open: F,
        cell: Arc<LatestTelemetryCell>,
        settings: TelemetrySettings,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn TelemetryReceiver>> + Send + 'static,
    {
        let stats = Arc::new(TelemetryStats::default());
        let thread_cell = cell.clone();
        let thread_stats = stats.clone();
        let handle = ProducerHandle::spawn(TELEMETRY_THREAD_NAME, move |lifecycle| {
            run_receive(lifecycle, open, &thread_cell, &thread_stats, &settings)
        })?;
        Ok(Self {
            handle,
            cell,
            stats,
        })
    }

    /// Latest valid record, or `None` if nothing has been published yet.
    pub fn latest(&self) -> Option<Arc<TelemetryRecord>> {
        self.cell.latest()
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn close_requested(&self) -> bool {
        self.handle.close_requested()
    }

    pub fn phase(&self) -> ProducerPhase {
        self.handle.phase()
    }

    pub fn exit(&self) -> Option<ProducerExit> {
        self.handle.exit()
    }

    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.handle.wait_finished(timeout)
    }

    pub fn join(&mut self) -> Result<()> {
        self.handle.join()
    }

    pub fn stats(&self) -> TelemetryStatsSnapshot {
        self.stats.snapshot()
    }
}

fn run_receive<F>(
    lifecycle: &Lifecycle,
    open: F,
    cell: &LatestTelemetryCell,
    stats: &TelemetryStats,
    settings: &TelemetrySettings,
) -> ProducerExit
where
    F: FnOnce() -> Result<Box<dyn TelemetryReceiver>>,
{
    let mut receiver = match open() {
        Ok(receiver) => receiver,
        Err(err) => {
            log::warn!("TelemetryProducer: failed to open telemetry source: {:#}", err);
            return ProducerExit::Failed(format!("{:#}", err));
        }
    };
    let mut buf = vec![0u8; settings.max_message_bytes.max(1)];

    while !lifecycle.should_close() {
        match receiver.recv_timeout(&mut buf, settings.poll_interval) {
            Ok(Some(len)) => {
                if publish_message(cell, &buf[..len]) {
                    stats.accepted.fetch_add(1, Ordering::Relaxed);
                } else {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(None) => {}
            Err(err) => {
                log::warn!("TelemetryProducer: telemetry source unreadable: {:#}", err);
                return ProducerExit::Failed(format!("{:#}", err));
            }
        }
    }
    ProducerExit::Closed
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
