//! Test doubles shared by unit tests.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::frame::{Frame, PixelFormat};
use crate::ingest::{DecodeOutcome, FrameDecoder, SourceFactory, TelemetryReceiver};
use crate::producer::CloseFlag;

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

// ----------------------------------------------------------------------------
// Mock decoder
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub(crate) enum MockStep {
    Frame,
    NotReady,
    EndOfStream,
    Error(&'static str),
    /// Block inside the decode call, then report not ready.
    Stall(Duration),
}

/// Observes a mock resource from the test thread.
#[derive(Clone, Debug, Default)]
pub(crate) struct Tracker {
    released: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl Tracker {
    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub(crate) fn set_open(&self, open: bool) {
        self.closed.store(!open, Ordering::SeqCst);
    }
}

pub(crate) struct MockDecoder {
    script: Option<VecDeque<MockStep>>,
    tracker: Tracker,
    sequence: u64,
}

impl MockDecoder {
    /// Produces a frame every millisecond until closed.
    pub(crate) fn endless() -> (Self, Tracker) {
        Self::build(None)
    }

    /// Plays `steps` in order, then reports end of stream.
    pub(crate) fn scripted(steps: Vec<MockStep>) -> (Self, Tracker) {
        Self::build(Some(steps.into()))
    }

    fn build(script: Option<VecDeque<MockStep>>) -> (Self, Tracker) {
        let tracker = Tracker::default();
        let decoder = Self {
            script,
            tracker: tracker.clone(),
            sequence: 0,
        };
        (decoder, tracker)
    }

    pub(crate) fn boxed(self) -> Box<dyn FrameDecoder> {
        Box::new(self)
    }

    fn next_frame(&mut self) -> Frame {
        self.sequence += 1;
        Frame::new(vec![0u8; 12], 2, 2, PixelFormat::Rgb24, self.sequence)
    }
}

impl FrameDecoder for MockDecoder {
    fn is_open(&self) -> bool {
        !self.tracker.closed.load(Ordering::SeqCst)
    }

    fn read_next_frame(&mut self) -> Result<DecodeOutcome> {
        let step = match self.script.as_mut() {
            None => {
                std::thread::sleep(Duration::from_millis(1));
                MockStep::Frame
            }
            Some(script) => script.pop_front().unwrap_or(MockStep::EndOfStream),
        };
        match step {
            MockStep::Frame => Ok(DecodeOutcome::Frame(self.next_frame())),
            MockStep::NotReady => Ok(DecodeOutcome::NotReady),
            MockStep::EndOfStream => Ok(DecodeOutcome::EndOfStream),
            MockStep::Error(reason) => Err(anyhow!(reason)),
            MockStep::Stall(duration) => {
                std::thread::sleep(duration);
                Ok(DecodeOutcome::NotReady)
            }
        }
    }
}

impl Drop for MockDecoder {
    fn drop(&mut self) {
        self.tracker.released.store(true, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Mock telemetry receiver
// ----------------------------------------------------------------------------

enum MockDatagram {
    Payload(Vec<u8>),
    Fail(&'static str),
}

#[derive(Clone)]
pub(crate) struct MockSender {
    tx: mpsc::Sender<MockDatagram>,
}

impl MockSender {
    pub(crate) fn send(&self, payload: &[u8]) {
        let _ = self.tx.send(MockDatagram::Payload(payload.to_vec()));
    }

    pub(crate) fn fail(&self, reason: &'static str) {
        let _ = self.tx.send(MockDatagram::Fail(reason));
    }
}

pub(crate) struct MockReceiver {
    rx: mpsc::Receiver<MockDatagram>,
    tracker: Tracker,
}

impl MockReceiver {
    pub(crate) fn new() -> (Self, MockSender, Tracker) {
        let (tx, rx) = mpsc::channel();
        let tracker = Tracker::default();
        let receiver = Self {
            rx,
            tracker: tracker.clone(),
        };
        (receiver, MockSender { tx }, tracker)
    }

    pub(crate) fn boxed(self) -> Box<dyn TelemetryReceiver> {
        Box::new(self)
    }
}

impl TelemetryReceiver for MockReceiver {
    fn recv_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        match self.rx.recv_timeout(timeout) {
            Ok(MockDatagram::Payload(payload)) => {
                let len = payload.len().min(buf.len());
                buf[..len].copy_from_slice(&payload[..len]);
                Ok(Some(len))
            }
            Ok(MockDatagram::Fail(reason)) => Err(anyhow!(reason)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}

impl Drop for MockReceiver {
    fn drop(&mut self) {
        self.tracker.released.store(true, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Mock source factory
// ----------------------------------------------------------------------------

/// Hands out fresh mock connections per session and records their trackers.
#[derive(Default)]
pub(crate) struct MockSources {
    video_plans: Mutex<VecDeque<Vec<MockStep>>>,
    telemetry_backlog: Vec<Vec<u8>>,
    telemetry_fails: bool,
    video_open_blocks: bool,
    decoder_trackers: Mutex<Vec<Tracker>>,
    receiver_trackers: Mutex<Vec<Tracker>>,
    senders: Mutex<Vec<MockSender>>,
    video_opens: AtomicUsize,
    telemetry_opens: AtomicUsize,
}

impl MockSources {
    /// Session N plays `plans[N]`; sessions past the end stream endlessly.
    pub(crate) fn with_video_plans(plans: Vec<Vec<MockStep>>) -> Self {
        Self {
            video_plans: Mutex::new(plans.into()),
            ..Self::default()
        }
    }

    /// Messages queued on every new telemetry connection.
    pub(crate) fn with_telemetry(mut self, messages: &[&[u8]]) -> Self {
        self.telemetry_backlog = messages.iter().map(|m| m.to_vec()).collect();
        self
    }

    /// Every telemetry connection fails after delivering its backlog.
    pub(crate) fn with_failing_telemetry(mut self) -> Self {
        self.telemetry_fails = true;
        self
    }

    /// Video opens block like a listening socket with no peer, until the
    /// producer is closed.
    pub(crate) fn with_blocking_video_open(mut self) -> Self {
        self.video_open_blocks = true;
        self
    }

    pub(crate) fn video_opens(&self) -> usize {
        self.video_opens.load(Ordering::SeqCst)
    }

    pub(crate) fn telemetry_opens(&self) -> usize {
        self.telemetry_opens.load(Ordering::SeqCst)
    }

    pub(crate) fn decoder_trackers(&self) -> Vec<Tracker> {
        self.decoder_trackers.lock().unwrap().clone()
    }

    pub(crate) fn receiver_trackers(&self) -> Vec<Tracker> {
        self.receiver_trackers.lock().unwrap().clone()
    }
}

impl SourceFactory for MockSources {
    fn open_video(&self, close: CloseFlag) -> Result<Box<dyn FrameDecoder>> {
        self.video_opens.fetch_add(1, Ordering::SeqCst);
        if self.video_open_blocks {
            while !close.is_raised() {
                std::thread::sleep(Duration::from_millis(1));
            }
            return Err(anyhow!("video listen interrupted"));
        }
        let (decoder, tracker) = match self.video_plans.lock().unwrap().pop_front() {
            Some(plan) => MockDecoder::scripted(plan),
            None => MockDecoder::endless(),
        };
        self.decoder_trackers.lock().unwrap().push(tracker);
        Ok(decoder.boxed())
    }

    fn open_telemetry(&self) -> Result<Box<dyn TelemetryReceiver>> {
        self.telemetry_opens.fetch_add(1, Ordering::SeqCst);
        let (receiver, sender, tracker) = MockReceiver::new();
        for message in &self.telemetry_backlog {
            sender.send(message);
        }
        if self.telemetry_fails {
            sender.fail("telemetry socket closed");
        }
        self.receiver_trackers.lock().unwrap().push(tracker);
        self.senders.lock().unwrap().push(sender);
        Ok(receiver.boxed())
    }
}
