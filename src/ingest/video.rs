//! Video acquisition.
//!
//! `FrameProducer` owns one decoder on a dedicated thread and feeds the
//! session's `FrameChannel`. The decoder itself is opaque: anything that
//! implements `FrameDecoder` can be plugged in.
//!
//! Built-in decoders:
//! - `stub://` URLs: synthetic frames for tests and demos
//! - anything else: FFmpeg (feature: video-ffmpeg), e.g. `tcp://127.0.0.1:47000?listen`

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "video-ffmpeg")]
use super::video_ffmpeg::FfmpegDecoder;
use crate::frame::{Frame, FrameChannel, PixelFormat};
use crate::producer::{CloseFlag, Lifecycle, ProducerExit, ProducerHandle, ProducerPhase};

const VIDEO_THREAD_NAME: &str = "frame-producer";

/// Result of one decode attempt.
#[derive(Debug)]
pub enum DecodeOutcome {
    Frame(Frame),
    /// Nothing decodable yet (e.g. a non-video packet). Try again.
    NotReady,
    EndOfStream,
}

/// Opaque video decoder bound to one connection.
///
/// A decoder is opened on its producer thread and never leaves it, so it
/// need not be `Send`. Dropping the decoder must release the underlying
/// connection.
pub trait FrameDecoder {
    fn is_open(&self) -> bool;

    /// Block until a frame, a transient "not ready", end of stream, or an
    /// unrecoverable error.
    fn read_next_frame(&mut self) -> Result<DecodeOutcome>;
}

/// Configuration for a video source.
#[derive(Clone, Debug)]
pub struct VideoConfig {
    /// Source URL (e.g. "tcp://127.0.0.1:47000?listen" or "stub://camera?frames=100").
    pub url: String,
    /// Frame width for synthetic sources.
    pub width: u32,
    /// Frame height for synthetic sources.
    pub height: u32,
    /// Pacing for synthetic sources. Zero means as fast as possible.
    pub target_fps: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            url: "tcp://127.0.0.1:47000?listen".to_string(),
            width: 640,
            height: 480,
            target_fps: 30,
        }
    }
}

/// Open the decoder selected by the URL scheme.
///
/// Blocking backends give up once `close` is raised.
pub fn open_video_decoder(config: &VideoConfig, close: CloseFlag) -> Result<Box<dyn FrameDecoder>> {
    if config.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticDecoder::new(config)?));
    }
    #[cfg(feature = "video-ffmpeg")]
    {
        Ok(Box::new(FfmpegDecoder::open(&config.url, close)?))
    }
    #[cfg(not(feature = "video-ffmpeg"))]
    {
        let _ = close;
        anyhow::bail!(
            "video url '{}' requires the video-ffmpeg feature",
            config.url
        )
    }
}

// ----------------------------------------------------------------------------
// FrameProducer
// ----------------------------------------------------------------------------

/// Counters for a frame producer.
#[derive(Debug, Default)]
pub struct VideoStats {
    frames_decoded: AtomicU64,
    frames_evicted: AtomicU64,
    not_ready: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VideoStatsSnapshot {
    pub frames_decoded: u64,
    pub frames_evicted: u64,
    pub not_ready: u64,
}

impl VideoStats {
    pub fn snapshot(&self) -> VideoStatsSnapshot {
        VideoStatsSnapshot {
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_evicted: self.frames_evicted.load(Ordering::Relaxed),
            not_ready: self.not_ready.load(Ordering::Relaxed),
        }
    }
}

/// Decodes frames on its own thread and pushes them into a `FrameChannel`.
pub struct FrameProducer {
    handle: ProducerHandle,
    stats: Arc<VideoStats>,
}

impl FrameProducer {
    /// Start the acquisition thread and return immediately.
    ///
    /// `open` runs on the producer thread, so a slow connect (e.g. waiting
    /// for a peer on a listening socket) never blocks the caller. `open`
    /// receives the producer's close flag so a blocking connect can give up
    /// when the producer is closed. An open failure ends the producer like
    /// any other source failure.
    pub fn start<F>(open: F, channel: Arc<FrameChannel>) -> Result<Self>
    where
        F: FnOnce(CloseFlag) -> Result<Box<dyn FrameDecoder>> + Send + 'static,
    {
        let stats = Arc::new(VideoStats::default());
        let thread_stats = stats.clone();
        let handle = ProducerHandle::spawn(VIDEO_THREAD_NAME, move |lifecycle| {
            run_capture(lifecycle, open, &channel, &thread_stats)
        })?;
        Ok(Self { handle, stats })
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

    pub fn stats(&self) -> VideoStatsSnapshot {
        self.stats.snapshot()
    }
}

fn run_capture<F>(
    lifecycle: &Lifecycle,
    open: F,
    channel: &FrameChannel,
    stats: &VideoStats,
) -> ProducerExit
where
    F: FnOnce(CloseFlag) -> Result<Box<dyn FrameDecoder>>,
{
    let mut decoder = match open(lifecycle.close_flag()) {
        Ok(decoder) => decoder,
        Err(err) => {
            if lifecycle.should_close() {
                log::debug!("FrameProducer: open abandoned on close: {:#}", err);
                return ProducerExit::Closed;
            }
            log::warn!("FrameProducer: failed to open video source: {:#}", err);
            return ProducerExit::Failed(format!("{:#}", err));
        }
    };
    log::info!("FrameProducer: video source open");

    loop {
        if lifecycle.should_close() {
            return ProducerExit::Closed;
        }
        if !decoder.is_open() {
            return ProducerExit::Exhausted;
        }
        match decoder.read_next_frame() {
            Ok(DecodeOutcome::Frame(frame)) => {
                stats.frames_decoded.fetch_add(1, Ordering::Relaxed);
                if channel.push(frame) {
                    stats.frames_evicted.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(DecodeOutcome::NotReady) => {
                stats.not_ready.fetch_add(1, Ordering::Relaxed);
                std::thread::yield_now();
            }
            Ok(DecodeOutcome::EndOfStream) => return ProducerExit::Exhausted,
            // A decoder interrupted by the close flag surfaces as an error.
            Err(err) if lifecycle.should_close() => {
                log::debug!("FrameProducer: read abandoned on close: {:#}", err);
                return ProducerExit::Closed;
            }
            Err(err) => {
                log::warn!("FrameProducer: video source unreadable: {:#}", err);
                return ProducerExit::Failed(format!("{:#}", err));
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic decoder (stub://) for tests and demos
// ----------------------------------------------------------------------------

/// Generates a moving gradient. `stub://name?frames=N` ends the stream after
/// N frames; `fps=F` overrides the configured pacing.
pub struct SyntheticDecoder {
    width: u32,
    height: u32,
    frame_interval: Duration,
    frame_limit: Option<u64>,
    frame_count: u64,
}

impl SyntheticDecoder {
    pub fn new(config: &VideoConfig) -> Result<Self> {
        let mut frame_limit = None;
        let mut fps = config.target_fps;
        if let Some((_, query)) = config.url.split_once('?') {
            for (key, value) in query.split('&').filter_map(|pair| pair.split_once('=')) {
                match key {
                    "frames" => frame_limit = Some(parse_query_value(key, value)?),
                    "fps" => fps = parse_query_value(key, value)?,
                    other => log::debug!("SyntheticDecoder: ignoring query key '{}'", other),
                }
            }
        }
        log::info!("SyntheticDecoder: streaming {}", config.url);
        Ok(Self {
            width: config.width.max(1),
            height: config.height.max(1),
            frame_interval: frame_interval(fps),
            frame_limit,
            frame_count: 0,
        })
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let row_bytes = self.width as usize * 3;
        let mut pixels = vec![0u8; row_bytes * self.height as usize];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            let column = (i % row_bytes) as u64;
            *pixel = ((column + self.frame_count) % 256) as u8;
        }
        pixels
    }
}

impl FrameDecoder for SyntheticDecoder {
    fn is_open(&self) -> bool {
        self.frame_limit
            .map_or(true, |limit| self.frame_count < limit)
    }

    fn read_next_frame(&mut self) -> Result<DecodeOutcome> {
        if !self.is_open() {
            return Ok(DecodeOutcome::EndOfStream);
        }
        if !self.frame_interval.is_zero() {
            std::thread::sleep(self.frame_interval);
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Ok(DecodeOutcome::Frame(Frame::new(
            pixels,
            self.width,
            self.height,
            PixelFormat::Rgb24,
            self.frame_count,
        )))
    }
}

fn parse_query_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid stub url parameter {}={}", key, value))
}

fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDecoder, MockStep};

    const WAIT: Duration = Duration::from_secs(5);

    fn stub_config(url: &str) -> VideoConfig {
        VideoConfig {
            url: url.to_string(),
            width: 4,
            height: 2,
            target_fps: 0,
        }
    }

    #[test]
    fn close_releases_decoder() -> Result<()> {
        let (decoder, tracker) = MockDecoder::endless();
        let channel = Arc::new(FrameChannel::new(2));
        let mut producer = FrameProducer::start(move |_| Ok(decoder.boxed()), channel.clone())?;

        assert!(channel.pull_timeout(WAIT).is_some());
        assert!(!producer.is_finished());

        producer.close();
        assert!(producer.wait_finished(WAIT));
        assert!(tracker.is_released());
        assert_eq!(producer.exit(), Some(ProducerExit::Closed));
        producer.join()?;
        Ok(())
    }

    #[test]
    fn end_of_stream_finishes_without_close() -> Result<()> {
        let (decoder, tracker) = MockDecoder::scripted(vec![
            MockStep::Frame,
            MockStep::NotReady,
            MockStep::Frame,
            MockStep::EndOfStream,
        ]);
        let channel = Arc::new(FrameChannel::new(2));
        let producer = FrameProducer::start(move |_| Ok(decoder.boxed()), channel.clone())?;

        assert!(producer.wait_finished(WAIT));
        assert!(!producer.close_requested());
        assert!(tracker.is_released());
        assert_eq!(producer.exit(), Some(ProducerExit::Exhausted));
        let stats = producer.stats();
        assert_eq!(stats.frames_decoded, 2);
        assert_eq!(stats.not_ready, 1);
        assert_eq!(channel.len(), 2);
        Ok(())
    }

    #[test]
    fn unreadable_source_finishes_as_failure() -> Result<()> {
        let (decoder, tracker) =
            MockDecoder::scripted(vec![MockStep::Frame, MockStep::Error("connection reset")]);
        let channel = Arc::new(FrameChannel::new(2));
        let producer = FrameProducer::start(move |_| Ok(decoder.boxed()), channel)?;

        assert!(producer.wait_finished(WAIT));
        assert!(tracker.is_released());
        match producer.exit() {
            Some(ProducerExit::Failed(reason)) => assert!(reason.contains("connection reset")),
            other => panic!("unexpected exit {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn open_failure_finishes_producer() -> Result<()> {
        let channel = Arc::new(FrameChannel::new(2));
        let producer = FrameProducer::start(
            |_| Err(anyhow::anyhow!("connection refused")),
            channel,
        )?;
        assert!(producer.wait_finished(WAIT));
        assert!(matches!(producer.exit(), Some(ProducerExit::Failed(_))));
        Ok(())
    }

    #[test]
    fn close_abandons_blocking_open() -> Result<()> {
        let channel = Arc::new(FrameChannel::new(2));
        let mut producer = FrameProducer::start(
            |close: CloseFlag| {
                while !close.is_raised() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(anyhow::anyhow!("connect interrupted"))
            },
            channel,
        )?;

        assert!(!producer.wait_finished(Duration::from_millis(50)));
        producer.close();
        assert!(producer.wait_finished(WAIT));
        assert_eq!(producer.exit(), Some(ProducerExit::Closed));
        producer.join()?;
        Ok(())
    }

    /// Blocks inside a read until closed, then fails the way an interrupted
    /// network read does.
    struct InterruptibleDecoder {
        close: CloseFlag,
        released: Arc<std::sync::atomic::AtomicBool>,
    }

    impl FrameDecoder for InterruptibleDecoder {
        fn is_open(&self) -> bool {
            true
        }

        fn read_next_frame(&mut self) -> Result<DecodeOutcome> {
            while !self.close.is_raised() {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(anyhow::anyhow!("read interrupted"))
        }
    }

    impl Drop for InterruptibleDecoder {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn close_interrupting_a_read_is_a_clean_close() -> Result<()> {
        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = released.clone();
        let channel = Arc::new(FrameChannel::new(2));
        let mut producer = FrameProducer::start(
            move |close| {
                Ok(Box::new(InterruptibleDecoder {
                    close,
                    released: flag,
                }) as Box<dyn FrameDecoder>)
            },
            channel,
        )?;

        assert!(!producer.wait_finished(Duration::from_millis(50)));
        producer.close();
        assert!(producer.wait_finished(WAIT));
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(producer.exit(), Some(ProducerExit::Closed));
        producer.join()?;
        Ok(())
    }

    #[test]
    fn closed_decoder_is_treated_as_exhausted() -> Result<()> {
        let (decoder, tracker) = MockDecoder::scripted(vec![]);
        tracker.set_open(false);
        let channel = Arc::new(FrameChannel::new(2));
        let producer = FrameProducer::start(move |_| Ok(decoder.boxed()), channel)?;
        assert!(producer.wait_finished(WAIT));
        assert_eq!(producer.exit(), Some(ProducerExit::Exhausted));
        Ok(())
    }

    #[test]
    fn slow_consumer_only_sees_latest_frames() -> Result<()> {
        let (decoder, _tracker) = MockDecoder::scripted(
            std::iter::repeat(MockStep::Frame)
                .take(5)
                .chain(std::iter::once(MockStep::EndOfStream))
                .collect(),
        );
        let channel = Arc::new(FrameChannel::new(2));
        let producer = FrameProducer::start(move |_| Ok(decoder.boxed()), channel.clone())?;
        assert!(producer.wait_finished(WAIT));

        let sequences: Vec<u64> = std::iter::from_fn(|| channel.try_pull())
            .map(|frame| frame.sequence)
            .collect();
        assert_eq!(sequences, vec![4, 5]);
        assert_eq!(producer.stats().frames_evicted, 3);
        Ok(())
    }

    #[test]
    fn synthetic_decoder_honours_frame_limit() -> Result<()> {
        let mut decoder = SyntheticDecoder::new(&stub_config("stub://test?frames=2&fps=0"))?;
        assert!(matches!(decoder.read_next_frame()?, DecodeOutcome::Frame(_)));
        match decoder.read_next_frame()? {
            DecodeOutcome::Frame(frame) => {
                assert_eq!(frame.sequence, 2);
                assert_eq!((frame.width, frame.height), (4, 2));
                assert_eq!(frame.byte_len(), 4 * 2 * 3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!decoder.is_open());
        assert!(matches!(decoder.read_next_frame()?, DecodeOutcome::EndOfStream));
        Ok(())
    }

    #[test]
    fn synthetic_decoder_rejects_bad_parameters() {
        assert!(SyntheticDecoder::new(&stub_config("stub://test?frames=many")).is_err());
    }

    #[test]
    fn stub_urls_open_synthetic_decoder() -> Result<()> {
        let mut decoder = open_video_decoder(&stub_config("stub://camera"), CloseFlag::default())?;
        assert!(decoder.is_open());
        assert!(matches!(decoder.read_next_frame()?, DecodeOutcome::Frame(_)));
        Ok(())
    }

    #[cfg(not(feature = "video-ffmpeg"))]
    #[test]
    fn network_urls_require_ffmpeg_feature() {
        let err = open_video_decoder(
            &stub_config("tcp://127.0.0.1:47000?listen"),
            CloseFlag::default(),
        )
            .err()
            .expect("ffmpeg feature disabled");
        assert!(err.to_string().contains("video-ffmpeg"));
    }
}
