//! Feed acquisition.
//!
//! This module provides the two producers a session runs:
//! - `FrameProducer`: video decode into the bounded `FrameChannel`
//! - `TelemetryProducer`: telemetry receive into the `LatestTelemetryCell`
//!
//! Connections are opened through a `SourceFactory` on the producer threads,
//! once per session. Nothing opened here is reused across sessions.
//!
//! Producers MUST NOT:
//! - Block on a full frame channel
//! - Publish malformed or non-telemetry messages
//! - Propagate source failures as errors across the thread boundary

pub mod telemetry;
pub mod video;
#[cfg(feature = "video-ffmpeg")]
pub(crate) mod video_ffmpeg;

use anyhow::Result;

use crate::producer::CloseFlag;

pub use telemetry::{
    publish_message, TelemetryProducer, TelemetryReceiver, TelemetrySettings,
    TelemetryStatsSnapshot, UdpTelemetryReceiver, DEFAULT_MAX_MESSAGE_BYTES,
    DEFAULT_POLL_INTERVAL,
};
pub use video::{
    open_video_decoder, DecodeOutcome, FrameDecoder, FrameProducer, SyntheticDecoder, VideoConfig,
    VideoStatsSnapshot,
};

/// Default UDP address for telemetry.
pub const DEFAULT_TELEMETRY_ADDR: &str = "127.0.0.1:9707";

/// Opens fresh connections for a session.
///
/// Both methods are called on the producer threads and may block (for
/// example while a listening socket waits for its peer). A blocking video
/// open should give up once `close` is raised.
pub trait SourceFactory: Send + Sync + 'static {
    fn open_video(&self, close: CloseFlag) -> Result<Box<dyn FrameDecoder>>;
    fn open_telemetry(&self) -> Result<Box<dyn TelemetryReceiver>>;
}

/// Production sources: a URL-selected video decoder and a UDP telemetry socket.
#[derive(Clone, Debug)]
pub struct NetworkSources {
    pub video: VideoConfig,
    pub telemetry_addr: String,
}

impl Default for NetworkSources {
    fn default() -> Self {
        Self {
            video: VideoConfig::default(),
            telemetry_addr: DEFAULT_TELEMETRY_ADDR.to_string(),
        }
    }
}

impl SourceFactory for NetworkSources {
    fn open_video(&self, close: CloseFlag) -> Result<Box<dyn FrameDecoder>> {
        open_video_decoder(&self.video, close)
    }

    fn open_telemetry(&self) -> Result<Box<dyn TelemetryReceiver>> {
        Ok(Box::new(UdpTelemetryReceiver::bind(&self.telemetry_addr)?))
    }
}
