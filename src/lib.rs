//! Feed Fusion
//!
//! Fuses a live video stream with an independent telemetry stream: every
//! decoded frame is handed to the consumer together with the most recent
//! valid telemetry record, with no timestamp alignment between the two.
//!
//! # Architecture
//!
//! - Two producers run on their own threads and never block each other:
//!   the frame producer decodes into a small drop-oldest channel, the
//!   telemetry producer overwrites a latest-value cell.
//! - A `Session` owns one pair of producers plus their buffers and drives a
//!   consumer until a stop request or until either producer dies.
//! - A `Supervisor` restarts failed sessions from scratch with bounded,
//!   jittered backoff.
//!
//! # Module Structure
//!
//! - `frame`: `Frame` and the bounded `FrameChannel`
//! - `telemetry`: `TelemetryRecord`, parsing, `LatestTelemetryCell`
//! - `ingest`: decoders, receivers, the two producers, `SourceFactory`
//! - `producer`: shared thread lifecycle (close request, finished flag)
//! - `session` / `supervisor`: fusion loop and restart policy
//! - `format`: display adapter for telemetry fields
//! - `config`: file + environment configuration

pub mod config;
pub mod format;
pub mod frame;
pub mod ingest;
pub mod producer;
pub mod session;
pub mod supervisor;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use config::FusionConfig;
pub use format::TelemetryFormatter;
pub use frame::{Frame, FrameChannel, PixelFormat, DEFAULT_FRAME_CAPACITY};
pub use ingest::{
    DecodeOutcome, FrameDecoder, FrameProducer, NetworkSources, SourceFactory, TelemetryProducer,
    TelemetryReceiver, TelemetrySettings, UdpTelemetryReceiver, VideoConfig,
};
pub use producer::{CloseFlag, ProducerExit, ProducerPhase};
pub use session::{Consumer, Flow, Session, SessionEnd, SessionSettings, SessionState, StopSignal};
pub use supervisor::{RestartPolicy, Supervisor, SupervisorExit, SupervisorReport};
pub use telemetry::{parse_telemetry, LatestTelemetryCell, TelemetryRecord};
