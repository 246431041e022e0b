//! fusiond - video + telemetry fusion daemon
//!
//! This daemon:
//! 1. Accepts a video stream (default: tcp listen on the video port)
//! 2. Receives JSON telemetry datagrams on the telemetry port
//! 3. Pairs every decoded frame with the newest valid telemetry record
//! 4. Logs a summary line per second and restarts the pipeline when a feed dies

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};

use feed_fusion::{
    Consumer, Flow, Frame, FusionConfig, SourceFactory, StopSignal, Supervisor, SupervisorExit,
    TelemetryFormatter, TelemetryRecord,
};

const SUMMARY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(author, version, about = "Fuse a video stream with JSON telemetry")]
struct Args {
    /// Listen for the video stream on this local TCP port.
    #[arg(long, env = "FUSION_VIDEO_PORT")]
    video_port: Option<u16>,

    /// Receive telemetry datagrams on this local UDP port.
    #[arg(long, env = "FUSION_TELEMETRY_PORT")]
    telemetry_port: Option<u16>,

    /// Maximum telemetry message size in bytes.
    #[arg(long)]
    telemetry_bufsize: Option<usize>,

    /// Full video source URL (overrides --video-port).
    #[arg(long)]
    video_url: Option<String>,

    /// Give up after this many restarts.
    #[arg(long)]
    max_restarts: Option<u32>,

    /// Exit after delivering this many fused updates.
    #[arg(long)]
    max_updates: Option<u64>,
}

/// Logs fused updates; rendering is left to downstream tools.
struct SummaryLogger {
    formatter: TelemetryFormatter,
    delivered: u64,
    max_updates: Option<u64>,
    last_summary: Option<Instant>,
}

impl Consumer for SummaryLogger {
    fn on_update(&mut self, frame: Frame, telemetry: Option<Arc<TelemetryRecord>>) -> Result<Flow> {
        self.delivered += 1;
        let summary = self.formatter.summary(telemetry.as_deref());
        log::debug!(
            "frame {} {}x{} age={:?}: {}",
            frame.sequence,
            frame.width,
            frame.height,
            frame.age(),
            summary
        );
        if self
            .last_summary
            .map_or(true, |at| at.elapsed() >= SUMMARY_INTERVAL)
        {
            log::info!("{}", summary);
            self.last_summary = Some(Instant::now());
        }
        Ok(match self.max_updates {
            Some(max) if self.delivered >= max => Flow::Stop,
            _ => Flow::Continue,
        })
    }

    fn on_idle(&mut self) -> Result<Flow> {
        log::info!("waiting for video...");
        Ok(Flow::Continue)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = FusionConfig::load()?;
    if let Some(port) = args.video_port {
        cfg.video.url = format!("tcp://127.0.0.1:{}?listen", port);
    }
    if let Some(url) = args.video_url {
        cfg.video.url = url;
    }
    if let Some(port) = args.telemetry_port {
        cfg.telemetry_addr = format!("127.0.0.1:{}", port);
    }
    if let Some(bytes) = args.telemetry_bufsize {
        cfg.session.telemetry.max_message_bytes = bytes;
    }
    if let Some(max) = args.max_restarts {
        cfg.restart.max_restarts = Some(max);
    }
    cfg.validate()?;

    log::info!(
        "fusiond starting: video={} telemetry={} capacity={}",
        cfg.video.url,
        cfg.telemetry_addr,
        cfg.session.frame_capacity
    );

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        handler_stop.request();
    })
    .context("error setting Ctrl-C handler")?;

    let sources: Arc<dyn SourceFactory> = Arc::new(cfg.network_sources());
    let supervisor = Supervisor::new(sources, cfg.session.clone(), cfg.restart.clone());
    let mut consumer = SummaryLogger {
        formatter: TelemetryFormatter::new(),
        delivered: 0,
        max_updates: args.max_updates,
        last_summary: None,
    };

    let report = supervisor.run(&mut consumer, &stop)?;
    log::info!(
        "fusiond stopped: {:?} after {} sessions, {} restarts, {} updates",
        report.exit,
        report.sessions_started,
        report.restarts,
        report.updates_delivered
    );
    if report.exit == SupervisorExit::RestartLimitReached {
        anyhow::bail!("restart limit reached");
    }
    Ok(())
}
