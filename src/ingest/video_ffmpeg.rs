//! FFmpeg-backed network video decoder.
//!
//! Opens any URL libavformat understands (e.g. `tcp://127.0.0.1:47000?listen`),
//! decodes the best video stream and converts each frame to packed RGB24.
//!
//! The producer's close flag is installed as the libavformat interrupt
//! callback, so a pending listen, connect or read returns once the producer
//! is closed.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;

use super::video::{DecodeOutcome, FrameDecoder};
use crate::frame::{Frame, PixelFormat};
use crate::producer::CloseFlag;

pub(crate) struct FfmpegDecoder {
    url: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_count: u64,
    open: bool,
}

impl FfmpegDecoder {
    /// Connect and open a decoder. Blocks until the peer connects for
    /// listening URLs, or until `close` is raised.
    pub(crate) fn open(url: &str, close: CloseFlag) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        ffmpeg::format::network::init();
        let input = ffmpeg::format::input_with_interrupt(&url, move || close.is_raised())
            .with_context(|| format!("failed to open video input '{}' with ffmpeg", url))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("video input has no video track"))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!(
            "FfmpegDecoder: opened {} ({}x{})",
            url,
            decoder.width(),
            decoder.height()
        );

        Ok(Self {
            url: url.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            frame_count: 0,
            open: true,
        })
    }

    fn receive_frame(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            return Ok(None);
        }
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        self.frame_count += 1;
        Ok(Some(Frame::new(
            pixels,
            width,
            height,
            PixelFormat::Rgb24,
            self.frame_count,
        )))
    }
}

impl FrameDecoder for FfmpegDecoder {
    fn is_open(&self) -> bool {
        self.open
    }

    fn read_next_frame(&mut self) -> Result<DecodeOutcome> {
        // Drain frames the decoder already buffered before reading more input.
        if let Some(frame) = self.receive_frame()? {
            return Ok(DecodeOutcome::Frame(frame));
        }

        let mut packet = ffmpeg::Packet::empty();
        match read_status(packet.read(&mut self.input))? {
            None => {}
            Some(DecodeOutcome::EndOfStream) => {
                log::info!("FfmpegDecoder: {} reached end of stream", self.url);
                self.open = false;
                return Ok(DecodeOutcome::EndOfStream);
            }
            Some(outcome) => return Ok(outcome),
        }
        if packet.stream() != self.stream_index {
            return Ok(DecodeOutcome::NotReady);
        }

        self.decoder
            .send_packet(&packet)
            .context("send packet to ffmpeg decoder")?;

        Ok(match self.receive_frame()? {
            Some(frame) => DecodeOutcome::Frame(frame),
            None => DecodeOutcome::NotReady,
        })
    }
}

/// Map the result of one packet read. `None` means a packet is ready.
///
/// Only end of file and `EAGAIN` are non-fatal; every other error (socket
/// timeout, I/O failure, interrupt) ends the stream as unreadable.
fn read_status(result: Result<(), ffmpeg::Error>) -> Result<Option<DecodeOutcome>> {
    match result {
        Ok(()) => Ok(None),
        Err(ffmpeg::Error::Eof) => Ok(Some(DecodeOutcome::EndOfStream)),
        Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
            Ok(Some(DecodeOutcome::NotReady))
        }
        Err(err) => Err(err).context("read packet from video input"),
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
