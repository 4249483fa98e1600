use std::sync::LazyLock;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::format::context::Input as InputContext;
use ffmpeg_next::software::scaling::context::Context as Scaler;
use ffmpeg_next::software::scaling::flag::Flags;
use ffmpeg_next::threading;
use ffmpeg_next::{Dictionary, codec, format, frame, media};
use tracing::{debug, warn};

use super::{FrameSource, FrameStream, SourceError, StopFlag, redact_credentials};
use crate::frame::{BYTES_PER_PIXEL, RawFrame};

static DECODE_THREADS: LazyLock<usize> = LazyLock::new(|| num_cpus::get().min(4));

/// Fixed decode parameters, chosen at open time and never renegotiated.
#[derive(Clone, Debug)]
pub struct DecodeOptions {
    /// RTSP transport protocol, `tcp` or `udp`.
    pub transport: String,
    /// Per-read socket timeout; bounds how long a dead transport can block
    /// the capture loop before it notices.
    pub socket_timeout: Duration,
    /// Overall limit for connecting and decoding the first frame.
    pub probe_timeout: Duration,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            transport: "tcp".to_string(),
            socket_timeout: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// One RTSP connection. Holds only the address and options, so the pump can
/// reopen it as many times as its reconnect policy allows.
pub struct RtspSource {
    url: String,
    options: DecodeOptions,
    stop: StopFlag,
}

impl RtspSource {
    pub fn new(url: impl Into<String>, options: DecodeOptions, stop: StopFlag) -> Self {
        Self {
            url: url.into(),
            options,
            stop,
        }
    }
}

impl FrameSource for RtspSource {
    type Stream = RtspStream;

    fn open(&mut self) -> Result<RtspStream, SourceError> {
        let deadline = Instant::now() + self.options.probe_timeout;
        let display_url = redact_credentials(&self.url);

        let mut open_opts = Dictionary::new();
        open_opts.set("rtsp_transport", &self.options.transport);
        open_opts.set("fflags", "nobuffer");
        open_opts.set("flags", "low_delay");
        let timeout_us = self.options.socket_timeout.as_micros().to_string();
        open_opts.set("stimeout", &timeout_us);
        open_opts.set("timeout", &timeout_us);

        debug!(url = %display_url, transport = %self.options.transport, "Opening stream");
        let ictx = format::input_with_dictionary(&self.url, open_opts).map_err(|error| {
            SourceError::unavailable(format!("failed to open {display_url}: {error}"))
        })?;

        let (video_index, parameters) = {
            let input = ictx.streams().best(media::Type::Video).ok_or_else(|| {
                SourceError::unavailable(format!("{display_url}: no video stream"))
            })?;
            (input.index(), input.parameters())
        };

        let mut context = codec::context::Context::from_parameters(parameters).map_err(|error| {
            SourceError::unavailable(format!("{display_url}: bad codec parameters: {error}"))
        })?;
        let mut threading_config = threading::Config::default();
        threading_config.count = *DECODE_THREADS;
        threading_config.kind = threading::Type::Slice;
        context.set_threading(threading_config);

        let decoder = context.decoder().video().map_err(|error| {
            SourceError::unavailable(format!("{display_url}: failed to open decoder: {error}"))
        })?;

        let mut stream = RtspStream {
            ictx,
            decoder,
            video_index,
            scaler: None,
            dimensions: (0, 0),
            pending: None,
            stop: self.stop.clone(),
        };
        stream.probe(deadline, &display_url)?;
        Ok(stream)
    }
}

/// A connected RTSP feed mid-decode. The dimension probe runs in the same
/// pipeline as ongoing capture; the probed frame becomes the first frame
/// `run` delivers.
pub struct RtspStream {
    ictx: InputContext,
    decoder: codec::decoder::Video,
    video_index: usize,
    scaler: Option<Scaler>,
    dimensions: (u32, u32),
    pending: Option<RawFrame>,
    stop: StopFlag,
}

/// Outcome of one transport read.
enum PacketRead {
    Video(ffmpeg_next::Packet),
    Skip,
    End,
}

impl RtspStream {
    /// One blocking transport read, bounded by the socket timeout.
    fn read_packet(&mut self) -> PacketRead {
        match self.ictx.packets().next() {
            Some((stream, packet)) if stream.index() == self.video_index => {
                PacketRead::Video(packet)
            }
            Some(_) => PacketRead::Skip,
            None => PacketRead::End,
        }
    }

    /// Reads packets until the first decodable frame or the deadline.
    fn probe(&mut self, deadline: Instant, display_url: &str) -> Result<(), SourceError> {
        let mut decoded = frame::Video::empty();
        loop {
            if self.stop.is_stopped() {
                return Err(SourceError::unavailable("stopped during probe"));
            }
            if Instant::now() >= deadline {
                return Err(SourceError::unavailable(format!(
                    "{display_url}: no decodable frame within probe timeout"
                )));
            }

            let packet = match self.read_packet() {
                PacketRead::Video(packet) => packet,
                PacketRead::Skip => continue,
                PacketRead::End => {
                    return Err(SourceError::unavailable(format!(
                        "{display_url}: stream ended during probe"
                    )));
                }
            };
            if self.decoder.send_packet(&packet).is_err() {
                continue;
            }
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                let first = self.convert(&decoded)?;
                self.dimensions = (first.width(), first.height());
                self.pending = Some(first);
                return Ok(());
            }
        }
    }

    /// Converts one decoded frame to packed RGB24, creating the scaler from
    /// the first frame's format.
    fn convert(&mut self, decoded: &frame::Video) -> Result<RawFrame, SourceError> {
        if self.scaler.is_none() {
            let scaler = Scaler::get(
                decoded.format(),
                decoded.width(),
                decoded.height(),
                Pixel::RGB24,
                decoded.width(),
                decoded.height(),
                Flags::BILINEAR,
            )
            .map_err(|error| SourceError::transport(format!("failed to create scaler: {error}")))?;
            self.scaler = Some(scaler);
        }
        let Some(scaler) = &mut self.scaler else {
            return Err(SourceError::transport("scaler not initialized"));
        };

        let mut scaled = frame::Video::empty();
        scaler
            .run(decoded, &mut scaled)
            .map_err(|error| SourceError::transport(format!("pixel conversion failed: {error}")))?;
        pack_rgb24(&scaled)
    }
}

impl FrameStream for RtspStream {
    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn run(&mut self, on_frame: &mut dyn FnMut(RawFrame)) -> Result<(), SourceError> {
        if let Some(first) = self.pending.take() {
            on_frame(first);
        }

        let mut decoded = frame::Video::empty();
        loop {
            if self.stop.is_stopped() {
                return Ok(());
            }
            let packet = match self.read_packet() {
                PacketRead::Video(packet) => packet,
                PacketRead::Skip => continue,
                PacketRead::End => return Err(SourceError::transport("stream ended")),
            };
            if self.decoder.send_packet(&packet).is_err() {
                warn!("Video decoder rejected packet, skipping");
                continue;
            }
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                on_frame(self.convert(&decoded)?);
            }
        }
    }
}

/// Copies the RGB24 plane row by row, dropping the stride padding ffmpeg
/// aligns each line to.
fn pack_rgb24(scaled: &frame::Video) -> Result<RawFrame, SourceError> {
    let width = scaled.width();
    let height = scaled.height();
    let stride = scaled.stride(0);
    let row = width as usize * BYTES_PER_PIXEL;
    let data = scaled.data(0);

    let mut packed = BytesMut::with_capacity(row * height as usize);
    for y in 0..height as usize {
        let start = y * stride;
        let line = data
            .get(start..start + row)
            .ok_or_else(|| SourceError::transport("scaled frame plane shorter than expected"))?;
        packed.extend_from_slice(line);
    }

    RawFrame::from_packed(width, height, packed.freeze())
        .map_err(|error| SourceError::transport(error.to_string()))
}
