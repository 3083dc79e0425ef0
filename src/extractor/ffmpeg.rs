use super::{CancelFlag, DecodingHandle, MediaBackend, RgbFrame, VideoMetadata};
use crate::error::ThumbnailError;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::context::Context as Scaler;
use ffmpeg_next::software::scaling::flag::Flags;
use ffmpeg_next::{Dictionary, Packet, Rational, codec, ffi, format, frame, media, threading};
use std::ffi::{CString, c_int, c_void};
use std::ptr;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// libavformat's internal time base (microseconds).
const AV_TIME_BASE: i64 = 1_000_000;
/// AV_NOPTS_VALUE
const NO_PTS: i64 = i64::MIN;
/// Upper bound on video packets read after a seek before giving up.
const MAX_SEEK_PACKETS: usize = 2048;
/// Protocols a remote locator may touch, nested ones (HLS segments, TLS) included.
pub const NETWORK_PROTOCOLS: &str = "http,https,tcp,tls,crypto";
const USER_AGENT: &str = concat!("video-thumbnailer/", env!("CARGO_PKG_VERSION"));

static NUM_CPUS: LazyLock<usize> = LazyLock::new(|| {
    let n = num_cpus::get();
    let num = if n > 16 { 16 } else { n };
    info!(num, "Detecting CPU cores");
    num
});

fn is_rational_valid(r: Rational) -> bool {
    r.numerator() > 0 && r.denominator() > 0
}

/// Container duration first, then the stream's own duration scaled by its time base.
fn resolve_duration(container_us: i64, stream_ts: i64, time_base: Rational) -> Duration {
    if container_us > 0 {
        return Duration::from_micros(container_us as u64);
    }
    if stream_ts > 0 && is_rational_valid(time_base) {
        return Duration::from_secs_f64(stream_ts as f64 * f64::from(time_base));
    }
    Duration::ZERO
}

fn start_offset(start_ts: i64) -> i64 {
    if start_ts == NO_PTS { 0 } else { start_ts }
}

/// `target` past the stream start, in `time_base` ticks.
fn to_stream_ts(target: Duration, time_base: Rational, start_ts: i64) -> i64 {
    if !is_rational_valid(time_base) {
        return 0;
    }
    let ticks = (target.as_secs_f64() * f64::from(time_base.invert())).round() as i64;
    start_offset(start_ts) + ticks
}

/// `target` past the stream start, in `AV_TIME_BASE` units as `seek` expects.
fn to_seek_position(target: Duration, time_base: Rational, start_ts: i64) -> i64 {
    let position = (target.as_secs_f64() * AV_TIME_BASE as f64).round() as i64;
    if !is_rational_valid(time_base) {
        return position;
    }
    let start_us = start_offset(start_ts) as f64 * f64::from(time_base) * AV_TIME_BASE as f64;
    position + start_us.round() as i64
}

/// Copies the visible part of each row out of a strided plane.
fn pack_rows(plane: &[u8], stride: usize, width: u32, height: u32) -> Vec<u8> {
    let row = width as usize * 3;
    let mut data = Vec::with_capacity(row * height as usize);
    for line in plane.chunks(stride).take(height as usize) {
        data.extend_from_slice(&line[..row.min(line.len())]);
    }
    data
}

unsafe extern "C" fn interrupt_requested(opaque: *mut c_void) -> c_int {
    // SAFETY: `opaque` is the flag of a CancelFlag that outlives the format context
    let flag = unsafe { &*(opaque as *const AtomicBool) };
    flag.load(Ordering::SeqCst) as c_int
}

/// `format::input_with_dictionary` plus an interrupt callback wired to `cancel`,
/// so blocked libav I/O returns as soon as the flag is raised.
fn open_input(
    locator: &str,
    options: Dictionary,
    cancel: &CancelFlag,
) -> Result<format::context::Input, ffmpeg_next::Error> {
    let path = CString::new(locator).map_err(|_| ffmpeg_next::Error::InvalidData)?;

    unsafe {
        let mut ps = ffi::avformat_alloc_context();
        if ps.is_null() {
            return Err(ffmpeg_next::Error::Bug);
        }
        (*ps).interrupt_callback = ffi::AVIOInterruptCB {
            callback: Some(interrupt_requested),
            opaque: cancel.as_ptr() as *mut c_void,
        };

        let mut opts = options.disown();
        let res = ffi::avformat_open_input(&mut ps, path.as_ptr(), ptr::null_mut(), &mut opts);
        Dictionary::own(opts);
        // on failure the context has already been freed
        if res < 0 {
            return Err(ffmpeg_next::Error::from(res));
        }

        let res = ffi::avformat_find_stream_info(ps, ptr::null_mut());
        if res < 0 {
            ffi::avformat_close_input(&mut ps);
            return Err(ffmpeg_next::Error::from(res));
        }

        Ok(format::context::Input::wrap(ps))
    }
}

/// Decodes over libavformat/libavcodec. Network locators are fetched without
/// cookies or an authorization header, and only through `protocols`.
#[derive(Clone, Debug)]
pub struct FfmpegBackend {
    io_timeout: Duration,
    protocols: String,
    max_seek_packets: usize,
}

impl FfmpegBackend {
    pub fn new(io_timeout: Duration) -> Self {
        Self {
            io_timeout,
            protocols: NETWORK_PROTOCOLS.to_string(),
            max_seek_packets: MAX_SEEK_PACKETS,
        }
    }

    /// Replaces the libav protocol whitelist, e.g. `"file"` for local clips.
    pub fn with_protocols(mut self, protocols: &str) -> Self {
        self.protocols = protocols.to_string();
        self
    }

    fn open_options(&self, locator: &str) -> Dictionary<'static> {
        let mut opts = Dictionary::new();
        opts.set("rw_timeout", &self.io_timeout.as_micros().to_string());
        opts.set("protocol_whitelist", &self.protocols);
        if locator.starts_with("http://") || locator.starts_with("https://") {
            opts.set("user_agent", USER_AGENT);
            opts.set("reconnect", "1");
            opts.set("reconnect_streamed", "1");
        }
        opts
    }
}

impl MediaBackend for FfmpegBackend {
    type Handle = FfmpegHandle;

    #[allow(clippy::field_reassign_with_default)]
    fn open(&self, locator: &str, cancel: &CancelFlag) -> Result<FfmpegHandle, ThumbnailError> {
        debug!(locator, "Opening video");
        let input = open_input(locator, self.open_options(locator), cancel)
            .inspect_err(|error| warn!(locator, %error, "Failed to open video"))
            .map_err(ThumbnailError::load)?;

        let stream = input
            .streams()
            .best(media::Type::Video)
            .ok_or_else(|| ThumbnailError::load(format!("{locator} has no video stream")))?;
        let stream_index = stream.index();
        let time_base = stream.time_base();
        let start_ts = stream.start_time();
        let stream_duration = stream.duration();

        let mut context = codec::context::Context::from_parameters(stream.parameters())
            .map_err(ThumbnailError::load)?;

        let mut threading_config = threading::Config::default();
        threading_config.count = *NUM_CPUS;
        threading_config.kind = threading::Type::Frame;
        context.set_threading(threading_config);

        let decoder = context
            .decoder()
            .video()
            .map_err(|e| ThumbnailError::load(format!("Video decoder: failed to open: {e}")))?;

        let metadata = VideoMetadata {
            duration: resolve_duration(input.duration(), stream_duration, time_base),
            width: decoder.width(),
            height: decoder.height(),
        };
        debug!(
            locator,
            stream_index,
            time_base = ?time_base,
            start_ts,
            ?metadata,
            "Video metadata ready"
        );

        Ok(FfmpegHandle {
            locator: locator.to_string(),
            input,
            decoder,
            stream_index,
            time_base,
            start_ts,
            max_seek_packets: self.max_seek_packets,
            metadata,
            settled: None,
            cancel: cancel.clone(),
        })
    }
}

/// One open input plus its video decoder.
pub struct FfmpegHandle {
    locator: String,
    input: format::context::Input,
    decoder: codec::decoder::Video,
    stream_index: usize,
    time_base: Rational,
    start_ts: i64,
    max_seek_packets: usize,
    metadata: VideoMetadata,
    settled: Option<frame::Video>,
    // dropped after `input`, whose interrupt callback points into it
    cancel: CancelFlag,
}

impl FfmpegHandle {
    fn cancelled(&self) -> ThumbnailError {
        ThumbnailError::seek(format!("{}: seek cancelled", self.locator))
    }

    /// Decodes forward until a frame at or after `target_ts` appears. Keeps
    /// the latest decoded frame so a seek past the last frame still settles.
    fn decode_until(&mut self, target_ts: i64) -> Result<(), ThumbnailError> {
        let mut decoded = frame::Video::empty();
        let mut packets = 0;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            let mut packet = Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {}
                Err(ffmpeg_next::Error::Eof) => break,
                Err(_) if self.cancel.is_cancelled() => return Err(self.cancelled()),
                Err(error) => {
                    debug!(locator = %self.locator, %error, "Read failed, treating as end of stream");
                    break;
                }
            }

            if packet.stream() != self.stream_index {
                continue;
            }
            packets += 1;
            if packets > self.max_seek_packets {
                warn!(locator = %self.locator, packets, target_ts, "Gave up decoding towards seek target");
                return Err(ThumbnailError::seek(format!(
                    "{} did not reach the seek target within {} packets",
                    self.locator, self.max_seek_packets
                )));
            }

            if let Err(error) = self.decoder.send_packet(&packet) {
                trace!(locator = %self.locator, %error, "Skipping undecodable packet");
                continue;
            }

            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let ts = decoded.timestamp().or(decoded.pts());
                self.settled = Some(std::mem::replace(&mut decoded, frame::Video::empty()));
                if ts.is_none_or(|ts| ts >= target_ts) {
                    trace!(locator = %self.locator, ?ts, target_ts, "Seek settled");
                    return Ok(());
                }
            }
        }

        // drain whatever the decoder still holds
        if self.decoder.send_eof().is_ok() {
            while self.decoder.receive_frame(&mut decoded).is_ok() {
                self.settled = Some(std::mem::replace(&mut decoded, frame::Video::empty()));
            }
        }

        if self.settled.is_some() {
            debug!(locator = %self.locator, target_ts, "Stream ended before target, using last frame");
            Ok(())
        } else {
            Err(ThumbnailError::seek(format!(
                "{} produced no frame after seeking",
                self.locator
            )))
        }
    }
}

impl DecodingHandle for FfmpegHandle {
    fn metadata(&self) -> VideoMetadata {
        self.metadata
    }

    fn seek(&mut self, target: Duration) -> Result<(), ThumbnailError> {
        let position = to_seek_position(target, self.time_base, self.start_ts);
        self.input
            .seek(position, ..position)
            .map_err(|e| ThumbnailError::seek(format!("Seeking video failed: {e}")))?;
        self.decoder.flush();
        self.settled = None;

        self.decode_until(to_stream_ts(target, self.time_base, self.start_ts))
    }

    fn render(&mut self, width: u32, height: u32) -> Result<RgbFrame, ThumbnailError> {
        let frame = self
            .settled
            .as_ref()
            .ok_or_else(|| ThumbnailError::seek("no frame has settled"))?;

        let mut scaler = Scaler::get(
            frame.format(),
            frame.width(),
            frame.height(),
            Pixel::RGB24,
            width,
            height,
            Flags::BILINEAR,
        )
        .map_err(|e| ThumbnailError::encode(format!("Scaler: failed to create: {e}")))?;

        let mut rgb = frame::Video::empty();
        scaler
            .run(frame, &mut rgb)
            .map_err(|e| ThumbnailError::encode(format!("Scaler: failed to run: {e}")))?;

        Ok(RgbFrame {
            width,
            height,
            data: pack_rows(rgb.data(0), rgb.stride(0), width, height),
        })
    }
}

impl Drop for FfmpegHandle {
    fn drop(&mut self) {
        trace!(locator = %self.locator, "Releasing decoding handle");
    }
}
