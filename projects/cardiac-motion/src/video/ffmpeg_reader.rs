use super::VideoReader;
use anyhow::{anyhow, Context, Result};
use ffmpeg_next::codec::decoder;
use ffmpeg_next::codec::packet::Packet;
use ffmpeg_next::ffi;
use ffmpeg_next::format::{context::Input, stream::Stream, Pixel};
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::frame::Video as VideoFrame;
use opencv::{core, prelude::*};
use std::path::Path;

/// Sequential CPU decoder over ffmpeg-next, yielding BGR frames.
pub struct FfmpegReader {
    input: Input,
    decoder: decoder::Video,
    stream_index: usize,
    /// Built from the first decoded frame, whose pixel format is only known then.
    to_bgr: Option<scaling::Context>,
    path: String,
    width: u32,
    height: u32,
    fps: f64,
    frame_count: usize,
    packet: Packet,
    flushing: bool,
}

// SAFETY: a reader is owned by one extraction call at a time and its ffmpeg handles
// never leave that thread while in use.
unsafe impl Send for FfmpegReader {}

/// Average frame rate of `stream`, or 0.0 when the container does not declare one.
fn stream_fps(stream: &Stream) -> f64 {
    let rate = stream.avg_frame_rate();
    if rate.denominator() > 0 {
        rate.numerator() as f64 / rate.denominator() as f64
    } else {
        0.0
    }
}

/// Declared frame count, falling back to duration times fps for containers that
/// leave it blank.
fn estimate_frame_count(stream: &Stream, input: &Input, fps: f64) -> usize {
    let declared = stream.frames().max(0) as usize;
    if declared > 0 {
        return declared;
    }
    let secs = input.duration() as f64 / ffi::AV_TIME_BASE as f64;
    (secs * fps).round().max(0.0) as usize
}

impl FfmpegReader {
    pub fn new(path: &str) -> Result<Self> {
        ffmpeg_next::init().context("FFmpeg initialisation failed")?;
        if !Path::new(path).exists() {
            return Err(anyhow!("No such video: {}", path));
        }

        let input = ffmpeg_next::format::input(&path).context("Container could not be opened")?;
        let stream = input
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video stream", path))?;

        let stream_index = stream.index();
        let fps = stream_fps(&stream);
        if fps == 0.0 {
            tracing::warn!("FfmpegReader: {} declares no frame rate", path);
        }
        let frame_count = estimate_frame_count(&stream, &input, fps);

        let decoder = ffmpeg_next::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video())
            .context("Video decoder could not be opened")?;
        let (width, height) = (decoder.width(), decoder.height());

        tracing::info!(
            "FfmpegReader: {} is {}x{} at {:.2} fps, ~{} frames",
            path,
            width,
            height,
            fps,
            frame_count
        );

        Ok(Self {
            input,
            decoder,
            stream_index,
            to_bgr: None,
            path: path.to_string(),
            width,
            height,
            fps,
            frame_count,
            packet: Packet::empty(),
            flushing: false,
        })
    }

    /// Feed the decoder until it yields a frame. `Ok(false)` means fully drained.
    fn receive(&mut self, out: &mut VideoFrame) -> Result<bool> {
        loop {
            match self.decoder.receive_frame(out) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) if self.flushing => {
                    return Ok(false)
                }
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {}
                Err(e) => return Err(anyhow!("{}: decode failed: {}", self.path, e)),
            }

            if !self.send_next_packet()? {
                self.decoder.send_eof().context("Decoder refused EOF")?;
                self.flushing = true;
            }
        }
    }

    /// Send the next packet of our stream; `false` once the input is exhausted.
    fn send_next_packet(&mut self) -> Result<bool> {
        while self.packet.read(&mut self.input).is_ok() {
            if self.packet.stream() != self.stream_index {
                continue;
            }
            self.decoder
                .send_packet(&self.packet)
                .context("Decoder rejected packet")?;
            return Ok(true);
        }
        Ok(false)
    }

    fn convert(&mut self, frame: &VideoFrame) -> Result<VideoFrame> {
        let (width, height) = (self.width, self.height);
        let ctx = match &mut self.to_bgr {
            Some(ctx) => ctx,
            slot => slot.insert(
                scaling::Context::get(
                    frame.format(),
                    width,
                    height,
                    Pixel::BGR24,
                    width,
                    height,
                    scaling::Flags::BILINEAR,
                )
                .context("BGR converter could not be created")?,
            ),
        };
        let mut bgr = VideoFrame::empty();
        ctx.run(frame, &mut bgr).context("BGR conversion failed")?;
        Ok(bgr)
    }
}

/// Copy a packed BGR24 frame into an owned `Mat`, dropping row padding.
fn bgr_to_mat(frame: &VideoFrame) -> Result<core::Mat> {
    let (cols, rows) = (frame.width() as i32, frame.height() as i32);
    let row_len = cols as usize * 3;
    let stride = frame.stride(0);
    let plane = frame.data(0);

    let mut mat =
        core::Mat::new_rows_cols_with_default(rows, cols, core::CV_8UC3, core::Scalar::all(0.0))?;
    for (r, row) in plane.chunks(stride).take(rows as usize).enumerate() {
        let dst = mat.ptr_mut(r as i32)?;
        // SAFETY: row `r` of `mat` is `row_len` contiguous bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(row[..row_len].as_ptr(), dst, row_len);
        }
    }
    Ok(mat)
}

impl VideoReader for FfmpegReader {
    fn dimensions(&self) -> (i32, i32) {
        (self.width as i32, self.height as i32)
    }

    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn source_fps(&self) -> f64 {
        self.fps
    }

    fn next_frame(&mut self) -> Result<Option<core::Mat>> {
        let mut decoded = VideoFrame::empty();
        if !self.receive(&mut decoded)? {
            return Ok(None);
        }
        let bgr = self.convert(&decoded)?;
        bgr_to_mat(&bgr).map(Some)
    }
}
