use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use ffmpeg::util::frame::video::Video;
use ffmpeg_next::{self as ffmpeg, codec, decoder, format, media, software};
use image::codecs::jpeg;
use image::{ImageBuffer, Rgb, RgbImage};
use tempfile::TempPath;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};

static INIT: OnceLock<std::result::Result<(), ffmpeg::Error>> = OnceLock::new();

pub(crate) fn init() -> anyhow::Result<()> {
    INIT.get_or_init(|| {
        ffmpeg::init()?;
        ffmpeg::util::log::set_level(ffmpeg::util::log::Level::Error);
        Ok(())
    })
    .clone()
    .map_err(anyhow::Error::from)
}

/// One decoded video frame, re-encoded as a standalone JPEG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub index: usize,
    pub jpeg: Vec<u8>,
}

/// The uploaded video persisted to temporary storage. The file is removed
/// when the asset is dropped or released.
#[derive(Debug)]
pub struct VideoAsset {
    path: TempPath,
    duration: f64,
}

impl VideoAsset {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Declared duration in seconds; `0.0` when the container does not say.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn release(self) {
        let path = self.path.to_path_buf();
        if let Err(e) = self.path.close() {
            tracing::warn!(path = %path.display(), "failed to remove source video: {e}");
        }
    }
}

#[derive(Debug)]
pub struct CapturedVideo {
    /// Every decoded frame in presentation order.
    pub frames: Vec<Frame>,
    pub asset: VideoAsset,
}

/// Persists `video` to a temporary file and decodes every frame of its best
/// video stream.
///
/// A container that cannot be opened, or has no video stream, yields an empty
/// frame sequence rather than an error; callers that need frames decide
/// whether that is fatal.
pub fn decode_video(video: &[u8], config: &PipelineConfig) -> Result<CapturedVideo> {
    init().map_err(PipelineError::Decode)?;

    let mut file = config.temp_file("narrator-src-", ".mp4")?;
    file.write_all(video)?;
    file.flush()?;
    let path = file.into_temp_path();

    let (frames, duration) = match format::input(&path) {
        Ok(mut input) => {
            let duration = container_duration(&input);
            let frames = capture_jpeg_frames(&mut input).map_err(PipelineError::Decode)?;
            (frames, duration)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "cannot open video container: {e}");
            (Vec::new(), 0.0)
        }
    };

    tracing::info!(frames = frames.len(), duration, "frames read");

    Ok(CapturedVideo {
        frames,
        asset: VideoAsset { path, duration },
    })
}

pub(crate) fn container_duration(input: &format::context::Input) -> f64 {
    if input.duration() > 0 {
        return input.duration() as f64 / f64::from(ffmpeg::ffi::AV_TIME_BASE);
    }
    input
        .streams()
        .best(media::Type::Video)
        .filter(|stream| stream.duration() > 0)
        .map(|stream| stream.duration() as f64 * f64::from(stream.time_base()))
        .unwrap_or(0.0)
}

fn capture_jpeg_frames(input: &mut format::context::Input) -> anyhow::Result<Vec<Frame>> {
    let Some(video_stream) = input.streams().best(media::Type::Video) else {
        tracing::warn!("container has no video stream");
        return Ok(Vec::new());
    };
    let video_stream_index = video_stream.index();
    let mut decoder = codec::context::Context::from_parameters(video_stream.parameters())?
        .decoder()
        .video()?;

    let mut scaler = software::scaling::context::Context::get(
        decoder.format(),
        decoder.width(),
        decoder.height(),
        format::Pixel::RGB24,
        decoder.width(),
        decoder.height(),
        software::scaling::Flags::BILINEAR,
    )?;

    let mut frames = Vec::new();
    let mut receive_and_encode_decoded_frames =
        |decoder: &mut decoder::Video| -> anyhow::Result<()> {
            let mut decoded = Video::empty();
            while decoder.receive_frame(&mut decoded).is_ok() {
                let mut rgb_frame = Video::empty();
                scaler.run(&decoded, &mut rgb_frame)?;
                let jpeg = encode_jpeg(&rgb_frame)?;
                frames.push(Frame {
                    index: frames.len(),
                    jpeg,
                });
            }
            Ok(())
        };

    for (stream, packet) in input.packets() {
        if stream.index() == video_stream_index {
            decoder.send_packet(&packet)?;
            receive_and_encode_decoded_frames(&mut decoder)?;
        }
    }
    decoder.send_eof()?;
    receive_and_encode_decoded_frames(&mut decoder)?;

    Ok(frames)
}

/// Encodes a packed RGB24 frame. Rows may be padded past `width * 3`.
fn encode_jpeg(rgb_frame: &Video) -> anyhow::Result<Vec<u8>> {
    let width = rgb_frame.width();
    let height = rgb_frame.height();
    let row_len = width as usize * 3;
    let stride = rgb_frame.stride(0);
    let data = rgb_frame.data(0);

    let mut pixels = Vec::with_capacity(row_len * height as usize);
    for row in data.chunks(stride).take(height as usize) {
        pixels.extend_from_slice(&row[..row_len]);
    }
    let image_buffer = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, pixels)
        .ok_or(anyhow::anyhow!("Failed to create image buffer"))?;
    jpeg_from_rgb(&image_buffer)
}

pub(crate) fn jpeg_from_rgb(image_buffer: &RgbImage) -> anyhow::Result<Vec<u8>> {
    let mut jpeg_data = Vec::new();
    let mut encoder = jpeg::JpegEncoder::new_with_quality(&mut jpeg_data, 90);
    encoder.encode(
        image_buffer,
        image_buffer.width(),
        image_buffer.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(jpeg_data)
}
