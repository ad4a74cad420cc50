#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::Mutex;

use async_openai::types::CreateChatCompletionRequest;
use bytes::Bytes;
use ffmpeg::encoder;
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video;
use ffmpeg_next::channel_layout::ChannelLayout;
use ffmpeg_next::{self as ffmpeg, codec, format, Packet, Rational};
use futures_util::{stream, StreamExt};
use narrator::ai::speech::{SpeechReply, SpeechRequest, SpeechTransport};
use narrator::ai::vision::VisionInference;
use narrator::ai::Completion;
use narrator::config::PipelineConfig;
use reqwest::StatusCode;

pub const WIDTH: u32 = 320;
pub const HEIGHT: u32 = 240;

/// Sample rate of the audio track written by [`write_test_video_with_audio`].
pub const SOURCE_AUDIO_RATE: i32 = 16_000;

/// Writes a silent MPEG-4 video of `frames` frames at `fps`, fading from
/// black to white.
pub fn write_test_video(path: &Path, frames: usize, fps: i32) -> anyhow::Result<()> {
    write_fixture(path, frames, fps, None)
}

/// Like [`write_test_video`] but with a mono PCM track of `audio_seconds`
/// alongside the picture. Use a `.mkv` path.
pub fn write_test_video_with_audio(
    path: &Path,
    frames: usize,
    fps: i32,
    audio_seconds: f32,
) -> anyhow::Result<()> {
    write_fixture(path, frames, fps, Some(audio_seconds))
}

fn drain_encoder(
    encoder: &mut encoder::Encoder,
    stream_index: usize,
    encoder_time_base: Rational,
    output: &mut format::context::Output,
) -> anyhow::Result<()> {
    let stream_time_base = output
        .stream(stream_index)
        .ok_or(anyhow::anyhow!("missing output stream"))?
        .time_base();
    let mut packet = Packet::empty();
    while encoder.receive_packet(&mut packet).is_ok() {
        packet.set_stream(stream_index);
        packet.rescale_ts(encoder_time_base, stream_time_base);
        packet.write_interleaved(output)?;
    }
    Ok(())
}

fn write_fixture(
    path: &Path,
    frames: usize,
    fps: i32,
    audio_seconds: Option<f32>,
) -> anyhow::Result<()> {
    ffmpeg::init()?;
    let mut output = format::output(&path)?;
    let global_header = output
        .format()
        .flags()
        .contains(format::Flags::GLOBAL_HEADER);

    let codec = encoder::find(codec::Id::MPEG4).ok_or(anyhow::anyhow!("no MPEG-4 encoder"))?;
    let mut output_stream = output.add_stream(codec)?;
    let mut encoder = codec::context::Context::new_with_codec(codec)
        .encoder()
        .video()?;
    encoder.set_width(WIDTH);
    encoder.set_height(HEIGHT);
    encoder.set_format(format::Pixel::YUV420P);
    encoder.set_time_base(Rational(1, fps));
    encoder.set_frame_rate(Some(Rational(fps, 1)));
    if global_header {
        encoder.set_flags(codec::Flags::GLOBAL_HEADER);
    }
    let mut encoder = encoder.open_as(codec)?;
    output_stream.set_time_base(Rational(1, fps));
    output_stream.set_parameters(&encoder);

    let audio_time_base = Rational(1, SOURCE_AUDIO_RATE);
    let mut audio_encoder = match audio_seconds {
        Some(_) => {
            let codec = encoder::find(codec::Id::PCM_S16LE)
                .ok_or(anyhow::anyhow!("no PCM encoder"))?;
            let mut audio_stream = output.add_stream(codec)?;
            let mut audio_encoder = codec::context::Context::new_with_codec(codec)
                .encoder()
                .audio()?;
            audio_encoder.set_rate(SOURCE_AUDIO_RATE);
            audio_encoder.set_channel_layout(ChannelLayout::MONO);
            audio_encoder.set_format(format::Sample::I16(format::sample::Type::Packed));
            audio_encoder.set_time_base(audio_time_base);
            if global_header {
                audio_encoder.set_flags(codec::Flags::GLOBAL_HEADER);
            }
            let audio_encoder = audio_encoder.open_as(codec)?;
            audio_stream.set_time_base(audio_time_base);
            audio_stream.set_parameters(&audio_encoder);
            Some(audio_encoder)
        }
        None => None,
    };

    output.write_header()?;

    for index in 0..frames {
        let mut frame = Video::new(format::Pixel::YUV420P, WIDTH, HEIGHT);
        frame.data_mut(0).fill((index * 255 / frames.max(1)) as u8);
        frame.data_mut(1).fill(128);
        frame.data_mut(2).fill(128);
        frame.set_pts(Some(index as i64));
        encoder.send_frame(&frame)?;
        drain_encoder(&mut encoder, 0, Rational(1, fps), &mut output)?;
    }
    encoder.send_eof()?;
    drain_encoder(&mut encoder, 0, Rational(1, fps), &mut output)?;

    if let (Some(audio_encoder), Some(seconds)) = (audio_encoder.as_mut(), audio_seconds) {
        let total = (seconds * SOURCE_AUDIO_RATE as f32) as usize;
        let mut written = 0;
        while written < total {
            let count = (total - written).min(1024);
            let mut frame = AudioFrame::new(
                format::Sample::I16(format::sample::Type::Packed),
                count,
                ChannelLayout::MONO,
            );
            frame.set_rate(SOURCE_AUDIO_RATE as u32);
            for (offset, sample) in frame.plane_mut::<i16>(0).iter_mut().enumerate() {
                *sample = if (written + offset) / 20 % 2 == 0 { 4000 } else { -4000 };
            }
            frame.set_pts(Some(written as i64));
            audio_encoder.send_frame(&frame)?;
            drain_encoder(audio_encoder, 1, audio_time_base, &mut output)?;
            written += count;
        }
        audio_encoder.send_eof()?;
        drain_encoder(audio_encoder, 1, audio_time_base, &mut output)?;
    }

    output.write_trailer()?;
    Ok(())
}

/// A mono 16-bit WAV sine tone.
pub fn tone_wav(seconds: f32, sample_rate: u32) -> Vec<u8> {
    tone_wav_channels(seconds, sample_rate, 1)
}

/// A plain (non-extensible) 16-bit PCM WAV with the same tone on every channel.
pub fn tone_wav_channels(seconds: f32, sample_rate: u32, channels: u16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut buffer = Vec::new();
    let mut writer = hound::WavWriter::new(Cursor::new(&mut buffer), spec).unwrap();
    let samples = (seconds * sample_rate as f32) as u32;
    for n in 0..samples {
        let t = n as f32 / sample_rate as f32;
        let sample = (t * 440.0 * std::f32::consts::TAU).sin() * 0.3;
        for _ in 0..channels {
            writer.write_sample((sample * i16::MAX as f32) as i16).unwrap();
        }
    }
    writer.finalize().unwrap();
    buffer
}

pub fn test_video_bytes(frames: usize, fps: i32) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fixture.mp4");
    write_test_video(&path, frames, fps).unwrap();
    std::fs::read(&path).unwrap()
}

pub fn pipeline_config_in(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        temp_dir: Some(dir.to_path_buf()),
        ..PipelineConfig::default()
    }
}

pub fn leftover_files(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

/// Replies with a fixed completion and keeps every request as JSON.
pub struct ScriptedVision {
    reply: Completion,
    pub requests: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedVision {
    pub fn new(reply: Completion) -> Self {
        Self {
            reply,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl VisionInference for &ScriptedVision {
    async fn complete(&self, request: CreateChatCompletionRequest) -> Completion {
        self.requests
            .lock()
            .unwrap()
            .push(serde_json::to_value(&request).unwrap());
        self.reply.clone()
    }
}

/// Streams a fixed body in 4 KiB chunks with the given status.
pub struct ScriptedSpeech {
    status: StatusCode,
    body: Vec<u8>,
    pub inputs: Mutex<Vec<String>>,
}

impl ScriptedSpeech {
    pub fn new(status: StatusCode, body: Vec<u8>) -> Self {
        Self {
            status,
            body,
            inputs: Mutex::new(Vec::new()),
        }
    }
}

impl SpeechTransport for &ScriptedSpeech {
    async fn post(&self, request: &SpeechRequest) -> narrator::Result<SpeechReply> {
        self.inputs.lock().unwrap().push(request.input.clone());
        let chunks = self
            .body
            .chunks(4096)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect::<Vec<Result<Bytes, String>>>();
        Ok(SpeechReply {
            status: self.status,
            body: stream::iter(chunks).boxed(),
        })
    }
}
