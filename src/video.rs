use std::path::Path;

use ffmpeg::encoder;
use ffmpeg::util::frame::{audio::Audio, video::Video};
use ffmpeg_next::{
    self as ffmpeg, codec, decoder, filter, format, media, picture, software, Dictionary,
    Error, Frame, Packet, Rational,
};
use ffmpeg_next::channel_layout::ChannelLayout;
use tempfile::TempPath;

use crate::ai::speech::AudioAsset;
use crate::capture::{self, VideoAsset};
use crate::config::{AudioFit, PipelineConfig};
use crate::error::{PipelineError, Result};

const AUDIO_BIT_RATE: usize = 128_000;

/// The narrated video on temporary storage. Dropping it deletes the file, so
/// callers copy it out with [`OutputVideoAsset::deliver`] first.
#[derive(Debug)]
pub struct OutputVideoAsset {
    path: TempPath,
}

impl OutputVideoAsset {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copies the video to `destination`, returning the number of bytes written.
    pub fn deliver(&self, destination: &Path) -> Result<u64> {
        Ok(std::fs::copy(&self.path, destination)?)
    }

    pub fn release(self) {
        let path = self.path.to_path_buf();
        if let Err(e) = self.path.close() {
            tracing::warn!(path = %path.display(), "failed to remove narrated video: {e}");
        }
    }
}

/// What a container holds, as far as the narration output cares.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaInfo {
    pub duration: f64,
    pub video_frames: usize,
    pub audio_tracks: usize,
    pub video_tracks: usize,
    /// Length of the first audio track in seconds, 0 when there is none.
    pub audio_duration: f64,
    pub audio_channels: u16,
}

pub fn probe(path: &Path) -> anyhow::Result<MediaInfo> {
    capture::init()?;
    let mut input = format::input(&path)?;
    let duration = capture::container_duration(&input);
    let video_tracks = input
        .streams()
        .filter(|stream| stream.parameters().medium() == media::Type::Video)
        .count();
    let audio_tracks = input
        .streams()
        .filter(|stream| stream.parameters().medium() == media::Type::Audio)
        .count();
    let (audio_duration, audio_channels) = match input.streams().best(media::Type::Audio) {
        Some(stream) => {
            let decoder = codec::context::Context::from_parameters(stream.parameters())?
                .decoder()
                .audio()?;
            let duration = if stream.duration() > 0 {
                stream.duration() as f64 * f64::from(stream.time_base())
            } else {
                0.0
            };
            (duration, decoder.channels())
        }
        None => (0.0, 0),
    };
    let best_video = input
        .streams()
        .best(media::Type::Video)
        .map(|stream| stream.index());
    let video_frames = match best_video {
        Some(index) => input
            .packets()
            .filter(|(stream, _)| stream.index() == index)
            .count(),
        None => 0,
    };
    Ok(MediaInfo {
        duration,
        video_frames,
        audio_tracks,
        video_tracks,
        audio_duration,
        audio_channels,
    })
}

trait Transcoder {
    fn flush_filter_graph(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn receive_and_process_filtered_frames(
        &mut self,
        _output: &mut format::context::Output,
        _output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn send_packet_to_decoder(&mut self, packet: &Packet) -> anyhow::Result<()>;

    fn send_eof_to_decoder(&mut self) -> anyhow::Result<()>;

    fn receive_and_process_decoded_frames(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()>;

    fn send_eof_to_encoder(&mut self) -> anyhow::Result<()>;

    fn receive_and_process_encoded_packets(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()>;

    /// Drains decoder, filter graph and encoder in that order.
    fn finish(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        self.send_eof_to_decoder()?;
        self.receive_and_process_decoded_frames(output, output_stream_time_base)?;
        self.flush_filter_graph()?;
        self.receive_and_process_filtered_frames(output, output_stream_time_base)?;
        self.send_eof_to_encoder()?;
        self.receive_and_process_encoded_packets(output, output_stream_time_base)
    }
}

/// Re-encodes the source picture track as H.264 / yuv420p.
struct VideoTranscoder {
    output_stream_index: usize,
    decoder: decoder::Video,
    encoder: encoder::Video,
    scaler: Option<software::scaling::Context>,
    input_time_base: Rational,
    first_timestamp: Option<i64>,
}

impl VideoTranscoder {
    fn new(
        input_stream: &format::stream::Stream,
        output: &mut format::context::Output,
        output_stream_index: usize,
    ) -> anyhow::Result<Self> {
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);
        let decoder = codec::context::Context::from_parameters(input_stream.parameters())?
            .decoder()
            .video()?;

        let codec = encoder::find(codec::Id::H264)
            .ok_or(anyhow::anyhow!("H.264 encoder is not available"))?;
        let mut output_stream = output.add_stream(codec)?;
        let mut encoder = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        encoder.set_height(decoder.height());
        encoder.set_width(decoder.width());
        encoder.set_aspect_ratio(decoder.aspect_ratio());
        encoder.set_format(format::Pixel::YUV420P);
        encoder.set_frame_rate(
            decoder
                .frame_rate()
                .or(Some(input_stream.avg_frame_rate())),
        );
        encoder.set_time_base(input_stream.time_base());
        output_stream.set_time_base(input_stream.time_base());

        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = Dictionary::new();
        opts.set("preset", "medium");

        let opened_encoder = encoder.open_with(opts)?;
        output_stream.set_parameters(&opened_encoder);

        let scaler = if decoder.format() == format::Pixel::YUV420P {
            None
        } else {
            Some(software::scaling::Context::get(
                decoder.format(),
                decoder.width(),
                decoder.height(),
                format::Pixel::YUV420P,
                decoder.width(),
                decoder.height(),
                software::scaling::Flags::BILINEAR,
            )?)
        };

        Ok(Self {
            output_stream_index,
            decoder,
            encoder: opened_encoder,
            scaler,
            input_time_base: input_stream.time_base(),
            first_timestamp: None,
        })
    }

    fn send_frame_to_encoder(&mut self, frame: &Video) -> anyhow::Result<()> {
        match self.scaler.as_mut() {
            Some(scaler) => {
                let mut converted = Video::empty();
                scaler.run(frame, &mut converted)?;
                converted.set_pts(frame.pts());
                converted.set_kind(picture::Type::None);
                self.encoder.send_frame(&converted)?;
            }
            None => self.encoder.send_frame(frame)?,
        }
        Ok(())
    }
}

impl Transcoder for VideoTranscoder {
    fn send_packet_to_decoder(&mut self, packet: &Packet) -> anyhow::Result<()> {
        self.decoder
            .send_packet(packet)
            .map_err(anyhow::Error::from)
    }

    fn send_eof_to_decoder(&mut self) -> anyhow::Result<()> {
        self.decoder.send_eof().map_err(anyhow::Error::from)
    }

    fn receive_and_process_decoded_frames(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut frame = Video::empty();
        while self.decoder.receive_frame(&mut frame).is_ok() {
            let timestamp = frame.timestamp().ok_or(anyhow::anyhow!("No timestamp"))?;
            let start = *self.first_timestamp.get_or_insert(timestamp);
            frame.set_pts(Some(timestamp - start));
            frame.set_kind(picture::Type::None);
            self.send_frame_to_encoder(&frame)?;
            self.receive_and_process_encoded_packets(output, output_stream_time_base)?;
        }
        Ok(())
    }

    fn send_eof_to_encoder(&mut self) -> anyhow::Result<()> {
        self.encoder.send_eof().map_err(anyhow::Error::from)
    }

    fn receive_and_process_encoded_packets(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.output_stream_index);
            packet.rescale_ts(self.input_time_base, output_stream_time_base);
            packet.write_interleaved(output)?;
        }
        Ok(())
    }
}

/// Decodes the narration and re-encodes it as AAC through a filter graph.
/// Timestamps are regenerated from the sample count, so the track always
/// starts at zero.
struct AudioTranscoder {
    output_stream_index: usize,
    decoder: decoder::Audio,
    encoder: encoder::Audio,
    filter_graph: filter::Graph,
    time_base: Rational,
    next_pts: i64,
}

impl AudioTranscoder {
    fn new(
        input_stream: &format::stream::Stream,
        output: &mut format::context::Output,
        output_stream_index: usize,
        filter_spec: &str,
    ) -> anyhow::Result<Self> {
        let global_header = output
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);
        let decoder = codec::context::Context::from_parameters(input_stream.parameters())?
            .decoder()
            .audio()?;

        let codec = encoder::find(codec::Id::AAC)
            .ok_or(anyhow::anyhow!(Error::EncoderNotFound))?
            .audio()?;
        let mut output_stream = output.add_stream(codec)?;
        let context = codec::context::Context::from_parameters(output_stream.parameters())?;
        let mut encoder = context.encoder().audio()?;

        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let channel_layout = codec
            .channel_layouts()
            .map(|layouts| layouts.best(source_channel_layout(&decoder).channels()))
            .unwrap_or(ChannelLayout::STEREO);

        let time_base = Rational(1, decoder.rate() as i32);
        encoder.set_channel_layout(channel_layout);
        encoder.set_rate(decoder.rate() as _);
        encoder.set_format(
            codec
                .formats()
                .ok_or(anyhow::anyhow!("Unknown supported formats"))?
                .next()
                .ok_or(anyhow::anyhow!("Failed to get sample format"))?,
        );
        encoder.set_bit_rate(AUDIO_BIT_RATE);
        encoder.set_time_base(time_base);
        output_stream.set_time_base(time_base);

        let opened_encoder = encoder.open_as(codec)?;
        output_stream.set_parameters(&opened_encoder);

        let filter_graph = Self::filter_graph(filter_spec, &decoder, &opened_encoder, time_base)?;

        Ok(Self {
            output_stream_index,
            decoder,
            encoder: opened_encoder,
            filter_graph,
            time_base,
            next_pts: 0,
        })
    }

    fn filter_graph(
        spec: &str,
        decoder: &codec::decoder::Audio,
        encoder: &codec::encoder::Audio,
        time_base: Rational,
    ) -> anyhow::Result<filter::Graph> {
        let mut filter_graph = filter::Graph::new();

        let args = format!(
            "time_base={}:sample_rate={}:sample_fmt={}:channel_layout=0x{:x}",
            time_base,
            decoder.rate(),
            decoder.format().name(),
            source_channel_layout(decoder).bits()
        );

        filter_graph.add(
            &filter::find("abuffer").ok_or(anyhow::anyhow!("Failed to find filter"))?,
            "in",
            &args,
        )?;
        filter_graph.add(
            &filter::find("abuffersink").ok_or(anyhow::anyhow!("Failed to find filter"))?,
            "out",
            "",
        )?;

        {
            let mut out = filter_graph
                .get("out")
                .ok_or(anyhow::anyhow!("Failed to get filter"))?;
            out.set_sample_format(encoder.format());
            out.set_channel_layout(encoder.channel_layout());
            out.set_sample_rate(encoder.rate());
        }

        filter_graph.output("in", 0)?.input("out", 0)?.parse(spec)?;
        filter_graph.validate()?;

        tracing::debug!(graph = %filter_graph.dump(), "audio filter graph");

        if let Some(codec) = encoder.codec() {
            if !codec
                .capabilities()
                .contains(ffmpeg::codec::capabilities::Capabilities::VARIABLE_FRAME_SIZE)
            {
                filter_graph
                    .get("out")
                    .ok_or(anyhow::anyhow!("Failed to get filter"))?
                    .sink()
                    .set_frame_size(encoder.frame_size());
            }
        }

        Ok(filter_graph)
    }

    fn add_frame_to_filter_graph(&mut self, frame: &Frame) -> anyhow::Result<()> {
        self.filter_graph
            .get("in")
            .ok_or(anyhow::anyhow!("Failed to get filter"))?
            .source()
            .add(frame)
            .map_err(|e| anyhow::anyhow!(e))
    }
}

impl Transcoder for AudioTranscoder {
    fn flush_filter_graph(&mut self) -> anyhow::Result<()> {
        self.filter_graph
            .get("in")
            .ok_or(anyhow::anyhow!("Failed to get filter"))?
            .source()
            .flush()
            .map_err(|e| anyhow::anyhow!(e))
    }

    fn receive_and_process_filtered_frames(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut frame = Audio::empty();
        while self
            .filter_graph
            .get("out")
            .ok_or(anyhow::anyhow!("Failed to get filter"))?
            .sink()
            .frame(&mut frame)
            .is_ok()
        {
            self.encoder.send_frame(&frame)?;
            self.receive_and_process_encoded_packets(output, output_stream_time_base)?;
        }
        Ok(())
    }

    fn send_packet_to_decoder(&mut self, packet: &Packet) -> anyhow::Result<()> {
        self.decoder
            .send_packet(packet)
            .map_err(anyhow::Error::from)
    }

    fn send_eof_to_decoder(&mut self) -> anyhow::Result<()> {
        self.decoder.send_eof().map_err(anyhow::Error::from)
    }

    fn receive_and_process_decoded_frames(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut frame = Audio::empty();
        while self.decoder.receive_frame(&mut frame).is_ok() {
            frame.set_pts(Some(self.next_pts));
            self.next_pts += frame.samples() as i64;
            self.add_frame_to_filter_graph(&frame)?;
            self.receive_and_process_filtered_frames(output, output_stream_time_base)?;
        }
        Ok(())
    }

    fn send_eof_to_encoder(&mut self) -> anyhow::Result<()> {
        self.encoder.send_eof().map_err(anyhow::Error::from)
    }

    fn receive_and_process_encoded_packets(
        &mut self,
        output: &mut format::context::Output,
        output_stream_time_base: Rational,
    ) -> anyhow::Result<()> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.output_stream_index);
            packet.rescale_ts(self.time_base, output_stream_time_base);
            packet.write_interleaved(output)?;
        }
        Ok(())
    }
}

/// Layout of the decoded narration. Plain PCM WAV leaves it unspecified, so
/// fall back to the default layout for the channel count.
fn source_channel_layout(decoder: &codec::decoder::Audio) -> ChannelLayout {
    let layout = decoder.channel_layout();
    if layout.bits() == 0 {
        ChannelLayout::default(decoder.channels() as i32)
    } else {
        layout
    }
}

/// Filter chain that fits the narration to `video_duration` seconds.
fn audio_filter_spec(fit: AudioFit, video_duration: f64) -> String {
    match fit {
        AudioFit::PadOrTrim if video_duration > 0.0 => format!(
            "apad=whole_dur={video_duration:.3},atrim=end={video_duration:.3}"
        ),
        _ => "anull".to_owned(),
    }
}

fn packet_seconds(packet: &Packet, time_base: Rational) -> f64 {
    packet
        .dts()
        .or(packet.pts())
        .map(|ts| ts as f64 * f64::from(time_base))
        .unwrap_or(0.0)
}

/// Writes `output_path` with the picture track of `video_path` and the first
/// audio track of `audio_path`. Any audio in the source video is dropped.
pub fn mux_files(
    video_path: &Path,
    audio_path: &Path,
    output_path: &Path,
    fit: AudioFit,
) -> anyhow::Result<()> {
    capture::init()?;

    let mut video_input = format::input(&video_path)?;
    let mut audio_input = format::input(&audio_path)?;
    let mut output = format::output(&output_path)?;

    let video_duration = capture::container_duration(&video_input);
    let filter_spec = audio_filter_spec(fit, video_duration);
    tracing::debug!(video_duration, %filter_spec, "muxing narration");

    let video_stream = video_input
        .streams()
        .best(media::Type::Video)
        .ok_or(anyhow::anyhow!("source has no video stream"))?;
    let video_stream_index = video_stream.index();
    let video_time_base = video_stream.time_base();
    let mut video = VideoTranscoder::new(&video_stream, &mut output, 0)?;

    let audio_stream = audio_input
        .streams()
        .best(media::Type::Audio)
        .ok_or(anyhow::anyhow!("narration has no audio stream"))?;
    let audio_stream_index = audio_stream.index();
    let audio_time_base = audio_stream.time_base();
    let mut audio = AudioTranscoder::new(&audio_stream, &mut output, 1, &filter_spec)?;

    output.set_metadata(video_input.metadata().to_owned());
    output.write_header()?;

    let video_ost_time_base = output
        .stream(0)
        .ok_or(anyhow::anyhow!(Error::StreamNotFound))?
        .time_base();
    let audio_ost_time_base = output
        .stream(1)
        .ok_or(anyhow::anyhow!(Error::StreamNotFound))?
        .time_base();

    {
        let mut video_packets = video_input
            .packets()
            .filter_map(|(stream, packet)| (stream.index() == video_stream_index).then_some(packet))
            .peekable();
        let mut audio_packets = audio_input
            .packets()
            .filter_map(|(stream, packet)| (stream.index() == audio_stream_index).then_some(packet))
            .peekable();

        // Feed whichever source is behind so the muxer sees roughly ordered packets.
        loop {
            let take_video = match (video_packets.peek(), audio_packets.peek()) {
                (None, None) => break,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (Some(v), Some(a)) => {
                    packet_seconds(v, video_time_base) <= packet_seconds(a, audio_time_base)
                }
            };
            if take_video {
                if let Some(packet) = video_packets.next() {
                    video.send_packet_to_decoder(&packet)?;
                    video.receive_and_process_decoded_frames(&mut output, video_ost_time_base)?;
                }
            } else if let Some(packet) = audio_packets.next() {
                audio.send_packet_to_decoder(&packet)?;
                audio.receive_and_process_decoded_frames(&mut output, audio_ost_time_base)?;
            }
        }
    }

    video.finish(&mut output, video_ost_time_base)?;
    audio.finish(&mut output, audio_ost_time_base)?;
    output.write_trailer()?;

    drop(video_input);
    drop(audio_input);
    Ok(())
}

/// Muxes the narration onto the source video. The output replaces the
/// video's audio entirely and is always H.264 + AAC.
pub fn mux(
    video: &VideoAsset,
    audio: &AudioAsset,
    config: &PipelineConfig,
) -> Result<OutputVideoAsset> {
    let path = config.temp_file("narrator-out-", ".mp4")?.into_temp_path();
    mux_files(video.path(), audio.path(), &path, config.audio_fit).map_err(PipelineError::Mux)?;
    tracing::info!(path = %path.display(), "narrated video written");
    Ok(OutputVideoAsset { path })
}
