use std::path::Path;

use crate::ai::speech::{HttpSpeech, SpeechSynthesizer, SpeechTransport};
use crate::ai::vision::{NarrationGenerator, OpenAiVision, VisionInference};
use crate::capture::{self, CapturedVideo};
use crate::config::{PipelineConfig, Settings};
use crate::error::{PipelineError, Result};
use crate::keyframes::select_keyframes;
use crate::video::{self, OutputVideoAsset};

/// Progress of a single run. `Failed` is reachable from every state before
/// `Cleaned`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    FramesExtracted,
    NarrationReady,
    AudioReady,
    Muxed,
    Cleaned,
    Failed,
}

/// A finished run, valid only for the duration of the delivery callback.
#[derive(Debug)]
pub struct NarratedVideo {
    narration: String,
    audio_bytes: usize,
    output: OutputVideoAsset,
}

impl NarratedVideo {
    pub fn narration(&self) -> &str {
        &self.narration
    }

    /// Size of the synthesized speech audio.
    pub fn audio_bytes(&self) -> usize {
        self.audio_bytes
    }

    pub fn output(&self) -> &OutputVideoAsset {
        &self.output
    }

    pub fn path(&self) -> &Path {
        self.output.path()
    }
}

pub struct Pipeline<V, S> {
    narrator: NarrationGenerator<V>,
    synthesizer: SpeechSynthesizer<S>,
    config: PipelineConfig,
    state: PipelineState,
}

impl Pipeline<OpenAiVision, HttpSpeech> {
    /// Builds a pipeline talking to the OpenAI endpoints in `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        settings.pipeline.validate()?;
        let vision = OpenAiVision::new(&settings.inference, &settings.vision)?;
        let speech = HttpSpeech::new(&settings.inference, &settings.speech);
        Self::new(
            NarrationGenerator::new(vision, &settings.vision, &settings.pipeline),
            SpeechSynthesizer::new(speech, &settings.speech, &settings.pipeline),
            settings.pipeline.clone(),
        )
    }
}

impl<V: VisionInference, S: SpeechTransport> Pipeline<V, S> {
    /// Fails with [`PipelineError::Config`] when `config` does not validate.
    pub fn new(
        narrator: NarrationGenerator<V>,
        synthesizer: SpeechSynthesizer<S>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            narrator,
            synthesizer,
            config,
            state: PipelineState::Idle,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::info!(from = ?self.state, to = ?next, "pipeline state");
        self.state = next;
    }

    /// Narrates `video` following `prompt` and hands the result to `deliver`.
    ///
    /// Every temporary file created along the way is gone when this returns,
    /// whether the run succeeded or not.
    pub async fn run<T>(
        &mut self,
        video: Vec<u8>,
        prompt: &str,
        deliver: impl FnOnce(&NarratedVideo) -> Result<T>,
    ) -> Result<T> {
        self.state = PipelineState::Idle;
        let narrated = match self.produce(video, prompt).await {
            Ok(narrated) => narrated,
            Err(e) => return Err(self.fail(e)),
        };

        match deliver(&narrated) {
            Ok(delivered) => {
                narrated.output.release();
                self.transition(PipelineState::Cleaned);
                Ok(delivered)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, error: PipelineError) -> PipelineError {
        tracing::error!(state = ?self.state, "narration failed: {error}");
        self.transition(PipelineState::Failed);
        error
    }

    async fn produce(&mut self, video: Vec<u8>, prompt: &str) -> Result<NarratedVideo> {
        let config = self.config.clone();
        let CapturedVideo { frames, asset } =
            tokio::task::spawn_blocking(move || capture::decode_video(&video, &config))
                .await
                .map_err(|e| PipelineError::Decode(anyhow::anyhow!("decode task failed: {e}")))??;
        self.transition(PipelineState::FramesExtracted);

        let keyframes = select_keyframes(&frames, self.config.stride);
        tracing::info!(
            keyframes = keyframes.len(),
            stride = keyframes.stride(),
            "keyframes selected"
        );
        let narration = self
            .narrator
            .generate(&keyframes, prompt, asset.duration())
            .await?;
        drop(keyframes);
        drop(frames);
        self.transition(PipelineState::NarrationReady);

        let audio = self.synthesizer.synthesize(&narration).await?;
        let audio_bytes = audio.len();
        self.transition(PipelineState::AudioReady);

        let config = self.config.clone();
        let (asset, audio, output) = tokio::task::spawn_blocking(move || {
            let output = video::mux(&asset, &audio, &config);
            (asset, audio, output)
        })
        .await
        .map_err(|e| PipelineError::Mux(anyhow::anyhow!("mux task failed: {e}")))?;
        asset.release();
        audio.release();
        let output = output?;
        self.transition(PipelineState::Muxed);

        Ok(NarratedVideo {
            narration,
            audio_bytes,
            output,
        })
    }
}
