use std::convert::Infallible;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, ValueEnum};
use serde::Serialize;

use crate::error::{PipelineError, Result};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Credential for the inference services. Never printed.
#[derive(Clone)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl FromStr for ApiKey {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::new(s))
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

#[derive(Args, Debug, Clone)]
pub struct InferenceConfig {
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: ApiKey,
    #[arg(long, env = "OPENAI_API_BASE", default_value = DEFAULT_API_BASE)]
    pub api_base: String,
    /// Value of the `OpenAI-Version` header sent with vision requests
    #[arg(long, default_value = "2020-11-07")]
    pub openai_version: String,
}

impl InferenceConfig {
    pub fn new(api_key: ApiKey) -> Self {
        Self {
            api_key,
            api_base: DEFAULT_API_BASE.to_owned(),
            openai_version: "2020-11-07".to_owned(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct VisionConfig {
    #[arg(long, default_value = "gpt-4o")]
    pub vision_model: String,
    #[arg(long, default_value_t = 500)]
    pub max_tokens: u32,
    #[arg(long, default_value_t = 300)]
    pub vision_timeout_secs: u64,
}

impl VisionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.vision_timeout_secs)
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            vision_model: "gpt-4o".to_owned(),
            max_tokens: 500,
            vision_timeout_secs: 300,
        }
    }
}

/// Speech voices. The service only accepts the lowercase spelling, so the
/// serialized form is fixed here no matter how the user typed it.
#[derive(ValueEnum, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Voice {
    Alloy,
    Echo,
    Fable,
    Onyx,
    #[default]
    Nova,
    Shimmer,
}

#[derive(Args, Debug, Clone)]
pub struct SpeechConfig {
    #[arg(long, default_value = "tts-1")]
    pub speech_model: String,
    #[arg(long, value_enum, ignore_case = true, default_value_t = Voice::Nova)]
    pub voice: Voice,
    #[arg(long, default_value_t = 120)]
    pub speech_timeout_secs: u64,
}

impl SpeechConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.speech_timeout_secs)
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            speech_model: "tts-1".to_owned(),
            voice: Voice::default(),
            speech_timeout_secs: 120,
        }
    }
}

/// How the narration track is fitted to the video length when muxing.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioFit {
    /// Pad with silence or trim so the audio ends with the video.
    #[default]
    PadOrTrim,
    /// Leave the audio as synthesized.
    Passthrough,
}

#[derive(Args, Debug, Clone)]
pub struct PipelineConfig {
    /// Take every Nth decoded frame as a keyframe
    #[arg(long, default_value_t = 25)]
    pub stride: usize,
    /// Upper bound on images attached to the vision request
    #[arg(long, default_value_t = 50)]
    pub max_images: usize,
    #[arg(long, default_value_t = 768)]
    pub resize_height: u32,
    #[arg(long, default_value_t = 2.0)]
    pub words_per_second: f64,
    #[arg(long, value_enum, default_value_t = AudioFit::PadOrTrim)]
    pub audio_fit: AudioFit,
    /// Directory for invocation-scoped temporary files
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stride == 0 {
            return Err(PipelineError::Config("stride must be at least 1".into()));
        }
        if self.max_images == 0 {
            return Err(PipelineError::Config("max-images must be at least 1".into()));
        }
        if self.resize_height == 0 {
            return Err(PipelineError::Config("resize-height must be at least 1".into()));
        }
        if !self.words_per_second.is_finite() || self.words_per_second < 0.0 {
            return Err(PipelineError::Config(format!(
                "words-per-second must be a non-negative number, got {}",
                self.words_per_second
            )));
        }
        Ok(())
    }

    /// Creates an invocation-scoped temporary file under `temp_dir`, or the
    /// system temp directory.
    pub(crate) fn temp_file(&self, prefix: &str, suffix: &str) -> Result<tempfile::NamedTempFile> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix).suffix(suffix);
        let file = match &self.temp_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        Ok(file)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stride: 25,
            max_images: 50,
            resize_height: 768,
            words_per_second: 2.0,
            audio_fit: AudioFit::default(),
            temp_dir: None,
        }
    }
}

/// Everything a narration run needs, resolved once at startup.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    #[command(flatten)]
    pub inference: InferenceConfig,
    #[command(flatten)]
    pub vision: VisionConfig,
    #[command(flatten)]
    pub speech: SpeechConfig,
    #[command(flatten)]
    pub pipeline: PipelineConfig,
}

impl Settings {
    pub fn new(api_key: ApiKey) -> Self {
        Self {
            inference: InferenceConfig::new(api_key),
            vision: VisionConfig::default(),
            speech: SpeechConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}
