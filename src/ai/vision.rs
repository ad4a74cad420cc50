use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ImageUrlArgs,
};
use async_openai::Client;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use image::imageops::FilterType;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use super::Completion;
use crate::capture::{jpeg_from_rgb, Frame};
use crate::config::{InferenceConfig, PipelineConfig, VisionConfig};
use crate::error::{PipelineError, Result};
use crate::keyframes::KeyframeSubset;

/// A vision-capable chat model. Implementations must decode the remote
/// response into a [`Completion`] before returning.
#[allow(async_fn_in_trait)]
pub trait VisionInference {
    async fn complete(&self, request: CreateChatCompletionRequest) -> Completion;
}

/// Chat completions against the OpenAI API.
pub struct OpenAiVision {
    client: Client<OpenAIConfig>,
    timeout: Duration,
}

impl OpenAiVision {
    pub fn new(inference: &InferenceConfig, vision: &VisionConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("openai-version"),
            HeaderValue::from_str(&inference.openai_version)
                .map_err(|e| PipelineError::Config(format!("invalid OpenAI-Version header: {e}")))?,
        );
        let http_client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| PipelineError::Config(format!("failed to build HTTP client: {e}")))?;

        let config = OpenAIConfig::new()
            .with_api_key(inference.api_key.expose())
            .with_api_base(&inference.api_base);
        // Single attempt per invocation.
        let no_retry = backoff::ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::ZERO))
            .build();
        let client = Client::with_config(config)
            .with_http_client(http_client)
            .with_backoff(no_retry);

        Ok(Self {
            client,
            timeout: vision.timeout(),
        })
    }
}

impl VisionInference for OpenAiVision {
    async fn complete(&self, request: CreateChatCompletionRequest) -> Completion {
        let response = tokio::time::timeout(self.timeout, self.client.chat().create(request)).await;
        match response {
            Err(_) => Completion::Failure(format!("no response within {:?}", self.timeout)),
            Ok(Err(e)) => Completion::Failure(e.to_string()),
            Ok(Ok(response)) => Completion::from_content(
                response
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.message.content),
            ),
        }
    }
}

/// A keyframe ready to attach to the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub frame_index: usize,
    /// `data:image/jpeg;base64,...`
    pub url: String,
    pub resize_height: u32,
}

#[derive(Debug, Clone)]
pub struct NarrationPrompt {
    pub text: String,
    pub images: Vec<ImagePayload>,
}

/// Number of words the narration may use to fit in `duration` seconds.
pub fn word_target(duration: f64, words_per_second: f64) -> u64 {
    let target = duration * words_per_second;
    if target.is_finite() && target > 0.0 {
        target.round() as u64
    } else {
        0
    }
}

/// Seconds with at most two decimals and no trailing zeros.
fn format_seconds(duration: f64) -> String {
    let duration = if duration.is_finite() { duration.max(0.0) } else { 0.0 };
    let formatted = format!("{duration:.2}");
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_owned()
}

/// Appends the length budget to the user's instruction.
pub fn budgeted_instruction(user_prompt: &str, duration: f64, words_per_second: f64) -> String {
    format!(
        "{} (This video is only {} seconds long, so keep the narration within {} words.)",
        user_prompt.trim_end(),
        format_seconds(duration),
        word_target(duration, words_per_second)
    )
}

fn image_payload(frame: &Frame, resize_height: u32) -> anyhow::Result<ImagePayload> {
    let image = image::load_from_memory(&frame.jpeg)?;
    let jpeg = if image.height() > resize_height {
        let scaled = u64::from(image.width()) * u64::from(resize_height);
        let width = (scaled / u64::from(image.height())).max(1) as u32;
        let resized = image.resize_exact(width, resize_height, FilterType::Triangle);
        jpeg_from_rgb(&resized.to_rgb8())?
    } else {
        frame.jpeg.clone()
    };

    Ok(ImagePayload {
        frame_index: frame.index,
        url: format!("data:image/jpeg;base64,{}", BASE64_STANDARD.encode(jpeg)),
        resize_height,
    })
}

pub struct NarrationGenerator<V> {
    vision: V,
    model: String,
    max_tokens: u32,
    max_images: usize,
    resize_height: u32,
    words_per_second: f64,
}

impl<V: VisionInference> NarrationGenerator<V> {
    pub fn new(vision: V, config: &VisionConfig, pipeline: &PipelineConfig) -> Self {
        Self {
            vision,
            model: config.vision_model.clone(),
            max_tokens: config.max_tokens,
            max_images: pipeline.max_images.max(1),
            resize_height: pipeline.resize_height.max(1),
            words_per_second: pipeline.words_per_second,
        }
    }

    pub fn prompt(
        &self,
        keyframes: &KeyframeSubset<'_>,
        user_prompt: &str,
        duration: f64,
    ) -> Result<NarrationPrompt> {
        if keyframes.is_empty() {
            return Err(PipelineError::EmptyInput);
        }
        let keyframes = keyframes.clone().limit(self.max_images);
        let images = keyframes
            .frames()
            .iter()
            .map(|frame| image_payload(frame, self.resize_height))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(PipelineError::Decode)?;

        Ok(NarrationPrompt {
            text: budgeted_instruction(user_prompt, duration, self.words_per_second),
            images,
        })
    }

    pub fn request(&self, prompt: &NarrationPrompt) -> Result<CreateChatCompletionRequest> {
        self.build_request(prompt)
            .map_err(|e| PipelineError::Inference(format!("invalid request: {e}")))
    }

    #[allow(deprecated)]
    fn build_request(
        &self,
        prompt: &NarrationPrompt,
    ) -> std::result::Result<CreateChatCompletionRequest, OpenAIError> {
        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .max_tokens(self.max_tokens)
            .messages([ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(ChatCompletionRequestUserMessageContent::Array(
                        [
                            vec![ChatCompletionRequestUserMessageContentPart::Text(
                                ChatCompletionRequestMessageContentPartTextArgs::default()
                                    .text(&prompt.text)
                                    .build()?,
                            )],
                            prompt
                                .images
                                .iter()
                                .map(|image| -> std::result::Result<_, OpenAIError> {
                                    Ok(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                                        ChatCompletionRequestMessageContentPartImageArgs::default()
                                            .image_url(
                                                ImageUrlArgs::default().url(&image.url).build()?,
                                            )
                                            .build()?,
                                    ))
                                })
                                .collect::<std::result::Result<_, _>>()?,
                        ]
                        .concat(),
                    ))
                    .build()?,
            )])
            .build()
    }

    /// Asks the vision model for narration of `keyframes`, budgeted to
    /// `duration` seconds of speech. A single attempt; failures are returned
    /// as [`PipelineError::Inference`].
    pub async fn generate(
        &self,
        keyframes: &KeyframeSubset<'_>,
        user_prompt: &str,
        duration: f64,
    ) -> Result<String> {
        let prompt = self.prompt(keyframes, user_prompt, duration)?;
        let request = self.request(&prompt)?;

        tracing::info!(
            model = %self.model,
            images = prompt.images.len(),
            "requesting narration"
        );
        match self.vision.complete(request).await {
            Completion::Success(text) => {
                tracing::debug!(chars = text.chars().count(), "narration received");
                Ok(text)
            }
            Completion::Failure(reason) => Err(PipelineError::Inference(reason)),
        }
    }
}
