use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Serialize;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;

use crate::config::{ApiKey, InferenceConfig, PipelineConfig, SpeechConfig, Voice};
use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct SpeechRequest {
    pub model: String,
    pub input: String,
    pub voice: Voice,
}

pub type AudioStream = BoxStream<'static, std::result::Result<Bytes, String>>;

/// Status line and streamed body of a speech response.
pub struct SpeechReply {
    pub status: StatusCode,
    pub body: AudioStream,
}

#[allow(async_fn_in_trait)]
pub trait SpeechTransport {
    async fn post(&self, request: &SpeechRequest) -> Result<SpeechReply>;
}

/// `POST {api_base}/audio/speech` with a bearer credential.
pub struct HttpSpeech {
    client: reqwest::Client,
    endpoint: String,
    api_key: ApiKey,
    timeout: Duration,
}

impl HttpSpeech {
    pub fn new(inference: &InferenceConfig, speech: &SpeechConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/audio/speech", inference.api_base.trim_end_matches('/')),
            api_key: inference.api_key.clone(),
            timeout: speech.timeout(),
        }
    }
}

impl SpeechTransport for HttpSpeech {
    async fn post(&self, request: &SpeechRequest) -> Result<SpeechReply> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose())
            .json(request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| PipelineError::Speech(e.to_string()))?;

        Ok(SpeechReply {
            status: response.status(),
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| e.to_string()))
                .boxed(),
        })
    }
}

/// Synthesized narration, held both in memory and on temporary storage.
#[derive(Debug)]
pub struct AudioAsset {
    bytes: Cursor<Vec<u8>>,
    path: TempPath,
}

impl AudioAsset {
    /// The in-memory copy, rewound to the start.
    pub fn reader(&mut self) -> &mut Cursor<Vec<u8>> {
        self.bytes.set_position(0);
        &mut self.bytes
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes.get_ref()
    }

    pub fn len(&self) -> usize {
        self.bytes.get_ref().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.get_ref().is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) {
        let path = self.path.to_path_buf();
        if let Err(e) = self.path.close() {
            tracing::warn!(path = %path.display(), "failed to remove narration audio: {e}");
        }
    }
}

pub struct SpeechSynthesizer<T> {
    transport: T,
    model: String,
    voice: Voice,
    pipeline: PipelineConfig,
}

impl<T: SpeechTransport> SpeechSynthesizer<T> {
    pub fn new(transport: T, config: &SpeechConfig, pipeline: &PipelineConfig) -> Self {
        Self {
            transport,
            model: config.speech_model.clone(),
            voice: config.voice,
            pipeline: pipeline.clone(),
        }
    }

    /// Speaks `text`. Any status other than 200 fails before a file is
    /// created; the body is read once and copied chunk by chunk into memory
    /// and onto disk.
    pub async fn synthesize(&self, text: &str) -> Result<AudioAsset> {
        let request = SpeechRequest {
            model: self.model.clone(),
            input: text.to_owned(),
            voice: self.voice,
        };
        tracing::info!(model = %request.model, voice = ?request.voice, "requesting speech");

        let reply = self.transport.post(&request).await?;
        if reply.status != StatusCode::OK {
            return Err(PipelineError::Service {
                status: reply.status,
            });
        }

        let (file, path) = self
            .pipeline
            .temp_file("narrator-speech-", ".mp3")?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut buffer = Vec::new();
        let mut body = reply.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(PipelineError::Speech)?;
            buffer.extend_from_slice(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        if buffer.is_empty() {
            return Err(PipelineError::Speech("response contained no audio".to_owned()));
        }
        tracing::info!(bytes = buffer.len(), path = %path.display(), "speech audio saved");

        Ok(AudioAsset {
            bytes: Cursor::new(buffer),
            path,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Mutex;

    use futures_util::stream;

    use super::*;

    struct FakeSpeech {
        status: StatusCode,
        chunks: Vec<&'static str>,
        failure: Option<&'static str>,
        requests: Mutex<Vec<serde_json::Value>>,
    }

    impl FakeSpeech {
        fn new(status: StatusCode, chunks: &[&'static str]) -> Self {
            Self {
                status,
                chunks: chunks.to_vec(),
                failure: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn failing_after(chunks: &[&'static str], failure: &'static str) -> Self {
            Self {
                failure: Some(failure),
                ..Self::new(StatusCode::OK, chunks)
            }
        }
    }

    impl SpeechTransport for &FakeSpeech {
        async fn post(&self, request: &SpeechRequest) -> Result<SpeechReply> {
            self.requests
                .lock()
                .unwrap()
                .push(serde_json::to_value(request).unwrap());
            let mut chunks: Vec<std::result::Result<Bytes, String>> = self
                .chunks
                .iter()
                .copied()
                .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
                .collect();
            if let Some(failure) = self.failure {
                chunks.push(Err(failure.to_owned()));
            }
            Ok(SpeechReply {
                status: self.status,
                body: stream::iter(chunks).boxed(),
            })
        }
    }

    fn pipeline_in(dir: &Path) -> PipelineConfig {
        PipelineConfig {
            temp_dir: Some(dir.to_path_buf()),
            ..PipelineConfig::default()
        }
    }

    fn files_in(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn chunks_land_in_memory_and_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeSpeech::new(StatusCode::OK, &["ID3", "-audio", "-tail"]);
        let synthesizer =
            SpeechSynthesizer::new(&fake, &SpeechConfig::default(), &pipeline_in(dir.path()));

        let mut audio = synthesizer.synthesize("hello there").await.unwrap();
        assert_eq!(audio.bytes(), b"ID3-audio-tail");
        assert_eq!(std::fs::read(audio.path()).unwrap(), b"ID3-audio-tail");

        let mut first = String::new();
        audio.reader().read_to_string(&mut first).unwrap();
        let mut second = String::new();
        audio.reader().read_to_string(&mut second).unwrap();
        assert_eq!(first, second);

        audio.release();
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn request_body_uses_exact_voice_name() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeSpeech::new(StatusCode::OK, &["audio"]);
        let synthesizer =
            SpeechSynthesizer::new(&fake, &SpeechConfig::default(), &pipeline_in(dir.path()));

        synthesizer.synthesize("narration").await.unwrap();
        let requests = fake.requests.lock().unwrap();
        assert_eq!(
            requests[0],
            serde_json::json!({"model": "tts-1", "input": "narration", "voice": "nova"})
        );
    }

    #[tokio::test]
    async fn non_ok_status_fails_without_creating_files() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeSpeech::new(StatusCode::BAD_REQUEST, &["partial"]);
        let synthesizer =
            SpeechSynthesizer::new(&fake, &SpeechConfig::default(), &pipeline_in(dir.path()));

        let err = synthesizer.synthesize("narration").await.unwrap_err();
        assert!(
            matches!(err, PipelineError::Service { status } if status == StatusCode::BAD_REQUEST)
        );
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn broken_stream_leaves_no_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeSpeech::failing_after(&["start"], "connection reset");
        let synthesizer =
            SpeechSynthesizer::new(&fake, &SpeechConfig::default(), &pipeline_in(dir.path()));

        let err = synthesizer.synthesize("narration").await.unwrap_err();
        assert!(matches!(err, PipelineError::Speech(reason) if reason == "connection reset"));
        assert_eq!(files_in(dir.path()), 0);
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeSpeech::new(StatusCode::OK, &[]);
        let synthesizer =
            SpeechSynthesizer::new(&fake, &SpeechConfig::default(), &pipeline_in(dir.path()));

        assert!(synthesizer.synthesize("narration").await.is_err());
        assert_eq!(files_in(dir.path()), 0);
    }
}
