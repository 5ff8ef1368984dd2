//! Whisper transcription service client
//!
//! Uploads audio files to the local whisper HTTP service and returns the
//! timed segments.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::AppError;

// Transcribing a full-length part can legitimately take this long
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1800);

pub struct WhisperClient {
    client: reqwest::Client,
    base_url: String,
}

impl WhisperClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Check if the whisper service is reachable
    pub async fn health_check(&self) -> Result<(), AppError> {
        let url = format!("{}/health", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::Transient(format!(
                "Whisper service returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Transcribe one audio file. Times are in seconds relative to the
    /// start of the uploaded file.
    pub async fn transcribe(&self, audio_path: &Path) -> Result<TranscribeResponse, AppError> {
        let url = format!("{}/transcribe", self.base_url);
        let bytes = tokio::fs::read(audio_path).await?;
        let file_name = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio.mp3".to_string());

        log::info!(
            "Uploading {:?} ({} bytes) for transcription",
            audio_path,
            bytes.len()
        );

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/mpeg")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self.client.post(&url).multipart(form).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = format!("Whisper returned {}: {}", status, body);
            return Err(if status.is_client_error() {
                AppError::Permanent(message)
            } else {
                AppError::Transient(message)
            });
        }

        let result: TranscribeResponse = response.json().await?;
        log::info!("Transcription finished: {} segments", result.segments.len());
        Ok(result)
    }
}

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TranscribeResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
pub struct WhisperSegment {
    #[serde(default)]
    pub id: i64,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transcribe_response() {
        let json = r#"{
            "text": "hello world",
            "segments": [
                {"id": 0, "start": 0.0, "end": 2.5, "text": " hello"},
                {"id": 1, "start": 2.5, "end": 4.0, "text": " world"}
            ]
        }"#;
        let parsed: TranscribeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.text, "hello world");
        assert_eq!(parsed.segments.len(), 2);
        assert_eq!(parsed.segments[0].end, 2.5);
        assert_eq!(parsed.segments[1].text, " world");
    }

    #[test]
    fn test_parse_response_without_segments() {
        let parsed: TranscribeResponse = serde_json::from_str(r#"{"text": ""}"#).unwrap();
        assert!(parsed.segments.is_empty());
    }
}
