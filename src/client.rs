//! Conversation backend client.
//!
//! The engine talks to its backend through the [`ConversationClient`] trait
//! so tests and alternative transports can be injected. The bundled
//! [`HttpConversationClient`] speaks the companion service's JSON protocol:
//! one POST per utterance, answered with either inline base64 audio or a URL
//! the client fetches in a second round trip.

use async_trait::async_trait;
use base64::engine::general_purpose;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Failure modes of one backend round trip. These are never fatal to the
/// engine; a failed turn just resumes listening.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend returned status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NetworkError::Timeout
        } else {
            NetworkError::Transport(err.to_string())
        }
    }
}

/// What the backend handed back for one utterance.
#[derive(Debug, Clone)]
pub enum ConversationReply {
    /// Playable audio, inline.
    Audio(Vec<u8>),

    /// Audio hosted at a URL, requiring a follow-up fetch.
    AudioUrl(String),

    /// A well-formed response with nothing to play.
    Empty,
}

/// Asynchronous conversation backend.
#[async_trait]
pub trait ConversationClient: Send + Sync {
    /// Submit one finished utterance (raw PCM) on behalf of a user.
    async fn submit(&self, audio: &[u8], user_id: &str)
        -> Result<ConversationReply, NetworkError>;

    /// Resolve a URL-shaped reply into audio bytes.
    async fn fetch_audio(&self, url: &str) -> Result<Vec<u8>, NetworkError>;
}

#[derive(Serialize)]
struct VoiceRequest<'a> {
    audio_data: String,
    user_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct VoiceResponse {
    audio_url: Option<String>,
    audio_data: Option<String>,
}

/// Map a decoded response body onto a reply. Inline audio wins over a URL
/// when the backend sends both.
fn reply_from_response(response: VoiceResponse) -> Result<ConversationReply, NetworkError> {
    if let Some(encoded) = response.audio_data {
        let bytes = general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| NetworkError::Malformed(format!("invalid base64 audio: {e}")))?;
        return Ok(ConversationReply::Audio(bytes));
    }
    if let Some(url) = response.audio_url {
        return Ok(ConversationReply::AudioUrl(url));
    }
    Ok(ConversationReply::Empty)
}

/// HTTP client for the voice-conversation endpoint.
pub struct HttpConversationClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpConversationClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ConversationClient for HttpConversationClient {
    async fn submit(
        &self,
        audio: &[u8],
        user_id: &str,
    ) -> Result<ConversationReply, NetworkError> {
        let body = VoiceRequest {
            audio_data: general_purpose::STANDARD.encode(audio),
            user_id,
        };

        info!(bytes = audio.len(), "submitting utterance to backend");
        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Status(status.as_u16()));
        }

        let parsed: VoiceResponse = response
            .json()
            .await
            .map_err(|e| NetworkError::Malformed(e.to_string()))?;
        reply_from_response(parsed)
    }

    async fn fetch_audio(&self, url: &str) -> Result<Vec<u8>, NetworkError> {
        debug!(url, "fetching response audio");
        let response = self.http.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::Status(status.as_u16()));
        }

        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }
}
