//! Provider adapters: translation between the normalized wire types and
//! each upstream's schema.
//!
//! Every adapter implements [`Adapter`] and advertises a fixed
//! [`Capability`] set through its [`Definition`]. The factory resolves a
//! catalog entry's `provider` tag to a definition and builds the adapter
//! for that entry; the router then carries the adapter inside its routes.
//! Calling an operation outside an adapter's capability set is a client
//! error (400), never a runtime surprise.

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod compat;
pub mod openai;
pub mod vertex;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::crypto::SecretBox;
use crate::db::models::catalog::{CatalogEntry, ProviderKind};
use crate::errors::Error as GatewayError;
use crate::openai::{
    AudioTranscriptionRequest, AudioTranscriptionResponse, ChatRequest, ChatResponse, ChatMessage,
    EmbeddingsRequest, EmbeddingsResponse, ImageEditRequest, ImageGenerationRequest, ImageResponse,
    ImageVariationRequest, SpeechRequest,
};
use crate::streaming::ChunkStream;

/// Default per-attempt timeout for sync upstream calls.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(600);

/// Operations a route can support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Chat,
    ChatStream,
    Embeddings,
    ImageGeneration,
    ImageEdit,
    ImageVariation,
    AudioTranscription,
    AudioTranslation,
    AudioSpeech,
    Models,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Chat => "chat",
            Capability::ChatStream => "chat_stream",
            Capability::Embeddings => "embeddings",
            Capability::ImageGeneration => "image_generation",
            Capability::ImageEdit => "image_edit",
            Capability::ImageVariation => "image_variation",
            Capability::AudioTranscription => "audio_transcription",
            Capability::AudioTranslation => "audio_translation",
            Capability::AudioSpeech => "audio_speech",
            Capability::Models => "models",
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(
            self,
            Capability::ImageGeneration | Capability::ImageEdit | Capability::ImageVariation
        )
    }
}

/// Errors surfaced by adapters. The dispatcher retries across remaining
/// route candidates only when [`AdapterError::retryable`] holds.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Operation outside the adapter's capability set
    #[error("operation `{0}` is not supported by this provider")]
    Unsupported(&'static str),

    /// The normalized request cannot be translated (e.g. no usable messages)
    #[error("{0}")]
    InvalidRequest(String),

    /// Upstream replied with a non-success status
    #[error("upstream returned status {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Transport-level failure before or during the exchange
    #[error("connection error: {0}")]
    Connection(String),

    /// The per-attempt timeout elapsed
    #[error("upstream request timed out")]
    Timeout,
}

impl AdapterError {
    /// 5xx, connection failures, and timeouts are worth trying on another
    /// candidate; 4xx stops the cascade.
    pub fn retryable(&self) -> bool {
        match self {
            AdapterError::Upstream { status, .. } => *status >= 500,
            AdapterError::Connection(_) | AdapterError::Timeout => true,
            AdapterError::Unsupported(_) | AdapterError::InvalidRequest(_) => false,
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout
        } else if let Some(status) = err.status() {
            AdapterError::Upstream {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            AdapterError::Connection(err.to_string())
        }
    }
}

impl From<AdapterError> for GatewayError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Unsupported(operation) => GatewayError::OperationUnsupported {
                operation: operation.to_string(),
            },
            AdapterError::InvalidRequest(message) => GatewayError::InvalidRequest { message },
            AdapterError::Upstream { status, message } => GatewayError::Provider {
                status: Some(status),
                message,
            },
            AdapterError::Connection(message) => GatewayError::Provider { status: None, message },
            AdapterError::Timeout => GatewayError::Provider {
                status: None,
                message: "upstream request timed out".to_string(),
            },
        }
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// A provider adapter bound to one catalog entry.
///
/// Default method bodies reject with [`AdapterError::Unsupported`]; adapters
/// override exactly the operations in their capability set.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn capabilities(&self) -> &'static [Capability];

    async fn chat(&self, _req: &ChatRequest) -> AdapterResult<ChatResponse> {
        Err(AdapterError::Unsupported("chat"))
    }

    async fn chat_stream(&self, _req: &ChatRequest) -> AdapterResult<ChunkStream> {
        Err(AdapterError::Unsupported("chat_stream"))
    }

    async fn embeddings(&self, _req: &EmbeddingsRequest) -> AdapterResult<EmbeddingsResponse> {
        Err(AdapterError::Unsupported("embeddings"))
    }

    async fn image_generation(&self, _req: &ImageGenerationRequest) -> AdapterResult<ImageResponse> {
        Err(AdapterError::Unsupported("image_generation"))
    }

    async fn image_edit(&self, _req: &ImageEditRequest) -> AdapterResult<ImageResponse> {
        Err(AdapterError::Unsupported("image_edit"))
    }

    async fn image_variation(&self, _req: &ImageVariationRequest) -> AdapterResult<ImageResponse> {
        Err(AdapterError::Unsupported("image_variation"))
    }

    async fn transcribe(&self, _req: &AudioTranscriptionRequest) -> AdapterResult<AudioTranscriptionResponse> {
        Err(AdapterError::Unsupported("audio_transcription"))
    }

    async fn translate_audio(&self, _req: &AudioTranscriptionRequest) -> AdapterResult<AudioTranscriptionResponse> {
        Err(AdapterError::Unsupported("audio_translation"))
    }

    async fn speech(&self, _req: &SpeechRequest) -> AdapterResult<Bytes> {
        Err(AdapterError::Unsupported("audio_speech"))
    }

    /// Cheap reachability probe used by the health monitor.
    async fn health(&self) -> AdapterResult<()> {
        Ok(())
    }
}

/// Everything a builder needs besides the catalog entry itself.
pub struct BuildContext<'a> {
    pub http: reqwest::Client,
    pub secrets: &'a SecretBox,
}

impl BuildContext<'_> {
    /// Decrypt the entry's upstream credential, if present.
    pub fn credential(&self, entry: &CatalogEntry) -> Result<Option<String>, GatewayError> {
        entry
            .api_key_ciphertext
            .as_deref()
            .map(|ct| self.secrets.decrypt(ct))
            .transpose()
    }
}

type BuildFn = fn(&CatalogEntry, &BuildContext) -> Result<Arc<dyn Adapter>, GatewayError>;

/// Static description of a provider family.
pub struct Definition {
    pub name: &'static str,
    pub description: &'static str,
    pub capabilities: &'static [Capability],
    pub build: BuildFn,
}

/// Resolve a provider tag to its definition. This is the normative support
/// matrix; catalog metadata can disable capabilities but never add them.
pub fn definition(kind: ProviderKind) -> &'static Definition {
    match kind {
        ProviderKind::Openai => &openai::DEFINITION,
        ProviderKind::OpenaiCompatible => &compat::DEFINITION,
        ProviderKind::Azure => &azure::DEFINITION,
        ProviderKind::Anthropic => &anthropic::DEFINITION,
        ProviderKind::Bedrock => &bedrock::DEFINITION,
        ProviderKind::Vertex => &vertex::DEFINITION,
    }
}

/// Translate messages into the canonical three-role space, dropping blanks.
/// An empty result is an invalid request.
pub fn canonical_messages(req: &ChatRequest) -> AdapterResult<Vec<ChatMessage>> {
    let messages: Vec<ChatMessage> = req
        .effective_messages()
        .into_iter()
        .map(|m| ChatMessage {
            role: m.role.canonical(),
            content: m.content.clone(),
            name: None,
        })
        .collect();
    if messages.is_empty() {
        return Err(AdapterError::InvalidRequest(
            "request contains no non-empty messages".to_string(),
        ));
    }
    Ok(messages)
}

/// Read an error body from a non-success upstream response, truncated for
/// logs and envelopes.
pub async fn upstream_error(response: reqwest::Response) -> AdapterError {
    let status = response.status().as_u16();
    let message = match response.text().await {
        Ok(body) => {
            let mut snippet: String = body.chars().take(512).collect();
            if snippet.is_empty() {
                snippet = "upstream returned an empty error body".to_string();
            }
            snippet
        }
        Err(_) => "upstream error body could not be read".to_string(),
    };
    AdapterError::Upstream { status, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openai::Role;

    fn chat_request(messages: Vec<(Role, &str)>) -> ChatRequest {
        serde_json::from_value(serde_json::json!({
            "model": "m",
            "messages": messages
                .into_iter()
                .map(|(role, content)| serde_json::json!({"role": role, "content": content}))
                .collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    #[test]
    fn test_canonical_messages_maps_roles_and_drops_blanks() {
        let req = chat_request(vec![
            (Role::System, "be brief"),
            (Role::Developer, "use json"),
            (Role::Tool, "  "),
            (Role::User, "hello"),
        ]);
        let messages = canonical_messages(&req).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].role, Role::User); // developer folded into user
        assert_eq!(messages[2].role, Role::User);
    }

    #[test]
    fn test_canonical_messages_rejects_empty_effective_request() {
        let req = chat_request(vec![(Role::User, "   ")]);
        let err = canonical_messages(&req).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidRequest(_)));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(
            AdapterError::Upstream {
                status: 500,
                message: String::new()
            }
            .retryable()
        );
        assert!(
            AdapterError::Upstream {
                status: 503,
                message: String::new()
            }
            .retryable()
        );
        assert!(
            !AdapterError::Upstream {
                status: 400,
                message: String::new()
            }
            .retryable()
        );
        assert!(
            !AdapterError::Upstream {
                status: 429,
                message: String::new()
            }
            .retryable()
        );
        assert!(AdapterError::Connection("reset".into()).retryable());
        assert!(AdapterError::Timeout.retryable());
        assert!(!AdapterError::Unsupported("chat").retryable());
    }

    #[test]
    fn test_every_provider_kind_has_a_definition() {
        for kind in [
            ProviderKind::Openai,
            ProviderKind::OpenaiCompatible,
            ProviderKind::Azure,
            ProviderKind::Anthropic,
            ProviderKind::Bedrock,
            ProviderKind::Vertex,
        ] {
            let def = definition(kind);
            assert!(!def.capabilities.is_empty(), "{} has no capabilities", def.name);
        }
    }
}
