//! Normalized OpenAI-compatible wire types.
//!
//! Every inbound request is deserialized into these shapes, and every
//! provider adapter translates between them and its upstream schema. The
//! response types are what clients see regardless of which provider served
//! the request.
//!
//! Unknown request fields are preserved where harmless (serde ignores them);
//! responses always carry `{id, created, model, choices[], usage}`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal marker emitted after the last SSE chunk of a stream.
pub const SSE_DONE: &str = "[DONE]";

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// Message role. Everything that is not `system` or `assistant` is forwarded
/// to providers in their user slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
    Function,
    Developer,
}

impl Role {
    /// Collapse the role space to the three slots providers understand.
    pub fn canonical(&self) -> Role {
        match self {
            Role::System => Role::System,
            Role::Assistant => Role::Assistant,
            Role::User | Role::Tool | Role::Function | Role::Developer => Role::User,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::Function => "function",
            Role::Developer => "developer",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }

    /// Whitespace-only messages carry no signal and are dropped before
    /// translation.
    pub fn is_blank(&self) -> bool {
        self.text().trim().is_empty()
    }
}

/// `stop` accepts either a single string or up to four sequences.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn as_vec(&self) -> Vec<String> {
        match self {
            StopSequences::One(s) => vec![s.clone()],
            StopSequences::Many(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl ChatRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// All message text joined for guardrail scanning and token estimation.
    pub fn prompt_text(&self) -> String {
        self.messages.iter().map(|m| m.text()).collect::<Vec<_>>().join("\n")
    }

    /// Messages with blanks removed. An empty result means the request has
    /// no usable content.
    pub fn effective_messages(&self) -> Vec<&ChatMessage> {
        self.messages.iter().filter(|m| !m.is_blank()).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: Role,
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Usage,
}

impl ChatResponse {
    pub fn new(model: &str, content: String, usage: Usage) -> Self {
        Self {
            id: response_id("chatcmpl"),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: AssistantMessage {
                    role: Role::Assistant,
                    content: Some(content),
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage,
        }
    }

    /// Concatenated completion text across choices, for guardrail scanning.
    pub fn completion_text(&self) -> String {
        self.choices
            .iter()
            .filter_map(|c| c.message.content.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Replace all choice content with a redaction sentinel.
    pub fn redact(&mut self, sentinel: &str) {
        for choice in &mut self.choices {
            choice.message.content = Some(sentinel.to_string());
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

/// One SSE frame of a streamed chat completion. A terminal frame may carry
/// usage with an empty `choices` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatChunk {
    pub fn content_delta(model: &str, id: &str, content: String) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: None,
                    content: Some(content),
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// A usage-only terminal chunk (empty choices, populated usage).
    pub fn usage_only(model: &str, id: &str, usage: Usage) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: Vec::new(),
            usage: Some(usage),
        }
    }

    pub fn text(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| c.delta.content.as_deref())
            .unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingsInput {
    One(String),
    Many(Vec<String>),
}

impl EmbeddingsInput {
    pub fn as_vec(&self) -> Vec<String> {
        match self {
            EmbeddingsInput::One(s) => vec![s.clone()],
            EmbeddingsInput::Many(v) => v.clone(),
        }
    }

    pub fn joined(&self) -> String {
        self.as_vec().join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    pub model: String,
    pub input: EmbeddingsInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub object: String,
    pub index: u32,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub object: String,
    pub data: Vec<Embedding>,
    pub model: String,
    #[serde(default)]
    pub usage: Usage,
}

impl EmbeddingsResponse {
    pub fn new(model: &str, vectors: Vec<Vec<f32>>, usage: Usage) -> Self {
        Self {
            object: "list".to_string(),
            data: vectors
                .into_iter()
                .enumerate()
                .map(|(index, embedding)| Embedding {
                    object: "embedding".to_string(),
                    index: index as u32,
                    embedding,
                })
                .collect(),
            model: model.to_string(),
            usage,
        }
    }
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// `response_format` for image operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageResponseFormat {
    #[default]
    Url,
    B64Json,
}

/// Maximum `n` accepted for any image operation.
pub const MAX_IMAGES_PER_REQUEST: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ImageResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Image edit/variation payloads arrive as multipart and never round-trip
/// through serde; the image bytes ride alongside the parsed fields.
#[derive(Debug, Clone)]
pub struct ImageEditRequest {
    pub model: Option<String>,
    pub prompt: String,
    pub image: bytes::Bytes,
    pub image_filename: String,
    pub mask: Option<bytes::Bytes>,
    pub n: Option<u32>,
    pub size: Option<String>,
    pub response_format: Option<ImageResponseFormat>,
}

#[derive(Debug, Clone)]
pub struct ImageVariationRequest {
    pub model: Option<String>,
    pub image: bytes::Bytes,
    pub image_filename: String,
    pub n: Option<u32>,
    pub size: Option<String>,
    pub response_format: Option<ImageResponseFormat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDatum {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageResponse {
    pub created: i64,
    pub data: Vec<ImageDatum>,
}

// ---------------------------------------------------------------------------
// Audio
// ---------------------------------------------------------------------------

/// Transcription/translation uploads: multipart audio plus tuning fields.
#[derive(Debug, Clone)]
pub struct AudioTranscriptionRequest {
    pub model: String,
    pub file: bytes::Bytes,
    pub filename: String,
    pub language: Option<String>,
    pub prompt: Option<String>,
    pub response_format: Option<String>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioTranscriptionResponse {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub model: String,
    pub input: String,
    pub voice: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelObject>,
}

impl ModelList {
    pub fn new(data: Vec<ModelObject>) -> Self {
        Self {
            object: "list".to_string(),
            data,
        }
    }
}

/// Response ids look like `chatcmpl-<uuid-simple>`, matching the upstream
/// convention closely enough for client SDKs.
pub fn response_id(kind: &str) -> String {
    format!("{kind}-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_canonicalization() {
        assert_eq!(Role::System.canonical(), Role::System);
        assert_eq!(Role::Assistant.canonical(), Role::Assistant);
        assert_eq!(Role::User.canonical(), Role::User);
        assert_eq!(Role::Tool.canonical(), Role::User);
        assert_eq!(Role::Function.canonical(), Role::User);
        assert_eq!(Role::Developer.canonical(), Role::User);
    }

    #[test]
    fn test_chat_request_parses_minimal_body() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"model":"gpt-test","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        assert_eq!(req.model, "gpt-test");
        assert!(!req.is_stream());
        assert_eq!(req.prompt_text(), "hi");
    }

    #[test]
    fn test_stop_sequences_accept_both_shapes() {
        let one: ChatRequest = serde_json::from_str(
            r#"{"model":"m","messages":[],"stop":"END"}"#,
        )
        .unwrap();
        assert_eq!(one.stop.unwrap().as_vec(), vec!["END"]);

        let many: ChatRequest = serde_json::from_str(
            r#"{"model":"m","messages":[],"stop":["a","b"]}"#,
        )
        .unwrap();
        assert_eq!(many.stop.unwrap().as_vec(), vec!["a", "b"]);
    }

    #[test]
    fn test_blank_messages_are_filtered() {
        let req: ChatRequest = serde_json::from_str(
            r#"{"model":"m","messages":[
                {"role":"system","content":"  \n "},
                {"role":"user","content":"hello"},
                {"role":"user","content":null}
            ]}"#,
        )
        .unwrap();
        let effective = req.effective_messages();
        assert_eq!(effective.len(), 1);
        assert_eq!(effective[0].text(), "hello");
    }

    #[test]
    fn test_embeddings_input_shapes() {
        let one: EmbeddingsRequest =
            serde_json::from_str(r#"{"model":"m","input":"hello"}"#).unwrap();
        assert_eq!(one.input.as_vec(), vec!["hello"]);

        let many: EmbeddingsRequest =
            serde_json::from_str(r#"{"model":"m","input":["a","b"]}"#).unwrap();
        assert_eq!(many.input.as_vec().len(), 2);
    }

    #[test]
    fn test_usage_only_chunk_has_empty_choices() {
        let chunk = ChatChunk::usage_only("m", "chatcmpl-1", Usage::new(10, 5));
        assert!(chunk.choices.is_empty());
        assert_eq!(chunk.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_redaction_replaces_all_choices() {
        let mut resp = ChatResponse::new("m", "secret output".into(), Usage::default());
        resp.redact("[redacted]");
        assert_eq!(resp.completion_text(), "[redacted]");
    }
}
