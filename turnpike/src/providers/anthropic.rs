//! Anthropic Messages API adapter.
//!
//! Translation notes:
//! - system messages move to the top-level `system` field
//! - consecutive same-role messages are merged (the Messages API expects
//!   alternating turns) and the conversation must open with a user turn
//! - `max_tokens` is mandatory upstream; a default is applied when the
//!   client omitted it
//! - streaming events (`content_block_delta`, `message_delta`, ...) are
//!   re-shaped into OpenAI chunks, with a usage-only terminal chunk built
//!   from `message_start` + `message_delta` token counts

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use super::{
    Adapter, AdapterError, AdapterResult, BuildContext, Capability, Definition, UPSTREAM_TIMEOUT,
    canonical_messages, upstream_error,
};
use crate::db::models::catalog::CatalogEntry;
use crate::errors::Error as GatewayError;
use crate::openai::{ChatChunk, ChatRequest, ChatResponse, Role, Usage, response_id};
use crate::streaming::{ChunkStream, SseParser, spawn_producer};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub static DEFINITION: Definition = Definition {
    name: "anthropic",
    description: "Anthropic Messages API",
    capabilities: &[Capability::Chat, Capability::ChatStream],
    build: build,
};

fn build(entry: &CatalogEntry, ctx: &BuildContext) -> Result<Arc<dyn Adapter>, GatewayError> {
    let api_key = ctx.credential(entry)?.ok_or_else(|| GatewayError::Internal {
        operation: format!("build anthropic route for `{}`: catalog entry has no credential", entry.alias),
    })?;
    Ok(Arc::new(AnthropicAdapter {
        http: ctx.http.clone(),
        base_url: entry
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string(),
        api_key,
        model: entry.provider_model.clone(),
    }))
}

pub struct AnthropicAdapter {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

/// Build the Messages API body from a normalized chat request.
pub fn messages_body(req: &ChatRequest, model: &str, stream: bool) -> AdapterResult<serde_json::Value> {
    let canonical = canonical_messages(req)?;

    let mut system_parts = Vec::new();
    let mut turns: Vec<(Role, String)> = Vec::new();
    for message in canonical {
        let text = message.text().to_string();
        match message.role {
            Role::System => system_parts.push(text),
            role => {
                // Merge consecutive same-role turns
                if let Some((last_role, last_text)) = turns.last_mut()
                    && *last_role == role
                {
                    last_text.push('\n');
                    last_text.push_str(&text);
                } else {
                    turns.push((role, text));
                }
            }
        }
    }

    // The conversation must open with a user turn
    if matches!(turns.first(), Some((Role::Assistant, _))) {
        turns.insert(0, (Role::User, "...".to_string()));
    }
    if turns.is_empty() {
        return Err(AdapterError::InvalidRequest(
            "request contains no user or assistant messages".to_string(),
        ));
    }

    let messages: Vec<serde_json::Value> = turns
        .into_iter()
        .map(|(role, content)| json!({"role": role.as_str(), "content": content}))
        .collect();

    let mut body = json!({
        "model": model,
        "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
    });
    if !system_parts.is_empty() {
        body["system"] = json!(system_parts.join("\n"));
    }
    if let Some(temperature) = req.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = req.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(stop) = &req.stop {
        body["stop_sequences"] = json!(stop.as_vec());
    }
    if stream {
        body["stream"] = json!(true);
    }
    Ok(body)
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: MessagesUsage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

fn map_stop_reason(reason: Option<&str>) -> Option<String> {
    reason.map(|r| {
        match r {
            "end_turn" | "stop_sequence" => "stop",
            "max_tokens" => "length",
            other => other,
        }
        .to_string()
    })
}

impl AnthropicAdapter {
    fn request(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
    }
}

#[async_trait]
impl Adapter for AnthropicAdapter {
    fn capabilities(&self) -> &'static [Capability] {
        DEFINITION.capabilities
    }

    async fn chat(&self, req: &ChatRequest) -> AdapterResult<ChatResponse> {
        let body = messages_body(req, &self.model, false)?;
        let response = self
            .request(&body)
            .timeout(UPSTREAM_TIMEOUT)
            .send()
            .await
            .map_err(AdapterError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        let upstream: MessagesResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Connection(format!("decode upstream response: {e}")))?;

        let text = upstream
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .map(|block| block.text.as_str())
            .collect::<Vec<_>>()
            .join("");

        let mut translated = ChatResponse::new(
            &upstream.model,
            text,
            Usage::new(upstream.usage.input_tokens, upstream.usage.output_tokens),
        );
        translated.choices[0].finish_reason = map_stop_reason(upstream.stop_reason.as_deref());
        Ok(translated)
    }

    async fn chat_stream(&self, req: &ChatRequest) -> AdapterResult<ChunkStream> {
        let body = messages_body(req, &self.model, true)?;
        let response = self.request(&body).send().await.map_err(AdapterError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }

        let model = self.model.clone();
        Ok(spawn_producer(move |sender| async move {
            let chunk_id = response_id("chatcmpl");
            let mut parser = SseParser::new();
            let mut body = response.bytes_stream();
            let mut prompt_tokens = 0u32;
            let mut completion_tokens = 0u32;

            while let Some(next) = body.next().await {
                let bytes = match next {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let err = if e.is_timeout() {
                            AdapterError::Timeout
                        } else {
                            AdapterError::Connection(e.to_string())
                        };
                        let _ = sender.send(Err(err)).await;
                        return;
                    }
                };

                for payload in parser.push(&bytes) {
                    let Ok(event) = serde_json::from_str::<serde_json::Value>(&payload) else {
                        continue;
                    };
                    match event["type"].as_str() {
                        Some("message_start") => {
                            prompt_tokens = event["message"]["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
                        }
                        Some("content_block_delta") => {
                            if let Some(text) = event["delta"]["text"].as_str()
                                && !sender.send(Ok(ChatChunk::content_delta(&model, &chunk_id, text.to_string()))).await
                            {
                                return;
                            }
                        }
                        Some("message_delta") => {
                            if let Some(tokens) = event["usage"]["output_tokens"].as_u64() {
                                completion_tokens = tokens as u32;
                            }
                        }
                        Some("message_stop") => {
                            let usage = Usage::new(prompt_tokens, completion_tokens);
                            let _ = sender.send(Ok(ChatChunk::usage_only(&model, &chunk_id, usage))).await;
                            return;
                        }
                        _ => {}
                    }
                }
            }
        }))
    }

    async fn health(&self) -> AdapterResult<()> {
        let response = self
            .http
            .get(format!("{}/v1/models", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(UPSTREAM_TIMEOUT)
            .send()
            .await
            .map_err(AdapterError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_request(json: serde_json::Value) -> ChatRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_system_messages_move_to_system_field() {
        let req = chat_request(json!({
            "model": "alias",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
            ],
        }));
        let body = messages_body(&req, "claude-3-5-haiku", false).unwrap();
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_consecutive_user_turns_are_merged() {
        let req = chat_request(json!({
            "model": "alias",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "tool", "content": "second"},
                {"role": "assistant", "content": "reply"},
            ],
        }));
        let body = messages_body(&req, "claude-3-5-haiku", false).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], "first\nsecond");
        assert_eq!(messages[1]["role"], "assistant");
    }

    #[test]
    fn test_leading_assistant_turn_gets_user_preamble() {
        let req = chat_request(json!({
            "model": "alias",
            "messages": [{"role": "assistant", "content": "continue this"}],
        }));
        let body = messages_body(&req, "claude-3-5-haiku", false).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["role"], "assistant");
    }

    #[tokio::test]
    async fn test_chat_translates_response_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "anthropic-key"))
            .and(header("anthropic-version", ANTHROPIC_VERSION))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_01",
                "type": "message",
                "role": "assistant",
                "content": [{"type": "text", "text": "bonjour"}],
                "model": "claude-3-5-haiku",
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 12, "output_tokens": 3}
            })))
            .mount(&server)
            .await;

        let adapter = AnthropicAdapter {
            http: reqwest::Client::new(),
            base_url: server.uri(),
            api_key: "anthropic-key".to_string(),
            model: "claude-3-5-haiku".to_string(),
        };
        let req = chat_request(json!({
            "model": "alias",
            "messages": [{"role": "user", "content": "hello"}],
        }));
        let response = adapter.chat(&req).await.unwrap();
        assert_eq!(response.completion_text(), "bonjour");
        assert_eq!(response.usage, Usage::new(12, 3));
        assert_eq!(response.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_stream_reshapes_events_into_chunks() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":9}}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"bon\"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"jour\"}}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":4}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let adapter = AnthropicAdapter {
            http: reqwest::Client::new(),
            base_url: server.uri(),
            api_key: "anthropic-key".to_string(),
            model: "claude-3-5-haiku".to_string(),
        };
        let req = chat_request(json!({
            "model": "alias",
            "messages": [{"role": "user", "content": "hello"}],
            "stream": true,
        }));
        let mut stream = adapter.chat_stream(&req).await.unwrap();

        let mut text = String::new();
        let mut usage = None;
        while let Some(chunk) = stream.next_chunk().await {
            let chunk = chunk.unwrap();
            text.push_str(chunk.text());
            if let Some(u) = chunk.usage.clone() {
                usage = Some(u);
            }
        }
        assert_eq!(text, "bonjour");
        assert_eq!(usage, Some(Usage::new(9, 4)));
    }
}
