//! Native OpenAI adapter.
//!
//! The upstream schema matches the normalized wire types, so translation is
//! mostly a matter of substituting the provider-side model name and
//! stripping gateway-only fields. This module also hosts the body builders
//! shared by the Azure and OpenAI-compatible adapters.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde_json::json;

use super::{
    Adapter, AdapterError, AdapterResult, BuildContext, Capability, Definition, UPSTREAM_TIMEOUT,
    canonical_messages, upstream_error,
};
use crate::db::models::catalog::CatalogEntry;
use crate::errors::Error as GatewayError;
use crate::openai::{
    AudioTranscriptionRequest, AudioTranscriptionResponse, ChatRequest, ChatResponse,
    EmbeddingsRequest, EmbeddingsResponse, ImageEditRequest, ImageGenerationRequest,
    ImageResponse, ImageResponseFormat, ImageVariationRequest, MAX_IMAGES_PER_REQUEST,
    SpeechRequest,
};
use crate::streaming::{ChunkStream, forward_sse, spawn_producer};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub static DEFINITION: Definition = Definition {
    name: "openai",
    description: "Native OpenAI API",
    capabilities: &[
        Capability::Chat,
        Capability::ChatStream,
        Capability::Embeddings,
        Capability::ImageGeneration,
        Capability::ImageEdit,
        Capability::ImageVariation,
        Capability::AudioTranscription,
        Capability::AudioTranslation,
        Capability::AudioSpeech,
        Capability::Models,
    ],
    build: build,
};

fn build(entry: &CatalogEntry, ctx: &BuildContext) -> Result<Arc<dyn Adapter>, GatewayError> {
    let api_key = ctx.credential(entry)?.ok_or_else(|| GatewayError::Internal {
        operation: format!("build openai route for `{}`: catalog entry has no credential", entry.alias),
    })?;
    let base_url = entry
        .endpoint
        .clone()
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    Ok(Arc::new(OpenAiAdapter {
        http: ctx.http.clone(),
        base_url: base_url.trim_end_matches('/').to_string(),
        api_key,
        model: entry.provider_model.clone(),
    }))
}

pub struct OpenAiAdapter {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiAdapter {
    /// Also used by the OpenAI-compatible adapter, which differs only in
    /// capability surface and base URL handling.
    pub(super) fn new(http: reqwest::Client, base_url: String, api_key: String, model: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }
}

/// Build the upstream chat body: provider-side model name, canonicalized
/// messages, and only the tuning fields the request actually set.
pub fn chat_body(req: &ChatRequest, model: &str, stream: bool) -> AdapterResult<serde_json::Value> {
    let messages = canonical_messages(req)?;
    let mut body = json!({
        "model": model,
        "messages": messages,
    });
    if let Some(temperature) = req.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = req.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(max_tokens) = req.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(stop) = &req.stop {
        body["stop"] = json!(stop.as_vec());
    }
    if let Some(n) = req.n {
        body["n"] = json!(n);
    }
    if let Some(user) = &req.user {
        body["user"] = json!(user);
    }
    if stream {
        body["stream"] = json!(true);
        // Ask for the usage-only terminal chunk so accounting is exact
        body["stream_options"] = json!({"include_usage": true});
    }
    Ok(body)
}

pub fn embeddings_body(req: &EmbeddingsRequest, model: &str) -> serde_json::Value {
    let mut body = json!({
        "model": model,
        "input": req.input,
    });
    if let Some(format) = &req.encoding_format {
        body["encoding_format"] = json!(format);
    }
    if let Some(dimensions) = req.dimensions {
        body["dimensions"] = json!(dimensions);
    }
    body
}

/// Reject an `n` outside the supported range for image operations.
pub fn check_image_count(n: Option<u32>) -> AdapterResult<()> {
    if let Some(n) = n
        && (n == 0 || n > MAX_IMAGES_PER_REQUEST)
    {
        return Err(AdapterError::InvalidRequest(format!(
            "n must be between 1 and {MAX_IMAGES_PER_REQUEST}"
        )));
    }
    Ok(())
}

fn response_format_str(format: Option<ImageResponseFormat>) -> &'static str {
    match format.unwrap_or_default() {
        ImageResponseFormat::Url => "url",
        ImageResponseFormat::B64Json => "b64_json",
    }
}

impl OpenAiAdapter {
    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> AdapterResult<T> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .timeout(UPSTREAM_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(AdapterError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| AdapterError::Connection(format!("decode upstream response: {e}")))
    }

    async fn post_multipart<T: serde::de::DeserializeOwned>(&self, path: &str, form: Form) -> AdapterResult<T> {
        let response = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .timeout(UPSTREAM_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(AdapterError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| AdapterError::Connection(format!("decode upstream response: {e}")))
    }
}

#[async_trait]
impl Adapter for OpenAiAdapter {
    fn capabilities(&self) -> &'static [Capability] {
        DEFINITION.capabilities
    }

    async fn chat(&self, req: &ChatRequest) -> AdapterResult<ChatResponse> {
        let body = chat_body(req, &self.model, false)?;
        self.post_json("chat/completions", &body).await
    }

    async fn chat_stream(&self, req: &ChatRequest) -> AdapterResult<ChunkStream> {
        let body = chat_body(req, &self.model, true)?;
        let response = self
            .http
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(AdapterError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        Ok(spawn_producer(move |sender| forward_sse(response, sender)))
    }

    async fn embeddings(&self, req: &EmbeddingsRequest) -> AdapterResult<EmbeddingsResponse> {
        let body = embeddings_body(req, &self.model);
        self.post_json("embeddings", &body).await
    }

    async fn image_generation(&self, req: &ImageGenerationRequest) -> AdapterResult<ImageResponse> {
        check_image_count(req.n)?;
        let mut body = json!({
            "model": self.model,
            "prompt": req.prompt,
            "response_format": response_format_str(req.response_format),
        });
        if let Some(n) = req.n {
            body["n"] = json!(n);
        }
        if let Some(size) = &req.size {
            body["size"] = json!(size);
        }
        if let Some(quality) = &req.quality {
            body["quality"] = json!(quality);
        }
        self.post_json("images/generations", &body).await
    }

    async fn image_edit(&self, req: &ImageEditRequest) -> AdapterResult<ImageResponse> {
        check_image_count(req.n)?;
        let mut form = Form::new()
            .text("model", self.model.clone())
            .text("prompt", req.prompt.clone())
            .text("response_format", response_format_str(req.response_format))
            .part(
                "image",
                Part::bytes(req.image.to_vec()).file_name(req.image_filename.clone()),
            );
        if let Some(mask) = &req.mask {
            form = form.part("mask", Part::bytes(mask.to_vec()).file_name("mask.png"));
        }
        if let Some(n) = req.n {
            form = form.text("n", n.to_string());
        }
        if let Some(size) = &req.size {
            form = form.text("size", size.clone());
        }
        self.post_multipart("images/edits", form).await
    }

    async fn image_variation(&self, req: &ImageVariationRequest) -> AdapterResult<ImageResponse> {
        check_image_count(req.n)?;
        let mut form = Form::new()
            .text("model", self.model.clone())
            .text("response_format", response_format_str(req.response_format))
            .part(
                "image",
                Part::bytes(req.image.to_vec()).file_name(req.image_filename.clone()),
            );
        if let Some(n) = req.n {
            form = form.text("n", n.to_string());
        }
        if let Some(size) = &req.size {
            form = form.text("size", size.clone());
        }
        self.post_multipart("images/variations", form).await
    }

    async fn transcribe(&self, req: &AudioTranscriptionRequest) -> AdapterResult<AudioTranscriptionResponse> {
        let form = audio_form(req, &self.model);
        self.post_multipart("audio/transcriptions", form).await
    }

    async fn translate_audio(&self, req: &AudioTranscriptionRequest) -> AdapterResult<AudioTranscriptionResponse> {
        let form = audio_form(req, &self.model);
        self.post_multipart("audio/translations", form).await
    }

    async fn speech(&self, req: &SpeechRequest) -> AdapterResult<Bytes> {
        let mut body = json!({
            "model": self.model,
            "input": req.input,
            "voice": req.voice,
        });
        if let Some(format) = &req.response_format {
            body["response_format"] = json!(format);
        }
        if let Some(speed) = req.speed {
            body["speed"] = json!(speed);
        }

        let response = self
            .http
            .post(self.url("audio/speech"))
            .bearer_auth(&self.api_key)
            .timeout(UPSTREAM_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(AdapterError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        response.bytes().await.map_err(AdapterError::from_reqwest)
    }

    async fn health(&self) -> AdapterResult<()> {
        let response = self
            .http
            .get(self.url("models"))
            .bearer_auth(&self.api_key)
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

fn audio_form(req: &AudioTranscriptionRequest, model: &str) -> Form {
    let mut form = Form::new()
        .text("model", model.to_string())
        .part("file", Part::bytes(req.file.to_vec()).file_name(req.filename.clone()));
    if let Some(language) = &req.language {
        form = form.text("language", language.clone());
    }
    if let Some(prompt) = &req.prompt {
        form = form.text("prompt", prompt.clone());
    }
    if let Some(format) = &req.response_format {
        form = form.text("response_format", format.clone());
    }
    if let Some(temperature) = req.temperature {
        form = form.text("temperature", temperature.to_string());
    }
    form
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretBox;
    use crate::openai::Usage;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter(base_url: &str) -> OpenAiAdapter {
        OpenAiAdapter {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: "upstream-key".to_string(),
            model: "gpt-4o-mini".to_string(),
        }
    }

    fn chat_request(json: serde_json::Value) -> ChatRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_chat_body_substitutes_provider_model() {
        let req = chat_request(serde_json::json!({
            "model": "my-alias",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
        }));
        let body = chat_body(&req, "gpt-4o-mini", false).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["temperature"], 0.2);
        assert!(body.get("stream").is_none());
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn test_chat_body_stream_requests_usage_chunk() {
        let req = chat_request(serde_json::json!({
            "model": "my-alias",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let body = chat_body(&req, "gpt-4o-mini", true).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_check_image_count_bounds() {
        assert!(check_image_count(None).is_ok());
        assert!(check_image_count(Some(1)).is_ok());
        assert!(check_image_count(Some(10)).is_ok());
        assert!(check_image_count(Some(0)).is_err());
        assert!(check_image_count(Some(11)).is_err());
    }

    #[tokio::test]
    async fn test_chat_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer upstream-key"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-4o-mini"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-abc",
                "object": "chat.completion",
                "created": 1700000000,
                "model": "gpt-4o-mini",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "hello there"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(&format!("{}/v1", server.uri()));
        let req = chat_request(serde_json::json!({
            "model": "alias",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let response = adapter.chat(&req).await.unwrap();
        assert_eq!(response.completion_text(), "hello there");
        assert_eq!(response.usage, Usage::new(5, 2));
    }

    #[tokio::test]
    async fn test_chat_upstream_error_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let adapter = adapter(&format!("{}/v1", server.uri()));
        let req = chat_request(serde_json::json!({
            "model": "alias",
            "messages": [{"role": "user", "content": "hi"}],
        }));
        let err = adapter.chat(&req).await.unwrap_err();
        assert!(err.retryable());
        match err {
            AdapterError::Upstream { status, message } => {
                assert_eq!(status, 503);
                assert!(message.contains("overloaded"));
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chat_stream_forwards_chunks_and_usage() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"he\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"chatcmpl-1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o-mini\",\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2,\"total_tokens\":5}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(sse_body),
            )
            .mount(&server)
            .await;

        let adapter = adapter(&format!("{}/v1", server.uri()));
        let req = chat_request(serde_json::json!({
            "model": "alias",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }));
        let mut stream = adapter.chat_stream(&req).await.unwrap();

        let mut text = String::new();
        let mut usage = None;
        while let Some(chunk) = stream.next_chunk().await {
            let chunk = chunk.unwrap();
            text.push_str(chunk.text());
            if let Some(u) = chunk.usage {
                usage = Some(u);
            }
        }
        assert_eq!(text, "hello");
        assert_eq!(usage, Some(Usage::new(3, 2)));
    }

    #[tokio::test]
    async fn test_build_decrypts_credential() {
        let secrets = SecretBox::new("master");
        let entry = CatalogEntry {
            id: uuid::Uuid::new_v4(),
            alias: "gpt-test".into(),
            provider: "openai".into(),
            provider_model: "gpt-4o-mini".into(),
            deployment: None,
            endpoint: None,
            api_key_ciphertext: Some(secrets.encrypt("sk-upstream").unwrap()),
            api_version: None,
            region: None,
            modalities: serde_json::json!(["text"]),
            supports_tools: true,
            price_input: rust_decimal::Decimal::ZERO,
            price_output: rust_decimal::Decimal::ZERO,
            currency: "USD".into(),
            weight: 1.0,
            enabled: true,
            metadata_json: serde_json::json!({}),
            provider_config_json: serde_json::json!({}),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let ctx = BuildContext {
            http: reqwest::Client::new(),
            secrets: &secrets,
        };
        let adapter = (DEFINITION.build)(&entry, &ctx).unwrap();
        assert!(adapter.capabilities().contains(&Capability::ImageEdit));
    }
}
