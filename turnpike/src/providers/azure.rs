//! Azure OpenAI adapter.
//!
//! Azure routes by deployment rather than model name, authenticates with an
//! `api-key` header, and versions every call with an `api-version` query
//! parameter. Request and response bodies are otherwise the OpenAI schema,
//! so the body builders are shared with the native adapter.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde_json::json;

use super::openai::{chat_body, check_image_count, embeddings_body};
use super::{
    Adapter, AdapterError, AdapterResult, BuildContext, Capability, Definition, UPSTREAM_TIMEOUT,
    upstream_error,
};
use crate::db::models::catalog::CatalogEntry;
use crate::errors::Error as GatewayError;
use crate::openai::{
    AudioTranscriptionRequest, AudioTranscriptionResponse, ChatRequest, ChatResponse,
    EmbeddingsRequest, EmbeddingsResponse, ImageGenerationRequest, ImageResponse, SpeechRequest,
};
use crate::streaming::{ChunkStream, forward_sse, spawn_producer};

const DEFAULT_API_VERSION: &str = "2024-06-01";

pub static DEFINITION: Definition = Definition {
    name: "azure",
    description: "Azure OpenAI deployments",
    capabilities: &[
        Capability::Chat,
        Capability::ChatStream,
        Capability::Embeddings,
        Capability::ImageGeneration,
        Capability::AudioTranscription,
        Capability::AudioTranslation,
        Capability::AudioSpeech,
    ],
    build: build,
};

fn build(entry: &CatalogEntry, ctx: &BuildContext) -> Result<Arc<dyn Adapter>, GatewayError> {
    let api_key = ctx.credential(entry)?.ok_or_else(|| GatewayError::Internal {
        operation: format!("build azure route for `{}`: catalog entry has no credential", entry.alias),
    })?;
    let endpoint = entry.endpoint.clone().ok_or_else(|| GatewayError::Internal {
        operation: format!("build azure route for `{}`: catalog entry has no endpoint", entry.alias),
    })?;
    let deployment = entry.deployment.clone().ok_or_else(|| GatewayError::Internal {
        operation: format!("build azure route for `{}`: catalog entry has no deployment", entry.alias),
    })?;

    Ok(Arc::new(AzureAdapter {
        http: ctx.http.clone(),
        endpoint: endpoint.trim_end_matches('/').to_string(),
        deployment,
        api_key,
        api_version: entry
            .api_version
            .clone()
            .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        model: entry.provider_model.clone(),
    }))
}

pub struct AzureAdapter {
    http: reqwest::Client,
    endpoint: String,
    deployment: String,
    api_key: String,
    api_version: String,
    model: String,
}

impl AzureAdapter {
    fn url(&self, path: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{path}?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> AdapterResult<T> {
        let response = self
            .http
            .post(self.url(path))
            .header("api-key", &self.api_key)
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
}

#[async_trait]
impl Adapter for AzureAdapter {
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
            .header("api-key", &self.api_key)
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
        let mut body = json!({"prompt": req.prompt});
        if let Some(n) = req.n {
            body["n"] = json!(n);
        }
        if let Some(size) = &req.size {
            body["size"] = json!(size);
        }
        if let Some(format) = req.response_format {
            body["response_format"] = json!(match format {
                crate::openai::ImageResponseFormat::Url => "url",
                crate::openai::ImageResponseFormat::B64Json => "b64_json",
            });
        }
        self.post_json("images/generations", &body).await
    }

    async fn transcribe(&self, req: &AudioTranscriptionRequest) -> AdapterResult<AudioTranscriptionResponse> {
        self.post_audio("audio/transcriptions", req).await
    }

    async fn translate_audio(&self, req: &AudioTranscriptionRequest) -> AdapterResult<AudioTranscriptionResponse> {
        self.post_audio("audio/translations", req).await
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
            .header("api-key", &self.api_key)
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
        let url = format!("{}/openai/models?api-version={}", self.endpoint, self.api_version);
        let response = self
            .http
            .get(url)
            .header("api-key", &self.api_key)
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

impl AzureAdapter {
    async fn post_audio(&self, path: &str, req: &AudioTranscriptionRequest) -> AdapterResult<AudioTranscriptionResponse> {
        let mut form = Form::new().part("file", Part::bytes(req.file.to_vec()).file_name(req.filename.clone()));
        if let Some(language) = &req.language {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = &req.prompt {
            form = form.text("prompt", prompt.clone());
        }
        if let Some(temperature) = req.temperature {
            form = form.text("temperature", temperature.to_string());
        }

        let response = self
            .http
            .post(self.url(path))
            .header("api-key", &self.api_key)
            .timeout(UPSTREAM_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(AdapterError::from_reqwest)?;

        if !response.status().is_success() {
            return Err(upstream_error(response).await);
        }
        response
            .json::<AudioTranscriptionResponse>()
            .await
            .map_err(|e| AdapterError::Connection(format!("decode upstream response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_azure_url_shape_and_auth_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/deployments/prod-gpt4/chat/completions"))
            .and(query_param("api-version", "2024-06-01"))
            .and(header("api-key", "azure-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1,
                "model": "gpt-4",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "ok"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = AzureAdapter {
            http: reqwest::Client::new(),
            endpoint: server.uri(),
            deployment: "prod-gpt4".to_string(),
            api_key: "azure-key".to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            model: "gpt-4".to_string(),
        };
        let req: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "alias",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap();
        let response = adapter.chat(&req).await.unwrap();
        assert_eq!(response.completion_text(), "ok");
    }
}
