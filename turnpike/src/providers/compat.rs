//! Adapter for OpenAI-compatible servers (vLLM, TGI, Ollama, LiteLLM and
//! friends).
//!
//! Wire behavior is identical to the native adapter; the differences are a
//! mandatory `endpoint`, an optional credential, and a conservative
//! capability surface (text only - compatible servers rarely implement the
//! image and audio routes faithfully).

use std::sync::Arc;

use async_trait::async_trait;

use super::openai::OpenAiAdapter;
use super::{Adapter, AdapterResult, BuildContext, Capability, Definition};
use crate::db::models::catalog::CatalogEntry;
use crate::errors::Error as GatewayError;
use crate::openai::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse};
use crate::streaming::ChunkStream;

pub static DEFINITION: Definition = Definition {
    name: "openai_compatible",
    description: "Any server speaking the OpenAI chat/embeddings API",
    capabilities: &[
        Capability::Chat,
        Capability::ChatStream,
        Capability::Embeddings,
        Capability::Models,
    ],
    build: build,
};

fn build(entry: &CatalogEntry, ctx: &BuildContext) -> Result<Arc<dyn Adapter>, GatewayError> {
    let endpoint = entry.endpoint.clone().ok_or_else(|| GatewayError::Internal {
        operation: format!(
            "build openai_compatible route for `{}`: catalog entry has no endpoint",
            entry.alias
        ),
    })?;
    // Many self-hosted servers run without auth; send a placeholder then
    let api_key = ctx.credential(entry)?.unwrap_or_else(|| "none".to_string());
    Ok(Arc::new(CompatAdapter {
        inner: OpenAiAdapter::new(ctx.http.clone(), endpoint, api_key, entry.provider_model.clone()),
    }))
}

pub struct CompatAdapter {
    inner: OpenAiAdapter,
}

#[async_trait]
impl Adapter for CompatAdapter {
    fn capabilities(&self) -> &'static [Capability] {
        DEFINITION.capabilities
    }

    async fn chat(&self, req: &ChatRequest) -> AdapterResult<ChatResponse> {
        self.inner.chat(req).await
    }

    async fn chat_stream(&self, req: &ChatRequest) -> AdapterResult<ChunkStream> {
        self.inner.chat_stream(req).await
    }

    async fn embeddings(&self, req: &EmbeddingsRequest) -> AdapterResult<EmbeddingsResponse> {
        self.inner.embeddings(req).await
    }

    async fn health(&self) -> AdapterResult<()> {
        self.inner.health().await
    }
}
