//! AWS Bedrock adapter.
//!
//! Chat uses the Converse / ConverseStream APIs, which normalize the
//! model-specific prompt formats on the AWS side; embeddings use
//! InvokeModel with the Titan embeddings body. Credentials come from the
//! ambient AWS environment (the standard provider chain), not the catalog
//! entry; the entry supplies region and model id.
//!
//! The SDK client is built lazily on first use because config loading is
//! asynchronous while route construction is not.

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_bedrockruntime::Client;
use aws_sdk_bedrockruntime::config::Region;
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ContentBlockDelta, ConversationRole, ConverseOutput, ConverseStreamOutput,
    InferenceConfiguration, Message, StopReason, SystemContentBlock,
};
use serde_json::json;
use tokio::sync::OnceCell;

use super::{
    Adapter, AdapterError, AdapterResult, BuildContext, Capability, Definition, canonical_messages,
};
use crate::db::models::catalog::CatalogEntry;
use crate::errors::Error as GatewayError;
use crate::openai::{
    ChatChunk, ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, Role, Usage,
    response_id,
};
use crate::streaming::{ChunkStream, spawn_producer};

pub static DEFINITION: Definition = Definition {
    name: "bedrock",
    description: "AWS Bedrock (Converse + Titan embeddings)",
    capabilities: &[Capability::Chat, Capability::ChatStream, Capability::Embeddings],
    build: build,
};

fn build(entry: &CatalogEntry, _ctx: &BuildContext) -> Result<Arc<dyn Adapter>, GatewayError> {
    Ok(Arc::new(BedrockAdapter {
        region: entry.region.clone(),
        model: entry.provider_model.clone(),
        client: OnceCell::new(),
    }))
}

pub struct BedrockAdapter {
    region: Option<String>,
    model: String,
    client: OnceCell<Client>,
}

fn sdk_error<E, R>(err: aws_sdk_bedrockruntime::error::SdkError<E, R>) -> AdapterError
where
    E: std::fmt::Debug,
    R: std::fmt::Debug,
{
    use aws_sdk_bedrockruntime::error::SdkError;
    match &err {
        SdkError::TimeoutError(_) => AdapterError::Timeout,
        SdkError::DispatchFailure(_) => AdapterError::Connection(format!("{err:?}")),
        SdkError::ServiceError(_) => AdapterError::Upstream {
            // The smithy response type is opaque here; 502 keeps the
            // dispatcher's retry classification on the retryable side
            status: 502,
            message: format!("{err:?}").chars().take(512).collect(),
        },
        _ => AdapterError::Connection(format!("{err:?}").chars().take(512).collect()),
    }
}

fn map_stop_reason(reason: &StopReason) -> &'static str {
    match reason {
        StopReason::MaxTokens => "length",
        StopReason::ContentFiltered => "content_filter",
        _ => "stop",
    }
}

/// Split the normalized request into Converse inputs: system text, turns,
/// and inference configuration.
fn converse_inputs(
    req: &ChatRequest,
) -> AdapterResult<(Vec<SystemContentBlock>, Vec<Message>, InferenceConfiguration)> {
    let canonical = canonical_messages(req)?;

    let mut system = Vec::new();
    let mut messages = Vec::new();
    for message in canonical {
        let text = message.text().to_string();
        match message.role {
            Role::System => system.push(SystemContentBlock::Text(text)),
            role => {
                let converse_role = if role == Role::Assistant {
                    ConversationRole::Assistant
                } else {
                    ConversationRole::User
                };
                let built = Message::builder()
                    .role(converse_role)
                    .content(ContentBlock::Text(text))
                    .build()
                    .map_err(|e| AdapterError::InvalidRequest(format!("build converse message: {e}")))?;
                messages.push(built);
            }
        }
    }
    if messages.is_empty() {
        return Err(AdapterError::InvalidRequest(
            "request contains no user or assistant messages".to_string(),
        ));
    }

    let mut inference = InferenceConfiguration::builder();
    if let Some(max_tokens) = req.max_tokens {
        inference = inference.max_tokens(max_tokens as i32);
    }
    if let Some(temperature) = req.temperature {
        inference = inference.temperature(temperature as f32);
    }
    if let Some(top_p) = req.top_p {
        inference = inference.top_p(top_p as f32);
    }
    if let Some(stop) = &req.stop {
        for sequence in stop.as_vec() {
            inference = inference.stop_sequences(sequence);
        }
    }

    Ok((system, messages, inference.build()))
}

impl BedrockAdapter {
    async fn client(&self) -> &Client {
        self.client
            .get_or_init(|| async {
                let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
                if let Some(region) = &self.region {
                    loader = loader.region(Region::new(region.clone()));
                }
                Client::new(&loader.load().await)
            })
            .await
    }
}

#[async_trait]
impl Adapter for BedrockAdapter {
    fn capabilities(&self) -> &'static [Capability] {
        DEFINITION.capabilities
    }

    async fn chat(&self, req: &ChatRequest) -> AdapterResult<ChatResponse> {
        let (system, messages, inference) = converse_inputs(req)?;
        let output = self
            .client()
            .await
            .converse()
            .model_id(&self.model)
            .set_system(Some(system))
            .set_messages(Some(messages))
            .inference_config(inference)
            .send()
            .await
            .map_err(sdk_error)?;

        let text = match output.output() {
            Some(ConverseOutput::Message(message)) => message
                .content()
                .iter()
                .filter_map(|block| block.as_text().ok())
                .cloned()
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        };

        let usage = output
            .usage()
            .map(|u| Usage::new(u.input_tokens().max(0) as u32, u.output_tokens().max(0) as u32))
            .unwrap_or_default();

        let mut translated = ChatResponse::new(&self.model, text, usage);
        translated.choices[0].finish_reason = Some(map_stop_reason(output.stop_reason()).to_string());
        Ok(translated)
    }

    async fn chat_stream(&self, req: &ChatRequest) -> AdapterResult<ChunkStream> {
        let (system, messages, inference) = converse_inputs(req)?;
        let output = self
            .client()
            .await
            .converse_stream()
            .model_id(&self.model)
            .set_system(Some(system))
            .set_messages(Some(messages))
            .inference_config(inference)
            .send()
            .await
            .map_err(sdk_error)?;

        let model = self.model.clone();
        let mut events = output.stream;
        Ok(spawn_producer(move |sender| async move {
            let chunk_id = response_id("chatcmpl");
            loop {
                let event = match events.recv().await {
                    Ok(Some(event)) => event,
                    Ok(None) => return,
                    Err(e) => {
                        let _ = sender
                            .send(Err(AdapterError::Connection(format!("{e:?}").chars().take(512).collect())))
                            .await;
                        return;
                    }
                };
                match event {
                    ConverseStreamOutput::ContentBlockDelta(delta_event) => {
                        let text = delta_event
                            .delta()
                            .and_then(|d| match d {
                                ContentBlockDelta::Text(text) => Some(text.clone()),
                                _ => None,
                            })
                            .unwrap_or_default();
                        if !text.is_empty()
                            && !sender.send(Ok(ChatChunk::content_delta(&model, &chunk_id, text))).await
                        {
                            return;
                        }
                    }
                    ConverseStreamOutput::Metadata(metadata) => {
                        if let Some(u) = metadata.usage() {
                            let usage = Usage::new(u.input_tokens().max(0) as u32, u.output_tokens().max(0) as u32);
                            let _ = sender.send(Ok(ChatChunk::usage_only(&model, &chunk_id, usage))).await;
                        }
                    }
                    ConverseStreamOutput::MessageStop(_) => {
                        // Metadata (with usage) may still follow; keep draining
                    }
                    _ => {}
                }
            }
        }))
    }

    async fn embeddings(&self, req: &EmbeddingsRequest) -> AdapterResult<EmbeddingsResponse> {
        let inputs = req.input.as_vec();
        let mut vectors = Vec::with_capacity(inputs.len());
        let mut prompt_tokens = 0u32;

        // Titan embeds one text per call
        for input in &inputs {
            let body = json!({"inputText": input});
            let output = self
                .client()
                .await
                .invoke_model()
                .model_id(&self.model)
                .content_type("application/json")
                .accept("application/json")
                .body(Blob::new(body.to_string()))
                .send()
                .await
                .map_err(sdk_error)?;

            let parsed: serde_json::Value = serde_json::from_slice(output.body().as_ref())
                .map_err(|e| AdapterError::Connection(format!("decode titan response: {e}")))?;
            let embedding: Vec<f32> = parsed["embedding"]
                .as_array()
                .map(|values| values.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect())
                .unwrap_or_default();
            prompt_tokens += parsed["inputTextTokenCount"].as_u64().unwrap_or(0) as u32;
            vectors.push(embedding);
        }

        Ok(EmbeddingsResponse::new(&self.model, vectors, Usage::new(prompt_tokens, 0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_request(json: serde_json::Value) -> ChatRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_converse_inputs_split_system_and_turns() {
        let req = chat_request(json!({
            "model": "alias",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
            ],
            "max_tokens": 64,
            "stop": ["END"],
        }));
        let (system, messages, inference) = converse_inputs(&req).unwrap();
        assert_eq!(system.len(), 1);
        assert_eq!(messages.len(), 2);
        assert_eq!(*messages[0].role(), ConversationRole::User);
        assert_eq!(*messages[1].role(), ConversationRole::Assistant);
        assert_eq!(inference.max_tokens(), Some(64));
        assert_eq!(inference.stop_sequences(), &["END".to_string()]);
    }

    #[test]
    fn test_converse_inputs_reject_system_only_request() {
        let req = chat_request(json!({
            "model": "alias",
            "messages": [{"role": "system", "content": "be brief"}],
        }));
        assert!(matches!(
            converse_inputs(&req).unwrap_err(),
            AdapterError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(map_stop_reason(&StopReason::EndTurn), "stop");
        assert_eq!(map_stop_reason(&StopReason::MaxTokens), "length");
        assert_eq!(map_stop_reason(&StopReason::StopSequence), "stop");
    }
}
