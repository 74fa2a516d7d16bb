//! Request dispatch: the pipeline every billable request walks through.
//!
//! Order per request: alias resolution → rate-limit admission → budget
//! pre-check → guardrail pre-check → idempotency lookup → route selection
//! with breaker-aware failover → invoke → guardrail post-check → usage
//! recording → budget post-update. The dispatcher is the only retry
//! authority: adapters classify errors, this module decides whether the
//! next candidate is tried, and breaker accounting stays consistent
//! because both happen in one place.
//!
//! The batch worker drives the same code through
//! [`Dispatcher::execute_batch_item`], so limits, budgets, and guardrails
//! apply to batch traffic identically.

use bytes::Bytes;
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::auth::AuthContext;
use crate::budget::{BudgetEvaluator, BudgetSnapshot};
use crate::db::handlers::Guardrails;
use crate::db::models::guardrails::GuardrailEventDraft;
use crate::db::models::usage::UsageDraft;
use crate::errors::{Error, GuardrailStage, Result};
use crate::guardrails::{GuardrailConfig, GuardrailEvaluator, effective_config};
use crate::idempotency::IdempotencyCache;
use crate::openai::{
    AudioTranscriptionRequest, AudioTranscriptionResponse, ChatRequest, ChatResponse,
    EmbeddingsRequest, EmbeddingsResponse, ImageEditRequest, ImageGenerationRequest, ImageResponse,
    ImageVariationRequest, SSE_DONE, SpeechRequest, Usage,
};
use crate::providers::{AdapterError, AdapterResult, Capability};
use crate::ratelimit::{LimitLease, RateLimiter};
use crate::router::{Route, RouterEngine};
use crate::usage::{UsageRecorder, cost_cents, estimate_tokens, flat_cost_cents};

/// A response plus the budget view used for `X-Budget-*` headers.
pub struct Outcome<T> {
    pub reply: Reply<T>,
    pub snapshot: BudgetSnapshot,
}

/// Fresh result, or bytes replayed verbatim from the idempotency cache.
pub enum Reply<T> {
    Fresh(T),
    Cached(Bytes),
}

/// Handle for a server-sent-event stream: pre-serialized frame payloads.
/// The driver task owns the rate-limit lease and usage accounting; dropping
/// the receiver (client disconnect) tears the upstream producer down.
pub struct StreamReply {
    pub frames: mpsc::Receiver<String>,
    pub snapshot: BudgetSnapshot,
}

#[derive(Clone)]
pub struct Dispatcher {
    pool: PgPool,
    router: Arc<RouterEngine>,
    limiter: RateLimiter,
    budget: Arc<BudgetEvaluator>,
    guardrails: GuardrailEvaluator,
    usage: UsageRecorder,
    idempotency: IdempotencyCache,
    redaction_sentinel: String,
    idle_chunk_timeout: Duration,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        router: Arc<RouterEngine>,
        limiter: RateLimiter,
        budget: Arc<BudgetEvaluator>,
        guardrails: GuardrailEvaluator,
        usage: UsageRecorder,
        idempotency: IdempotencyCache,
        redaction_sentinel: String,
        idle_chunk_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            router,
            limiter,
            budget,
            guardrails,
            usage,
            idempotency,
            redaction_sentinel,
            idle_chunk_timeout,
        }
    }

    pub fn router(&self) -> &RouterEngine {
        &self.router
    }

    /// Alias resolution: the alias must be in the tenant's allowed set and
    /// currently routable (disabled catalog entries never enter the router).
    fn check_alias(&self, ctx: &AuthContext, alias: &str) -> Result<()> {
        if !ctx.tenant.allows_alias(alias) || !self.router.has_alias(alias) {
            return Err(Error::ModelNotFound {
                alias: alias.to_string(),
            });
        }
        Ok(())
    }

    async fn guardrail_config(&self, ctx: &AuthContext) -> GuardrailConfig {
        let tenant_policy = match Guardrails::tenant_policy(&self.pool, ctx.tenant.id).await {
            Ok(policy) => policy,
            Err(e) => {
                tracing::error!(tenant = %ctx.tenant.id, "tenant guardrail policy load failed: {e:#}");
                None
            }
        };
        let key_policy = match Guardrails::api_key_policy(&self.pool, ctx.api_key.id).await {
            Ok(policy) => policy,
            Err(e) => {
                tracing::error!(api_key = %ctx.api_key.id, "api-key guardrail policy load failed: {e:#}");
                None
            }
        };
        effective_config(
            tenant_policy.as_ref().map(|p| &p.config),
            key_policy.as_ref().map(|p| &p.config),
        )
    }

    async fn record_guardrail_event(&self, ctx: &AuthContext, stage: GuardrailStage, action: &str, violations: &[String], error: Option<String>) {
        let draft = GuardrailEventDraft {
            tenant_id: ctx.tenant.id,
            api_key_id: Some(ctx.api_key.id),
            stage: stage.as_str().to_string(),
            action: action.to_string(),
            violations: violations.to_vec(),
            error,
        };
        if let Err(e) = Guardrails::record_event(&self.pool, &draft).await {
            tracing::error!(tenant = %ctx.tenant.id, "failed to record guardrail event: {e:#}");
        }
    }

    /// Steps 3-5: admission. On success the caller holds the lease, the
    /// budget snapshot, and the effective guardrail config. On any failure
    /// nothing is held (the lease auto-releases on drop).
    async fn admit(&self, ctx: &AuthContext, prompt: &str) -> Result<(LimitLease, BudgetSnapshot, GuardrailConfig)> {
        let lease = self.limiter.allow(&ctx.scope(), &ctx.limits).await?;

        let snapshot = match self.budget.pre_check(&ctx.tenant).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };

        let config = self.guardrail_config(ctx).await;
        let evaluation = self.guardrails.pre_check(&config, prompt).await;
        if let Some(webhook_error) = &evaluation.webhook_error {
            self.record_guardrail_event(ctx, GuardrailStage::Prompt, "allow", &[], Some(webhook_error.clone()))
                .await;
        }
        if evaluation.verdict.is_block() {
            self.record_guardrail_event(ctx, GuardrailStage::Prompt, "block", &evaluation.verdict.violations, None)
                .await;
            lease.release().await;
            return Err(Error::GuardrailBlocked {
                stage: GuardrailStage::Prompt,
                violations: evaluation.verdict.violations,
            });
        }

        Ok((lease, snapshot, config))
    }

    /// Step 9 tail: record the usage row, advance the budget, emit metrics.
    async fn record_and_post(&self, ctx: &AuthContext, draft: UsageDraft) -> BudgetSnapshot {
        counter!(
            "turnpike_requests_total",
            "alias" => draft.alias.clone(),
            "provider" => draft.provider.clone(),
            "status" => draft.status.clone(),
        )
        .increment(1);
        histogram!("turnpike_request_latency_ms", "alias" => draft.alias.clone()).record(draft.latency_ms as f64);

        self.usage.record_best_effort(&draft).await;
        self.budget.post_update(&ctx.tenant).await
    }

    fn usage_draft(&self, ctx: &AuthContext, route: &Route, alias: &str, usage: &Usage, cost: i64, started: Instant, status: &str) -> UsageDraft {
        UsageDraft {
            tenant_id: ctx.tenant.id,
            api_key_id: Some(ctx.api_key.id),
            alias: alias.to_string(),
            provider: route.provider.as_str().to_string(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost_cents: cost,
            latency_ms: started.elapsed().as_millis() as u64,
            status: status.to_string(),
        }
    }

    // -----------------------------------------------------------------
    // Chat
    // -----------------------------------------------------------------

    pub async fn chat(&self, ctx: &AuthContext, req: &ChatRequest, idempotency_key: Option<&str>) -> Result<Outcome<ChatResponse>> {
        let alias = req.model.clone();
        self.check_alias(ctx, &alias)?;
        let started = Instant::now();

        let (lease, snapshot, config) = self.admit(ctx, &req.prompt_text()).await?;

        if let Some(key) = idempotency_key
            && let Some(cached) = self.idempotency.get(ctx.tenant.id, key).await
        {
            lease.release().await;
            return Ok(Outcome {
                reply: Reply::Cached(cached),
                snapshot,
            });
        }

        let invoked = invoke_with_failover(&self.router, &alias, Capability::Chat, |route| {
            Box::pin(async move { route.adapter.chat(req).await })
        })
        .await;

        let (mut response, route) = match invoked {
            Ok(ok) => ok,
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };

        // TPM is charged once real token counts exist; an overage rolls the
        // counter back and fails the request, but the spend still happened
        // upstream so the usage row is written regardless.
        if let Err(e) = self
            .limiter
            .token_allowance(&ctx.scope(), response.usage.total_tokens as i64, &ctx.limits)
            .await
        {
            let cost = cost_cents(
                response.usage.prompt_tokens,
                response.usage.completion_tokens,
                route.price_input,
                route.price_output,
            );
            let draft = self.usage_draft(ctx, &route, &alias, &response.usage, cost, started, "rate_limited");
            lease.release().await;
            self.record_and_post(ctx, draft).await;
            return Err(e);
        }

        // Post-generation guardrail: a block redacts, it does not error
        let evaluation = self.guardrails.post_check(&config, &response.completion_text()).await;
        if let Some(webhook_error) = &evaluation.webhook_error {
            self.record_guardrail_event(ctx, GuardrailStage::Response, "allow", &[], Some(webhook_error.clone()))
                .await;
        }
        if evaluation.verdict.is_block() {
            self.record_guardrail_event(ctx, GuardrailStage::Response, "redact", &evaluation.verdict.violations, None)
                .await;
            response.redact(&self.redaction_sentinel);
        }

        let cost = cost_cents(
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
            route.price_input,
            route.price_output,
        );
        let draft = self.usage_draft(ctx, &route, &alias, &response.usage, cost, started, "success");
        lease.release().await;
        let snapshot = self.record_and_post(ctx, draft).await;

        Ok(Outcome {
            reply: Reply::Fresh(response),
            snapshot,
        })
    }

    /// Cache a freshly served response body for replay.
    pub async fn cache_response(&self, ctx: &AuthContext, idempotency_key: Option<&str>, body: &Bytes) {
        if let Some(key) = idempotency_key {
            self.idempotency.put(ctx.tenant.id, key, body.clone()).await;
        }
    }

    // -----------------------------------------------------------------
    // Chat streaming
    // -----------------------------------------------------------------

    pub async fn chat_stream(&self, ctx: &AuthContext, req: &ChatRequest) -> Result<StreamReply> {
        let alias = req.model.clone();
        self.check_alias(ctx, &alias)?;
        let started = Instant::now();

        let (lease, snapshot, _config) = self.admit(ctx, &req.prompt_text()).await?;

        let opened = invoke_with_failover(&self.router, &alias, Capability::ChatStream, |route| {
            Box::pin(async move { route.adapter.chat_stream(req).await })
        })
        .await;

        let (mut chunks, route) = match opened {
            Ok(ok) => ok,
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel::<String>(16);
        let dispatcher = self.clone();
        let ctx = ctx.clone();
        let prompt_estimate = estimate_tokens(&req.prompt_text());
        let idle_timeout = self.idle_chunk_timeout;

        tokio::spawn(async move {
            let mut completion_text = String::new();
            let mut reported_usage: Option<Usage> = None;
            let mut failed = false;

            loop {
                let next = tokio::time::timeout(idle_timeout, chunks.next_chunk()).await;
                match next {
                    Ok(Some(Ok(chunk))) => {
                        completion_text.push_str(chunk.text());
                        if let Some(usage) = &chunk.usage {
                            reported_usage = Some(usage.clone());
                        }
                        let frame = match serde_json::to_string(&chunk) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::error!("failed to serialize chunk: {e}");
                                continue;
                            }
                        };
                        if tx.send(frame).await.is_err() {
                            // Client went away; producer is torn down below
                            break;
                        }
                    }
                    Ok(Some(Err(e))) => {
                        failed = true;
                        dispatcher.router.report_failure(&route);
                        let envelope = Error::from(e).envelope();
                        let _ = tx.send(envelope.to_string()).await;
                        let _ = tx.send(SSE_DONE.to_string()).await;
                        break;
                    }
                    Ok(None) => {
                        dispatcher.router.report_success(&route);
                        let _ = tx.send(SSE_DONE.to_string()).await;
                        break;
                    }
                    Err(_) => {
                        failed = true;
                        dispatcher.router.report_failure(&route);
                        let envelope = Error::Provider {
                            status: None,
                            message: "stream idle timeout exceeded".to_string(),
                        }
                        .envelope();
                        let _ = tx.send(envelope.to_string()).await;
                        let _ = tx.send(SSE_DONE.to_string()).await;
                        break;
                    }
                }
            }

            // Closes the upstream producer exactly once, whichever exit path
            // ran first
            chunks.close();

            // Usage from the terminal chunk when the provider supplied it,
            // estimated from forwarded text otherwise
            let usage = reported_usage
                .unwrap_or_else(|| Usage::new(prompt_estimate, estimate_tokens(&completion_text)));
            if let Err(e) = dispatcher
                .limiter
                .token_allowance(&ctx.scope(), usage.total_tokens as i64, &ctx.limits)
                .await
            {
                // The stream is already delivered; charge and log only
                tracing::info!(tenant = %ctx.tenant.id, "stream exceeded TPM window: {e}");
            }

            let status = if failed { "upstream_error" } else { "success" };
            let cost = cost_cents(usage.prompt_tokens, usage.completion_tokens, route.price_input, route.price_output);
            let draft = dispatcher.usage_draft(&ctx, &route, &alias, &usage, cost, started, status);
            lease.release().await;
            dispatcher.record_and_post(&ctx, draft).await;
        });

        Ok(StreamReply { frames: rx, snapshot })
    }

    // -----------------------------------------------------------------
    // Embeddings
    // -----------------------------------------------------------------

    pub async fn embeddings(
        &self,
        ctx: &AuthContext,
        req: &EmbeddingsRequest,
        idempotency_key: Option<&str>,
    ) -> Result<Outcome<EmbeddingsResponse>> {
        let alias = req.model.clone();
        self.check_alias(ctx, &alias)?;
        let started = Instant::now();

        let (lease, snapshot, _config) = self.admit(ctx, &req.input.joined()).await?;

        if let Some(key) = idempotency_key
            && let Some(cached) = self.idempotency.get(ctx.tenant.id, key).await
        {
            lease.release().await;
            return Ok(Outcome {
                reply: Reply::Cached(cached),
                snapshot,
            });
        }

        let invoked = invoke_with_failover(&self.router, &alias, Capability::Embeddings, |route| {
            Box::pin(async move { route.adapter.embeddings(req).await })
        })
        .await;

        let (response, route) = match invoked {
            Ok(ok) => ok,
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .limiter
            .token_allowance(&ctx.scope(), response.usage.total_tokens as i64, &ctx.limits)
            .await
        {
            let cost = cost_cents(response.usage.prompt_tokens, 0, route.price_input, route.price_output);
            let draft = self.usage_draft(ctx, &route, &alias, &response.usage, cost, started, "rate_limited");
            lease.release().await;
            self.record_and_post(ctx, draft).await;
            return Err(e);
        }

        let cost = cost_cents(response.usage.prompt_tokens, 0, route.price_input, route.price_output);
        let draft = self.usage_draft(ctx, &route, &alias, &response.usage, cost, started, "success");
        lease.release().await;
        let snapshot = self.record_and_post(ctx, draft).await;

        Ok(Outcome {
            reply: Reply::Fresh(response),
            snapshot,
        })
    }

    // -----------------------------------------------------------------
    // Images & audio (flat-priced operations)
    // -----------------------------------------------------------------

    async fn flat_priced<'a, T>(
        &self,
        ctx: &AuthContext,
        alias: &str,
        capability: Capability,
        prompt: &str,
        price_field: &str,
        units: u32,
        call: impl Fn(Arc<Route>) -> BoxFuture<'a, AdapterResult<T>>,
    ) -> Result<Outcome<T>> {
        self.check_alias(ctx, alias)?;
        let started = Instant::now();

        let (lease, _snapshot, _config) = self.admit(ctx, prompt).await?;

        let invoked = invoke_with_failover(&self.router, alias, capability, call).await;
        let (response, route) = match invoked {
            Ok(ok) => ok,
            Err(e) => {
                lease.release().await;
                return Err(e);
            }
        };

        let cost = flat_cost_cents(&route.metadata, price_field, units);
        let draft = self.usage_draft(ctx, &route, alias, &Usage::default(), cost, started, "success");
        lease.release().await;
        let snapshot = self.record_and_post(ctx, draft).await;

        Ok(Outcome {
            reply: Reply::Fresh(response),
            snapshot,
        })
    }

    pub async fn image_generation(&self, ctx: &AuthContext, alias: &str, req: &ImageGenerationRequest) -> Result<Outcome<ImageResponse>> {
        let units = req.n.unwrap_or(1);
        self.flat_priced(ctx, alias, Capability::ImageGeneration, &req.prompt, "price_image_cents", units, |route| {
            Box::pin(async move { route.adapter.image_generation(req).await })
        })
        .await
    }

    pub async fn image_edit(&self, ctx: &AuthContext, alias: &str, req: &ImageEditRequest) -> Result<Outcome<ImageResponse>> {
        let units = req.n.unwrap_or(1);
        self.flat_priced(ctx, alias, Capability::ImageEdit, &req.prompt, "price_image_cents", units, |route| {
            Box::pin(async move { route.adapter.image_edit(req).await })
        })
        .await
    }

    pub async fn image_variation(&self, ctx: &AuthContext, alias: &str, req: &ImageVariationRequest) -> Result<Outcome<ImageResponse>> {
        let units = req.n.unwrap_or(1);
        self.flat_priced(ctx, alias, Capability::ImageVariation, "", "price_image_cents", units, |route| {
            Box::pin(async move { route.adapter.image_variation(req).await })
        })
        .await
    }

    pub async fn transcribe(&self, ctx: &AuthContext, req: &AudioTranscriptionRequest) -> Result<Outcome<AudioTranscriptionResponse>> {
        let alias = req.model.clone();
        self.flat_priced(ctx, &alias, Capability::AudioTranscription, "", "price_audio_cents", 1, |route| {
            Box::pin(async move { route.adapter.transcribe(req).await })
        })
        .await
    }

    pub async fn translate_audio(&self, ctx: &AuthContext, req: &AudioTranscriptionRequest) -> Result<Outcome<AudioTranscriptionResponse>> {
        let alias = req.model.clone();
        self.flat_priced(ctx, &alias, Capability::AudioTranslation, "", "price_audio_cents", 1, |route| {
            Box::pin(async move { route.adapter.translate_audio(req).await })
        })
        .await
    }

    pub async fn speech(&self, ctx: &AuthContext, req: &SpeechRequest) -> Result<Outcome<Bytes>> {
        let alias = req.model.clone();
        self.flat_priced(ctx, &alias, Capability::AudioSpeech, &req.input, "price_speech_cents", 1, |route| {
            Box::pin(async move { route.adapter.speech(req).await })
        })
        .await
    }

    // -----------------------------------------------------------------
    // Batch items
    // -----------------------------------------------------------------

    /// Run one batch item through the non-streaming path, returning the
    /// response body for the output file.
    pub async fn execute_batch_item(&self, ctx: &AuthContext, endpoint: &str, body: &serde_json::Value) -> Result<serde_json::Value> {
        match endpoint {
            "/v1/chat/completions" => {
                let mut req: ChatRequest = serde_json::from_value(body.clone()).map_err(|e| Error::InvalidRequest {
                    message: format!("invalid chat completion body: {e}"),
                })?;
                req.stream = None;
                let outcome = self.chat(ctx, &req, None).await?;
                match outcome.reply {
                    Reply::Fresh(response) => Ok(serde_json::to_value(response).map_err(anyhow::Error::from)?),
                    Reply::Cached(_) => unreachable!("batch items bypass the idempotency cache"),
                }
            }
            "/v1/embeddings" => {
                let req: EmbeddingsRequest = serde_json::from_value(body.clone()).map_err(|e| Error::InvalidRequest {
                    message: format!("invalid embeddings body: {e}"),
                })?;
                let outcome = self.embeddings(ctx, &req, None).await?;
                match outcome.reply {
                    Reply::Fresh(response) => Ok(serde_json::to_value(response).map_err(anyhow::Error::from)?),
                    Reply::Cached(_) => unreachable!("batch items bypass the idempotency cache"),
                }
            }
            "/v1/images/generations" => {
                let req: ImageGenerationRequest = serde_json::from_value(body.clone()).map_err(|e| Error::InvalidRequest {
                    message: format!("invalid image generation body: {e}"),
                })?;
                let alias = req.model.clone().ok_or_else(|| Error::InvalidRequest {
                    message: "image generation requires a model".to_string(),
                })?;
                let outcome = self.image_generation(ctx, &alias, &req).await?;
                match outcome.reply {
                    Reply::Fresh(response) => Ok(serde_json::to_value(response).map_err(anyhow::Error::from)?),
                    Reply::Cached(_) => unreachable!("batch items bypass the idempotency cache"),
                }
            }
            other => Err(Error::InvalidRequest {
                message: format!("unsupported batch endpoint: {other}"),
            }),
        }
    }
}

/// Breaker-aware failover over the candidate list. Retryable errors (5xx,
/// connection, timeout) count against the breaker and advance to the next
/// candidate; 4xx stops the cascade immediately.
pub async fn invoke_with_failover<'a, T>(
    router: &RouterEngine,
    alias: &str,
    capability: Capability,
    call: impl Fn(Arc<Route>) -> BoxFuture<'a, AdapterResult<T>>,
) -> Result<(T, Arc<Route>)> {
    let routes = router.select_routes(alias);
    if routes.is_empty() {
        return Err(Error::ServiceUnavailable {
            message: format!("no healthy upstream for model `{alias}`"),
        });
    }

    let capable: Vec<Arc<Route>> = routes.into_iter().filter(|r| r.supports(capability)).collect();
    if capable.is_empty() {
        return Err(Error::OperationUnsupported {
            operation: capability.as_str().to_string(),
        });
    }

    let mut last_err: Option<AdapterError> = None;
    for route in capable {
        match call(route.clone()).await {
            Ok(response) => {
                router.report_success(&route);
                return Ok((response, route));
            }
            Err(e) => {
                if e.retryable() {
                    router.report_failure(&route);
                    tracing::warn!(alias, deployment = %route.deployment, "attempt failed, trying next candidate: {e}");
                    last_err = Some(e);
                } else {
                    // Provider rejected the request itself; the route is fine
                    return Err(e.into());
                }
            }
        }
    }

    Err(last_err.map(Error::from).unwrap_or(Error::ServiceUnavailable {
        message: format!("no healthy upstream for model `{alias}`"),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::BreakerConfig;
    use crate::router::tests::test_route;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine(routes: Vec<Arc<Route>>) -> RouterEngine {
        let engine = RouterEngine::new(BreakerConfig::default());
        let mut table: HashMap<String, Vec<Arc<Route>>> = HashMap::new();
        for route in routes {
            table.entry(route.alias.clone()).or_default().push(route);
        }
        engine.reload(table);
        engine
    }

    #[tokio::test]
    async fn test_failover_advances_on_retryable_error() {
        let engine = engine(vec![test_route("m", "a", 1.0), test_route("m", "b", 1.0)]);
        let attempts = AtomicU32::new(0);

        let (value, route) = invoke_with_failover(&engine, "m", Capability::Chat, |_route| {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n == 0 {
                    Err(AdapterError::Upstream {
                        status: 502,
                        message: "bad gateway".into(),
                    })
                } else {
                    Ok(42u32)
                }
            })
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // The succeeding route's breaker streak was reset
        engine.report_failure(&route);
    }

    #[tokio::test]
    async fn test_failover_stops_on_non_retryable_error() {
        let engine = engine(vec![test_route("m", "a", 1.0), test_route("m", "b", 1.0)]);
        let attempts = AtomicU32::new(0);

        let err = invoke_with_failover(&engine, "m", Capability::Chat, |_route| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                Err::<u32, _>(AdapterError::Upstream {
                    status: 400,
                    message: "bad request".into(),
                })
            })
        })
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 1, "4xx must not cascade");
        assert!(matches!(err, Error::Provider { status: Some(400), .. }));
    }

    #[tokio::test]
    async fn test_failover_exhaustion_returns_last_error() {
        let engine = engine(vec![test_route("m", "a", 1.0), test_route("m", "b", 1.0)]);

        let err = invoke_with_failover(&engine, "m", Capability::Chat, |_route| {
            Box::pin(async move { Err::<u32, _>(AdapterError::Timeout) })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, Error::Provider { .. }));
    }

    #[tokio::test]
    async fn test_unknown_alias_is_service_unavailable() {
        let engine = engine(vec![]);
        let err = invoke_with_failover(&engine, "ghost", Capability::Chat, |_route| {
            Box::pin(async move { Ok(1u32) })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_missing_capability_is_operation_unsupported() {
        // StaticAdapter supports chat/stream/embeddings but not image ops
        let engine = engine(vec![test_route("m", "a", 1.0)]);
        let err = invoke_with_failover(&engine, "m", Capability::ImageEdit, |_route| {
            Box::pin(async move { Ok(1u32) })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::OperationUnsupported { .. }));
        assert_eq!(err.error_code(), "image_operation_unsupported");
    }

    #[tokio::test]
    async fn test_repeated_failures_open_breaker_through_failover() {
        let engine = engine(vec![test_route("m", "a", 1.0)]);

        for _ in 0..3 {
            let _ = invoke_with_failover(&engine, "m", Capability::Chat, |_route| {
                Box::pin(async move { Err::<u32, _>(AdapterError::Timeout) })
            })
            .await;
        }
        // Three retryable failures opened the breaker
        assert!(engine.select_routes("m").is_empty());
    }
}
