//! # turnpike: a multi-tenant gateway for OpenAI-compatible traffic
//!
//! `turnpike` sits between API consumers and heterogeneous model providers
//! (OpenAI, Azure OpenAI, Anthropic, AWS Bedrock, Google Vertex, and any
//! OpenAI-compatible server). Clients speak the OpenAI HTTP API against a
//! curated catalog of model aliases; the gateway authenticates the caller,
//! enforces rate limits and budgets, applies guardrail policies, picks a
//! healthy upstream route, translates the request to the provider's wire
//! format, and accounts for usage and cost - exposing one normalized
//! response shape regardless of who served the request.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum); PostgreSQL
//! holds all durable state (tenants, keys, catalog, usage, files, batches)
//! and Redis holds the in-flight rate-limit counters.
//!
//! ### Request flow
//!
//! A call to `/v1/chat/completions` is authenticated by prefix lookup and
//! Argon2id verification of the bearer key, then walks the dispatch
//! pipeline in [`dispatch`]: rate-limit admission, budget pre-check,
//! guardrail screening, idempotency lookup, and breaker-aware weighted
//! route selection through the [`router`] engine. The chosen [`providers`]
//! adapter translates to the upstream schema (streaming responses are
//! bridged chunk-by-chunk through [`streaming`]), and the tail of the
//! pipeline records a usage row and advances the tenant's budget window.
//!
//! ### Background services
//!
//! Alongside the server run a catalog reload sweep (keeping the in-memory
//! route table in step with the database), a route health monitor feeding
//! the circuit breakers, a file TTL sweeper, and the [`batches`] worker,
//! which drains queued batch items through the same dispatch pipeline as
//! live traffic.
//!
//! ## Quick start
//!
//! ```no_run
//! use clap::Parser;
//! use turnpike::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = turnpike::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     turnpike::telemetry::init_telemetry()?;
//!
//!     Application::new(config).await?.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     }).await
//! }
//! ```

pub mod alerts;
pub mod api;
pub mod auth;
pub mod batches;
pub mod budget;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod files;
pub mod guardrails;
pub mod idempotency;
pub mod openai;
pub mod providers;
pub mod ratelimit;
pub mod storage;
pub mod streaming;
pub mod telemetry;
pub mod types;
pub mod usage;

pub mod router;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::alerts::AlertDispatcher;
use crate::batches::{BatchService, worker::BatchWorker};
use crate::budget::BudgetEvaluator;
pub use crate::config::Config;
use crate::crypto::SecretBox;
use crate::db::handlers::Catalog;
use crate::dispatch::Dispatcher;
use crate::files::FileService;
use crate::guardrails::GuardrailEvaluator;
use crate::idempotency::IdempotencyCache;
use crate::providers::BuildContext;
use crate::ratelimit::{LimitConfig, RateLimiter};
use crate::router::{BreakerConfig, RouterEngine, build_route_table, health::HealthMonitor};
use crate::usage::UsageRecorder;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub dispatcher: Arc<Dispatcher>,
    pub files: FileService,
    pub batches: BatchService,
    pub limiter: RateLimiter,
    pub default_limits: LimitConfig,
}

/// Get the turnpike database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// The assembled application: shared state plus the background services
/// that [`Application::serve`] spawns next to the HTTP server.
pub struct Application {
    state: AppState,
    engine: Arc<RouterEngine>,
    worker: Option<Arc<BatchWorker>>,
    http: reqwest::Client,
    secrets: SecretBox,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_secs))
            .connect(&config.database.url)
            .await?;
        migrator().run(&pool).await?;
        info!("database connected and migrated");

        let limiter = RateLimiter::connect(&config.redis.url).await?;
        info!("redis connected");

        let secret_key = match &config.secret_key {
            Some(key) => key.clone(),
            None => {
                tracing::warn!(
                    "no secret_key configured; catalog credentials encrypted this run cannot be read after restart"
                );
                use base64::Engine as _;
                use rand::RngCore;
                let mut random = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut random);
                base64::engine::general_purpose::STANDARD.encode(random)
            }
        };
        let secrets = SecretBox::new(&secret_key);

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let engine = Arc::new(RouterEngine::new(BreakerConfig {
            failure_threshold: config.router.breaker_failure_threshold,
            cooldown: config.router.breaker_cooldown,
        }));
        let entries = Catalog::enabled_entries(&pool).await?;
        let table = build_route_table(
            &entries,
            &BuildContext {
                http: http.clone(),
                secrets: &secrets,
            },
        );
        info!(aliases = table.len(), entries = entries.len(), "route table built");
        engine.reload(table);

        let store = storage::create_blob_store(&config.file_storage).await?;
        let files = FileService::new(
            pool.clone(),
            store,
            config.file_storage.encryption_key.is_some(),
            config.file_storage.upload_ttl,
        );

        let alert_dispatcher = Arc::new(AlertDispatcher::from_config(&config.alerts, http.clone()));
        let budget = Arc::new(BudgetEvaluator::new(
            pool.clone(),
            alert_dispatcher,
            config.reporting_utc_offset_minutes,
        ));
        let guardrails = GuardrailEvaluator::new(http.clone(), config.guardrails.webhook_timeout);
        let recorder = UsageRecorder::new(pool.clone());
        let idempotency = IdempotencyCache::new(config.idempotency.capacity, config.idempotency.ttl);

        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            engine.clone(),
            limiter.clone(),
            budget,
            guardrails,
            recorder,
            idempotency,
            config.guardrails.redaction_sentinel.clone(),
            config.streaming.idle_chunk_timeout,
        ));

        let default_limits = LimitConfig {
            rpm: config.limits.rpm_default,
            tpm: config.limits.tpm_default,
            max_parallel: config.limits.max_parallel_default,
        };

        let batch_service = BatchService::new(pool.clone(), files.clone(), config.batches.clone());
        let worker = config.batches.worker_enabled.then(|| {
            Arc::new(BatchWorker::new(
                pool.clone(),
                dispatcher.clone(),
                batch_service.clone(),
                config.batches.clone(),
                default_limits,
            ))
        });

        let state = AppState {
            db: pool,
            config,
            dispatcher,
            files,
            batches: batch_service,
            limiter,
            default_limits,
        };

        Ok(Self {
            state,
            engine,
            worker,
            http,
            secrets,
        })
    }

    /// Run the HTTP server and background services until `shutdown`
    /// resolves, then drain gracefully.
    pub async fn serve(self, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let cancel = CancellationToken::new();

        // Catalog reload sweep: rebuild the route table periodically so
        // catalog edits take effect without a restart
        {
            let pool = self.state.db.clone();
            let engine = self.engine.clone();
            let http = self.http.clone();
            let secrets = self.secrets.clone();
            let interval = self.state.config.router.reload_interval;
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {}
                    }
                    match Catalog::enabled_entries(&pool).await {
                        Ok(entries) => {
                            let table = build_route_table(
                                &entries,
                                &BuildContext {
                                    http: http.clone(),
                                    secrets: &secrets,
                                },
                            );
                            engine.reload(table);
                            tracing::debug!(entries = entries.len(), "route table reloaded");
                        }
                        Err(e) => tracing::error!("catalog reload failed: {e:#}"),
                    }
                }
            });
        }

        // Route health monitor
        let monitor = HealthMonitor::new(
            self.engine.clone(),
            self.state.config.router.health_interval,
            self.state.config.router.health_timeout,
        );
        tokio::spawn(monitor.run(cancel.clone()));

        // File TTL sweeper
        tokio::spawn(
            self.state
                .files
                .clone()
                .run_ttl_sweeper(self.state.config.file_storage.ttl_sweep_interval, cancel.clone()),
        );

        // Batch worker
        if let Some(worker) = &self.worker {
            tokio::spawn(worker.clone().run(cancel.clone()));
        }

        let app = api::router(self.state.clone());
        let address = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = TcpListener::bind(&address).await?;
        info!("turnpike listening on {address}");

        let shutdown_cancel = cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                shutdown_cancel.cancel();
            })
            .await?;

        cancel.cancel();
        info!("shutdown complete");
        Ok(())
    }
}
