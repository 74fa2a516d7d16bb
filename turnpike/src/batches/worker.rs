//! Batch worker: claims queued batches and drives their items through the
//! dispatcher's non-streaming path.
//!
//! One worker runs per process. Batches are claimed one at a time with
//! `FOR UPDATE SKIP LOCKED` (safe across replicas); items execute
//! concurrently up to `min(batch.max_concurrency, global cap)`. Every item
//! passes through the same auth context, rate limits, budget, and
//! guardrails as live traffic. Cancellation is observed at the next item
//! claim, which returns no rows once the batch left `in_progress`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{BatchService, encode_item_error};
use crate::auth::AuthContext;
use crate::config::BatchesConfig;
use crate::db::handlers::{ApiKeys, Batches, Tenants};
use crate::db::handlers::batches::ItemOutcome;
use crate::db::models::batches::{Batch, BatchStatus};
use crate::dispatch::Dispatcher;
use crate::errors::{Error, Result};
use crate::ratelimit::LimitConfig;

pub struct BatchWorker {
    pool: PgPool,
    dispatcher: Arc<Dispatcher>,
    service: BatchService,
    config: BatchesConfig,
    default_limits: LimitConfig,
    items_in_flight: Arc<AtomicUsize>,
}

impl BatchWorker {
    pub fn new(
        pool: PgPool,
        dispatcher: Arc<Dispatcher>,
        service: BatchService,
        config: BatchesConfig,
        default_limits: LimitConfig,
    ) -> Self {
        Self {
            pool,
            dispatcher,
            service,
            config,
            default_limits,
            items_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Items currently executing on this worker.
    pub fn items_in_flight(&self) -> usize {
        self.items_in_flight.load(Ordering::Relaxed)
    }

    /// Main loop: claim → process → repeat, sleeping when the queue is
    /// empty.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!("batch worker starting");
        loop {
            if cancel.is_cancelled() {
                tracing::debug!("batch worker stopping");
                return;
            }

            let claimed = match Batches::claim_next(&self.pool).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::error!("batch claim failed: {e:#}");
                    None
                }
            };

            match claimed {
                Some(batch) => {
                    tracing::info!(batch = %batch.id, total = batch.total, "processing batch");
                    self.process_batch(batch).await;
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.config.claim_interval) => {}
                    }
                }
            }
        }
    }

    /// Rebuild the submitting caller's auth context from the stored ids.
    async fn build_context(&self, batch: &Batch) -> Result<AuthContext> {
        let tenant = Tenants::get(&self.pool, batch.tenant_id).await?;
        if !tenant.is_active() {
            return Err(Error::Unauthorized {
                message: "tenant is suspended".to_string(),
            });
        }
        let api_key_id = batch.api_key_id.ok_or_else(|| Error::Unauthorized {
            message: "batch has no associated API key".to_string(),
        })?;
        let api_key = ApiKeys::get(&self.pool, api_key_id).await?;
        if api_key.is_revoked() {
            return Err(Error::Unauthorized {
                message: "API key has been revoked".to_string(),
            });
        }

        let limits = LimitConfig::effective(
            &self.default_limits,
            api_key.rpm_limit,
            api_key.tpm_limit,
            api_key.max_parallel,
        );
        Ok(AuthContext {
            tenant,
            api_key,
            limits,
        })
    }

    async fn process_batch(&self, batch: Batch) {
        let ctx = match self.build_context(&batch).await {
            Ok(ctx) => Arc::new(ctx),
            Err(e) => {
                // The whole batch shares one caller; fail every item with
                // the same envelope and let finalization run
                tracing::warn!(batch = %batch.id, "batch context unavailable: {e}");
                self.fail_all_items(&batch, &e).await;
                self.finish(&batch).await;
                return;
            }
        };

        let concurrency = (batch.max_concurrency.max(1) as usize).min(self.config.global_max_concurrency.max(1));
        let mut executors: JoinSet<()> = JoinSet::new();
        for _ in 0..concurrency {
            let pool = self.pool.clone();
            let dispatcher = self.dispatcher.clone();
            let ctx = ctx.clone();
            let batch_id = batch.id;
            let endpoint = batch.endpoint.clone();
            let items_in_flight = self.items_in_flight.clone();

            executors.spawn(async move {
                loop {
                    let item = match Batches::claim_next_item(&pool, batch_id).await {
                        Ok(Some(item)) => item,
                        Ok(None) => return,
                        Err(e) => {
                            tracing::error!(batch = %batch_id, "item claim failed: {e:#}");
                            return;
                        }
                    };

                    items_in_flight.fetch_add(1, Ordering::Relaxed);
                    let _in_flight = scopeguard::guard((), |_| {
                        items_in_flight.fetch_sub(1, Ordering::Relaxed);
                    });

                    let outcome = dispatcher.execute_batch_item(&ctx, &endpoint, &item.input).await;
                    if let Err(e) = &outcome {
                        tracing::debug!(batch = %batch_id, item = item.item_index, "item failed: {e}");
                    }

                    let mut tx = match pool.begin().await {
                        Ok(tx) => tx,
                        Err(e) => {
                            tracing::error!(batch = %batch_id, "failed to open item transaction: {e:#}");
                            return;
                        }
                    };
                    let finish = match &outcome {
                        Ok(response) => Batches::finish_item(&mut *tx, item.id, batch_id, ItemOutcome::Completed(response)).await,
                        Err(e) => {
                            let encoded = encode_item_error(e);
                            Batches::finish_item(&mut *tx, item.id, batch_id, ItemOutcome::Failed(&encoded)).await
                        }
                    };
                    match finish {
                        Ok(()) => {
                            if let Err(e) = tx.commit().await {
                                tracing::error!(batch = %batch_id, "item commit failed: {e:#}");
                            }
                        }
                        Err(e) => {
                            tracing::error!(batch = %batch_id, item = item.item_index, "item finish failed: {e:#}");
                            let _ = tx.rollback().await;
                        }
                    }
                }
            });
        }
        while executors.join_next().await.is_some() {}

        self.finish(&batch).await;
    }

    /// Post-drain: finalize settled batches, tidy cancelled ones.
    async fn finish(&self, batch: &Batch) {
        let current = match Batches::get(&self.pool, batch.id).await {
            Ok(current) => current,
            Err(e) => {
                tracing::error!(batch = %batch.id, "failed to re-read batch: {e:#}");
                return;
            }
        };

        match current.batch_status() {
            Some(BatchStatus::Cancelled) => {
                // Items queued when cancel landed are still pending
                if let Err(e) = Batches::cancel_remaining_items(&self.pool, batch.id).await {
                    tracing::error!(batch = %batch.id, "failed to cancel remaining items: {e:#}");
                }
            }
            Some(BatchStatus::InProgress) if current.counts_settled() => {
                if let Err(e) = self.service.finalize(&current).await {
                    tracing::error!(batch = %batch.id, "finalization failed: {e:#}");
                }
            }
            _ => {}
        }
    }

    /// Mark every claimable item failed with one shared error envelope.
    async fn fail_all_items(&self, batch: &Batch, error: &Error) {
        let encoded = encode_item_error(error);
        loop {
            let item = match Batches::claim_next_item(&self.pool, batch.id).await {
                Ok(Some(item)) => item,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(batch = %batch.id, "item claim failed while failing batch: {e:#}");
                    return;
                }
            };
            let mut tx = match self.pool.begin().await {
                Ok(tx) => tx,
                Err(e) => {
                    tracing::error!(batch = %batch.id, "failed to open transaction: {e:#}");
                    return;
                }
            };
            if let Err(e) = Batches::finish_item(&mut *tx, item.id, batch.id, ItemOutcome::Failed(&encoded)).await {
                tracing::error!(batch = %batch.id, "failed to fail item: {e:#}");
                let _ = tx.rollback().await;
                return;
            }
            if let Err(e) = tx.commit().await {
                tracing::error!(batch = %batch.id, "item commit failed: {e:#}");
                return;
            }
        }
    }
}
