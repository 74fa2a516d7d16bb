//! Background health monitor.
//!
//! A periodic sweep probes every route's adapter with a per-check timeout
//! and feeds the result into the breaker. Sweeps run sequentially within
//! one instance; overlapping sweeps across instances are harmless because
//! breaker state is per-process.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::RouterEngine;

pub struct HealthMonitor {
    engine: Arc<RouterEngine>,
    interval: Duration,
    check_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(engine: Arc<RouterEngine>, interval: Duration, check_timeout: Duration) -> Self {
        Self {
            engine,
            interval,
            check_timeout,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup traffic and
        // the first sweep do not race route construction.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("health monitor stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            self.sweep().await;
        }
    }

    async fn sweep(&self) {
        let routes = self.engine.all_routes();
        tracing::debug!(routes = routes.len(), "health sweep starting");

        for route in routes {
            let outcome = tokio::time::timeout(self.check_timeout, route.adapter.health()).await;
            match outcome {
                Ok(Ok(())) => self.engine.report_success(&route),
                Ok(Err(e)) => {
                    tracing::debug!(alias = %route.alias, deployment = %route.deployment, "health check failed: {e}");
                    self.engine.report_failure(&route);
                }
                Err(_) => {
                    tracing::debug!(alias = %route.alias, deployment = %route.deployment, "health check timed out");
                    self.engine.report_failure(&route);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::tests::test_route;
    use crate::router::{BreakerConfig, Route};
    use std::collections::HashMap;

    fn engine_with(route: Arc<Route>) -> Arc<RouterEngine> {
        let engine = Arc::new(RouterEngine::new(BreakerConfig::default()));
        let mut table: HashMap<String, Vec<Arc<Route>>> = HashMap::new();
        table.insert(route.alias.clone(), vec![route]);
        engine.reload(table);
        engine
    }

    #[tokio::test]
    async fn test_sweep_trips_breaker_on_unhealthy_route() {
        use crate::router::tests::StaticAdapter;

        let adapter = Arc::new(StaticAdapter::new());
        let mut route = Arc::try_unwrap(test_route("m", "a", 1.0)).ok().unwrap();
        route.adapter = adapter.clone();
        let route = Arc::new(route);

        let engine = engine_with(route.clone());
        let monitor = HealthMonitor::new(engine.clone(), Duration::from_secs(60), Duration::from_secs(1));

        adapter.healthy.store(false, std::sync::atomic::Ordering::SeqCst);
        for _ in 0..3 {
            monitor.sweep().await;
        }
        assert!(engine.select_routes("m").is_empty());

        // A healthy probe after the cooldown closes the breaker again
        adapter.healthy.store(true, std::sync::atomic::Ordering::SeqCst);
        monitor.sweep().await;
    }

    #[tokio::test]
    async fn test_sweep_reports_success_for_healthy_route() {
        let route = test_route("m", "a", 1.0);
        let engine = engine_with(route.clone());
        let monitor = HealthMonitor::new(engine.clone(), Duration::from_secs(60), Duration::from_secs(1));

        // Two manual failures, then a healthy sweep clears the streak
        engine.report_failure(&route);
        engine.report_failure(&route);
        monitor.sweep().await;
        engine.report_failure(&route);
        engine.report_failure(&route);
        assert_eq!(engine.select_routes("m").len(), 1);
    }
}
