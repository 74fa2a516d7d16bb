//! Router engine: the in-memory alias → routes map with per-deployment
//! circuit breakers, weighted selection, and atomic reload.
//!
//! All reads go through [`RouterEngine::select_routes`] under a read lock;
//! reload and breaker reports take the write lock. Reload swaps whole maps
//! rather than mutating in place, so every selection observes a consistent
//! routes+state snapshot.

pub mod health;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::Rng;
use rust_decimal::Decimal;

use crate::db::models::catalog::{CatalogEntry, ProviderKind};
use crate::providers::{Adapter, BuildContext, Capability, definition};

/// One (alias, deployment) binding carrying the adapter for its provider.
pub struct Route {
    pub alias: String,
    pub provider: ProviderKind,
    pub provider_model: String,
    /// Breaker key component; stable across reloads for the same binding
    pub deployment: String,
    pub weight: f64,
    pub price_input: Decimal,
    pub price_output: Decimal,
    pub metadata: serde_json::Value,
    pub adapter: Arc<dyn Adapter>,
    disabled: HashSet<&'static str>,
}

impl Route {
    /// Whether this route can serve the operation. The adapter's capability
    /// set is normative; catalog metadata can only subtract from it.
    pub fn supports(&self, capability: Capability) -> bool {
        self.adapter.capabilities().contains(&capability) && !self.disabled.contains(capability.as_str())
    }

    fn state_key(&self) -> (String, String) {
        (self.alias.clone(), self.deployment.clone())
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("alias", &self.alias)
            .field("deployment", &self.deployment)
            .field("weight", &self.weight)
            .finish()
    }
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Per-(alias, deployment) breaker state. `open_until == None` is closed.
/// There is no distinct half-open state: once the deadline elapses the
/// route re-enters selection and the next success closes the breaker.
#[derive(Debug, Clone, Copy, Default)]
struct RouteState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

impl RouteState {
    fn is_open(&self, now: Instant) -> bool {
        self.open_until.is_some_and(|until| until > now)
    }
}

#[derive(Default)]
struct Inner {
    routes: HashMap<String, Vec<Arc<Route>>>,
    state: HashMap<(String, String), RouteState>,
}

pub struct RouterEngine {
    inner: RwLock<Inner>,
    breaker: BreakerConfig,
}

impl RouterEngine {
    pub fn new(breaker: BreakerConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            breaker,
        }
    }

    /// Healthy candidates for an alias, failover-ordered: the weighted
    /// winner first, then the rest. Empty when the alias is unknown or
    /// every deployment's breaker is open.
    pub fn select_routes(&self, alias: &str) -> Vec<Arc<Route>> {
        let now = Instant::now();
        let inner = self.inner.read().expect("router lock poisoned");
        let Some(routes) = inner.routes.get(alias) else {
            return Vec::new();
        };

        let mut healthy: Vec<Arc<Route>> = routes
            .iter()
            .filter(|route| {
                !inner
                    .state
                    .get(&route.state_key())
                    .copied()
                    .unwrap_or_default()
                    .is_open(now)
            })
            .cloned()
            .collect();
        drop(inner);

        if healthy.len() >= 2 {
            let winner = weighted_pick(&healthy, rand::thread_rng().gen_range(0.0..1.0));
            healthy.swap(0, winner);
        }
        healthy
    }

    /// Record a failed attempt; opens the breaker on the Nth consecutive
    /// failure.
    pub fn report_failure(&self, route: &Route) {
        let mut inner = self.inner.write().expect("router lock poisoned");
        let state = inner.state.entry(route.state_key()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.breaker.failure_threshold {
            state.open_until = Some(Instant::now() + self.breaker.cooldown);
            tracing::warn!(
                alias = %route.alias,
                deployment = %route.deployment,
                failures = state.consecutive_failures,
                "circuit breaker opened"
            );
        }
    }

    /// Record a successful attempt; closes the breaker and clears the
    /// failure streak.
    pub fn report_success(&self, route: &Route) {
        let mut inner = self.inner.write().expect("router lock poisoned");
        if let Some(state) = inner.state.get_mut(&route.state_key()) {
            *state = RouteState::default();
        }
    }

    /// Install a freshly built route table. Breaker state survives for
    /// (alias, deployment) pairs that persist; state for removed pairs is
    /// dropped.
    pub fn reload(&self, routes: HashMap<String, Vec<Arc<Route>>>) {
        let live_keys: HashSet<(String, String)> = routes
            .values()
            .flatten()
            .map(|route| route.state_key())
            .collect();

        let mut inner = self.inner.write().expect("router lock poisoned");
        inner.state.retain(|key, _| live_keys.contains(key));
        inner.routes = routes;
    }

    /// Aliases currently routable (ignoring breaker state).
    pub fn aliases(&self) -> Vec<String> {
        let inner = self.inner.read().expect("router lock poisoned");
        let mut aliases: Vec<String> = inner.routes.keys().cloned().collect();
        aliases.sort();
        aliases
    }

    pub fn has_alias(&self, alias: &str) -> bool {
        self.inner.read().expect("router lock poisoned").routes.contains_key(alias)
    }

    /// Every route in the table; used by the health monitor sweep.
    pub fn all_routes(&self) -> Vec<Arc<Route>> {
        let inner = self.inner.read().expect("router lock poisoned");
        inner.routes.values().flatten().cloned().collect()
    }
}

/// Pick an index by weight given a uniform draw in [0, 1): binary-search
/// the cumulative weight table for the drawn point. Non-positive weights
/// count as 1 so a zero-weight route still serves occasionally rather than
/// starving.
fn weighted_pick(routes: &[Arc<Route>], draw: f64) -> usize {
    let mut cumulative = Vec::with_capacity(routes.len());
    let mut total = 0.0;
    for route in routes {
        total += if route.weight > 0.0 { route.weight } else { 1.0 };
        cumulative.push(total);
    }

    let target = draw * total;
    cumulative.partition_point(|&bound| bound <= target).min(routes.len() - 1)
}

/// Build the route table from a catalog snapshot. Entries with unknown
/// providers or failing builders are skipped with a log line; one bad row
/// must not take down reload.
pub fn build_route_table(entries: &[CatalogEntry], ctx: &BuildContext) -> HashMap<String, Vec<Arc<Route>>> {
    let mut table: HashMap<String, Vec<Arc<Route>>> = HashMap::new();

    for entry in entries {
        let Some(kind) = entry.provider_kind() else {
            tracing::warn!(alias = %entry.alias, provider = %entry.provider, "unknown provider, skipping catalog entry");
            continue;
        };
        if let Some(endpoint) = &entry.endpoint
            && url::Url::parse(endpoint).is_err()
        {
            tracing::warn!(alias = %entry.alias, endpoint, "catalog entry has an unparseable endpoint, skipping");
            continue;
        }
        let def = definition(kind);
        let adapter = match (def.build)(entry, ctx) {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::error!(alias = %entry.alias, provider = def.name, "failed to build route: {e:#}");
                continue;
            }
        };

        let disabled: HashSet<&'static str> = entry
            .disabled_capabilities()
            .into_iter()
            .filter_map(|name| {
                def.capabilities
                    .iter()
                    .map(|c| c.as_str())
                    .find(|c| *c == name.as_str())
            })
            .collect();

        let route = Arc::new(Route {
            alias: entry.alias.clone(),
            provider: kind,
            provider_model: entry.provider_model.clone(),
            deployment: entry.deployment_key(),
            weight: entry.weight,
            price_input: entry.price_input,
            price_output: entry.price_output,
            metadata: entry.metadata_json.clone(),
            adapter,
            disabled,
        });
        table.entry(entry.alias.clone()).or_default().push(route);
    }

    table
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::providers::AdapterResult;
    use async_trait::async_trait;

    /// Minimal adapter for engine tests; health outcome is scripted.
    pub(crate) struct StaticAdapter {
        pub healthy: std::sync::atomic::AtomicBool,
    }

    impl StaticAdapter {
        pub fn new() -> Self {
            Self {
                healthy: std::sync::atomic::AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl Adapter for StaticAdapter {
        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::Chat, Capability::ChatStream, Capability::Embeddings]
        }

        async fn health(&self) -> AdapterResult<()> {
            if self.healthy.load(std::sync::atomic::Ordering::SeqCst) {
                Ok(())
            } else {
                Err(crate::providers::AdapterError::Connection("probe failed".into()))
            }
        }
    }

    pub(crate) fn test_route(alias: &str, deployment: &str, weight: f64) -> Arc<Route> {
        Arc::new(Route {
            alias: alias.to_string(),
            provider: ProviderKind::Openai,
            provider_model: "gpt-test".to_string(),
            deployment: deployment.to_string(),
            weight,
            price_input: Decimal::ZERO,
            price_output: Decimal::ZERO,
            metadata: serde_json::json!({}),
            adapter: Arc::new(StaticAdapter::new()),
            disabled: HashSet::new(),
        })
    }

    fn engine_with(routes: Vec<Arc<Route>>, breaker: BreakerConfig) -> RouterEngine {
        let engine = RouterEngine::new(breaker);
        let mut table: HashMap<String, Vec<Arc<Route>>> = HashMap::new();
        for route in routes {
            table.entry(route.alias.clone()).or_default().push(route);
        }
        engine.reload(table);
        engine
    }

    #[test]
    fn test_select_unknown_alias_is_empty() {
        let engine = engine_with(vec![], BreakerConfig::default());
        assert!(engine.select_routes("nope").is_empty());
    }

    #[test]
    fn test_breaker_opens_on_nth_failure_exactly() {
        let route = test_route("m", "a", 1.0);
        let engine = engine_with(vec![route.clone()], BreakerConfig::default());

        engine.report_failure(&route);
        engine.report_failure(&route);
        assert_eq!(engine.select_routes("m").len(), 1, "breaker must not open on failure 2");

        engine.report_failure(&route);
        assert!(engine.select_routes("m").is_empty(), "breaker must open on failure 3");
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let route = test_route("m", "a", 1.0);
        let engine = engine_with(vec![route.clone()], BreakerConfig::default());

        engine.report_failure(&route);
        engine.report_failure(&route);
        engine.report_success(&route);
        engine.report_failure(&route);
        engine.report_failure(&route);
        assert_eq!(engine.select_routes("m").len(), 1);
    }

    #[test]
    fn test_open_breaker_expires_and_success_closes() {
        let route = test_route("m", "a", 1.0);
        let engine = engine_with(
            vec![route.clone()],
            BreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_millis(30),
            },
        );

        for _ in 0..3 {
            engine.report_failure(&route);
        }
        assert!(engine.select_routes("m").is_empty());

        std::thread::sleep(Duration::from_millis(50));
        // Cooldown elapsed: route re-enters selection
        assert_eq!(engine.select_routes("m").len(), 1);

        engine.report_success(&route);
        assert_eq!(engine.select_routes("m").len(), 1);
    }

    #[test]
    fn test_tripped_route_filtered_but_sibling_serves() {
        let route_a = test_route("m", "a", 1.0);
        let route_b = test_route("m", "b", 1.0);
        let engine = engine_with(vec![route_a.clone(), route_b], BreakerConfig::default());

        for _ in 0..3 {
            engine.report_failure(&route_a);
        }
        let selected = engine.select_routes("m");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].deployment, "b");
    }

    #[test]
    fn test_reload_preserves_state_for_persisting_keys() {
        let route_a = test_route("m", "a", 1.0);
        let route_b = test_route("m", "b", 1.0);
        let engine = engine_with(vec![route_a.clone(), route_b.clone()], BreakerConfig::default());

        for _ in 0..3 {
            engine.report_failure(&route_a);
        }
        assert_eq!(engine.select_routes("m").len(), 1);

        // Reload with the same bindings: breaker state must survive
        let mut table: HashMap<String, Vec<Arc<Route>>> = HashMap::new();
        table.insert("m".into(), vec![route_a.clone(), route_b.clone()]);
        engine.reload(table);
        assert_eq!(engine.select_routes("m").len(), 1, "open breaker must survive identical reload");

        // Reload without route a: its state is dropped, so when a returns
        // later it starts closed
        let mut table: HashMap<String, Vec<Arc<Route>>> = HashMap::new();
        table.insert("m".into(), vec![route_b.clone()]);
        engine.reload(table);

        let mut table: HashMap<String, Vec<Arc<Route>>> = HashMap::new();
        table.insert("m".into(), vec![route_a.clone(), route_b]);
        engine.reload(table);
        assert_eq!(engine.select_routes("m").len(), 2);
    }

    #[test]
    fn test_weighted_pick_deterministic_boundaries() {
        let routes = vec![test_route("m", "a", 3.0), test_route("m", "b", 1.0)];
        // total = 4; draws below 0.75 land on a, above on b
        assert_eq!(weighted_pick(&routes, 0.0), 0);
        assert_eq!(weighted_pick(&routes, 0.74), 0);
        assert_eq!(weighted_pick(&routes, 0.76), 1);
        assert_eq!(weighted_pick(&routes, 0.999), 1);
    }

    #[test]
    fn test_weighted_pick_treats_non_positive_as_one() {
        let routes = vec![test_route("m", "a", 0.0), test_route("m", "b", 1.0)];
        // both behave as weight 1
        assert_eq!(weighted_pick(&routes, 0.25), 0);
        assert_eq!(weighted_pick(&routes, 0.75), 1);
    }

    #[test]
    fn test_weighted_selection_ratio_over_many_trials() {
        let engine = engine_with(
            vec![test_route("m", "heavy", 3.0), test_route("m", "light", 1.0)],
            BreakerConfig::default(),
        );

        let trials = 10_000;
        let mut heavy_first = 0u32;
        for _ in 0..trials {
            let selected = engine.select_routes("m");
            assert_eq!(selected.len(), 2);
            if selected[0].deployment == "heavy" {
                heavy_first += 1;
            }
        }

        // Expected p = 0.75; allow a generous binomial band (~7 sigma)
        let share = heavy_first as f64 / trials as f64;
        assert!((0.72..0.78).contains(&share), "heavy share {share} outside expected band");
    }
}
