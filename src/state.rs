//! Application state shared across handlers: the config plus the gateway's
//! running components (registry, route matcher, rate limiter, proxy
//! dispatcher).

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::proxy::ProxyDispatcher;
use crate::ratelimit::RateLimiter;
use crate::registry::{EventPublisher, HealthMonitor, NoopSink, PublisherConfig, RegistryCache, RegistryManager};
use crate::routing::RouteMatcher;

/// Shared gateway state, cloned cheaply into every axum handler via
/// `Arc` internally -- `AppState` itself derives `Clone` and is handed
/// to `Router::with_state` directly.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    registry: Arc<RegistryManager>,
    health_monitor: Arc<HealthMonitor>,
    route_matcher: Arc<RouteMatcher>,
    rate_limiter: Arc<RateLimiter>,
    proxy: Arc<ProxyDispatcher>,
}

impl AppState {
    /// Wire every component from a loaded `Config`. Starts the event
    /// publisher's dispatcher task (so `register`/`deregister` don't
    /// silently no-op) but does not start the health monitor's tick loop
    /// or the rate limiter's sweeper -- the caller (the `gateway` binary)
    /// spawns those explicitly so tests can build an `AppState` without
    /// long-running background tasks.
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);

        let cache = Arc::new(RegistryCache::new());
        let publisher = Arc::new(EventPublisher::new(PublisherConfig::default()));

        #[cfg(feature = "events-nats")]
        if let Some(nats_config) = &config.nats {
            match crate::registry::events::NatsEventSink::connect(nats_config).await {
                Ok(sink) => publisher.subscribe("nats-durable-store", Arc::new(sink)).await,
                Err(e) if nats_config.optional => {
                    tracing::warn!(error = %e, "optional NATS event sink unavailable, continuing without it");
                }
                Err(e) => return Err(e),
            }
        }
        publisher.subscribe("noop", Arc::new(NoopSink)).await;
        publisher.start().await;

        let registry = Arc::new(RegistryManager::new(cache, publisher));
        let health_monitor = Arc::new(HealthMonitor::new(registry.clone(), config.health_monitor.clone()));
        let route_matcher = Arc::new(RouteMatcher::new(config.gateway.id.clone(), config.route_cache.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiter.clone()));
        rate_limiter.set_configs(config.rate_limits.clone());
        route_matcher.replace_routes(config.routes.clone()).await?;
        let proxy = Arc::new(ProxyDispatcher::new(registry.clone(), config.proxy.clone()));

        Ok(Self {
            config,
            registry,
            health_monitor,
            route_matcher,
            rate_limiter,
            proxy,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RegistryManager> {
        &self.registry
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health_monitor
    }

    pub fn route_matcher(&self) -> &Arc<RouteMatcher> {
        &self.route_matcher
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn proxy(&self) -> &Arc<ProxyDispatcher> {
        &self.proxy
    }

    /// Reload routes, filters and rate limits from a freshly-loaded
    /// `Config` (driven by a config-change `ServiceEvent`), logging the
    /// counts and wall-clock duration of the reload.
    pub async fn reload(&self, config: Config) -> Result<()> {
        let start = std::time::Instant::now();
        let counts = crate::config::ReloadCounts {
            routes: config.routes.len(),
            filters: config.filters.len(),
            rate_limits: config.rate_limits.len(),
        };

        self.route_matcher.replace_routes(config.routes.clone()).await?;
        self.rate_limiter.set_configs(config.rate_limits.clone());

        crate::config::log_reload(&counts, start.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_wires_every_component() {
        let state = AppState::new(Config::default()).await.unwrap();
        assert_eq!(state.config().service.name, "gateway-core");
        assert!(Arc::strong_count(state.registry()) >= 1);
    }

    #[tokio::test]
    async fn reload_replaces_the_live_route_set() {
        let state = AppState::new(Config::default()).await.unwrap();
        assert!(state
            .route_matcher()
            .resolve("host", "GET", "/anything")
            .await
            .is_err());

        let mut config = Config::default();
        config.routes = vec![crate::config::RouteConfig {
            tenant_id: "t1".into(),
            id: "r1".into(),
            gateway_instance_id: config.gateway.id.clone(),
            service_group_id: "g1".into(),
            path: "/api".into(),
            match_type: crate::config::MatchType::Prefix,
            allowed_methods: vec![],
            allowed_hosts: vec![],
            priority: 0,
            rewrite_path: None,
            strip_path_prefix: false,
            retry_count: 0,
            retry_interval_ms: 100,
            timeout_ms: 1_000,
            service_definition_ids: vec!["svc".into()],
            response_merge_strategy: crate::config::ResponseMergeStrategy::First,
            require_all_success: false,
            max_concurrent_requests: 0,
            allow_non_idempotent_retry: false,
            active: true,
        }];

        state.reload(config).await.unwrap();

        let matched = state
            .route_matcher()
            .resolve("host", "GET", "/api/users")
            .await
            .unwrap();
        assert_eq!(matched.route.id.as_str(), "r1");
    }
}
