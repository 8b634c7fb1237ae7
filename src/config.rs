//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: `GATEWAY_`)
//! 2. Current working directory: `./config.toml`
//! 3. XDG config directory: `~/.config/gateway-core/config.toml`
//! 4. System directory: `/etc/gateway-core/config.toml`
//! 5. Default values
//!
//! `ServiceConfig` carries the gateway-instance bootstrap settings; the
//! config-store entities (`GatewayInstanceConfig`, `RouteConfig`,
//! `FilterConfig`, `RateLimitConfig`, the security configs) are normally
//! hot-reloaded from the external admin/config store at runtime (see
//! `registry::events`) -- the figment-loaded `Config` only carries a
//! `routes.toml`-style static seed used by tests and standalone
//! deployments.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::ids::{
    FilterConfigId, GatewayInstanceId, RateLimitConfigId, RouteConfigId, ServiceGroupId, TenantId,
};

/// Root configuration structure loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service-level bootstrap configuration.
    pub service: ServiceConfig,

    /// The gateway instance this process serves.
    pub gateway: GatewayInstanceConfig,

    /// Cross-cutting middleware knobs (CORS mode, body limits, security headers).
    #[serde(default)]
    pub middleware: MiddlewareConfig,

    /// Statically seeded routes (merged with whatever the config store
    /// supplies at runtime via change events). Useful for tests and
    /// single-binary deployments that don't run the admin CRUD surface.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Statically seeded filters.
    #[serde(default)]
    pub filters: Vec<FilterConfig>,

    /// Statically seeded rate-limit configs.
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,

    /// NATS event-sink configuration (durable-store writer), optional.
    #[serde(default)]
    pub nats: Option<NatsConfig>,

    /// TLS material for the gateway's listeners, optional.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Health monitor tuning.
    #[serde(default)]
    pub health_monitor: HealthMonitorConfig,

    /// Rate limiter sweeper tuning.
    #[serde(default)]
    pub rate_limiter: RateLimiterTuning,

    /// Route matcher cache tuning.
    #[serde(default)]
    pub route_cache: RouteCacheConfig,

    /// Proxy dispatcher tuning.
    #[serde(default)]
    pub proxy: ProxyConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            gateway: GatewayInstanceConfig::default(),
            middleware: MiddlewareConfig::default(),
            routes: Vec::new(),
            filters: Vec::new(),
            rate_limits: Vec::new(),
            nats: None,
            tls: None,
            health_monitor: HealthMonitorConfig::default(),
            rate_limiter: RateLimiterTuning::default(),
            route_cache: RouteCacheConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from all sources, highest precedence last.
    pub fn load() -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"));

        if let Ok(dirs) = xdg::BaseDirectories::with_prefix("gateway-core") {
            if let Some(path) = dirs.find_config_file("config.toml") {
                figment = figment.merge(Toml::file(path));
            }
        }

        let etc_path = PathBuf::from("/etc/gateway-core/config.toml");
        if etc_path.exists() {
            figment = figment.merge(Toml::file(etc_path));
        }

        figment = figment.merge(Env::prefixed("GATEWAY_").split("__"));

        Ok(figment.extract::<Config>()?)
    }
}

/// Service-level bootstrap configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Graceful shutdown window; active requests get this long to finish
    /// after `Stop()` cancels the root context (§5).
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "gateway-core".to_string(),
            port: default_port(),
            log_level: default_log_level(),
            timeout_secs: default_timeout(),
            environment: default_environment(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_timeout() -> u64 {
    30
}
fn default_environment() -> String {
    "development".to_string()
}
fn default_shutdown_grace_secs() -> u64 {
    5
}

/// Gateway instance: bind address, ports, TLS, timeouts, connection limits (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayInstanceConfig {
    pub id: GatewayInstanceId,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub https_port: Option<u16>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    #[serde(default = "default_true")]
    pub http2: bool,
    #[serde(default = "default_shutdown_grace_secs")]
    pub graceful_shutdown_secs: u64,
}

impl Default for GatewayInstanceConfig {
    fn default() -> Self {
        Self {
            id: GatewayInstanceId::from("gw-default"),
            bind_address: default_bind_address(),
            https_port: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_header_bytes: default_max_header_bytes(),
            max_connections: default_max_connections(),
            keep_alive: true,
            http2: true,
            graceful_shutdown_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    2_000
}
fn default_read_timeout_ms() -> u64 {
    30_000
}
fn default_write_timeout_ms() -> u64 {
    30_000
}
fn default_idle_timeout_ms() -> u64 {
    60_000
}
fn default_max_header_bytes() -> usize {
    16 * 1024
}
fn default_max_connections() -> usize {
    10_000
}
fn default_true() -> bool {
    true
}

/// Cross-cutting middleware configuration applied by `server::Server`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: usize,
    #[serde(default = "default_cors_mode")]
    pub cors_mode: String,
    #[serde(default)]
    pub security_headers: SecurityHeadersConfig,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            body_limit_mb: default_body_limit_mb(),
            cors_mode: default_cors_mode(),
            security_headers: SecurityHeadersConfig::default(),
        }
    }
}

fn default_body_limit_mb() -> usize {
    10
}
fn default_cors_mode() -> String {
    "restrictive".to_string()
}

/// Security-headers middleware configuration (HSTS, frame options, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityHeadersConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub hsts: bool,
    #[serde(default = "default_hsts_max_age")]
    pub hsts_max_age_secs: u64,
    #[serde(default)]
    pub hsts_include_subdomains: bool,
    #[serde(default)]
    pub hsts_preload: bool,
    #[serde(default = "default_true")]
    pub x_content_type_options: bool,
    #[serde(default = "default_frame_options")]
    pub x_frame_options: String,
    #[serde(default = "default_true")]
    pub x_xss_protection: bool,
    #[serde(default = "default_referrer_policy")]
    pub referrer_policy: String,
    #[serde(default)]
    pub permissions_policy: Option<String>,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hsts: true,
            hsts_max_age_secs: default_hsts_max_age(),
            hsts_include_subdomains: false,
            hsts_preload: false,
            x_content_type_options: true,
            x_frame_options: default_frame_options(),
            x_xss_protection: true,
            referrer_policy: default_referrer_policy(),
            permissions_policy: None,
        }
    }
}

fn default_hsts_max_age() -> u64 {
    31_536_000
}
fn default_frame_options() -> String {
    "DENY".to_string()
}
fn default_referrer_policy() -> String {
    "strict-origin-when-cross-origin".to_string()
}

/// NATS event-sink configuration (durable-store writer subscriber ingestion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_max_reconnects")]
    pub max_reconnects: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    #[serde(default)]
    pub optional: bool,
}

fn default_subject() -> String {
    "gateway.events".to_string()
}
fn default_max_reconnects() -> usize {
    60
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_delay() -> u64 {
    2
}

/// TLS material for the gateway's HTTPS listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Health monitor scheduling (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitorConfig {
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_min_tick_ms")]
    pub min_tick_ms: u64,
    #[serde(default = "default_eviction_alert_threshold")]
    pub eviction_alert_threshold: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            worker_pool_size: default_worker_pool_size(),
            min_tick_ms: default_min_tick_ms(),
            eviction_alert_threshold: default_eviction_alert_threshold(),
        }
    }
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}
fn default_worker_pool_size() -> usize {
    16
}
fn default_min_tick_ms() -> u64 {
    1_000
}
fn default_eviction_alert_threshold() -> usize {
    1
}

/// Rate-limiter state map tuning (§4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterTuning {
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_idle_ttl_multiple")]
    pub idle_ttl_multiple: u32,
}

impl Default for RateLimiterTuning {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            idle_ttl_multiple: default_idle_ttl_multiple(),
        }
    }
}

fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_idle_ttl_multiple() -> u32 {
    10
}

/// Route matcher LRU cache tuning (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCacheConfig {
    #[serde(default = "default_route_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_route_cache_ttl_secs")]
    pub route_cache_ttl_seconds: u64,
}

impl Default for RouteCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_route_cache_capacity(),
            route_cache_ttl_seconds: default_route_cache_ttl_secs(),
        }
    }
}

fn default_route_cache_capacity() -> usize {
    4_096
}
fn default_route_cache_ttl_secs() -> u64 {
    30
}

/// Proxy dispatcher tuning (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
        }
    }
}

fn default_pool_idle_timeout_secs() -> u64 {
    90
}
fn default_pool_max_idle_per_host() -> usize {
    32
}

impl ProxyConfig {
    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

// ---------------------------------------------------------------------
// Route / filter / rate-limit config-store entities (§3, §6)
// ---------------------------------------------------------------------

/// Route match type. Wire encoding per §6: `0=exact, 1=prefix, 2=regex`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact = 0,
    Prefix = 1,
    Regex = 2,
}

/// Multi-service fanout response merge strategy (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMergeStrategy {
    First,
    FirstError,
    All,
}

impl Default for ResponseMergeStrategy {
    fn default() -> Self {
        Self::First
    }
}

/// A routing rule mapping inbound request patterns to one or more services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub tenant_id: TenantId,
    pub id: RouteConfigId,
    pub gateway_instance_id: GatewayInstanceId,
    /// Service group all of `service_definition_ids` are resolved against
    /// (§3: `Service` is keyed by `(tenantId, groupId, serviceName)`, and
    /// a route's fanout targets all live in one group).
    pub service_group_id: ServiceGroupId,
    pub path: String,
    pub match_type: MatchType,
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Smaller number = higher priority (§3 I4).
    pub priority: i32,
    #[serde(default)]
    pub rewrite_path: Option<String>,
    #[serde(default)]
    pub strip_path_prefix: bool,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_route_timeout_ms")]
    pub timeout_ms: u64,
    /// Comma-separated in the wire format; parsed once at load time.
    pub service_definition_ids: Vec<String>,
    #[serde(default)]
    pub response_merge_strategy: ResponseMergeStrategy,
    #[serde(default)]
    pub require_all_success: bool,
    #[serde(default)]
    pub max_concurrent_requests: usize,
    /// Opt-in to replaying non-idempotent methods on retry (§4.8).
    #[serde(default)]
    pub allow_non_idempotent_retry: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_retry_count() -> u32 {
    0
}
fn default_retry_interval_ms() -> u64 {
    100
}
fn default_route_timeout_ms() -> u64 {
    10_000
}

impl RouteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Filter action phase (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterPhase {
    PreRouting,
    PostRouting,
    PreResponse,
}

/// Filter type (§6). The opaque JSON config blob is parsed into a typed
/// `FilterKind` once at load time (see `filters::types`); `FilterConfig`
/// just carries the raw type tag plus blob as loaded from the config store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterType {
    Header,
    QueryParam,
    Body,
    Strip,
    Rewrite,
    Method,
    Cookie,
    Response,
    /// Instance-level security filters (IP, UA, path, domain, CORS) and
    /// route-level auth are not separate wire types in §6's enum, but are
    /// carried under their own scope+kind in practice; we fold them into
    /// the `Security` / `Auth` variants to keep the typed enum exhaustive
    /// without an `unknown` catch-all swallowing them.
    Security,
    Auth,
}

/// Scope a filter (or rate-limit config) applies at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigScope {
    Instance,
    Route,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub tenant_id: TenantId,
    pub id: FilterConfigId,
    pub scope: ConfigScope,
    /// Present when `scope == Route`.
    #[serde(default)]
    pub route_config_id: Option<RouteConfigId>,
    pub filter_type: FilterType,
    pub action_phase: FilterPhase,
    pub order: i32,
    /// Opaque JSON config blob, schema depends on `filter_type`.
    pub filter_config: serde_json::Value,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Rate-limit admission algorithm (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateLimitAlgorithm {
    TokenBucket,
    LeakyBucket,
    SlidingWindow,
    FixedWindow,
    None,
}

/// Key-derivation strategy for rate-limiter admission (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitKeyStrategy {
    Ip,
    User,
    Path,
    Service,
    Route,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub tenant_id: TenantId,
    pub id: RateLimitConfigId,
    pub scope: ConfigScope,
    #[serde(default)]
    pub route_config_id: Option<RouteConfigId>,
    pub algorithm: RateLimitAlgorithm,
    pub key_strategy: RateLimitKeyStrategy,
    /// Requests per second; must be >= 1 for algorithms other than `none`.
    pub rate: f64,
    #[serde(default)]
    pub burst: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_rejection_status")]
    pub rejection_status_code: u16,
    #[serde(default = "default_rejection_message")]
    pub rejection_message: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_window_secs() -> u64 {
    1
}
fn default_rejection_status() -> u16 {
    429
}
fn default_rejection_message() -> String {
    "rate limit exceeded".to_string()
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }
}

// ---------------------------------------------------------------------
// Security filter configs (IP allow/deny, UA, path glob, domain, CORS) -- §6
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpAccessControlConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub trust_x_forwarded_for: bool,
    #[serde(default)]
    pub trust_x_real_ip: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserAgentAccessControlConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub block_empty_user_agent: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathAccessControlConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainAccessControlConfig {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub allow_subdomains: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsSecurityConfig {
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default)]
    pub allowed_methods: Vec<String>,
    #[serde(default)]
    pub allowed_headers: Vec<String>,
    #[serde(default)]
    pub exposed_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default = "default_cors_max_age")]
    pub max_age_secs: u64,
}

fn default_cors_max_age() -> u64 {
    600
}

impl Default for CorsSecurityConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allowed_methods: Vec::new(),
            allowed_headers: Vec::new(),
            exposed_headers: Vec::new(),
            allow_credentials: false,
            max_age_secs: default_cors_max_age(),
        }
    }
}

/// Config-change snapshot passed to the hot-reload path (§5).
#[derive(Debug, Clone, Default)]
pub struct ReloadCounts {
    pub routes: usize,
    pub filters: usize,
    pub rate_limits: usize,
}

/// Emits the config hot-reload acknowledgement log line (§5).
pub fn log_reload(counts: &ReloadCounts, elapsed: Duration) {
    tracing::info!(
        routes = counts.routes,
        filters = counts.filters,
        rate_limits = counts.rate_limits,
        elapsed_ms = elapsed.as_millis() as u64,
        "config reload applied"
    );
}

/// Per-tenant map, used by the JWT auth filter and similar config lookups
/// keyed by tenant without a full registry round-trip.
pub type TenantMap<V> = HashMap<TenantId, V>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.service.name, "gateway-core");
        assert_eq!(config.service.port, 8080);
        assert!(config.gateway.http2);
    }

    #[test]
    fn test_route_config_timeout() {
        let route = RouteConfig {
            tenant_id: "t1".into(),
            id: "r1".into(),
            gateway_instance_id: "gw1".into(),
            service_group_id: "grp1".into(),
            path: "/api/".to_string(),
            match_type: MatchType::Prefix,
            allowed_methods: vec![],
            allowed_hosts: vec![],
            priority: 10,
            rewrite_path: None,
            strip_path_prefix: true,
            retry_count: 2,
            retry_interval_ms: 50,
            timeout_ms: 5_000,
            service_definition_ids: vec!["svcA".to_string()],
            response_merge_strategy: ResponseMergeStrategy::First,
            require_all_success: false,
            max_concurrent_requests: 0,
            allow_non_idempotent_retry: false,
            active: true,
        };
        assert_eq!(route.timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_rate_limit_window() {
        let rl = RateLimitConfig {
            tenant_id: "t1".into(),
            id: "rl1".into(),
            scope: ConfigScope::Route,
            route_config_id: Some("r1".into()),
            algorithm: RateLimitAlgorithm::TokenBucket,
            key_strategy: RateLimitKeyStrategy::Ip,
            rate: 10.0,
            burst: 5,
            window_secs: 1,
            rejection_status_code: 429,
            rejection_message: "slow down".to_string(),
            active: true,
        };
        assert_eq!(rl.window(), Duration::from_secs(1));
    }
}
