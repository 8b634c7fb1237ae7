//! Route Matcher (§4.5): resolves an inbound `(host, method, path)` to the
//! single best `RouteConfig`, applying the match-type tier, priority/id
//! tiebreak, and strip/rewrite path transforms. Results are cached with
//! an LRU+TTL policy, invalidated wholesale on any route change.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use regex::Regex;
use tokio::sync::RwLock;

use crate::config::{MatchType, RouteCacheConfig, RouteConfig};
use crate::error::{Error, Result};
use crate::ids::GatewayInstanceId;

/// Outcome of a successful match: the winning route plus the path to
/// forward upstream after strip/rewrite is applied (§4.5).
#[derive(Debug, Clone)]
pub struct MatchedRoute {
    pub route: Arc<RouteConfig>,
    pub forward_path: String,
}

struct CompiledRoute {
    config: Arc<RouteConfig>,
    regex: Option<Regex>,
}

#[derive(Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    host: String,
    method: String,
    path: String,
}

struct CacheEntry {
    result: Option<MatchedRoute>,
    inserted_at: Instant,
}

pub struct RouteMatcher {
    gateway_instance_id: GatewayInstanceId,
    routes: RwLock<Vec<CompiledRoute>>,
    cache: RwLock<LruCache<CacheKey, CacheEntry>>,
    ttl: Duration,
}

impl RouteMatcher {
    pub fn new(gateway_instance_id: GatewayInstanceId, config: RouteCacheConfig) -> Self {
        let capacity = std::num::NonZeroUsize::new(config.capacity.max(1)).unwrap();
        Self {
            gateway_instance_id,
            routes: RwLock::new(Vec::new()),
            cache: RwLock::new(LruCache::new(capacity)),
            ttl: Duration::from_secs(config.route_cache_ttl_seconds),
        }
    }

    /// Replace the full route set, e.g. on a config-store change event.
    /// Invalidates the match cache wholesale (§4.5: "cache invalidated on
    /// route create/update/delete, not entry-by-entry").
    pub async fn replace_routes(&self, routes: Vec<RouteConfig>) -> Result<()> {
        let mut compiled = Vec::with_capacity(routes.len());
        for route in routes {
            if route.gateway_instance_id != self.gateway_instance_id {
                continue;
            }
            let regex = if route.match_type == MatchType::Regex {
                Some(
                    Regex::new(&route.path)
                        .map_err(|e| Error::InvalidArgument(format!("invalid route regex {}: {}", route.path, e)))?,
                )
            } else {
                None
            };
            compiled.push(CompiledRoute {
                config: Arc::new(route),
                regex,
            });
        }
        *self.routes.write().await = compiled;
        self.cache.write().await.clear();
        Ok(())
    }

    /// Resolve a route for `host`/`method`/`path`. Checks the LRU+TTL
    /// cache first, falling back to a full scan on miss or stale entry.
    pub async fn resolve(&self, host: &str, method: &str, path: &str) -> Result<MatchedRoute> {
        let key = CacheKey {
            host: host.to_ascii_lowercase(),
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
        };

        {
            let mut cache = self.cache.write().await;
            if let Some(entry) = cache.get(&key) {
                if entry.inserted_at.elapsed() < self.ttl {
                    return entry
                        .result
                        .clone()
                        .ok_or_else(|| Error::NotFound(format!("no route for {} {}", key.method, key.path)));
                }
            }
        }

        let result = self.find_best(&key.host, &key.method, &key.path).await;
        self.cache.write().await.put(
            key.clone(),
            CacheEntry {
                result: result.clone(),
                inserted_at: Instant::now(),
            },
        );

        result.ok_or_else(|| Error::NotFound(format!("no route for {} {}", key.method, key.path)))
    }

    async fn find_best(&self, host: &str, method: &str, path: &str) -> Option<MatchedRoute> {
        let routes = self.routes.read().await;

        // Candidate filter: active, method allowed (empty = any), host
        // allowed (empty = any; a `.example.com` entry matches any
        // subdomain case-insensitively) (§4.5).
        let candidates = routes.iter().filter(|r| {
            r.config.active
                && (r.config.allowed_methods.is_empty()
                    || r.config
                        .allowed_methods
                        .iter()
                        .any(|m| m.eq_ignore_ascii_case(method)))
                && (r.config.allowed_hosts.is_empty() || r.config.allowed_hosts.iter().any(|h| host_matches(h, host)))
        });

        // Match-type tiering: exact > prefix (longest) > regex, each tier
        // evaluated only if the previous found nothing (§4.5 I4).
        let mut exact: Vec<&CompiledRoute> = Vec::new();
        let mut prefix: Vec<&CompiledRoute> = Vec::new();
        let mut regex_matches: Vec<&CompiledRoute> = Vec::new();

        for candidate in candidates {
            match candidate.config.match_type {
                MatchType::Exact if candidate.config.path == path => exact.push(candidate),
                MatchType::Prefix if path.starts_with(candidate.config.path.as_str()) => prefix.push(candidate),
                MatchType::Regex => {
                    if candidate.regex.as_ref().map(|r| r.is_match(path)).unwrap_or(false) {
                        regex_matches.push(candidate);
                    }
                }
                _ => {}
            }
        }

        let winner = if !exact.is_empty() {
            pick_by_priority(&exact)
        } else if !prefix.is_empty() {
            pick_longest_prefix(&prefix)
        } else if !regex_matches.is_empty() {
            pick_by_priority(&regex_matches)
        } else {
            None
        }?;

        let forward_path = apply_path_transform(winner, path);
        Some(MatchedRoute {
            route: winner.config.clone(),
            forward_path,
        })
    }
}

/// Ascending priority, ascending id tiebreak (§3 I4).
fn pick_by_priority<'a>(candidates: &[&'a CompiledRoute]) -> Option<&'a CompiledRoute> {
    candidates
        .iter()
        .copied()
        .min_by(|a, b| {
            a.config
                .priority
                .cmp(&b.config.priority)
                .then_with(|| a.config.id.as_str().cmp(b.config.id.as_str()))
        })
}

/// Longest-prefix wins; priority/id breaks ties among equal-length
/// prefixes (§4.5).
fn pick_longest_prefix<'a>(candidates: &[&'a CompiledRoute]) -> Option<&'a CompiledRoute> {
    let max_len = candidates.iter().map(|c| c.config.path.len()).max()?;
    let longest: Vec<&&CompiledRoute> = candidates
        .iter()
        .filter(|c| c.config.path.len() == max_len)
        .collect();
    longest
        .into_iter()
        .min_by(|a, b| {
            a.config
                .priority
                .cmp(&b.config.priority)
                .then_with(|| a.config.id.as_str().cmp(b.config.id.as_str()))
        })
        .copied()
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('.') {
        host.eq_ignore_ascii_case(suffix) || host.to_ascii_lowercase().ends_with(&format!(".{}", suffix.to_ascii_lowercase()))
    } else {
        pattern.eq_ignore_ascii_case(host)
    }
}

fn apply_path_transform(route: &CompiledRoute, path: &str) -> String {
    if let Some(rewrite) = &route.config.rewrite_path {
        return rewrite.clone();
    }
    if route.config.strip_path_prefix && route.config.match_type == MatchType::Prefix {
        let stripped = path.strip_prefix(route.config.path.as_str()).unwrap_or(path);
        return if stripped.starts_with('/') {
            stripped.to_string()
        } else {
            format!("/{}", stripped)
        };
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponseMergeStrategy;

    fn route(id: &str, path: &str, match_type: MatchType, priority: i32, strip: bool) -> RouteConfig {
        RouteConfig {
            tenant_id: "t1".into(),
            id: id.into(),
            gateway_instance_id: "gw1".into(),
            service_group_id: "grp1".into(),
            path: path.to_string(),
            match_type,
            allowed_methods: vec![],
            allowed_hosts: vec![],
            priority,
            rewrite_path: None,
            strip_path_prefix: strip,
            retry_count: 0,
            retry_interval_ms: 100,
            timeout_ms: 5_000,
            service_definition_ids: vec!["svc".to_string()],
            response_merge_strategy: ResponseMergeStrategy::First,
            require_all_success: false,
            max_concurrent_requests: 0,
            allow_non_idempotent_retry: false,
            active: true,
        }
    }

    async fn matcher_with(routes: Vec<RouteConfig>) -> RouteMatcher {
        let matcher = RouteMatcher::new("gw1".into(), RouteCacheConfig::default());
        matcher.replace_routes(routes).await.unwrap();
        matcher
    }

    #[tokio::test]
    async fn exact_beats_prefix() {
        let matcher = matcher_with(vec![
            route("r-prefix", "/api", MatchType::Prefix, 1, false),
            route("r-exact", "/api/users", MatchType::Exact, 100, false),
        ])
        .await;

        let m = matcher.resolve("host", "GET", "/api/users").await.unwrap();
        assert_eq!(m.route.id.as_str(), "r-exact");
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let matcher = matcher_with(vec![
            route("r-short", "/api", MatchType::Prefix, 1, false),
            route("r-long", "/api/users", MatchType::Prefix, 1, false),
        ])
        .await;

        let m = matcher.resolve("host", "GET", "/api/users/42").await.unwrap();
        assert_eq!(m.route.id.as_str(), "r-long");
    }

    #[tokio::test]
    async fn priority_then_id_tiebreaks_equal_specificity() {
        let matcher = matcher_with(vec![
            route("r-b", "/api", MatchType::Prefix, 5, false),
            route("r-a", "/api", MatchType::Prefix, 5, false),
        ])
        .await;

        let m = matcher.resolve("host", "GET", "/api/x").await.unwrap();
        assert_eq!(m.route.id.as_str(), "r-a");
    }

    #[tokio::test]
    async fn strip_prefix_rewrites_forward_path() {
        let matcher = matcher_with(vec![route("r1", "/api", MatchType::Prefix, 1, true)]).await;
        let m = matcher.resolve("host", "GET", "/api/users").await.unwrap();
        assert_eq!(m.forward_path, "/users");
    }

    #[tokio::test]
    async fn regex_is_lowest_tier() {
        let matcher = matcher_with(vec![
            route("r-regex", "^/api/.*$", MatchType::Regex, 1, false),
            route("r-prefix", "/api", MatchType::Prefix, 100, false),
        ])
        .await;

        let m = matcher.resolve("host", "GET", "/api/anything").await.unwrap();
        assert_eq!(m.route.id.as_str(), "r-prefix");
    }

    #[tokio::test]
    async fn no_match_is_not_found() {
        let matcher = matcher_with(vec![route("r1", "/api", MatchType::Prefix, 1, false)]).await;
        let err = matcher.resolve("host", "GET", "/other").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn route_replace_invalidates_cache() {
        let matcher = matcher_with(vec![route("r1", "/api", MatchType::Prefix, 1, false)]).await;
        matcher.resolve("host", "GET", "/api/x").await.unwrap();
        matcher.replace_routes(vec![]).await.unwrap();
        assert!(matcher.resolve("host", "GET", "/api/x").await.is_err());
    }
}
