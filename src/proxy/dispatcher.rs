//! Proxy Dispatcher (§4.8): forwards matched requests upstream through a
//! pooled `reqwest::Client` per `host:port`, applying retry/timeout
//! policy and multi-service fanout merge strategies. WebSocket upgrades
//! are handled separately via byte-mirroring once both legs complete the
//! 101 handshake.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::config::{Config, ProxyConfig, ResponseMergeStrategy, RouteConfig};
use crate::error::{Error, Result};
use crate::ids::ServiceInstanceId;
use crate::registry::{RegistryManager, ServiceInstance};

/// One upstream call's outcome, used both for a single-service dispatch
/// and as a fanout leg.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub instance_id: ServiceInstanceId,
    pub status: reqwest::StatusCode,
    pub headers: reqwest::header::HeaderMap,
    pub body: bytes::Bytes,
}

/// Methods considered idempotent for retry purposes unless a route opts
/// into `allow_non_idempotent_retry` (§4.8). POST, PUT, PATCH, DELETE are
/// never replayed by default.
pub fn is_idempotent(method: &reqwest::Method) -> bool {
    matches!(
        *method,
        reqwest::Method::GET | reqwest::Method::HEAD | reqwest::Method::OPTIONS | reqwest::Method::TRACE
    )
}

pub struct ProxyDispatcher {
    clients: DashMap<String, reqwest::Client>,
    config: ProxyConfig,
    registry: Arc<RegistryManager>,
}

impl ProxyDispatcher {
    pub fn new(registry: Arc<RegistryManager>, config: ProxyConfig) -> Self {
        Self {
            clients: DashMap::new(),
            config,
            registry,
        }
    }

    fn client_for(&self, host: &str) -> reqwest::Client {
        if let Some(client) = self.clients.get(host) {
            return client.clone();
        }
        let client = reqwest::Client::builder()
            .pool_idle_timeout(self.config.pool_idle_timeout())
            .pool_max_idle_per_host(self.config.pool_max_idle_per_host)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        self.clients.insert(host.to_string(), client.clone());
        client
    }

    /// Dispatch to a single service, discovering an instance, retrying
    /// on failure per the route's policy, and excluding already-tried
    /// instances from each retry attempt (§4.8).
    pub async fn dispatch_single(
        &self,
        route: &RouteConfig,
        tenant_id: &crate::ids::TenantId,
        group_id: &crate::ids::ServiceGroupId,
        service_name: &crate::ids::ServiceName,
        method: reqwest::Method,
        path: &str,
        headers: reqwest::header::HeaderMap,
        body: bytes::Bytes,
        client_key: Option<&str>,
        claims: Option<&serde_json::Value>,
    ) -> Result<UpstreamResponse> {
        let mut tried: Vec<ServiceInstanceId> = Vec::new();
        let max_attempts = route.retry_count + 1;
        let replay_body = !is_idempotent(&method) && !route.allow_non_idempotent_retry;

        let mut last_err = None;
        for attempt in 0..max_attempts {
            if attempt > 0 && replay_body {
                // §4.8: never replay a non-idempotent method unless the
                // route opts in; the first attempt's result stands.
                break;
            }

            let instance = match self
                .discover_excluding(tenant_id, group_id, service_name, client_key, claims, &tried)
                .await
            {
                Ok(inst) => inst,
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            };
            tried.push(instance.id.clone());

            let result = self
                .send_once(&instance, method.clone(), path, headers.clone(), body.clone(), route.timeout())
                .await;

            match result {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    tracing::warn!(instance = %instance.id, attempt, error = %e, "upstream attempt failed");
                    last_err = Some(e);
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(route.retry_interval()).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::UpstreamFailure("no attempts made".into())))
    }

    async fn discover_excluding(
        &self,
        tenant_id: &crate::ids::TenantId,
        group_id: &crate::ids::ServiceGroupId,
        service_name: &crate::ids::ServiceName,
        client_key: Option<&str>,
        claims: Option<&serde_json::Value>,
        exclude: &[ServiceInstanceId],
    ) -> Result<ServiceInstance> {
        // The registry's discover_instance doesn't take an exclusion set
        // directly; retry against it a bounded number of times, skipping
        // any instance already tried this request (§4.8).
        for _ in 0..4 {
            let candidate = self
                .registry
                .discover_instance(tenant_id, group_id, service_name, client_key, claims)
                .await?;
            if !exclude.contains(&candidate.id) {
                return Ok(candidate);
            }
        }
        Err(Error::NoHealthyInstance(format!("{}/{}", group_id, service_name)))
    }

    async fn send_once(
        &self,
        instance: &ServiceInstance,
        method: reqwest::Method,
        path: &str,
        headers: reqwest::header::HeaderMap,
        body: bytes::Bytes,
        timeout: Duration,
    ) -> Result<UpstreamResponse> {
        let client = self.client_for(&instance.addr());
        let url = format!("http://{}{}", instance.addr(), path);

        let response = client
            .request(method, &url)
            .headers(headers)
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("upstream {} timed out", instance.addr()))
                } else {
                    Error::UpstreamFailure(format!("upstream {} unreachable: {}", instance.addr(), e))
                }
            })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::UpstreamFailure(format!("failed reading upstream body: {}", e)))?;

        if status.is_server_error() {
            return Err(Error::UpstreamFailure(format!(
                "upstream {} returned {}",
                instance.addr(),
                status
            )));
        }

        Ok(UpstreamResponse {
            instance_id: instance.id.clone(),
            status,
            headers,
            body,
        })
    }

    /// Multi-service fanout (§4.8): dispatch to every service listed on
    /// the route concurrently (bounded by `max_concurrent_requests`, 0 =
    /// unbounded), then merge per `response_merge_strategy`.
    pub async fn dispatch_fanout(
        &self,
        route: &RouteConfig,
        tenant_id: &crate::ids::TenantId,
        group_id: &crate::ids::ServiceGroupId,
        method: reqwest::Method,
        path: &str,
        headers: reqwest::header::HeaderMap,
        body: bytes::Bytes,
        client_key: Option<&str>,
        claims: Option<&serde_json::Value>,
    ) -> Result<Vec<Result<UpstreamResponse>>> {
        let semaphore = if route.max_concurrent_requests > 0 {
            Some(Arc::new(Semaphore::new(route.max_concurrent_requests)))
        } else {
            None
        };

        let mut tasks = Vec::new();
        for service_id in &route.service_definition_ids {
            let service_name: crate::ids::ServiceName = service_id.as_str().into();
            let method = method.clone();
            let headers = headers.clone();
            let body = body.clone();
            let tenant_id = tenant_id.clone();
            let group_id = group_id.clone();
            let route = route.clone();
            let sem = semaphore.clone();
            let claims = claims.cloned();

            let fut = async move {
                let _permit = match &sem {
                    Some(s) => Some(s.clone().acquire_owned().await),
                    None => None,
                };
                self.dispatch_single(&route, &tenant_id, &group_id, &service_name, method, path, headers, body, client_key, claims.as_ref())
                    .await
            };
            tasks.push(fut);
        }

        let results = futures::future::join_all(tasks).await;

        match route.response_merge_strategy {
            ResponseMergeStrategy::First => Ok(results),
            ResponseMergeStrategy::FirstError => {
                if route.require_all_success && results.iter().any(|r| r.is_err()) {
                    return Err(results.into_iter().find_map(|r| r.err()).unwrap_or_else(|| Error::UpstreamFailure("fanout failed".into())));
                }
                Ok(results)
            }
            ResponseMergeStrategy::All => Ok(results),
        }
    }
}

/// Pick the representative response for `first`/`first-error` merge
/// strategies from a fanout's per-service results (§4.8).
pub fn pick_merge_response(
    strategy: ResponseMergeStrategy,
    results: &[Result<UpstreamResponse>],
) -> Option<&UpstreamResponse> {
    match strategy {
        // `first`: first successful leg, ignoring any failed legs.
        ResponseMergeStrategy::First => results.iter().find_map(|r| r.as_ref().ok()),
        // `first_error`: first leg's outcome wins even if it failed;
        // `require_all_success` (checked in `dispatch_fanout`) decides
        // whether a failed leg aborts the whole fanout instead.
        ResponseMergeStrategy::FirstError => results.first().and_then(|r| r.as_ref().ok()),
        // `all`: every leg is surfaced individually; there's no single
        // representative response to merge into -- callers use the full
        // `results` vec (see DESIGN.md).
        ResponseMergeStrategy::All => None,
    }
}

/// Build the tuning the dispatcher reads from `Config`, used by
/// `state::AppState` wiring.
pub fn proxy_config_from(config: &Config) -> ProxyConfig {
    config.proxy.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResponseMergeStrategy;
    use crate::registry::manager::new_default;
    use crate::registry::model::{HealthStatus, InstanceStatus, ServiceInstance};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn idempotent_methods_are_safe_to_replay() {
        assert!(is_idempotent(&reqwest::Method::GET));
        assert!(is_idempotent(&reqwest::Method::HEAD));
        assert!(!is_idempotent(&reqwest::Method::PUT));
        assert!(!is_idempotent(&reqwest::Method::DELETE));
        assert!(!is_idempotent(&reqwest::Method::POST));
        assert!(!is_idempotent(&reqwest::Method::PATCH));
    }

    fn leg(status: u16) -> UpstreamResponse {
        UpstreamResponse {
            instance_id: "i1".into(),
            status: reqwest::StatusCode::from_u16(status).unwrap(),
            headers: reqwest::header::HeaderMap::new(),
            body: bytes::Bytes::new(),
        }
    }

    #[test]
    fn first_strategy_skips_failed_legs() {
        let results: Vec<Result<UpstreamResponse>> = vec![
            Err(Error::UpstreamFailure("down".into())),
            Ok(leg(200)),
        ];
        let picked = pick_merge_response(ResponseMergeStrategy::First, &results).unwrap();
        assert_eq!(picked.status, 200);
    }

    #[test]
    fn first_error_strategy_takes_the_first_leg_regardless() {
        let results: Vec<Result<UpstreamResponse>> = vec![
            Err(Error::UpstreamFailure("down".into())),
            Ok(leg(200)),
        ];
        assert!(pick_merge_response(ResponseMergeStrategy::FirstError, &results).is_none());
    }

    #[test]
    fn all_strategy_has_no_single_representative() {
        let results: Vec<Result<UpstreamResponse>> = vec![Ok(leg(200))];
        assert!(pick_merge_response(ResponseMergeStrategy::All, &results).is_none());
    }

    /// Binds a one-shot listener that replies with a fixed status and body
    /// to the first request it receives, then returns its address.
    async fn spawn_one_shot_upstream(status_line: &'static str, body: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "{status_line}\r\ncontent-length: {}\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        addr
    }

    fn instance_at(addr: std::net::SocketAddr) -> ServiceInstance {
        ServiceInstance {
            tenant_id: "t1".into(),
            id: "i1".into(),
            group_id: "g1".into(),
            service_name: "svc".into(),
            host: addr.ip().to_string(),
            port: addr.port(),
            instance_status: InstanceStatus::Up,
            health_status: HealthStatus::Healthy,
            weight: 1,
            last_heartbeat_time: 0,
            last_health_check_time: 0,
            heartbeat_fail_count: 0,
            ephemeral: true,
        }
    }

    #[tokio::test]
    async fn send_once_returns_upstream_response_on_success() {
        let addr = spawn_one_shot_upstream("HTTP/1.1 200 OK", "hello").await;
        let manager = new_default().await;
        let dispatcher = ProxyDispatcher::new(Arc::new(manager), ProxyConfig::default());
        let instance = instance_at(addr);

        let resp = dispatcher
            .send_once(
                &instance,
                reqwest::Method::GET,
                "/",
                reqwest::header::HeaderMap::new(),
                bytes::Bytes::new(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        assert_eq!(resp.status, reqwest::StatusCode::OK);
        assert_eq!(resp.body, bytes::Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn send_once_maps_upstream_5xx_to_upstream_failure() {
        let addr = spawn_one_shot_upstream("HTTP/1.1 503 Service Unavailable", "down").await;
        let manager = new_default().await;
        let dispatcher = ProxyDispatcher::new(Arc::new(manager), ProxyConfig::default());
        let instance = instance_at(addr);

        let err = dispatcher
            .send_once(
                &instance,
                reqwest::Method::GET,
                "/",
                reqwest::header::HeaderMap::new(),
                bytes::Bytes::new(),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UpstreamFailure(_)));
    }

    #[tokio::test]
    async fn client_for_reuses_the_pooled_client_per_host() {
        let dispatcher = ProxyDispatcher::new(Arc::new(new_default().await), ProxyConfig::default());
        let a = dispatcher.client_for("127.0.0.1:9000");
        let b = dispatcher.client_for("127.0.0.1:9000");
        assert_eq!(dispatcher.clients.len(), 1);
        drop((a, b));
    }
}
