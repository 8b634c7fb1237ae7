//! Gateway ingress handler (§2 data flow): the axum entry point that
//! strings the route matcher, filter chain engine, rate limiter, registry
//! discovery and proxy dispatcher together into the live request
//! pipeline --
//!
//! ```text
//! ingress -> pre-routing filters -> Route Matcher -> post-routing
//! filters -> rate limiter -> Registry Manager DiscoverInstance -> Proxy
//! Dispatcher -> upstream -> pre-response filters -> egress
//! ```
//!
//! This is the only place in the crate where those subsystems are
//! composed end-to-end; everything else exposes a piece of the pipeline
//! for this handler (or a test) to drive.

use std::net::{IpAddr, SocketAddr};

use axum::body::{to_bytes, Body};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::config::{ConfigScope, FilterConfig, RateLimitAlgorithm, RateLimitConfig, RouteConfig};
use crate::error::{Error, Result};
use crate::filters::{build_chain, FilterResult, RequestContext};
use crate::ids::{RouteConfigId, TenantId};
use crate::proxy::{pick_merge_response, UpstreamResponse};
use crate::ratelimit::derive_key;
use crate::state::AppState;

/// Header clients/operators use to select a tenant; falls back to a
/// single-tenant deployment when absent. See DESIGN.md for the tenant
/// attribution rationale.
const TENANT_HEADER: &str = "x-tenant-id";
const DEFAULT_TENANT: &str = "default";

/// Request bodies larger than this are rejected before they reach a
/// filter or the proxy dispatcher.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Axum handler wired as the gateway's catch-all route. Never panics on
/// a bad request -- every failure mode maps through `Error`'s
/// `IntoResponse` impl (§7).
pub async fn handle(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: Option<WebSocketUpgrade>,
    req: Request<Body>,
) -> Response {
    match dispatch(state, peer, ws, req).await {
        Ok(resp) => resp,
        Err(e) => e.into_response(),
    }
}

async fn dispatch(
    state: AppState,
    peer: SocketAddr,
    ws: Option<WebSocketUpgrade>,
    req: Request<Body>,
) -> Result<Response> {
    let (parts, body) = req.into_parts();
    let tenant_id = resolve_tenant(&parts.headers);
    let host = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut ctx = RequestContext::new(
        parts.method.clone(),
        parts.uri.clone(),
        parts.headers.clone(),
        tenant_id.clone(),
    );
    ctx.client_ip = Some(resolve_client_ip(&parts.headers, peer));

    // §4.6 pre-routing: only instance-scope filters are visible -- the
    // route hasn't been matched yet.
    let instance_chain = build_chain(&filters_for(&state, &tenant_id, None));
    let ctx = match instance_chain.run_pre_routing(ctx).await? {
        FilterResult::Continue(ctx) => ctx,
        FilterResult::ShortCircuit(resp) => return Ok(resp),
    };

    // §4.5 Route Matcher.
    let matched = state
        .route_matcher()
        .resolve(&host, parts.method.as_str(), parts.uri.path())
        .await?;
    let route = (*matched.route).clone();
    let mut ctx = ctx;
    ctx.route = Some(matched.clone());

    // §4.6 post-routing: instance-scope filters plus this route's own.
    let route_chain = build_chain(&filters_for(&state, &tenant_id, Some(&route.id)));
    let ctx = match route_chain.run_post_routing(ctx).await? {
        FilterResult::Continue(ctx) => ctx,
        FilterResult::ShortCircuit(resp) => return Ok(resp),
    };

    // §4.7 rate limiting.
    let (mut ctx, rejection) = apply_rate_limits(&state, &tenant_id, &route, ctx).await?;
    if let Some(resp) = rejection {
        return Ok(resp);
    }

    let service_name = route
        .service_definition_ids
        .first()
        .ok_or_else(|| Error::Internal(format!("route {} has no service_definition_ids", route.id)))?
        .as_str();

    if let Some(ws) = ws {
        let instance = state
            .registry()
            .discover_instance(&tenant_id, &route.service_group_id, &service_name.into(), ctx.client_ip.map(|ip| ip.to_string()).as_deref(), ctx.claims.as_ref())
            .await?;
        let path = matched.forward_path.clone();
        return Ok(ws.on_upgrade(move |socket| async move {
            if let Err(e) = crate::proxy::bridge_websocket(socket, &instance, &path).await {
                tracing::warn!(error = %e, "websocket bridge ended with error");
            }
        }));
    }

    let body_bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| Error::InvalidArgument(format!("failed to read request body: {e}")))?;
    ctx.body = Some(body_bytes.clone());

    let upstream_headers = forwarded_headers(&ctx.headers, ctx.client_ip, &host);
    let client_key = ctx.client_ip.map(|ip| ip.to_string());

    // §4.8 Proxy Dispatcher: single-service dispatch or multi-service
    // fanout, selected by how many services the route names.
    let upstream = if route.service_definition_ids.len() > 1 {
        let results = state
            .proxy()
            .dispatch_fanout(
                &route,
                &tenant_id,
                &route.service_group_id,
                ctx.method.clone(),
                &matched.forward_path,
                upstream_headers,
                body_bytes.clone(),
                client_key.as_deref(),
                ctx.claims.as_ref(),
            )
            .await?;

        if route.response_merge_strategy == crate::config::ResponseMergeStrategy::All {
            return Ok(merge_all_response(&route, results));
        }
        let picked = pick_merge_response(route.response_merge_strategy, &results).map(clone_upstream);
        match picked {
            Some(resp) => resp,
            None => {
                return Err(results
                    .into_iter()
                    .find_map(|r| r.err())
                    .unwrap_or_else(|| Error::UpstreamFailure("fanout produced no usable response".into())));
            }
        }
    } else {
        state
            .proxy()
            .dispatch_single(
                &route,
                &tenant_id,
                &route.service_group_id,
                &service_name.into(),
                ctx.method.clone(),
                &matched.forward_path,
                upstream_headers,
                body_bytes,
                client_key.as_deref(),
                ctx.claims.as_ref(),
            )
            .await?
    };

    // §4.6 pre-response.
    let ctx = match route_chain.run_pre_response(ctx).await? {
        FilterResult::Continue(ctx) => ctx,
        FilterResult::ShortCircuit(resp) => return Ok(resp),
    };

    Ok(build_response(&ctx, upstream))
}

fn resolve_tenant(headers: &HeaderMap) -> TenantId {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_TENANT)
        .into()
}

/// The immediate TCP peer, used as the fallback client IP (and the key
/// for `ip-hash`/rate-limiting) when no filter has opted into trusting a
/// forwarded-for header (§4.1, §6).
fn resolve_client_ip(_headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    peer.ip()
}

fn filters_for(state: &AppState, tenant_id: &TenantId, route_id: Option<&RouteConfigId>) -> Vec<FilterConfig> {
    state
        .config()
        .filters
        .iter()
        .filter(|f| &f.tenant_id == tenant_id && f.active)
        .filter(|f| match f.scope {
            ConfigScope::Instance => true,
            ConfigScope::Route => route_id.is_some_and(|id| f.route_config_id.as_ref() == Some(id)),
        })
        .cloned()
        .collect()
}

fn rate_limits_for(state: &AppState, tenant_id: &TenantId, route_id: &RouteConfigId) -> Vec<RateLimitConfig> {
    state
        .config()
        .rate_limits
        .iter()
        .filter(|r| &r.tenant_id == tenant_id && r.active)
        .filter(|r| match r.scope {
            ConfigScope::Instance => true,
            ConfigScope::Route => r.route_config_id.as_ref() == Some(route_id),
        })
        .cloned()
        .collect()
}

/// Run every applicable rate-limit config for this request, always
/// setting `X-RateLimit-*` on admit and reject alike (§4.7). The first
/// config to reject short-circuits the rest.
async fn apply_rate_limits(
    state: &AppState,
    tenant_id: &TenantId,
    route: &RouteConfig,
    mut ctx: RequestContext,
) -> Result<(RequestContext, Option<Response>)> {
    let configs = rate_limits_for(state, tenant_id, &route.id);
    let user_id = ctx
        .claims
        .as_ref()
        .and_then(|c| c.get("sub"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    for config in configs {
        if config.algorithm == RateLimitAlgorithm::None {
            continue;
        }
        let key = derive_key(
            config.key_strategy,
            ctx.client_ip.map(|ip| ip.to_string()).as_deref(),
            user_id.as_deref(),
            ctx.uri.path(),
            route.service_definition_ids.first().map(String::as_str),
            Some(route.id.as_str()),
        );
        let admission = state.rate_limiter().check(&config.id, &key).await?;
        ctx.response_headers.push(("x-ratelimit-limit".into(), admission.limit.to_string()));
        ctx.response_headers
            .push(("x-ratelimit-remaining".into(), admission.remaining.to_string()));
        ctx.response_headers
            .push(("x-ratelimit-reset".into(), admission.reset_after.as_secs().to_string()));

        if !admission.admitted {
            let status = StatusCode::from_u16(config.rejection_status_code).unwrap_or(StatusCode::TOO_MANY_REQUESTS);
            let mut builder = Response::builder().status(status);
            if let Some(headers) = builder.headers_mut() {
                apply_header_pairs(headers, &ctx.response_headers);
            }
            let resp = builder
                .body(Body::from(config.rejection_message.clone()))
                .unwrap_or_else(|_| StatusCode::TOO_MANY_REQUESTS.into_response());
            return Ok((ctx, Some(resp)));
        }
    }

    Ok((ctx, None))
}

/// Build the headers forwarded upstream: the client's own headers minus
/// `Host`, plus `X-Forwarded-For`/`-Proto`/`-Host` (§6).
fn forwarded_headers(headers: &HeaderMap, client_ip: Option<IpAddr>, host: &str) -> HeaderMap {
    let mut out = headers.clone();
    out.remove(axum::http::header::HOST);

    if let Some(ip) = client_ip {
        let forwarded_for = match out.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {ip}"),
            None => ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            out.insert(HeaderName::from_static("x-forwarded-for"), value);
        }
    }
    out.insert(HeaderName::from_static("x-forwarded-proto"), HeaderValue::from_static("http"));
    if let Ok(value) = HeaderValue::from_str(host) {
        out.insert(HeaderName::from_static("x-forwarded-host"), value);
    }
    out
}

fn apply_header_pairs(headers: &mut HeaderMap, pairs: &[(String, String)]) {
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            headers.insert(name, value);
        }
    }
}

fn build_response(ctx: &RequestContext, upstream: UpstreamResponse) -> Response {
    let mut builder = Response::builder().status(upstream.status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream.headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        apply_header_pairs(headers, &ctx.response_headers);
    }
    builder
        .body(Body::from(upstream.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Envelopes every fanout leg's outcome as a JSON array of `{service,
/// status, body}` objects (and `{error}` for a failed leg) rather than
/// picking one representative response (see DESIGN.md).
fn merge_all_response(route: &RouteConfig, results: Vec<Result<UpstreamResponse>>) -> Response {
    let legs: Vec<serde_json::Value> = route
        .service_definition_ids
        .iter()
        .zip(results.into_iter())
        .map(|(service, result)| match result {
            Ok(resp) => serde_json::json!({
                "service": service,
                "status": resp.status.as_u16(),
                "body": String::from_utf8_lossy(&resp.body),
            }),
            Err(e) => serde_json::json!({ "service": service, "error": e.to_string() }),
        })
        .collect();

    axum::Json(serde_json::json!({ "fanout": legs })).into_response()
}

fn clone_upstream(resp: &UpstreamResponse) -> UpstreamResponse {
    UpstreamResponse {
        instance_id: resp.instance_id.clone(),
        status: resp.status,
        headers: resp.headers.clone(),
        body: resp.body.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigScope, FilterType, RateLimitKeyStrategy};

    fn filter_config(tenant: &str, scope: ConfigScope, route_id: Option<&str>) -> FilterConfig {
        FilterConfig {
            tenant_id: tenant.into(),
            id: "f1".into(),
            scope,
            route_config_id: route_id.map(Into::into),
            filter_type: FilterType::Header,
            action_phase: crate::config::FilterPhase::PreRouting,
            order: 0,
            filter_config: serde_json::json!({}),
            active: true,
        }
    }

    async fn state_with(config: Config) -> AppState {
        AppState::new(config).await.unwrap()
    }

    #[tokio::test]
    async fn filters_for_includes_instance_scope_without_a_route() {
        let mut config = Config::default();
        config.filters = vec![filter_config("t1", ConfigScope::Instance, None)];
        let state = state_with(config).await;
        let tenant: TenantId = "t1".into();

        let found = filters_for(&state, &tenant, None);
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn filters_for_excludes_route_scope_when_route_ids_differ() {
        let mut config = Config::default();
        config.filters = vec![filter_config("t1", ConfigScope::Route, Some("r1"))];
        let state = state_with(config).await;
        let tenant: TenantId = "t1".into();

        assert!(filters_for(&state, &tenant, None).is_empty());
        assert!(filters_for(&state, &tenant, Some(&"r2".into())).is_empty());
        assert_eq!(filters_for(&state, &tenant, Some(&"r1".into())).len(), 1);
    }

    #[tokio::test]
    async fn filters_for_excludes_other_tenants() {
        let mut config = Config::default();
        config.filters = vec![filter_config("other", ConfigScope::Instance, None)];
        let state = state_with(config).await;
        let tenant: TenantId = "t1".into();

        assert!(filters_for(&state, &tenant, None).is_empty());
    }

    #[tokio::test]
    async fn rate_limits_for_mirrors_filter_scoping() {
        let mut config = Config::default();
        config.rate_limits = vec![rate_limit_config_sample()];
        let state = state_with(config).await;
        let tenant: TenantId = "t1".into();

        assert!(rate_limits_for(&state, &tenant, &"other-route".into()).is_empty());
        assert_eq!(rate_limits_for(&state, &tenant, &"r1".into()).len(), 1);
    }

    #[test]
    fn resolve_tenant_falls_back_to_default() {
        let headers = HeaderMap::new();
        assert_eq!(resolve_tenant(&headers).as_str(), "default");
    }

    #[test]
    fn resolve_tenant_reads_header() {
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_static("acme"));
        assert_eq!(resolve_tenant(&headers).as_str(), "acme");
    }

    #[test]
    fn forwarded_headers_sets_standard_triplet() {
        let headers = HeaderMap::new();
        let out = forwarded_headers(&headers, Some("203.0.113.9".parse().unwrap()), "api.example.com");
        assert_eq!(out.get("x-forwarded-for").unwrap(), "203.0.113.9");
        assert_eq!(out.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(out.get("x-forwarded-host").unwrap(), "api.example.com");
    }

    #[test]
    fn forwarded_headers_appends_to_existing_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1"));
        let out = forwarded_headers(&headers, Some("203.0.113.9".parse().unwrap()), "api.example.com");
        assert_eq!(out.get("x-forwarded-for").unwrap(), "198.51.100.1, 203.0.113.9");
    }

    fn rate_limit_config_sample() -> RateLimitConfig {
        RateLimitConfig {
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
            rejection_message: "slow down".into(),
            active: true,
        }
    }
}
