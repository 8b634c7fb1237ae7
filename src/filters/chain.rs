//! Filter Chain Engine (§4.6): executes filters in ascending `order`
//! within each phase (pre-routing, post-routing, pre-response), stopping
//! on the first short-circuit or error.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;

use crate::config::{FilterConfig, FilterPhase};
use crate::error::Result;
use crate::ids::TenantId;
use crate::routing::MatchedRoute;

/// Per-request state threaded through the chain. Filters read and mutate
/// it in place; the engine clones only what's needed to construct a
/// short-circuit response.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub client_ip: Option<IpAddr>,
    pub tenant_id: TenantId,
    /// Populated once the post-routing phase runs (§4.6: route matching
    /// happens between pre-routing and post-routing filters).
    pub route: Option<MatchedRoute>,
    pub body: Option<Bytes>,
    /// JWT claims, set by the auth filter for downstream filters/handlers.
    pub claims: Option<serde_json::Value>,
    /// Headers queued to be applied to the upstream response; drained by
    /// the pre-response phase's header-add filters.
    pub response_headers: Vec<(String, String)>,
}

impl RequestContext {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, tenant_id: TenantId) -> Self {
        let query = uri.query().map(parse_query).unwrap_or_default();
        Self {
            method,
            uri,
            headers,
            query,
            client_ip: None,
            tenant_id,
            route: None,
            body: None,
            claims: None,
            response_headers: Vec::new(),
        }
    }
}

/// Outcome of running a single filter (§4.6).
pub enum FilterResult {
    Continue(RequestContext),
    ShortCircuit(Response),
}

/// A single filter implementation. `order()`/`phase()` mirror the
/// backing `FilterConfig` so the chain can sort without a second lookup.
#[async_trait]
pub trait Filter: Send + Sync {
    async fn apply(&self, ctx: RequestContext) -> Result<FilterResult>;
    fn phase(&self) -> FilterPhase;
    fn order(&self) -> i32;
    fn id(&self) -> &str;
}

pub struct CompiledFilter {
    pub config: Arc<FilterConfig>,
    pub filter: Arc<dyn Filter>,
}

/// Holds the full active filter set for one tenant/route scope, grouped
/// by phase and pre-sorted by ascending order (§4.6 I: "filters within a
/// phase run in ascending order; ties broken by filter id ascending").
pub struct FilterChain {
    pre_routing: Vec<CompiledFilter>,
    post_routing: Vec<CompiledFilter>,
    pre_response: Vec<CompiledFilter>,
}

impl FilterChain {
    pub fn new(mut filters: Vec<CompiledFilter>) -> Self {
        filters.sort_by(|a, b| a.config.order.cmp(&b.config.order).then_with(|| a.config.id.as_str().cmp(b.config.id.as_str())));

        let mut pre_routing = Vec::new();
        let mut post_routing = Vec::new();
        let mut pre_response = Vec::new();

        for cf in filters {
            if !cf.config.active {
                continue;
            }
            match cf.config.action_phase {
                FilterPhase::PreRouting => pre_routing.push(cf),
                FilterPhase::PostRouting => post_routing.push(cf),
                FilterPhase::PreResponse => pre_response.push(cf),
            }
        }

        Self {
            pre_routing,
            post_routing,
            pre_response,
        }
    }

    pub async fn run_pre_routing(&self, ctx: RequestContext) -> Result<FilterResult> {
        run_phase(&self.pre_routing, ctx).await
    }

    pub async fn run_post_routing(&self, ctx: RequestContext) -> Result<FilterResult> {
        run_phase(&self.post_routing, ctx).await
    }

    pub async fn run_pre_response(&self, ctx: RequestContext) -> Result<FilterResult> {
        run_phase(&self.pre_response, ctx).await
    }
}

/// Minimal `application/x-www-form-urlencoded` query-string decoder so
/// the chain doesn't need a dedicated URL-parsing dependency just for
/// `?a=b&c=d` pairs.
fn parse_query(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = percent_decode(parts.next().unwrap_or(""));
            let value = percent_decode(parts.next().unwrap_or(""));
            (key, value)
        })
        .collect()
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                if let Ok(hex) = u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16) {
                    out.push(hex);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

async fn run_phase(filters: &[CompiledFilter], mut ctx: RequestContext) -> Result<FilterResult> {
    for compiled in filters {
        match compiled.filter.apply(ctx).await? {
            FilterResult::Continue(next) => ctx = next,
            short @ FilterResult::ShortCircuit(_) => return Ok(short),
        }
    }
    Ok(FilterResult::Continue(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigScope, FilterType};
    use axum::http::StatusCode;

    struct RejectAll;

    #[async_trait]
    impl Filter for RejectAll {
        async fn apply(&self, _ctx: RequestContext) -> Result<FilterResult> {
            Ok(FilterResult::ShortCircuit(
                Response::builder().status(StatusCode::FORBIDDEN).body(axum::body::Body::empty()).unwrap(),
            ))
        }
        fn phase(&self) -> FilterPhase {
            FilterPhase::PreRouting
        }
        fn order(&self) -> i32 {
            0
        }
        fn id(&self) -> &str {
            "reject-all"
        }
    }

    struct TagHeader(&'static str);

    #[async_trait]
    impl Filter for TagHeader {
        async fn apply(&self, mut ctx: RequestContext) -> Result<FilterResult> {
            ctx.response_headers.push((self.0.to_string(), "1".to_string()));
            Ok(FilterResult::Continue(ctx))
        }
        fn phase(&self) -> FilterPhase {
            FilterPhase::PreRouting
        }
        fn order(&self) -> i32 {
            0
        }
        fn id(&self) -> &str {
            self.0
        }
    }

    fn config(id: &str, phase: FilterPhase, order: i32) -> Arc<FilterConfig> {
        Arc::new(FilterConfig {
            tenant_id: "t1".into(),
            id: id.into(),
            scope: ConfigScope::Instance,
            route_config_id: None,
            filter_type: FilterType::Header,
            action_phase: phase,
            order,
            filter_config: serde_json::json!({}),
            active: true,
        })
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Method::GET, "/x".parse().unwrap(), HeaderMap::new(), "t1".into())
    }

    #[tokio::test]
    async fn short_circuit_stops_the_chain() {
        let chain = FilterChain::new(vec![
            CompiledFilter {
                config: config("f1", FilterPhase::PreRouting, 1),
                filter: Arc::new(RejectAll),
            },
            CompiledFilter {
                config: config("f2", FilterPhase::PreRouting, 2),
                filter: Arc::new(TagHeader("x-should-not-run")),
            },
        ]);

        match chain.run_pre_routing(ctx()).await.unwrap() {
            FilterResult::ShortCircuit(resp) => assert_eq!(resp.status(), StatusCode::FORBIDDEN),
            FilterResult::Continue(_) => panic!("expected short circuit"),
        }
    }

    #[tokio::test]
    async fn filters_run_in_ascending_order_within_phase() {
        let chain = FilterChain::new(vec![
            CompiledFilter {
                config: config("f-second", FilterPhase::PreRouting, 2),
                filter: Arc::new(TagHeader("second")),
            },
            CompiledFilter {
                config: config("f-first", FilterPhase::PreRouting, 1),
                filter: Arc::new(TagHeader("first")),
            },
        ]);

        match chain.run_pre_routing(ctx()).await.unwrap() {
            FilterResult::Continue(ctx) => {
                let names: Vec<&str> = ctx.response_headers.iter().map(|(k, _)| k.as_str()).collect();
                assert_eq!(names, vec!["first", "second"]);
            }
            FilterResult::ShortCircuit(_) => panic!("expected continue"),
        }
    }
}
