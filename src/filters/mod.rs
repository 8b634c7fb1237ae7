//! Filter Chain Engine (§4.6) and its built-in filter catalog (§6).

pub mod builtin;
pub mod chain;
pub mod types;

use std::sync::Arc;

use crate::config::FilterConfig;
use crate::error::Result;
use builtin::{
    BodyFilter, CookieFilter, FilterMeta, HeaderFilter, JwtAuthFilter, MethodFilter,
    QueryParamFilter, ResponseHeaderFilter, RewriteFilter, StripFilter,
};
pub use chain::{CompiledFilter, Filter, FilterChain, FilterResult, RequestContext};
use types::FilterKind;

fn meta_for(config: &FilterConfig) -> FilterMeta {
    FilterMeta {
        id: config.id.as_str().to_string(),
        phase: config.action_phase,
        order: config.order,
    }
}

/// Build a runnable filter from its config, or `None` for an inert
/// `Unknown` variant (logged once, treated as a no-op `Continue` by
/// simply never being added to the chain).
pub fn build_filter(config: &FilterConfig) -> Result<Option<Arc<dyn Filter>>> {
    let kind = FilterKind::parse(config)?;
    let meta = meta_for(config);

    let filter: Option<Arc<dyn Filter>> = match kind {
        FilterKind::Header(spec) => Some(Arc::new(HeaderFilter::new(meta, spec))),
        FilterKind::QueryParam(spec) => Some(Arc::new(QueryParamFilter::new(meta, spec))),
        FilterKind::Body(spec) => Some(Arc::new(BodyFilter::new(meta, spec))),
        FilterKind::Strip(spec) => Some(Arc::new(StripFilter::new(meta, spec))),
        FilterKind::Rewrite(spec) => Some(Arc::new(RewriteFilter::new(meta, spec))),
        FilterKind::Method(spec) => Some(Arc::new(MethodFilter::new(meta, spec))),
        FilterKind::Cookie(spec) => Some(Arc::new(CookieFilter::new(meta, spec))),
        FilterKind::Response(spec) => Some(Arc::new(ResponseHeaderFilter::new(meta, spec))),
        FilterKind::Security(spec) => builtin::build_security_filter(meta, spec),
        FilterKind::Auth(spec) => Some(Arc::new(JwtAuthFilter::new(meta, &spec)?)),
        FilterKind::Unknown { filter_type } => {
            tracing::warn!(filter = %config.id, ?filter_type, "unrecognized filter config, treating as no-op");
            None
        }
    };

    Ok(filter)
}

/// Build a `FilterChain` from a tenant/route's active `FilterConfig`
/// set, skipping any that fail to parse or compile (logged, not fatal --
/// a single malformed filter shouldn't take down the whole chain).
pub fn build_chain(configs: &[FilterConfig]) -> FilterChain {
    let mut compiled = Vec::with_capacity(configs.len());
    for config in configs {
        if !config.active {
            continue;
        }
        match build_filter(config) {
            Ok(Some(filter)) => compiled.push(CompiledFilter {
                config: Arc::new(config.clone()),
                filter,
            }),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(filter = %config.id, error = %e, "skipping filter that failed to compile");
            }
        }
    }
    FilterChain::new(compiled)
}
