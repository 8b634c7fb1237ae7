//! Built-in filter implementations (§6): header/query/body/method/cookie
//! mutation, URL strip/rewrite, instance-level security filters (IP, UA,
//! path, domain, CORS), and JWT authentication.

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use globset::Glob;
use ipnet::IpNet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use regex::Regex;

use crate::config::FilterPhase;
use crate::error::{Error, Result};
use crate::filters::chain::{Filter, FilterResult, RequestContext};
use crate::filters::types::{
    AuthFilterSpec, BodyFilterSpec, CookieFilterSpec, HeaderFilterSpec, MethodFilterSpec,
    QueryParamFilterSpec, ResponseHeaderFilterSpec, RewriteFilterSpec, SecurityFilterSpec,
    StripFilterSpec,
};

/// Metadata shared by every built-in filter, mirroring its `FilterConfig`
/// so the chain can sort without a second lookup.
#[derive(Clone)]
pub struct FilterMeta {
    pub id: String,
    pub phase: FilterPhase,
    pub order: i32,
}

macro_rules! impl_meta {
    ($ty:ty) => {
        impl $ty {
            fn meta(&self) -> &FilterMeta {
                &self.meta
            }
        }
    };
}

pub struct HeaderFilter {
    meta: FilterMeta,
    spec: HeaderFilterSpec,
}
impl_meta!(HeaderFilter);

impl HeaderFilter {
    pub fn new(meta: FilterMeta, spec: HeaderFilterSpec) -> Self {
        Self { meta, spec }
    }
}

#[async_trait]
impl Filter for HeaderFilter {
    async fn apply(&self, mut ctx: RequestContext) -> Result<FilterResult> {
        for name in &self.spec.remove {
            if let Ok(header) = HeaderName::from_str(name) {
                ctx.headers.remove(header);
            }
        }
        for (name, value) in &self.spec.add {
            if let (Ok(header), Ok(value)) = (HeaderName::from_str(name), HeaderValue::from_str(value)) {
                ctx.headers.insert(header, value);
            }
        }
        Ok(FilterResult::Continue(ctx))
    }
    fn phase(&self) -> FilterPhase {
        self.meta().phase
    }
    fn order(&self) -> i32 {
        self.meta().order
    }
    fn id(&self) -> &str {
        &self.meta().id
    }
}

pub struct QueryParamFilter {
    meta: FilterMeta,
    spec: QueryParamFilterSpec,
}
impl_meta!(QueryParamFilter);

impl QueryParamFilter {
    pub fn new(meta: FilterMeta, spec: QueryParamFilterSpec) -> Self {
        Self { meta, spec }
    }
}

#[async_trait]
impl Filter for QueryParamFilter {
    async fn apply(&self, mut ctx: RequestContext) -> Result<FilterResult> {
        for key in &self.spec.remove {
            ctx.query.remove(key);
        }
        for (key, value) in &self.spec.add {
            ctx.query.insert(key.clone(), value.clone());
        }
        Ok(FilterResult::Continue(ctx))
    }
    fn phase(&self) -> FilterPhase {
        self.meta().phase
    }
    fn order(&self) -> i32 {
        self.meta().order
    }
    fn id(&self) -> &str {
        &self.meta().id
    }
}

pub struct BodyFilter {
    meta: FilterMeta,
    spec: BodyFilterSpec,
}
impl_meta!(BodyFilter);

impl BodyFilter {
    pub fn new(meta: FilterMeta, spec: BodyFilterSpec) -> Self {
        Self { meta, spec }
    }
}

#[async_trait]
impl Filter for BodyFilter {
    async fn apply(&self, mut ctx: RequestContext) -> Result<FilterResult> {
        if let Some(max) = self.spec.max_body_bytes {
            if ctx.body.as_ref().map(|b| b.len()).unwrap_or(0) > max {
                return Ok(FilterResult::ShortCircuit(
                    Error::InvalidArgument("request body exceeds configured limit".into()).into_response(),
                ));
            }
        }
        if self.spec.set_fields.is_empty() {
            return Ok(FilterResult::Continue(ctx));
        }
        let Some(body) = &ctx.body else {
            return Ok(FilterResult::Continue(ctx));
        };
        let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(body) else {
            return Ok(FilterResult::Continue(ctx));
        };
        if let Some(obj) = value.as_object_mut() {
            for (key, v) in &self.spec.set_fields {
                obj.insert(key.clone(), v.clone());
            }
        }
        if let Ok(bytes) = serde_json::to_vec(&value) {
            ctx.body = Some(axum::body::Bytes::from(bytes));
        }
        Ok(FilterResult::Continue(ctx))
    }
    fn phase(&self) -> FilterPhase {
        self.meta().phase
    }
    fn order(&self) -> i32 {
        self.meta().order
    }
    fn id(&self) -> &str {
        &self.meta().id
    }
}

/// Path-strip as a standalone filter, distinct from `RouteConfig`'s own
/// `strip_path_prefix` flag -- lets a filter strip a prefix the route
/// itself doesn't know about (e.g. a shared API gateway prefix).
pub struct StripFilter {
    meta: FilterMeta,
    spec: StripFilterSpec,
}
impl_meta!(StripFilter);

impl StripFilter {
    pub fn new(meta: FilterMeta, spec: StripFilterSpec) -> Self {
        Self { meta, spec }
    }
}

#[async_trait]
impl Filter for StripFilter {
    async fn apply(&self, mut ctx: RequestContext) -> Result<FilterResult> {
        let path = ctx.uri.path();
        if let Some(stripped) = path.strip_prefix(self.spec.prefix.as_str()) {
            let new_path = if stripped.starts_with('/') {
                stripped.to_string()
            } else {
                format!("/{stripped}")
            };
            let rebuilt = match ctx.uri.query() {
                Some(q) => format!("{new_path}?{q}"),
                None => new_path,
            };
            if let Ok(uri) = rebuilt.parse() {
                ctx.uri = uri;
            }
        }
        Ok(FilterResult::Continue(ctx))
    }
    fn phase(&self) -> FilterPhase {
        self.meta().phase
    }
    fn order(&self) -> i32 {
        self.meta().order
    }
    fn id(&self) -> &str {
        &self.meta().id
    }
}

pub struct RewriteFilter {
    meta: FilterMeta,
    spec: RewriteFilterSpec,
}
impl_meta!(RewriteFilter);

impl RewriteFilter {
    pub fn new(meta: FilterMeta, spec: RewriteFilterSpec) -> Self {
        Self { meta, spec }
    }
}

#[async_trait]
impl Filter for RewriteFilter {
    async fn apply(&self, mut ctx: RequestContext) -> Result<FilterResult> {
        if let Ok(uri) = self.spec.to.parse() {
            ctx.uri = uri;
        }
        Ok(FilterResult::Continue(ctx))
    }
    fn phase(&self) -> FilterPhase {
        self.meta().phase
    }
    fn order(&self) -> i32 {
        self.meta().order
    }
    fn id(&self) -> &str {
        &self.meta().id
    }
}

pub struct MethodFilter {
    meta: FilterMeta,
    spec: MethodFilterSpec,
}
impl_meta!(MethodFilter);

impl MethodFilter {
    pub fn new(meta: FilterMeta, spec: MethodFilterSpec) -> Self {
        Self { meta, spec }
    }
}

#[async_trait]
impl Filter for MethodFilter {
    async fn apply(&self, ctx: RequestContext) -> Result<FilterResult> {
        let allowed = self
            .spec
            .allowed
            .iter()
            .any(|m| m.eq_ignore_ascii_case(ctx.method.as_str()));
        if allowed {
            Ok(FilterResult::Continue(ctx))
        } else {
            Ok(FilterResult::ShortCircuit(
                (StatusCode::METHOD_NOT_ALLOWED, "method not allowed for this route").into_response(),
            ))
        }
    }
    fn phase(&self) -> FilterPhase {
        self.meta().phase
    }
    fn order(&self) -> i32 {
        self.meta().order
    }
    fn id(&self) -> &str {
        &self.meta().id
    }
}

pub struct CookieFilter {
    meta: FilterMeta,
    spec: CookieFilterSpec,
}
impl_meta!(CookieFilter);

impl CookieFilter {
    pub fn new(meta: FilterMeta, spec: CookieFilterSpec) -> Self {
        Self { meta, spec }
    }
}

#[async_trait]
impl Filter for CookieFilter {
    async fn apply(&self, mut ctx: RequestContext) -> Result<FilterResult> {
        let existing = ctx
            .headers
            .get(axum::http::header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        let mut jar: Vec<(String, String)> = existing
            .split(';')
            .filter_map(|pair| {
                let pair = pair.trim();
                let mut parts = pair.splitn(2, '=');
                let name = parts.next()?.trim().to_string();
                let value = parts.next().unwrap_or("").trim().to_string();
                if name.is_empty() {
                    None
                } else {
                    Some((name, value))
                }
            })
            .collect();

        jar.retain(|(name, _)| !self.spec.remove.contains(name));
        for (name, value) in &self.spec.add {
            jar.retain(|(existing, _)| existing != name);
            jar.push((name.clone(), value.clone()));
        }

        let rebuilt = jar
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("; ");
        if let Ok(value) = HeaderValue::from_str(&rebuilt) {
            ctx.headers.insert(axum::http::header::COOKIE, value);
        }
        Ok(FilterResult::Continue(ctx))
    }
    fn phase(&self) -> FilterPhase {
        self.meta().phase
    }
    fn order(&self) -> i32 {
        self.meta().order
    }
    fn id(&self) -> &str {
        &self.meta().id
    }
}

/// Queues headers for the pre-response phase; applied to the upstream
/// response just before it's returned to the client.
pub struct ResponseHeaderFilter {
    meta: FilterMeta,
    spec: ResponseHeaderFilterSpec,
}
impl_meta!(ResponseHeaderFilter);

impl ResponseHeaderFilter {
    pub fn new(meta: FilterMeta, spec: ResponseHeaderFilterSpec) -> Self {
        Self { meta, spec }
    }
}

#[async_trait]
impl Filter for ResponseHeaderFilter {
    async fn apply(&self, mut ctx: RequestContext) -> Result<FilterResult> {
        ctx.response_headers.retain(|(name, _)| !self.spec.remove.contains(name));
        for (name, value) in &self.spec.add {
            ctx.response_headers.push((name.clone(), value.clone()));
        }
        Ok(FilterResult::Continue(ctx))
    }
    fn phase(&self) -> FilterPhase {
        self.meta().phase
    }
    fn order(&self) -> i32 {
        self.meta().order
    }
    fn id(&self) -> &str {
        &self.meta().id
    }
}

// -- Security filters (§6) ------------------------------------------------

pub struct IpAccessFilter {
    meta: FilterMeta,
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
    trust_x_forwarded_for: bool,
    trust_x_real_ip: bool,
}
impl_meta!(IpAccessFilter);

impl IpAccessFilter {
    pub fn new(meta: FilterMeta, spec: crate::config::IpAccessControlConfig) -> Self {
        Self {
            meta,
            allow: spec.allow.iter().filter_map(|s| parse_cidr(s)).collect(),
            deny: spec.deny.iter().filter_map(|s| parse_cidr(s)).collect(),
            trust_x_forwarded_for: spec.trust_x_forwarded_for,
            trust_x_real_ip: spec.trust_x_real_ip,
        }
    }

    fn resolve_ip(&self, ctx: &RequestContext) -> Option<IpAddr> {
        if self.trust_x_forwarded_for {
            if let Some(v) = ctx.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                if let Some(first) = v.split(',').next() {
                    if let Ok(ip) = IpAddr::from_str(first.trim()) {
                        return Some(ip);
                    }
                }
            }
        }
        if self.trust_x_real_ip {
            if let Some(v) = ctx.headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
                if let Ok(ip) = IpAddr::from_str(v.trim()) {
                    return Some(ip);
                }
            }
        }
        ctx.client_ip
    }
}

fn parse_cidr(raw: &str) -> Option<IpNet> {
    if let Ok(net) = IpNet::from_str(raw) {
        return Some(net);
    }
    let ip = IpAddr::from_str(raw).ok()?;
    let prefix = match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    IpNet::new(ip, prefix).ok()
}

#[async_trait]
impl Filter for IpAccessFilter {
    async fn apply(&self, ctx: RequestContext) -> Result<FilterResult> {
        let Some(ip) = self.resolve_ip(&ctx) else {
            return Ok(FilterResult::ShortCircuit(
                Error::Forbidden("could not determine client IP".into()).into_response(),
            ));
        };
        if self.deny.iter().any(|net| net.contains(&ip)) {
            return Ok(FilterResult::ShortCircuit(
                Error::Forbidden("client IP is denylisted".into()).into_response(),
            ));
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|net| net.contains(&ip)) {
            return Ok(FilterResult::ShortCircuit(
                Error::Forbidden("client IP is not allowlisted".into()).into_response(),
            ));
        }
        Ok(FilterResult::Continue(ctx))
    }
    fn phase(&self) -> FilterPhase {
        self.meta().phase
    }
    fn order(&self) -> i32 {
        self.meta().order
    }
    fn id(&self) -> &str {
        &self.meta().id
    }
}

pub struct UserAgentAccessFilter {
    meta: FilterMeta,
    allow: Vec<Regex>,
    deny: Vec<Regex>,
    block_empty_user_agent: bool,
}
impl_meta!(UserAgentAccessFilter);

impl UserAgentAccessFilter {
    pub fn new(meta: FilterMeta, spec: crate::config::UserAgentAccessControlConfig) -> Self {
        Self {
            meta,
            allow: spec.allow.iter().filter_map(|p| Regex::new(p).ok()).collect(),
            deny: spec.deny.iter().filter_map(|p| Regex::new(p).ok()).collect(),
            block_empty_user_agent: spec.block_empty_user_agent,
        }
    }
}

#[async_trait]
impl Filter for UserAgentAccessFilter {
    async fn apply(&self, ctx: RequestContext) -> Result<FilterResult> {
        let ua = ctx.headers.get(axum::http::header::USER_AGENT).and_then(|v| v.to_str().ok());
        match ua {
            None if self.block_empty_user_agent => {
                return Ok(FilterResult::ShortCircuit(
                    Error::Forbidden("user agent header is required".into()).into_response(),
                ));
            }
            Some(ua) => {
                if self.deny.iter().any(|re| re.is_match(ua)) {
                    return Ok(FilterResult::ShortCircuit(
                        Error::Forbidden("user agent is denylisted".into()).into_response(),
                    ));
                }
                if !self.allow.is_empty() && !self.allow.iter().any(|re| re.is_match(ua)) {
                    return Ok(FilterResult::ShortCircuit(
                        Error::Forbidden("user agent is not allowlisted".into()).into_response(),
                    ));
                }
            }
            None => {}
        }
        Ok(FilterResult::Continue(ctx))
    }
    fn phase(&self) -> FilterPhase {
        self.meta().phase
    }
    fn order(&self) -> i32 {
        self.meta().order
    }
    fn id(&self) -> &str {
        &self.meta().id
    }
}

pub struct PathAccessFilter {
    meta: FilterMeta,
    allow: Vec<globset::GlobMatcher>,
    deny: Vec<globset::GlobMatcher>,
}
impl_meta!(PathAccessFilter);

impl PathAccessFilter {
    pub fn new(meta: FilterMeta, spec: crate::config::PathAccessControlConfig) -> Self {
        Self {
            meta,
            allow: spec.allow.iter().filter_map(|p| Glob::new(p).ok()).map(|g| g.compile_matcher()).collect(),
            deny: spec.deny.iter().filter_map(|p| Glob::new(p).ok()).map(|g| g.compile_matcher()).collect(),
        }
    }
}

#[async_trait]
impl Filter for PathAccessFilter {
    async fn apply(&self, ctx: RequestContext) -> Result<FilterResult> {
        let path = ctx.uri.path();
        if self.deny.iter().any(|m| m.is_match(path)) {
            return Ok(FilterResult::ShortCircuit(
                Error::Forbidden("path is denylisted".into()).into_response(),
            ));
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|m| m.is_match(path)) {
            return Ok(FilterResult::ShortCircuit(
                Error::Forbidden("path is not allowlisted".into()).into_response(),
            ));
        }
        Ok(FilterResult::Continue(ctx))
    }
    fn phase(&self) -> FilterPhase {
        self.meta().phase
    }
    fn order(&self) -> i32 {
        self.meta().order
    }
    fn id(&self) -> &str {
        &self.meta().id
    }
}

pub struct DomainAccessFilter {
    meta: FilterMeta,
    allow: Vec<String>,
    deny: Vec<String>,
    allow_subdomains: bool,
}
impl_meta!(DomainAccessFilter);

impl DomainAccessFilter {
    pub fn new(meta: FilterMeta, spec: crate::config::DomainAccessControlConfig) -> Self {
        Self {
            meta,
            allow: spec.allow,
            deny: spec.deny,
            allow_subdomains: spec.allow_subdomains,
        }
    }

    fn matches(&self, list: &[String], host: &str) -> bool {
        list.iter().any(|pattern| {
            if self.allow_subdomains {
                host.eq_ignore_ascii_case(pattern) || host.to_ascii_lowercase().ends_with(&format!(".{}", pattern.to_ascii_lowercase()))
            } else {
                host.eq_ignore_ascii_case(pattern)
            }
        })
    }
}

#[async_trait]
impl Filter for DomainAccessFilter {
    async fn apply(&self, ctx: RequestContext) -> Result<FilterResult> {
        let host = ctx
            .headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if self.matches(&self.deny, host) {
            return Ok(FilterResult::ShortCircuit(
                Error::Forbidden("domain is denylisted".into()).into_response(),
            ));
        }
        if !self.allow.is_empty() && !self.matches(&self.allow, host) {
            return Ok(FilterResult::ShortCircuit(
                Error::Forbidden("domain is not allowlisted".into()).into_response(),
            ));
        }
        Ok(FilterResult::Continue(ctx))
    }
    fn phase(&self) -> FilterPhase {
        self.meta().phase
    }
    fn order(&self) -> i32 {
        self.meta().order
    }
    fn id(&self) -> &str {
        &self.meta().id
    }
}

/// Applies CORS headers per-route, in addition to the gateway-wide
/// `tower_http::cors` layer; short-circuits OPTIONS preflights (§6).
pub struct CorsFilter {
    meta: FilterMeta,
    spec: crate::config::CorsSecurityConfig,
}
impl_meta!(CorsFilter);

impl CorsFilter {
    pub fn new(meta: FilterMeta, spec: crate::config::CorsSecurityConfig) -> Self {
        Self { meta, spec }
    }
}

#[async_trait]
impl Filter for CorsFilter {
    async fn apply(&self, mut ctx: RequestContext) -> Result<FilterResult> {
        let origin = ctx.headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok());
        let origin_allowed = origin
            .map(|o| self.spec.allowed_origins.iter().any(|a| a == "*" || a == o))
            .unwrap_or(false);

        if origin_allowed {
            if let Some(origin) = origin {
                ctx.response_headers.push(("access-control-allow-origin".into(), origin.to_string()));
            }
            if self.spec.allow_credentials {
                ctx.response_headers.push(("access-control-allow-credentials".into(), "true".into()));
            }
            if !self.spec.exposed_headers.is_empty() {
                ctx.response_headers
                    .push(("access-control-expose-headers".into(), self.spec.exposed_headers.join(", ")));
            }
        }

        if ctx.method == axum::http::Method::OPTIONS {
            let mut builder = Response::builder().status(StatusCode::NO_CONTENT);
            if origin_allowed {
                if let Some(origin) = origin {
                    builder = builder.header("access-control-allow-origin", origin);
                }
                builder = builder
                    .header("access-control-allow-methods", self.spec.allowed_methods.join(", "))
                    .header("access-control-allow-headers", self.spec.allowed_headers.join(", "))
                    .header("access-control-max-age", self.spec.max_age_secs.to_string());
            }
            return Ok(FilterResult::ShortCircuit(builder.body(Body::empty())?));
        }

        Ok(FilterResult::Continue(ctx))
    }
    fn phase(&self) -> FilterPhase {
        self.meta().phase
    }
    fn order(&self) -> i32 {
        self.meta().order
    }
    fn id(&self) -> &str {
        &self.meta().id
    }
}

pub fn build_security_filter(meta: FilterMeta, spec: SecurityFilterSpec) -> Option<Arc<dyn Filter>> {
    match spec {
        SecurityFilterSpec::Ip(c) => Some(Arc::new(IpAccessFilter::new(meta, c))),
        SecurityFilterSpec::UserAgent(c) => Some(Arc::new(UserAgentAccessFilter::new(meta, c))),
        SecurityFilterSpec::Path(c) => Some(Arc::new(PathAccessFilter::new(meta, c))),
        SecurityFilterSpec::Domain(c) => Some(Arc::new(DomainAccessFilter::new(meta, c))),
        SecurityFilterSpec::Cors(c) => Some(Arc::new(CorsFilter::new(meta, c))),
    }
}

// -- JWT auth filter -------------------------------------------------------

/// Decoded token claims. The role/permission helper methods carry the
/// same shape as a typical service-to-service JWT, scoped here to
/// gateway tenants rather than application users.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub perms: Vec<String>,
    pub exp: usize,
    #[serde(default)]
    pub iat: Option<usize>,
}

impl Claims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_permission(&self, perm: &str) -> bool {
        self.perms.iter().any(|p| p == perm)
    }
}

pub struct JwtAuthFilter {
    meta: FilterMeta,
    decoding_key: DecodingKey,
    validation: Validation,
    required_roles: Vec<String>,
    required_permissions: Vec<String>,
    header: String,
}
impl_meta!(JwtAuthFilter);

impl JwtAuthFilter {
    pub fn new(meta: FilterMeta, spec: &AuthFilterSpec) -> Result<Self> {
        let algorithm = parse_algorithm(&spec.algorithm)?;
        let key_bytes = std::fs::read(&spec.public_key_path)
            .map_err(|e| Error::InvalidArgument(format!("cannot read JWT key {}: {}", spec.public_key_path, e)))?;

        let decoding_key = match algorithm {
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 | Algorithm::ES256 | Algorithm::ES384 => {
                DecodingKey::from_rsa_pem(&key_bytes)
                    .or_else(|_| DecodingKey::from_ec_pem(&key_bytes))
                    .map_err(Error::from)?
            }
            _ => DecodingKey::from_secret(&key_bytes),
        };

        let mut validation = Validation::new(algorithm);
        if let Some(iss) = &spec.issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(aud) = &spec.audience {
            validation.set_audience(&[aud]);
        }

        Ok(Self {
            meta,
            decoding_key,
            validation,
            required_roles: spec.required_roles.clone(),
            required_permissions: spec.required_permissions.clone(),
            header: spec.header.clone(),
        })
    }
}

fn parse_algorithm(name: &str) -> Result<Algorithm> {
    match name.to_ascii_uppercase().as_str() {
        "RS256" => Ok(Algorithm::RS256),
        "RS384" => Ok(Algorithm::RS384),
        "RS512" => Ok(Algorithm::RS512),
        "ES256" => Ok(Algorithm::ES256),
        "ES384" => Ok(Algorithm::ES384),
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(Error::InvalidArgument(format!("unsupported JWT algorithm: {other}"))),
    }
}

#[async_trait]
impl Filter for JwtAuthFilter {
    async fn apply(&self, mut ctx: RequestContext) -> Result<FilterResult> {
        let Some(header_value) = ctx.headers.get(self.header.as_str()).and_then(|v| v.to_str().ok()) else {
            return Ok(FilterResult::ShortCircuit(
                Error::Unauthorized("missing authorization header".into()).into_response(),
            ));
        };
        let Some(token) = header_value.strip_prefix("Bearer ").or_else(|| header_value.strip_prefix("bearer ")) else {
            return Ok(FilterResult::ShortCircuit(
                Error::Unauthorized("authorization header is not a bearer token".into()).into_response(),
            ));
        };

        let claims = match jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => data.claims,
            Err(e) => return Ok(FilterResult::ShortCircuit(Error::from(e).into_response())),
        };

        if !self.required_roles.is_empty() && !self.required_roles.iter().any(|r| claims.has_role(r)) {
            return Ok(FilterResult::ShortCircuit(
                Error::Forbidden("token missing required role".into()).into_response(),
            ));
        }
        if !self.required_permissions.is_empty()
            && !self.required_permissions.iter().any(|p| claims.has_permission(p))
        {
            return Ok(FilterResult::ShortCircuit(
                Error::Forbidden("token missing required permission".into()).into_response(),
            ));
        }

        ctx.claims = serde_json::to_value(&claims).ok();
        Ok(FilterResult::Continue(ctx))
    }
    fn phase(&self) -> FilterPhase {
        self.meta().phase
    }
    fn order(&self) -> i32 {
        self.meta().order
    }
    fn id(&self) -> &str {
        &self.meta().id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IpAccessControlConfig, PathAccessControlConfig};
    use axum::http::{HeaderMap, Method};

    fn meta() -> FilterMeta {
        FilterMeta {
            id: "f1".into(),
            phase: FilterPhase::PreRouting,
            order: 1,
        }
    }

    fn ctx_with_ip(ip: &str) -> RequestContext {
        let mut ctx = RequestContext::new(Method::GET, "/x".parse().unwrap(), HeaderMap::new(), "t1".into());
        ctx.client_ip = Some(IpAddr::from_str(ip).unwrap());
        ctx
    }

    #[tokio::test]
    async fn ip_deny_short_circuits() {
        let filter = IpAccessFilter::new(
            meta(),
            IpAccessControlConfig {
                allow: vec![],
                deny: vec!["203.0.113.0/24".into()],
                trust_x_forwarded_for: false,
                trust_x_real_ip: false,
            },
        );
        let result = filter.apply(ctx_with_ip("203.0.113.50")).await.unwrap();
        assert!(matches!(result, FilterResult::ShortCircuit(_)));
    }

    #[tokio::test]
    async fn ip_allowlist_rejects_non_member() {
        let filter = IpAccessFilter::new(
            meta(),
            IpAccessControlConfig {
                allow: vec!["10.0.0.0/8".into()],
                deny: vec![],
                trust_x_forwarded_for: false,
                trust_x_real_ip: false,
            },
        );
        let result = filter.apply(ctx_with_ip("8.8.8.8")).await.unwrap();
        assert!(matches!(result, FilterResult::ShortCircuit(_)));

        let result = filter.apply(ctx_with_ip("10.1.2.3")).await.unwrap();
        assert!(matches!(result, FilterResult::Continue(_)));
    }

    #[tokio::test]
    async fn path_glob_denylist_blocks_admin_paths() {
        let filter = PathAccessFilter::new(
            meta(),
            PathAccessControlConfig {
                allow: vec![],
                deny: vec!["/admin/**".into()],
            },
        );
        let mut ctx = RequestContext::new(Method::GET, "/admin/users".parse().unwrap(), HeaderMap::new(), "t1".into());
        ctx.client_ip = None;
        let result = filter.apply(ctx).await.unwrap();
        assert!(matches!(result, FilterResult::ShortCircuit(_)));
    }
}
