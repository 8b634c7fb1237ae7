//! Typed filter configuration (§6): `FilterConfig.filter_config` is an
//! opaque JSON blob whose schema depends on `filter_type`. Each blob is
//! parsed once, at load time, into a `FilterKind` so the hot path never
//! touches `serde_json::Value` again.

use serde::{Deserialize, Serialize};

use crate::config::{FilterConfig, FilterType};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct HeaderFilterSpec {
    #[serde(default)]
    pub add: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryParamFilterSpec {
    #[serde(default)]
    pub add: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BodyFilterSpec {
    /// JSON-pointer -> replacement value, applied to a JSON request body.
    #[serde(default)]
    pub set_fields: std::collections::HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub max_body_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripFilterSpec {
    pub prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RewriteFilterSpec {
    pub to: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MethodFilterSpec {
    pub allowed: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CookieFilterSpec {
    #[serde(default)]
    pub add: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseHeaderFilterSpec {
    #[serde(default)]
    pub add: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// Which security sub-kind a `Security`-typed filter implements. §6 folds
/// IP/UA/path/domain/CORS access control under one wire type; the config
/// blob's own `kind` tag disambiguates.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecurityFilterSpec {
    Ip(crate::config::IpAccessControlConfig),
    UserAgent(crate::config::UserAgentAccessControlConfig),
    Path(crate::config::PathAccessControlConfig),
    Domain(crate::config::DomainAccessControlConfig),
    Cors(crate::config::CorsSecurityConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthFilterSpec {
    pub public_key_path: String,
    #[serde(default = "default_jwt_algorithm")]
    pub algorithm: String,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub required_roles: Vec<String>,
    #[serde(default)]
    pub required_permissions: Vec<String>,
    #[serde(default = "default_bearer_header")]
    pub header: String,
}

fn default_jwt_algorithm() -> String {
    "RS256".to_string()
}

fn default_bearer_header() -> String {
    "authorization".to_string()
}

/// Parsed, typed form of a `FilterConfig`'s opaque blob. Unrecognized or
/// malformed `Security`/`Auth` sub-kinds surface as an `Unknown` variant
/// that logs once at load time and is a pass-through `Continue` at
/// runtime, rather than failing the whole chain load.
#[derive(Debug, Clone)]
pub enum FilterKind {
    Header(HeaderFilterSpec),
    QueryParam(QueryParamFilterSpec),
    Body(BodyFilterSpec),
    Strip(StripFilterSpec),
    Rewrite(RewriteFilterSpec),
    Method(MethodFilterSpec),
    Cookie(CookieFilterSpec),
    Response(ResponseHeaderFilterSpec),
    Security(SecurityFilterSpec),
    Auth(AuthFilterSpec),
    Unknown { filter_type: FilterType },
}

impl FilterKind {
    pub fn parse(config: &FilterConfig) -> Result<Self> {
        let blob = &config.filter_config;
        let parsed = match config.filter_type {
            FilterType::Header => serde_json::from_value::<HeaderFilterSpec>(blob.clone()).map(FilterKind::Header),
            FilterType::QueryParam => {
                serde_json::from_value::<QueryParamFilterSpec>(blob.clone()).map(FilterKind::QueryParam)
            }
            FilterType::Body => serde_json::from_value::<BodyFilterSpec>(blob.clone()).map(FilterKind::Body),
            FilterType::Strip => serde_json::from_value::<StripFilterSpec>(blob.clone()).map(FilterKind::Strip),
            FilterType::Rewrite => {
                serde_json::from_value::<RewriteFilterSpec>(blob.clone()).map(FilterKind::Rewrite)
            }
            FilterType::Method => serde_json::from_value::<MethodFilterSpec>(blob.clone()).map(FilterKind::Method),
            FilterType::Cookie => serde_json::from_value::<CookieFilterSpec>(blob.clone()).map(FilterKind::Cookie),
            FilterType::Response => {
                serde_json::from_value::<ResponseHeaderFilterSpec>(blob.clone()).map(FilterKind::Response)
            }
            FilterType::Security => {
                return serde_json::from_value::<SecurityFilterSpec>(blob.clone())
                    .map(FilterKind::Security)
                    .or(Ok(FilterKind::Unknown {
                        filter_type: FilterType::Security,
                    }));
            }
            FilterType::Auth => serde_json::from_value::<AuthFilterSpec>(blob.clone()).map(FilterKind::Auth),
        };

        parsed.map_err(|e| {
            Error::InvalidArgument(format!(
                "failed to parse filter {} ({:?}): {}",
                config.id, config.filter_type, e
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOrderKey {
    pub phase_rank: u8,
    pub order: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterPhase;

    #[test]
    fn header_filter_parses_add_and_remove() {
        let config = FilterConfig {
            tenant_id: "t1".into(),
            id: "f1".into(),
            scope: crate::config::ConfigScope::Route,
            route_config_id: Some("r1".into()),
            filter_type: FilterType::Header,
            action_phase: FilterPhase::PreRouting,
            order: 1,
            filter_config: serde_json::json!({"add": {"x-api-version": "v1"}, "remove": ["x-internal"]}),
            active: true,
        };
        let parsed = FilterKind::parse(&config).unwrap();
        match parsed {
            FilterKind::Header(h) => {
                assert_eq!(h.add.get("x-api-version").unwrap(), "v1");
                assert_eq!(h.remove, vec!["x-internal".to_string()]);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn malformed_security_blob_falls_back_to_unknown() {
        let config = FilterConfig {
            tenant_id: "t1".into(),
            id: "f1".into(),
            scope: crate::config::ConfigScope::Instance,
            route_config_id: None,
            filter_type: FilterType::Security,
            action_phase: FilterPhase::PreRouting,
            order: 1,
            filter_config: serde_json::json!({"kind": "not-a-real-kind"}),
            active: true,
        };
        let parsed = FilterKind::parse(&config).unwrap();
        assert!(matches!(parsed, FilterKind::Unknown { .. }));
    }
}
