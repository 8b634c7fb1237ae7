//! # gateway-core
//!
//! Multi-tenant API gateway data plane: route matching, filter chain
//! execution, proxy dispatch, service registry coordination (cache, event
//! publisher, health monitor, manager) and rate limiting.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gateway_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let state = AppState::new(config.clone()).await?;
//!     state.rate_limiter().clone().start_sweeper().await;
//!     tokio::spawn(state.health_monitor().clone().run());
//!
//!     let app = Router::new();
//!
//!     Server::new(config).serve(app).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod filters;
pub mod gateway;
pub mod ids;
pub mod middleware;
pub mod observability;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
pub mod routing;
pub mod server;
pub mod state;
pub mod tls;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};

    pub use crate::ids::{
        EventId, FilterConfigId, GatewayInstanceId, RateLimitConfigId, RequestId, RouteConfigId,
        ServiceGroupId, ServiceInstanceId, ServiceName, TenantId,
    };

    pub use crate::middleware::{
        apply_security_headers, request_id_layer, request_id_propagation_layer,
        sensitive_headers_layer, RequestTrackingConfig, PROPAGATE_HEADERS, SENSITIVE_HEADERS,
    };

    pub use crate::filters::{build_chain, build_filter, Filter, FilterChain, FilterResult, RequestContext};

    pub use crate::gateway::handle as gateway_handle;

    pub use crate::proxy::{bridge_websocket, pick_merge_response, ProxyDispatcher, UpstreamResponse};

    pub use crate::ratelimit::{derive_key, AdmissionResult, RateLimiter};

    pub use crate::registry::{
        EventPublisher, EventSink, EventSnapshot, HealthMonitor, LoadBalanceStrategy,
        RegistryCache, RegistryManager, Service, ServiceEvent, ServiceEventType, ServiceGroup,
        ServiceInstance,
    };

    pub use crate::routing::{MatchedRoute, RouteMatcher};

    pub use crate::server::Server;
    pub use crate::state::AppState;

    pub use crate::observability::init_tracing;

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Router,
    };

    pub use serde::{Deserialize, Serialize};

    pub use tracing::{debug, error, info, instrument, trace, warn, Level, Span};

    pub use tokio;

    pub use async_trait::async_trait;

    pub use thiserror::Error as ThisError;
    pub use anyhow::{self, Context as AnyhowContext};
}
