//! Proxy Dispatcher (§4.8): HTTP forwarding with retry/fanout, plus the
//! WebSocket upgrade pass-through for routes that need it.

pub mod dispatcher;
pub mod websocket;

pub use dispatcher::{is_idempotent, pick_merge_response, proxy_config_from, ProxyDispatcher, UpstreamResponse};
pub use websocket::bridge as bridge_websocket;
