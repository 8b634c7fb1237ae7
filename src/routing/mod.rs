//! Route Matcher (§4.5): resolves inbound requests to routing rules.

pub mod matcher;

pub use matcher::{MatchedRoute, RouteMatcher};
