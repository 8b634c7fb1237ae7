//! In-memory service registry: data model, sharded cache, event
//! publisher, manager façade and health monitor (§3, §4.1-§4.4).

pub mod cache;
pub mod events;
pub mod health;
pub mod manager;
pub mod model;

pub use cache::RegistryCache;
pub use events::{EventPublisher, EventSink, EventSnapshot, NoopSink, PublisherConfig, ServiceEvent, ServiceEventType};
pub use health::HealthMonitor;
pub use manager::RegistryManager;
pub use model::{
    HealthCheckMode, HealthCheckType, HealthStatus, InstanceStatus, LoadBalanceStrategy, Protocol,
    Service, ServiceGroup, ServiceInstance,
};
