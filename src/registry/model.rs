//! Data model for the service registry (§3): tenants, service groups,
//! services, service instances and their health/lifecycle state machine.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::ConfigScope;
use crate::ids::{ServiceGroupId, ServiceInstanceId, ServiceName, TenantId};

/// Wire-friendly protocol tag for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Grpc,
    Tcp,
}

/// Load-balancing strategy selectable per service (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalanceStrategy {
    RoundRobin,
    WeightedRoundRobin,
    Random,
    LeastConn,
    IpHash,
    ConsistentHash,
    StickySession,
}

/// Health-check mode: whether the health monitor actively probes the
/// instance or relies on heartbeats (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckMode {
    Active,
    Passive,
}

/// Health-check transport for ACTIVE mode probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckType {
    Http,
    Tcp,
}

/// Which instance statuses are admissible for discovery, per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Up,
    Draining,
    Down,
}

impl InstanceStatus {
    /// Default `statusFilter` admissible set (§4.1): `UP` and `STARTING`.
    pub fn admissible_by_default(self) -> bool {
        matches!(self, InstanceStatus::Up | InstanceStatus::Starting)
    }
}

/// Instance health state machine (§4.2 state diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub tenant_id: TenantId,
    pub id: ServiceGroupId,
    pub name: String,
    pub default_protocol: Protocol,
    pub default_lb_strategy: LoadBalanceStrategy,
    /// Per-tenant access-control flag (§3, wired through `DiscoverInstance`'s
    /// `Unauthorized` path, §5).
    pub access_control_enabled: bool,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub tenant_id: TenantId,
    pub group_id: ServiceGroupId,
    pub name: ServiceName,
    pub protocol: Protocol,
    pub lb_strategy: LoadBalanceStrategy,
    pub health_check_type: HealthCheckType,
    pub health_check_mode: HealthCheckMode,
    /// HTTP path probed in ACTIVE mode.
    pub health_check_path: String,
    /// Tick interval for this service's own health checks (§4.4: "tick is
    /// the minimum of configured check intervals ... probes rate-limited
    /// to each service's own interval").
    pub health_check_interval_secs: u64,
    /// Heartbeat staleness threshold for PASSIVE mode.
    pub heartbeat_timeout_secs: u64,
    /// Consecutive failures before a PASSIVE instance is marked UNHEALTHY
    /// / evicted.
    pub failure_threshold: u32,
    pub metadata: std::collections::HashMap<String, String>,
}

impl Service {
    pub fn key(&self) -> (TenantId, ServiceGroupId, ServiceName) {
        (self.tenant_id.clone(), self.group_id.clone(), self.name.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub tenant_id: TenantId,
    pub id: ServiceInstanceId,
    pub group_id: ServiceGroupId,
    pub service_name: ServiceName,
    pub host: String,
    pub port: u16,
    pub instance_status: InstanceStatus,
    pub health_status: HealthStatus,
    /// Relative LB weight, used by `weighted-round-robin`.
    pub weight: u32,
    pub last_heartbeat_time: i64,
    pub last_health_check_time: i64,
    pub heartbeat_fail_count: u32,
    /// Ephemeral instances are deregistered on eviction; persistent ones
    /// are only marked UNHEALTHY (glossary: "ephemeral instance").
    pub ephemeral: bool,
}

impl ServiceInstance {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_admissible(&self) -> bool {
        self.health_status == HealthStatus::Healthy && self.instance_status.admissible_by_default()
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Which filter/rate-limit scope an entity is evaluated at; re-exported
/// here so registry code doesn't need to reach into `config` for the
/// common case of "is this instance- or route-scoped".
pub type Scope = ConfigScope;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admissible_statuses() {
        assert!(InstanceStatus::Up.admissible_by_default());
        assert!(InstanceStatus::Starting.admissible_by_default());
        assert!(!InstanceStatus::Draining.admissible_by_default());
        assert!(!InstanceStatus::Down.admissible_by_default());
    }

    #[test]
    fn instance_is_admissible_requires_both() {
        let mut inst = ServiceInstance {
            tenant_id: "t1".into(),
            id: "i1".into(),
            group_id: "g1".into(),
            service_name: "svc".into(),
            host: "10.0.0.1".into(),
            port: 8080,
            instance_status: InstanceStatus::Up,
            health_status: HealthStatus::Healthy,
            weight: 1,
            last_heartbeat_time: now_millis(),
            last_health_check_time: now_millis(),
            heartbeat_fail_count: 0,
            ephemeral: true,
        };
        assert!(inst.is_admissible());
        inst.health_status = HealthStatus::Unhealthy;
        assert!(!inst.is_admissible());
    }
}
