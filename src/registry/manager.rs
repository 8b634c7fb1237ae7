//! Registry Manager (§4.2): the sole public façade for mutating registry
//! state. Every write path validates inputs, diffs against the prior
//! snapshot, writes the cache, publishes a `ServiceEvent`, and logs
//! structurally. Reads never publish events.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ids::{EventId, ServiceGroupId, ServiceInstanceId, ServiceName, TenantId};
use crate::registry::cache::RegistryCache;
use crate::registry::events::{
    EventPublisher, EventSnapshot, ServiceEvent, ServiceEventType,
};
use crate::registry::model::{
    now_millis, HealthStatus, Service, ServiceGroup, ServiceInstance,
};

/// Façade coordinating the cache and event publisher; the single entry
/// point for register/deregister/heartbeat/discover operations (§4.2).
pub struct RegistryManager {
    cache: Arc<RegistryCache>,
    publisher: Arc<EventPublisher>,
}

impl RegistryManager {
    pub fn new(cache: Arc<RegistryCache>, publisher: Arc<EventPublisher>) -> Self {
        Self { cache, publisher }
    }

    pub fn cache(&self) -> &Arc<RegistryCache> {
        &self.cache
    }

    async fn publish(&self, event: ServiceEvent) {
        if let Err(e) = self.publisher.publish(event).await {
            // §4.2: "Event publish failures are logged at WARN and
            // swallowed -- the cache write still stands."
            tracing::warn!(error = %e, "failed to publish registry event");
        }
    }

    // -- Service groups ---------------------------------------------------

    pub async fn create_or_update_group(&self, group: ServiceGroup) -> Result<()> {
        if group.name.trim().is_empty() {
            return Err(Error::InvalidArgument("service group name is required".into()));
        }
        let existed = self
            .cache
            .get_group(&group.tenant_id, &group.id)
            .await
            .is_some();
        let tenant_id = group.tenant_id.clone();
        let group_id = group.id.clone();
        self.cache.set_group(group.clone()).await;

        let event_type = if existed {
            ServiceEventType::ServiceGroupUpdated
        } else {
            ServiceEventType::ServiceGroupCreated
        };
        tracing::info!(tenant = %tenant_id, group = %group_id, event = ?event_type, "service group mutation");
        self.publish(ServiceEvent {
            id: EventId::new(),
            event_type,
            tenant_id,
            group_id: Some(group_id),
            service_instance_id: None,
            snapshot: EventSnapshot::Group(group),
            old_health_status: None,
            new_health_status: None,
            heartbeat_fail_count: None,
            source: "registry-manager".into(),
            timestamp: now_millis(),
            event_data: serde_json::json!({}),
        })
        .await;
        Ok(())
    }

    pub async fn delete_group(&self, tenant_id: &TenantId, id: &ServiceGroupId) -> Result<()> {
        let removed = self.cache.delete_group(tenant_id, id).await?;
        if removed {
            tracing::info!(tenant = %tenant_id, group = %id, "service group deleted");
            self.publish(ServiceEvent {
                id: EventId::new(),
                event_type: ServiceEventType::ServiceGroupDeleted,
                tenant_id: tenant_id.clone(),
                group_id: Some(id.clone()),
                service_instance_id: None,
                snapshot: EventSnapshot::Group(ServiceGroup {
                    tenant_id: tenant_id.clone(),
                    id: id.clone(),
                    name: String::new(),
                    default_protocol: crate::registry::model::Protocol::Http,
                    default_lb_strategy: crate::registry::model::LoadBalanceStrategy::RoundRobin,
                    access_control_enabled: false,
                    version: 0,
                }),
                old_health_status: None,
                new_health_status: None,
                heartbeat_fail_count: None,
                source: "registry-manager".into(),
                timestamp: now_millis(),
                event_data: serde_json::json!({"deleted": true}),
            })
            .await;
        }
        Ok(())
    }

    // -- Services ---------------------------------------------------------

    /// Upsert a service. Fails with `InvalidArgument` on empty required
    /// fields (§4.2).
    pub async fn register_service(&self, service: Service) -> Result<()> {
        if service.name.as_str().trim().is_empty() {
            return Err(Error::InvalidArgument("service name is required".into()));
        }
        let prior = self
            .cache
            .get_service(&service.tenant_id, &service.group_id, &service.name)
            .await;
        let tenant_id = service.tenant_id.clone();
        let group_id = service.group_id.clone();
        self.cache.set_service(service.clone()).await?;

        let event_type = if prior.is_some() {
            ServiceEventType::ServiceUpdated
        } else {
            ServiceEventType::ServiceRegistered
        };
        tracing::info!(tenant = %tenant_id, group = %group_id, service = %service.name, event = ?event_type, "service mutation");
        self.publish(ServiceEvent {
            id: EventId::new(),
            event_type,
            tenant_id,
            group_id: Some(group_id),
            service_instance_id: None,
            snapshot: EventSnapshot::Service(service),
            old_health_status: None,
            new_health_status: None,
            heartbeat_fail_count: None,
            source: "registry-manager".into(),
            timestamp: now_millis(),
            event_data: serde_json::json!({}),
        })
        .await;
        Ok(())
    }

    /// Idempotent: deleting a missing service returns success with no event.
    pub async fn deregister_service(
        &self,
        tenant_id: &TenantId,
        group_id: &ServiceGroupId,
        name: &ServiceName,
    ) -> Result<()> {
        let removed = self.cache.delete_service(tenant_id, group_id, name).await;
        if removed {
            tracing::info!(tenant = %tenant_id, group = %group_id, service = %name, "service deregistered");
            self.publish(ServiceEvent {
                id: EventId::new(),
                event_type: ServiceEventType::ServiceDeregistered,
                tenant_id: tenant_id.clone(),
                group_id: Some(group_id.clone()),
                service_instance_id: None,
                snapshot: EventSnapshot::Service(Service {
                    tenant_id: tenant_id.clone(),
                    group_id: group_id.clone(),
                    name: name.clone(),
                    protocol: crate::registry::model::Protocol::Http,
                    lb_strategy: crate::registry::model::LoadBalanceStrategy::RoundRobin,
                    health_check_type: crate::registry::model::HealthCheckType::Http,
                    health_check_mode: crate::registry::model::HealthCheckMode::Passive,
                    health_check_path: String::new(),
                    health_check_interval_secs: 0,
                    heartbeat_timeout_secs: 0,
                    failure_threshold: 0,
                    metadata: Default::default(),
                }),
                old_health_status: None,
                new_health_status: None,
                heartbeat_fail_count: None,
                source: "registry-manager".into(),
                timestamp: now_millis(),
                event_data: serde_json::json!({"deleted": true}),
            })
            .await;
        }
        Ok(())
    }

    pub async fn list_services(
        &self,
        tenant_id: &TenantId,
        group_id: &ServiceGroupId,
    ) -> Vec<Service> {
        self.cache.list_services(tenant_id, group_id).await
    }

    // -- Instances ---------------------------------------------------------

    /// Upsert an instance. Always emits `InstanceRegistered`, even on
    /// renewal of an existing id -- preserved verbatim per the source's
    /// observed (possibly unintentional) behaviour; see DESIGN.md.
    pub async fn register_instance(&self, instance: ServiceInstance) -> Result<()> {
        if instance.host.trim().is_empty() || instance.port == 0 {
            return Err(Error::InvalidArgument(
                "instance host and port are required".into(),
            ));
        }
        let tenant_id = instance.tenant_id.clone();
        let id = instance.id.clone();
        self.cache.set_instance(instance.clone()).await?;

        tracing::info!(tenant = %tenant_id, instance = %id, addr = %instance.addr(), "instance registered");
        self.publish(ServiceEvent {
            id: EventId::new(),
            event_type: ServiceEventType::InstanceRegistered,
            tenant_id,
            group_id: Some(instance.group_id.clone()),
            service_instance_id: Some(id),
            heartbeat_fail_count: Some(instance.heartbeat_fail_count),
            snapshot: EventSnapshot::Instance(instance),
            old_health_status: None,
            new_health_status: None,
            source: "registry-manager".into(),
            timestamp: now_millis(),
            event_data: serde_json::json!({}),
        })
        .await;
        Ok(())
    }

    /// Idempotent: deregistering a missing instance returns success with
    /// no event.
    pub async fn deregister_instance(
        &self,
        tenant_id: &TenantId,
        id: &ServiceInstanceId,
    ) -> Result<()> {
        let Some(prior) = self.cache.get_instance(tenant_id, id).await else {
            return Ok(());
        };
        self.cache.delete_instance(tenant_id, id).await;
        tracing::info!(tenant = %tenant_id, instance = %id, "instance deregistered");
        self.publish(ServiceEvent {
            id: EventId::new(),
            event_type: ServiceEventType::InstanceDeregistered,
            tenant_id: tenant_id.clone(),
            group_id: Some(prior.group_id.clone()),
            service_instance_id: Some(id.clone()),
            heartbeat_fail_count: Some(prior.heartbeat_fail_count),
            snapshot: EventSnapshot::Instance(prior),
            old_health_status: None,
            new_health_status: None,
            source: "registry-manager".into(),
            timestamp: now_millis(),
            event_data: serde_json::json!({"deleted": true}),
        })
        .await;
        Ok(())
    }

    /// Atomically resets `heartbeatFailCount` to 0 and transitions
    /// `healthStatus` to `HEALTHY` (§3 I3, §4.2).
    pub async fn update_instance_heartbeat(
        &self,
        tenant_id: &TenantId,
        id: &ServiceInstanceId,
    ) -> Result<()> {
        let now = now_millis();
        let Some((before, after)) = self
            .cache
            .update_instance(tenant_id, id, |inst| {
                inst.last_heartbeat_time = now;
                inst.last_health_check_time = now;
                inst.health_status = HealthStatus::Healthy;
                inst.heartbeat_fail_count = 0;
            })
            .await
        else {
            return Err(Error::NotFound(format!("instance {} not found", id)));
        };

        self.publish(ServiceEvent {
            id: EventId::new(),
            event_type: ServiceEventType::InstanceHeartbeatUpdated,
            tenant_id: tenant_id.clone(),
            group_id: Some(after.group_id.clone()),
            service_instance_id: Some(id.clone()),
            heartbeat_fail_count: Some(after.heartbeat_fail_count),
            old_health_status: Some(before.health_status),
            new_health_status: Some(after.health_status),
            snapshot: EventSnapshot::Instance(after),
            source: "registry-manager".into(),
            timestamp: now_millis(),
            event_data: serde_json::json!({}),
        })
        .await;
        Ok(())
    }

    /// Emits `InstanceHealthChange` only when the status actually changed;
    /// a `check-only` event otherwise (for audit) -- §4.2.
    pub async fn update_instance_health_status(
        &self,
        tenant_id: &TenantId,
        id: &ServiceInstanceId,
        status: HealthStatus,
        check_time: i64,
    ) -> Result<bool> {
        let Some((before, after)) = self
            .cache
            .update_instance(tenant_id, id, |inst| {
                inst.last_health_check_time = check_time;
                inst.health_status = status;
            })
            .await
        else {
            return Err(Error::NotFound(format!("instance {} not found", id)));
        };

        let changed = before.health_status != after.health_status;
        self.publish(ServiceEvent {
            id: EventId::new(),
            event_type: ServiceEventType::InstanceHealthChange,
            tenant_id: tenant_id.clone(),
            group_id: Some(after.group_id.clone()),
            service_instance_id: Some(id.clone()),
            heartbeat_fail_count: Some(after.heartbeat_fail_count),
            old_health_status: Some(before.health_status),
            new_health_status: Some(after.health_status),
            snapshot: EventSnapshot::Instance(after),
            source: "health-monitor".into(),
            timestamp: now_millis(),
            event_data: serde_json::json!({"check_only": !changed}),
        })
        .await;
        Ok(changed)
    }

    /// Increment `heartbeatFailCount` without otherwise touching status,
    /// used by the Health Monitor's PASSIVE-mode evaluation (§4.4).
    pub async fn record_heartbeat_miss(
        &self,
        tenant_id: &TenantId,
        id: &ServiceInstanceId,
    ) -> Result<ServiceInstance> {
        let Some((_, after)) = self
            .cache
            .update_instance(tenant_id, id, |inst| {
                inst.heartbeat_fail_count += 1;
            })
            .await
        else {
            return Err(Error::NotFound(format!("instance {} not found", id)));
        };
        Ok(after)
    }

    /// Emit a bulk eviction alert for a single health-monitor tick. Caps
    /// the enumerated instance list at 10 (§5) while still carrying the
    /// true `total_evicted` count.
    pub async fn emit_eviction_alert(
        &self,
        tenant_id: &TenantId,
        instances: Vec<ServiceInstance>,
        total_evicted: usize,
    ) {
        const MAX_ENUMERATED: usize = 10;
        let enumerated: Vec<ServiceInstance> = instances.into_iter().take(MAX_ENUMERATED).collect();
        tracing::warn!(
            tenant = %tenant_id,
            total_evicted,
            enumerated = enumerated.len(),
            "bulk instance eviction"
        );
        self.publish(ServiceEvent {
            id: EventId::new(),
            event_type: ServiceEventType::NodeEvictionAlert,
            tenant_id: tenant_id.clone(),
            group_id: None,
            service_instance_id: None,
            snapshot: EventSnapshot::Eviction {
                instances: enumerated,
                total_evicted,
            },
            old_health_status: None,
            new_health_status: None,
            heartbeat_fail_count: None,
            source: "health-monitor".into(),
            timestamp: now_millis(),
            event_data: serde_json::json!({"total_evicted": total_evicted}),
        })
        .await;
    }

    /// Read-only delegation to the cache (§4.2, logged at DEBUG).
    /// `client_key` feeds `ip-hash` / `consistent-hash` / `sticky-session`.
    /// `claims` is the caller's authenticated grant (set by the auth
    /// filter upstream from a validated bearer token); a group with
    /// `access_control_enabled` denies discovery to a caller with no
    /// grant at all (§4.1, `Unauthorized`).
    pub async fn discover_instance(
        &self,
        tenant_id: &TenantId,
        group_id: &ServiceGroupId,
        service_name: &ServiceName,
        client_key: Option<&str>,
        claims: Option<&serde_json::Value>,
    ) -> Result<ServiceInstance> {
        if let Some(group) = self.cache.get_group(tenant_id, group_id).await {
            if group.access_control_enabled && claims.is_none() {
                tracing::debug!(tenant = %tenant_id, group = %group_id, "denied: access-controlled group, no caller grant");
                return Err(Error::Unauthorized(format!(
                    "group {group_id} requires an authenticated grant"
                )));
            }
        }
        tracing::debug!(tenant = %tenant_id, group = %group_id, service = %service_name, "discover instance");
        self.cache
            .discover_instance(tenant_id, group_id, service_name, client_key)
            .await
    }
}

/// Helper used by handlers/tests to build a manager with fresh cache and
/// an already-started publisher.
pub async fn new_default() -> RegistryManager {
    let cache = Arc::new(RegistryCache::new());
    let publisher = Arc::new(EventPublisher::new(Default::default()));
    publisher.start().await;
    RegistryManager::new(cache, publisher)
}

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::{
        HealthCheckMode, HealthCheckType, InstanceStatus, LoadBalanceStrategy, Protocol,
    };

    fn group(tenant: &str, id: &str) -> ServiceGroup {
        ServiceGroup {
            tenant_id: tenant.into(),
            id: id.into(),
            name: "group".into(),
            default_protocol: Protocol::Http,
            default_lb_strategy: LoadBalanceStrategy::RoundRobin,
            access_control_enabled: false,
            version: 1,
        }
    }

    fn service(tenant: &str, group_id: &str, name: &str) -> Service {
        Service {
            tenant_id: tenant.into(),
            group_id: group_id.into(),
            name: name.into(),
            protocol: Protocol::Http,
            lb_strategy: LoadBalanceStrategy::RoundRobin,
            health_check_type: HealthCheckType::Http,
            health_check_mode: HealthCheckMode::Passive,
            health_check_path: "/health".into(),
            health_check_interval_secs: 10,
            heartbeat_timeout_secs: 10,
            failure_threshold: 3,
            metadata: Default::default(),
        }
    }

    fn instance(tenant: &str, id: &str, group_id: &str, name: &str) -> ServiceInstance {
        ServiceInstance {
            tenant_id: tenant.into(),
            id: id.into(),
            group_id: group_id.into(),
            service_name: name.into(),
            host: "127.0.0.1".into(),
            port: 9000,
            instance_status: InstanceStatus::Up,
            health_status: HealthStatus::Unknown,
            weight: 1,
            last_heartbeat_time: 0,
            last_health_check_time: 0,
            heartbeat_fail_count: 0,
            ephemeral: true,
        }
    }

    #[tokio::test]
    async fn register_then_deregister_then_get_not_found() {
        let manager = new_default().await;
        manager.create_or_update_group(group("t1", "g1")).await.unwrap();
        manager.register_service(service("t1", "g1", "svc")).await.unwrap();
        manager.register_instance(instance("t1", "i1", "g1", "svc")).await.unwrap();

        manager
            .deregister_instance(&"t1".into(), &"i1".into())
            .await
            .unwrap();

        assert!(manager
            .cache
            .get_instance(&"t1".into(), &"i1".into())
            .await
            .is_none());
    }

    #[tokio::test]
    async fn heartbeat_resets_fail_count_and_marks_healthy() {
        let manager = new_default().await;
        manager.create_or_update_group(group("t1", "g1")).await.unwrap();
        manager.register_service(service("t1", "g1", "svc")).await.unwrap();
        let mut inst = instance("t1", "i1", "g1", "svc");
        inst.heartbeat_fail_count = 2;
        inst.health_status = HealthStatus::Unhealthy;
        manager.register_instance(inst).await.unwrap();

        manager
            .update_instance_heartbeat(&"t1".into(), &"i1".into())
            .await
            .unwrap();

        let after = manager
            .cache
            .get_instance(&"t1".into(), &"i1".into())
            .await
            .unwrap();
        assert_eq!(after.heartbeat_fail_count, 0);
        assert_eq!(after.health_status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn deregister_missing_instance_is_noop_success() {
        let manager = new_default().await;
        assert!(manager
            .deregister_instance(&"t1".into(), &"missing".into())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn register_service_rejects_empty_name() {
        let manager = new_default().await;
        manager.create_or_update_group(group("t1", "g1")).await.unwrap();
        let mut svc = service("t1", "g1", "svc");
        svc.name = "".into();
        let err = manager.register_service(svc).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn discover_denies_access_controlled_group_without_claims() {
        let manager = new_default().await;
        let mut g = group("t1", "g1");
        g.access_control_enabled = true;
        manager.create_or_update_group(g).await.unwrap();
        manager.register_service(service("t1", "g1", "svc")).await.unwrap();
        let mut inst = instance("t1", "i1", "g1", "svc");
        inst.health_status = HealthStatus::Healthy;
        manager.register_instance(inst).await.unwrap();

        let err = manager
            .discover_instance(&"t1".into(), &"g1".into(), &"svc".into(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn discover_admits_access_controlled_group_with_claims() {
        let manager = new_default().await;
        let mut g = group("t1", "g1");
        g.access_control_enabled = true;
        manager.create_or_update_group(g).await.unwrap();
        manager.register_service(service("t1", "g1", "svc")).await.unwrap();
        let mut inst = instance("t1", "i1", "g1", "svc");
        inst.health_status = HealthStatus::Healthy;
        manager.register_instance(inst).await.unwrap();

        let claims = serde_json::json!({"sub": "user-1"});
        let found = manager
            .discover_instance(&"t1".into(), &"g1".into(), &"svc".into(), None, Some(&claims))
            .await
            .unwrap();
        assert_eq!(found.id, ServiceInstanceId::from("i1"));
    }
}
