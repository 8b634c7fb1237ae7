//! Health Monitor (§4.4): periodically scans registered services and
//! either actively probes their instances (HTTP/TCP) or passively
//! evaluates heartbeat staleness, evicting/demoting instances that no
//! longer pass.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::HealthMonitorConfig;
use crate::ids::{ServiceGroupId, ServiceName, TenantId};
use crate::registry::manager::RegistryManager;
use crate::registry::model::{HealthCheckMode, HealthCheckType, HealthStatus, Service, ServiceInstance};

/// Tracks, per `(tenant, service)`, the wall-clock time of the last probe
/// so a tick can run more often than any individual service's own
/// interval without over-probing it (§4.4: "tick is the minimum of
/// configured check intervals ... probes rate-limited to each service's
/// own interval").
type LastProbeMap = std::sync::Mutex<HashMap<(TenantId, ServiceGroupId, ServiceName), i64>>;

pub struct HealthMonitor {
    manager: Arc<RegistryManager>,
    client: reqwest::Client,
    config: HealthMonitorConfig,
    last_probe: LastProbeMap,
    stopped: Arc<AtomicBool>,
}

impl HealthMonitor {
    pub fn new(manager: Arc<RegistryManager>, config: HealthMonitorConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.probe_timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            manager,
            client,
            config,
            last_probe: std::sync::Mutex::new(HashMap::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Run the monitor loop until `stop()` is called. Intended to be
    /// spawned as a background task from `main`.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.min_tick_ms));
        loop {
            interval.tick().await;
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.tick().await;
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn tick(&self) {
        let services = self.manager.cache().all_services().await;
        let now = crate::registry::model::now_millis();

        let mut due = Vec::new();
        {
            let mut last = self.last_probe.lock().expect("last_probe lock poisoned");
            for svc in &services {
                let key = svc.key();
                let due_at = last.get(&key).copied().unwrap_or(0)
                    + (svc.health_check_interval_secs as i64 * 1_000);
                if now >= due_at {
                    last.insert(key, now);
                    due.push(svc.clone());
                }
            }
        }

        if due.is_empty() {
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.config.worker_pool_size.max(1)));
        let mut joinset: JoinSet<(TenantId, Vec<ServiceInstance>)> = JoinSet::new();

        for svc in due {
            match svc.health_check_mode {
                HealthCheckMode::Active => {
                    let client = self.client.clone();
                    let manager = self.manager.clone();
                    let sem = semaphore.clone();
                    let svc = svc.clone();
                    joinset.spawn(async move {
                        let _permit = sem.acquire_owned().await.ok();
                        probe_active(&client, &manager, &svc).await
                    });
                }
                HealthCheckMode::Passive => {
                    let manager = self.manager.clone();
                    let svc = svc.clone();
                    joinset.spawn(async move { evaluate_passive(&manager, &svc).await });
                }
            }
        }

        let mut evicted_by_tenant: HashMap<TenantId, Vec<ServiceInstance>> = HashMap::new();
        while let Some(joined) = joinset.join_next().await {
            let Ok((tenant_id, evicted)) = joined else {
                tracing::warn!("health monitor worker task panicked");
                continue;
            };
            if !evicted.is_empty() {
                evicted_by_tenant.entry(tenant_id).or_default().extend(evicted);
            }
        }

        for (tenant_id, evicted) in evicted_by_tenant {
            let total = evicted.len();
            if total >= self.config.eviction_alert_threshold.max(1) {
                self.manager.emit_eviction_alert(&tenant_id, evicted, total).await;
            }
        }
    }
}

/// ACTIVE-mode probe: GET/connect against every admissible-or-not
/// instance of `svc`, evaluating each independently. Returns instances
/// this call evicted or demoted.
async fn probe_active(
    client: &reqwest::Client,
    manager: &RegistryManager,
    svc: &Service,
) -> (TenantId, Vec<ServiceInstance>) {
    let instances = manager
        .cache()
        .instances_for(&svc.tenant_id, &svc.group_id, &svc.name)
        .await;
    let mut evicted = Vec::new();
    let now = crate::registry::model::now_millis();

    for inst in instances {
        let healthy = match svc.health_check_type {
            HealthCheckType::Http => probe_http(client, &inst, &svc.health_check_path).await,
            HealthCheckType::Tcp => probe_tcp(&inst).await,
        };

        if healthy {
            if let Err(e) = manager
                .update_instance_health_status(&svc.tenant_id, &inst.id, HealthStatus::Healthy, now)
                .await
            {
                tracing::debug!(instance = %inst.id, error = %e, "health status update skipped, instance gone");
            }
            continue;
        }

        let next = match manager.record_heartbeat_miss(&svc.tenant_id, &inst.id).await {
            Ok(inst) => inst,
            Err(_) => continue,
        };

        if next.heartbeat_fail_count >= svc.failure_threshold {
            if let Some(gone) = evict_or_demote(manager, svc, &next).await {
                evicted.push(gone);
            }
        } else {
            let _ = manager
                .update_instance_health_status(&svc.tenant_id, &inst.id, HealthStatus::Unhealthy, now)
                .await;
        }
    }

    (svc.tenant_id.clone(), evicted)
}

async fn probe_http(client: &reqwest::Client, inst: &ServiceInstance, path: &str) -> bool {
    let url = format!("http://{}{}", inst.addr(), path);
    match client.get(&url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

async fn probe_tcp(inst: &ServiceInstance) -> bool {
    tokio::net::TcpStream::connect(inst.addr()).await.is_ok()
}

/// PASSIVE-mode evaluation: compare each instance's last heartbeat
/// against `heartbeat_timeout_secs`, counting consecutive misses.
async fn evaluate_passive(manager: &RegistryManager, svc: &Service) -> (TenantId, Vec<ServiceInstance>) {
    let instances = manager
        .cache()
        .instances_for(&svc.tenant_id, &svc.group_id, &svc.name)
        .await;
    let mut evicted = Vec::new();
    let now = crate::registry::model::now_millis();
    let timeout_ms = svc.heartbeat_timeout_secs as i64 * 1_000;

    for inst in instances {
        if now - inst.last_heartbeat_time <= timeout_ms {
            continue;
        }

        let next = match manager.record_heartbeat_miss(&svc.tenant_id, &inst.id).await {
            Ok(inst) => inst,
            Err(_) => continue,
        };

        if next.heartbeat_fail_count >= svc.failure_threshold {
            if let Some(gone) = evict_or_demote(manager, svc, &next).await {
                evicted.push(gone);
            }
        } else {
            let _ = manager
                .update_instance_health_status(&svc.tenant_id, &inst.id, HealthStatus::Unhealthy, now)
                .await;
        }
    }

    (svc.tenant_id.clone(), evicted)
}

/// Ephemeral instances are deregistered outright; persistent instances
/// are only marked UNHEALTHY and kept in the registry for later recovery
/// (glossary: "ephemeral instance", §4.2/§4.4).
async fn evict_or_demote(
    manager: &RegistryManager,
    svc: &Service,
    inst: &ServiceInstance,
) -> Option<ServiceInstance> {
    if inst.ephemeral {
        tracing::warn!(tenant = %svc.tenant_id, instance = %inst.id, "evicting ephemeral instance");
        manager.deregister_instance(&svc.tenant_id, &inst.id).await.ok()?;
    } else {
        tracing::warn!(tenant = %svc.tenant_id, instance = %inst.id, "marking persistent instance unhealthy");
        manager
            .update_instance_health_status(
                &svc.tenant_id,
                &inst.id,
                HealthStatus::Unhealthy,
                crate::registry::model::now_millis(),
            )
            .await
            .ok()?;
    }
    Some(inst.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthMonitorConfig;
    use crate::registry::cache::RegistryCache;
    use crate::registry::events::{EventPublisher, PublisherConfig};
    use crate::registry::model::{
        HealthCheckMode, HealthCheckType, InstanceStatus, LoadBalanceStrategy, Protocol, ServiceGroup,
    };

    async fn manager_with(svc: Service, inst: ServiceInstance) -> Arc<RegistryManager> {
        let cache = Arc::new(RegistryCache::new());
        let publisher = Arc::new(EventPublisher::new(PublisherConfig::default()));
        publisher.start().await;
        let manager = Arc::new(RegistryManager::new(cache, publisher));
        manager
            .create_or_update_group(ServiceGroup {
                tenant_id: svc.tenant_id.clone(),
                id: svc.group_id.clone(),
                name: "group".into(),
                default_protocol: Protocol::Http,
                default_lb_strategy: LoadBalanceStrategy::RoundRobin,
                access_control_enabled: false,
                version: 1,
            })
            .await
            .unwrap();
        manager.register_service(svc).await.unwrap();
        manager.register_instance(inst).await.unwrap();
        manager
    }

    fn passive_service(tenant: &str, group: &str, name: &str) -> Service {
        Service {
            tenant_id: tenant.into(),
            group_id: group.into(),
            name: name.into(),
            protocol: Protocol::Http,
            lb_strategy: LoadBalanceStrategy::RoundRobin,
            health_check_type: HealthCheckType::Http,
            health_check_mode: HealthCheckMode::Passive,
            health_check_path: "/health".into(),
            health_check_interval_secs: 0,
            heartbeat_timeout_secs: 5,
            failure_threshold: 1,
            metadata: Default::default(),
        }
    }

    fn ephemeral_instance(tenant: &str, id: &str, group: &str, name: &str, last_heartbeat: i64) -> ServiceInstance {
        ServiceInstance {
            tenant_id: tenant.into(),
            id: id.into(),
            group_id: group.into(),
            service_name: name.into(),
            host: "127.0.0.1".into(),
            port: 9100,
            instance_status: InstanceStatus::Up,
            health_status: HealthStatus::Healthy,
            weight: 1,
            last_heartbeat_time: last_heartbeat,
            last_health_check_time: last_heartbeat,
            heartbeat_fail_count: 0,
            ephemeral: true,
        }
    }

    #[tokio::test]
    async fn passive_eviction_deregisters_stale_ephemeral_instance() {
        let svc = passive_service("t1", "g1", "svc");
        let stale = crate::registry::model::now_millis() - 60_000;
        let inst = ephemeral_instance("t1", "i1", "g1", "svc", stale);
        let manager = manager_with(svc.clone(), inst).await;

        let monitor = HealthMonitor::new(manager.clone(), HealthMonitorConfig::default());
        monitor.tick().await;

        assert!(manager.cache().get_instance(&"t1".into(), &"i1".into()).await.is_none());
    }

    #[tokio::test]
    async fn passive_skips_instances_within_timeout() {
        let svc = passive_service("t1", "g1", "svc");
        let fresh = crate::registry::model::now_millis();
        let inst = ephemeral_instance("t1", "i1", "g1", "svc", fresh);
        let manager = manager_with(svc.clone(), inst).await;

        let monitor = HealthMonitor::new(manager.clone(), HealthMonitorConfig::default());
        monitor.tick().await;

        assert!(manager.cache().get_instance(&"t1".into(), &"i1".into()).await.is_some());
    }
}
