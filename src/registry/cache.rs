//! Registry Cache (§4.1): the authoritative in-memory view of
//! groups/services/instances per tenant, plus derived indices and
//! load-balancing cursor state.
//!
//! Sharded locking keyed by a `blake3` hash of `tenantId` (N = 64 shards,
//! an Open Question settled in `DESIGN.md`) avoids a global mutex: writes
//! take the write half of the tenant's shard lock, reads take the read
//! half. LB cursor state lives alongside the per-service entry using
//! atomics/interior mutability so `discover_instance` only needs the
//! shard's read lock, never its write lock.

use std::collections::HashMap;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::ids::{ServiceGroupId, ServiceInstanceId, ServiceName, TenantId};
use crate::registry::model::{LoadBalanceStrategy, Service, ServiceGroup, ServiceInstance};

const SHARD_COUNT: usize = 64;

type ServiceKey = (ServiceGroupId, ServiceName);

/// Per-service load-balancing cursor state. Kept alongside the service
/// entry in the shard so `discover_instance` can mutate it without
/// upgrading the shard's read lock to a write lock.
#[derive(Default)]
pub struct LbState {
    round_robin: AtomicU64,
    /// Smooth weighted round robin "current weight" per instance.
    weighted_current: DashMap<ServiceInstanceId, i64>,
    /// 160-point virtual-node ring for `consistent-hash`, rebuilt whenever
    /// membership changes (invalidated by clearing it on write).
    ring: std::sync::RwLock<Option<ConsistentHashRing>>,
    /// Session-id -> instance binding for `sticky-session`.
    sticky: DashMap<String, ServiceInstanceId>,
}

const VIRTUAL_NODES_PER_INSTANCE: usize = 160;

struct ConsistentHashRing {
    /// Sorted (hash, instance_index) pairs.
    points: Vec<(u32, usize)>,
}

impl ConsistentHashRing {
    fn build(instance_ids: &[ServiceInstanceId]) -> Self {
        let mut points = Vec::with_capacity(instance_ids.len() * VIRTUAL_NODES_PER_INSTANCE);
        for (idx, id) in instance_ids.iter().enumerate() {
            for v in 0..VIRTUAL_NODES_PER_INSTANCE {
                let key = format!("{}#{}", id.as_str(), v);
                points.push((hash32(key.as_bytes()), idx));
            }
        }
        points.sort_by_key(|(h, _)| *h);
        Self { points }
    }

    fn pick(&self, key: &[u8]) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let h = hash32(key);
        let pos = self
            .points
            .partition_point(|(point_hash, _)| *point_hash < h);
        let pos = if pos == self.points.len() { 0 } else { pos };
        Some(self.points[pos].1)
    }
}

fn hash32(bytes: &[u8]) -> u32 {
    let hash = blake3::hash(bytes);
    let b = hash.as_bytes();
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn shard_index(tenant_id: &TenantId) -> usize {
    (hash32(tenant_id.as_str().as_bytes()) as usize) % SHARD_COUNT
}

#[derive(Default)]
struct ShardState {
    groups: HashMap<ServiceGroupId, ServiceGroup>,
    services: HashMap<ServiceKey, Service>,
    instances: HashMap<ServiceInstanceId, ServiceInstance>,
    instances_by_service: HashMap<ServiceKey, Vec<ServiceInstanceId>>,
    instances_by_addr: HashMap<(String, u16), ServiceInstanceId>,
    lb_state: HashMap<ServiceKey, Arc<LbState>>,
}

pub struct RegistryCache {
    shards: Vec<RwLock<ShardState>>,
}

impl Default for RegistryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryCache {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        shards.resize_with(SHARD_COUNT, || RwLock::new(ShardState::default()));
        Self { shards }
    }

    fn shard(&self, tenant_id: &TenantId) -> &RwLock<ShardState> {
        &self.shards[shard_index(tenant_id)]
    }

    // -- Groups ---------------------------------------------------------

    pub async fn set_group(&self, group: ServiceGroup) {
        let mut shard = self.shard(&group.tenant_id).write().await;
        shard.groups.insert(group.id.clone(), group);
    }

    pub async fn get_group(&self, tenant_id: &TenantId, id: &ServiceGroupId) -> Option<ServiceGroup> {
        self.shard(tenant_id).read().await.groups.get(id).cloned()
    }

    /// Delete a group. Fails per I2 if services remain.
    pub async fn delete_group(&self, tenant_id: &TenantId, id: &ServiceGroupId) -> Result<bool> {
        let mut shard = self.shard(tenant_id).write().await;
        let has_services = shard
            .services
            .keys()
            .any(|(group_id, _)| group_id == id);
        if has_services {
            return Err(Error::Conflict(format!(
                "cannot delete group {} with services still registered",
                id
            )));
        }
        Ok(shard.groups.remove(id).is_some())
    }

    // -- Services ---------------------------------------------------------

    pub async fn set_service(&self, service: Service) -> Result<()> {
        let mut shard = self.shard(&service.tenant_id).write().await;
        if !shard.groups.contains_key(&service.group_id) {
            return Err(Error::NotFound(format!(
                "service group {} not found",
                service.group_id
            )));
        }
        let key = (service.group_id.clone(), service.name.clone());
        shard.services.insert(key, service);
        Ok(())
    }

    pub async fn get_service(
        &self,
        tenant_id: &TenantId,
        group_id: &ServiceGroupId,
        name: &ServiceName,
    ) -> Option<Service> {
        let key = (group_id.clone(), name.clone());
        self.shard(tenant_id).read().await.services.get(&key).cloned()
    }

    pub async fn delete_service(
        &self,
        tenant_id: &TenantId,
        group_id: &ServiceGroupId,
        name: &ServiceName,
    ) -> bool {
        let key = (group_id.clone(), name.clone());
        let mut shard = self.shard(tenant_id).write().await;
        let removed = shard.services.remove(&key).is_some();
        if removed {
            if let Some(ids) = shard.instances_by_service.remove(&key) {
                for id in ids {
                    if let Some(inst) = shard.instances.remove(&id) {
                        shard.instances_by_addr.remove(&(inst.host, inst.port));
                    }
                }
            }
            shard.lb_state.remove(&key);
        }
        removed
    }

    pub async fn list_services(
        &self,
        tenant_id: &TenantId,
        group_id: &ServiceGroupId,
    ) -> Vec<Service> {
        self.shard(tenant_id)
            .read()
            .await
            .services
            .iter()
            .filter(|((g, _), _)| g == group_id)
            .map(|(_, s)| s.clone())
            .collect()
    }

    // -- Instances ---------------------------------------------------------

    pub async fn set_instance(&self, instance: ServiceInstance) -> Result<()> {
        let mut shard = self.shard(&instance.tenant_id).write().await;
        let service_key = (instance.group_id.clone(), instance.service_name.clone());
        if !shard.services.contains_key(&service_key) {
            return Err(Error::NotFound(format!(
                "service {}/{} not found",
                instance.group_id, instance.service_name
            )));
        }
        let addr = (instance.host.clone(), instance.port);
        let is_new = !shard.instances.contains_key(&instance.id);
        shard.instances_by_addr.insert(addr, instance.id.clone());
        if is_new {
            shard
                .instances_by_service
                .entry(service_key.clone())
                .or_default()
                .push(instance.id.clone());
        }
        shard.instances.insert(instance.id.clone(), instance);
        invalidate_ring(&mut shard, &service_key);
        Ok(())
    }

    pub async fn get_instance(
        &self,
        tenant_id: &TenantId,
        id: &ServiceInstanceId,
    ) -> Option<ServiceInstance> {
        self.shard(tenant_id).read().await.instances.get(id).cloned()
    }

    pub async fn delete_instance(&self, tenant_id: &TenantId, id: &ServiceInstanceId) -> bool {
        let mut shard = self.shard(tenant_id).write().await;
        let Some(inst) = shard.instances.remove(id) else {
            return false;
        };
        shard.instances_by_addr.remove(&(inst.host, inst.port));
        let service_key = (inst.group_id.clone(), inst.service_name.clone());
        if let Some(ids) = shard.instances_by_service.get_mut(&service_key) {
            ids.retain(|x| x != id);
        }
        invalidate_ring(&mut shard, &service_key);
        true
    }

    pub async fn list_instances(
        &self,
        tenant_id: &TenantId,
        group_id: &ServiceGroupId,
        name: &ServiceName,
    ) -> Vec<ServiceInstance> {
        let shard = self.shard(tenant_id).read().await;
        let key = (group_id.clone(), name.clone());
        shard
            .instances_by_service
            .get(&key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| shard.instances.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Update a single instance in place via a mutator closure, returning
    /// the pre- and post-mutation snapshots. Used by the Registry Manager
    /// to build event payloads from a single shard acquisition.
    pub async fn update_instance<F>(
        &self,
        tenant_id: &TenantId,
        id: &ServiceInstanceId,
        mutate: F,
    ) -> Option<(ServiceInstance, ServiceInstance)>
    where
        F: FnOnce(&mut ServiceInstance),
    {
        let mut shard = self.shard(tenant_id).write().await;
        let before = shard.instances.get(id)?.clone();
        let inst = shard.instances.get_mut(id)?;
        mutate(inst);
        let after = inst.clone();
        Some((before, after))
    }

    // -- Bulk enumeration, used by the health monitor's scan tick ----------

    /// Snapshot every service currently registered, across all tenants.
    /// Used by the health monitor to build its per-tick scan list; not on
    /// any per-request hot path.
    pub async fn all_services(&self) -> Vec<Service> {
        let mut out = Vec::new();
        for shard in &self.shards {
            out.extend(shard.read().await.services.values().cloned());
        }
        out
    }

    /// Snapshot every instance belonging to `(tenant, group, name)`.
    pub async fn instances_for(
        &self,
        tenant_id: &TenantId,
        group_id: &ServiceGroupId,
        name: &ServiceName,
    ) -> Vec<ServiceInstance> {
        self.list_instances(tenant_id, group_id, name).await
    }

    // -- Discovery / load balancing ---------------------------------------

    /// Select one admissible instance for `(group, name)` using the
    /// service's configured LB strategy (§4.1). `client_key` is the
    /// caller-derived key used by `ip-hash`, `consistent-hash` and
    /// `sticky-session`.
    pub async fn discover_instance(
        &self,
        tenant_id: &TenantId,
        group_id: &ServiceGroupId,
        name: &ServiceName,
        client_key: Option<&str>,
    ) -> Result<ServiceInstance> {
        let shard = self.shard(tenant_id).read().await;
        let service_key = (group_id.clone(), name.clone());
        let Some(service) = shard.services.get(&service_key) else {
            return Err(Error::NotFound(format!("service {}/{} not found", group_id, name)));
        };
        let strategy = service.lb_strategy;

        let candidate_ids: Vec<ServiceInstanceId> = shard
            .instances_by_service
            .get(&service_key)
            .map(|ids| {
                ids.iter()
                    .filter(|id| {
                        shard
                            .instances
                            .get(*id)
                            .map(|i| i.is_admissible())
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if candidate_ids.is_empty() {
            return Err(Error::NoHealthyInstance(format!("{}/{}", group_id, name)));
        }

        let lb_state = shard
            .lb_state
            .get(&service_key)
            .cloned()
            .unwrap_or_default();

        let chosen_id = match strategy {
            LoadBalanceStrategy::RoundRobin => {
                let idx = lb_state.round_robin.fetch_add(1, Ordering::Relaxed) as usize
                    % candidate_ids.len();
                candidate_ids[idx].clone()
            }
            LoadBalanceStrategy::WeightedRoundRobin => {
                pick_weighted(&shard, &candidate_ids, &lb_state)
            }
            LoadBalanceStrategy::Random => {
                let idx = rand::rng().random_range(0..candidate_ids.len());
                candidate_ids[idx].clone()
            }
            LoadBalanceStrategy::LeastConn => {
                // In-flight counters are owned by the proxy dispatcher
                // (§4.1); the cache falls back to round-robin when no
                // dispatcher counter is wired, matching "approximately
                // fair" semantics already sanctioned for round-robin (§5).
                let idx = lb_state.round_robin.fetch_add(1, Ordering::Relaxed) as usize
                    % candidate_ids.len();
                candidate_ids[idx].clone()
            }
            LoadBalanceStrategy::IpHash => {
                let key = client_key.unwrap_or("");
                let idx = (hash32(key.as_bytes()) as usize) % candidate_ids.len();
                candidate_ids[idx].clone()
            }
            LoadBalanceStrategy::ConsistentHash => {
                pick_consistent_hash(&lb_state, &candidate_ids, client_key.unwrap_or(""))
            }
            LoadBalanceStrategy::StickySession => {
                pick_sticky(&lb_state, &candidate_ids, client_key)
            }
        };

        shard
            .instances
            .get(&chosen_id)
            .cloned()
            .ok_or_else(|| Error::NoHealthyInstance(format!("{}/{}", group_id, name)))
    }
}

fn invalidate_ring(shard: &mut ShardState, service_key: &ServiceKey) {
    if let Some(lb) = shard.lb_state.get(service_key) {
        if let Ok(mut ring) = lb.ring.write() {
            *ring = None;
        }
    }
}

fn pick_weighted(
    shard: &tokio::sync::RwLockReadGuard<'_, ShardState>,
    candidates: &[ServiceInstanceId],
    lb: &LbState,
) -> ServiceInstanceId {
    // Smooth weighted round robin: pick the candidate with the highest
    // current weight, then subtract the total weight from it (§4.1).
    let mut total_weight: i64 = 0;
    let mut best: Option<(ServiceInstanceId, i64)> = None;

    for id in candidates {
        let weight = shard
            .instances
            .get(id)
            .map(|i| i.weight.max(1) as i64)
            .unwrap_or(1);
        total_weight += weight;

        let mut current = lb
            .weighted_current
            .entry(id.clone())
            .or_insert(0);
        *current += weight;

        if best.as_ref().map(|(_, w)| *current > *w).unwrap_or(true) {
            best = Some((id.clone(), *current));
        }
    }

    let chosen = best.map(|(id, _)| id).unwrap_or_else(|| candidates[0].clone());
    if let Some(mut entry) = lb.weighted_current.get_mut(&chosen) {
        *entry -= total_weight;
    }
    chosen
}

fn pick_consistent_hash(
    lb: &LbState,
    candidates: &[ServiceInstanceId],
    client_key: &str,
) -> ServiceInstanceId {
    {
        let guard = lb.ring.read().expect("ring lock poisoned");
        if let Some(ring) = guard.as_ref() {
            if let Some(idx) = ring.pick(client_key.as_bytes()) {
                if let Some(id) = candidates.get(idx) {
                    return id.clone();
                }
            }
        }
    }
    let ring = ConsistentHashRing::build(candidates);
    let idx = ring.pick(client_key.as_bytes()).unwrap_or(0);
    let chosen = candidates[idx.min(candidates.len() - 1)].clone();
    *lb.ring.write().expect("ring lock poisoned") = Some(ring);
    chosen
}

fn pick_sticky(
    lb: &LbState,
    candidates: &[ServiceInstanceId],
    client_key: Option<&str>,
) -> ServiceInstanceId {
    if let Some(session_id) = client_key {
        if let Some(bound) = lb.sticky.get(session_id) {
            if candidates.contains(&bound) {
                return bound.clone();
            }
        }
        // Fall back to round-robin on miss and bind (§4.1).
        let idx = lb.round_robin.fetch_add(1, Ordering::Relaxed) as usize % candidates.len();
        let chosen = candidates[idx].clone();
        lb.sticky.insert(session_id.to_string(), chosen.clone());
        return chosen;
    }
    candidates[0].clone()
}

/// Parse a client-supplied address into an `IpAddr`, used by the `ip-hash`
/// strategy and the IP-allow/deny security filter alike.
pub fn parse_client_ip(raw: &str) -> Option<IpAddr> {
    IpAddr::from_str(raw.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::{
        HealthCheckMode, HealthCheckType, HealthStatus, InstanceStatus, Protocol,
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

    fn service(tenant: &str, group_id: &str, name: &str, strategy: LoadBalanceStrategy) -> Service {
        Service {
            tenant_id: tenant.into(),
            group_id: group_id.into(),
            name: name.into(),
            protocol: Protocol::Http,
            lb_strategy: strategy,
            health_check_type: HealthCheckType::Http,
            health_check_mode: HealthCheckMode::Passive,
            health_check_path: "/health".into(),
            health_check_interval_secs: 10,
            heartbeat_timeout_secs: 10,
            failure_threshold: 3,
            metadata: Default::default(),
        }
    }

    fn instance(tenant: &str, id: &str, group_id: &str, name: &str, port: u16) -> ServiceInstance {
        ServiceInstance {
            tenant_id: tenant.into(),
            id: id.into(),
            group_id: group_id.into(),
            service_name: name.into(),
            host: "127.0.0.1".into(),
            port,
            instance_status: InstanceStatus::Up,
            health_status: HealthStatus::Healthy,
            weight: 1,
            last_heartbeat_time: crate::registry::model::now_millis(),
            last_health_check_time: crate::registry::model::now_millis(),
            heartbeat_fail_count: 0,
            ephemeral: true,
        }
    }

    #[tokio::test]
    async fn set_service_requires_group() {
        let cache = RegistryCache::new();
        let err = cache
            .set_service(service("t1", "g1", "svc", LoadBalanceStrategy::RoundRobin))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn discover_round_robin_cycles_candidates() {
        let cache = RegistryCache::new();
        cache.set_group(group("t1", "g1")).await;
        cache
            .set_service(service("t1", "g1", "svc", LoadBalanceStrategy::RoundRobin))
            .await
            .unwrap();
        cache
            .set_instance(instance("t1", "i1", "g1", "svc", 8001))
            .await
            .unwrap();
        cache
            .set_instance(instance("t1", "i2", "g1", "svc", 8002))
            .await
            .unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let inst = cache
                .discover_instance(&"t1".into(), &"g1".into(), &"svc".into(), None)
                .await
                .unwrap();
            seen.insert(inst.port);
        }
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn discover_excludes_unhealthy() {
        let cache = RegistryCache::new();
        cache.set_group(group("t1", "g1")).await;
        cache
            .set_service(service("t1", "g1", "svc", LoadBalanceStrategy::RoundRobin))
            .await
            .unwrap();
        let mut a = instance("t1", "i1", "g1", "svc", 8001);
        a.health_status = HealthStatus::Unhealthy;
        cache.set_instance(a).await.unwrap();

        let err = cache
            .discover_instance(&"t1".into(), &"g1".into(), &"svc".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoHealthyInstance(_)));
    }

    #[tokio::test]
    async fn discover_no_service_is_not_found() {
        let cache = RegistryCache::new();
        let err = cache
            .discover_instance(&"t1".into(), &"g1".into(), &"svc".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_group_fails_with_services() {
        let cache = RegistryCache::new();
        cache.set_group(group("t1", "g1")).await;
        cache
            .set_service(service("t1", "g1", "svc", LoadBalanceStrategy::RoundRobin))
            .await
            .unwrap();
        let err = cache.delete_group(&"t1".into(), &"g1".into()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn deregister_then_get_is_not_found() {
        let cache = RegistryCache::new();
        cache.set_group(group("t1", "g1")).await;
        cache
            .set_service(service("t1", "g1", "svc", LoadBalanceStrategy::RoundRobin))
            .await
            .unwrap();
        cache
            .set_instance(instance("t1", "i1", "g1", "svc", 8001))
            .await
            .unwrap();
        assert!(cache.delete_instance(&"t1".into(), &"i1".into()).await);
        assert!(cache.get_instance(&"t1".into(), &"i1".into()).await.is_none());
    }

    #[tokio::test]
    async fn sticky_session_binds_on_first_hit() {
        let cache = RegistryCache::new();
        cache.set_group(group("t1", "g1")).await;
        cache
            .set_service(service("t1", "g1", "svc", LoadBalanceStrategy::StickySession))
            .await
            .unwrap();
        cache
            .set_instance(instance("t1", "i1", "g1", "svc", 8001))
            .await
            .unwrap();
        cache
            .set_instance(instance("t1", "i2", "g1", "svc", 8002))
            .await
            .unwrap();

        let first = cache
            .discover_instance(&"t1".into(), &"g1".into(), &"svc".into(), Some("session-a"))
            .await
            .unwrap();
        let second = cache
            .discover_instance(&"t1".into(), &"g1".into(), &"svc".into(), Some("session-a"))
            .await
            .unwrap();
        assert_eq!(first.port, second.port);
    }
}
