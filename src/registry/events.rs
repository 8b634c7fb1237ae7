//! Event Publisher (§4.3): decouples the Registry Manager from its
//! subscribers (durable-store writer, change notifier) via a bounded
//! intake queue that fans out in commit order.
//!
//! Ordering (§3 I5) is preserved by a single producer task that drains
//! the bounded intake `mpsc` channel in commit order
//! and re-broadcasts each event to per-subscriber unbounded forwarding
//! channels, so one slow subscriber only backs up its own queue, never
//! another subscriber's or the publisher's.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::ids::{EventId, ServiceGroupId, ServiceInstanceId, TenantId};
use crate::registry::model::{HealthStatus, Service, ServiceGroup, ServiceInstance};

/// Event types (§6 egress events / §3 `ServiceEvent`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ServiceEventType {
    ServiceGroupCreated,
    ServiceGroupUpdated,
    ServiceGroupDeleted,
    ServiceRegistered,
    ServiceUpdated,
    ServiceDeregistered,
    InstanceRegistered,
    InstanceUpdated,
    InstanceDeregistered,
    InstanceHeartbeatUpdated,
    InstanceHealthChange,
    /// Emitted once per health-monitor tick that evicts/demotes at least
    /// `eviction_alert_threshold` instances: a bulk eviction alert with up
    /// to 10 enumerated instances (§5).
    NodeEvictionAlert,
}

/// Snapshot payload carried by a `ServiceEvent`. Only one variant is
/// populated depending on `event_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventSnapshot {
    Group(ServiceGroup),
    Service(Service),
    Instance(ServiceInstance),
    /// Up to 10 representative instances plus the full count for the
    /// tick (§5); the cap keeps the event payload bounded regardless of
    /// how large an outage is.
    Eviction {
        instances: Vec<ServiceInstance>,
        total_evicted: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub id: EventId,
    pub event_type: ServiceEventType,
    pub tenant_id: TenantId,
    pub group_id: Option<ServiceGroupId>,
    pub service_instance_id: Option<ServiceInstanceId>,
    pub snapshot: EventSnapshot,
    /// Old/new health status, populated for heartbeat and health-change
    /// events so subscribers can detect `UNHEALTHY -> HEALTHY` transitions
    /// without a second read (§4.2).
    #[serde(default)]
    pub old_health_status: Option<HealthStatus>,
    #[serde(default)]
    pub new_health_status: Option<HealthStatus>,
    /// `heartbeatFailCount` embedded in the instance snapshot (§5) so
    /// subscribers can tell "just missed one beat" apart from "about to
    /// be evicted" without a second read.
    #[serde(default)]
    pub heartbeat_fail_count: Option<u32>,
    /// Tag identifying the component that produced the event, e.g.
    /// `"registry-manager"` or `"health-monitor"`.
    pub source: String,
    pub timestamp: i64,
    /// Diff-oriented, human-display JSON per §6.
    pub event_data: serde_json::Value,
}

/// Pluggable sink a subscriber forwards events to -- the out-of-core
/// "durable store" collaborator's ingestion point (§4.3).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, event: &ServiceEvent) -> Result<()>;
}

/// A no-op sink, useful for tests and for subscribers added purely for
/// their side channel (e.g. a bare wakeup signal).
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn handle(&self, _event: &ServiceEvent) -> Result<()> {
        Ok(())
    }
}

/// Durable-store writer backed by NATS, held as a persistent async
/// client; publishing is at-least-once (§4.3).
#[cfg(feature = "events-nats")]
pub struct NatsEventSink {
    client: async_nats::Client,
    subject: String,
}

#[cfg(feature = "events-nats")]
impl NatsEventSink {
    pub async fn connect(config: &crate::config::NatsConfig) -> Result<Self> {
        let mut opts = async_nats::ConnectOptions::new().max_reconnects(Some(config.max_reconnects));
        if let Some(name) = &config.name {
            opts = opts.name(name);
        }
        let client = opts
            .connect(&config.url)
            .await
            .map_err(|e| Error::Nats(format!("failed to connect to NATS at {}: {}", config.url, e)))?;
        Ok(Self {
            client,
            subject: config.subject.clone(),
        })
    }
}

#[cfg(feature = "events-nats")]
#[async_trait]
impl EventSink for NatsEventSink {
    async fn handle(&self, event: &ServiceEvent) -> Result<()> {
        let subject = format!("{}.{}", self.subject, event.tenant_id);
        let payload = serde_json::to_vec(event)
            .map_err(|e| Error::Internal(format!("failed to serialize event: {}", e)))?;
        self.client
            .publish(subject, payload.into())
            .await
            .map_err(|e| Error::Nats(format!("failed to publish event {}: {}", event.id, e)))?;
        Ok(())
    }
}

struct Subscriber {
    name: String,
    tx: mpsc::UnboundedSender<ServiceEvent>,
}

/// Configuration for the publisher's intake queue (§4.3 `Publish`
/// contract: non-blocking when capacity allows, configurable behaviour
/// when full).
#[derive(Debug, Clone, Copy)]
pub struct PublisherConfig {
    pub queue_capacity: usize,
    pub block_when_full: bool,
    pub enqueue_deadline: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4_096,
            block_when_full: true,
            enqueue_deadline: Duration::from_millis(500),
        }
    }
}

pub struct EventPublisher {
    intake: Mutex<Option<mpsc::Sender<ServiceEvent>>>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    config: PublisherConfig,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
    intake_rx: Mutex<Option<mpsc::Receiver<ServiceEvent>>>,
}

impl EventPublisher {
    pub fn new(config: PublisherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Self {
            intake: Mutex::new(Some(tx)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            config,
            dispatcher: Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
            intake_rx: Mutex::new(Some(rx)),
        }
    }

    /// Register a consumer. Each subscriber owns an independent,
    /// unbounded forwarding channel and a background task draining it
    /// into `sink` -- a slow sink applies backpressure only to itself.
    pub async fn subscribe(&self, name: impl Into<String>, sink: Arc<dyn EventSink>) {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServiceEvent>();
        self.subscribers.lock().await.push(Subscriber {
            name: name.clone(),
            tx,
        });

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.handle(&event).await {
                    tracing::warn!(subscriber = %name, error = %e, "event sink failed, continuing");
                }
            }
        });
    }

    /// Start the producer task that drains the intake queue in commit
    /// order and re-broadcasts to subscriber channels (§5: preserves I5).
    pub async fn start(&self) {
        let Some(mut rx) = self.intake_rx.lock().await.take() else {
            return;
        };
        let subscribers = self.subscribers.clone();
        let stopped = self.stopped.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let subs = subscribers.lock().await;
                for sub in subs.iter() {
                    if sub.tx.send(event.clone()).is_err() {
                        tracing::warn!(subscriber = %sub.name, "subscriber channel closed");
                    }
                }
            }
            stopped.store(true, Ordering::SeqCst);
        });

        *self.dispatcher.lock().await = Some(handle);
    }

    /// Publish an event. Non-blocking if the intake queue has capacity;
    /// otherwise blocks up to `enqueue_deadline` or returns immediately
    /// with `Error::Internal("queue full")`, per the `block_when_full`
    /// config flag (§4.3).
    pub async fn publish(&self, event: ServiceEvent) -> Result<()> {
        let guard = self.intake.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Err(Error::Internal("event publisher is stopped".into()));
        };
        if self.config.block_when_full {
            match tokio::time::timeout(self.config.enqueue_deadline, tx.send(event)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(Error::Internal("event publisher intake closed".into())),
                Err(_) => Err(Error::Internal("event publisher intake queue full".into())),
            }
        } else {
            tx.try_send(event)
                .map_err(|_| Error::Internal("event publisher intake queue full".into()))
        }
    }

    /// Stop the publisher, draining the intake queue up to `grace`.
    pub async fn stop(&self, grace: Duration) {
        self.intake.lock().await.take();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            let _ = tokio::time::timeout(grace, handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::now_millis;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink(Arc<AtomicUsize>);

    #[async_trait]
    impl EventSink for CountingSink {
        async fn handle(&self, _event: &ServiceEvent) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample_event(tenant: &str, instance_id: &str) -> ServiceEvent {
        ServiceEvent {
            id: EventId::new(),
            event_type: ServiceEventType::InstanceRegistered,
            tenant_id: tenant.into(),
            group_id: Some("g1".into()),
            service_instance_id: Some(instance_id.into()),
            snapshot: EventSnapshot::Instance(crate::registry::model::ServiceInstance {
                tenant_id: tenant.into(),
                id: instance_id.into(),
                group_id: "g1".into(),
                service_name: "svc".into(),
                host: "127.0.0.1".into(),
                port: 8080,
                instance_status: crate::registry::model::InstanceStatus::Up,
                health_status: HealthStatus::Healthy,
                weight: 1,
                last_heartbeat_time: now_millis(),
                last_health_check_time: now_millis(),
                heartbeat_fail_count: 0,
                ephemeral: true,
            }),
            old_health_status: None,
            new_health_status: None,
            heartbeat_fail_count: Some(0),
            source: "test".into(),
            timestamp: now_millis(),
            event_data: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn subscribers_each_receive_published_events() {
        let publisher = EventPublisher::new(PublisherConfig::default());
        publisher.start().await;

        let count_a = Arc::new(AtomicUsize::new(0));
        let count_b = Arc::new(AtomicUsize::new(0));
        publisher
            .subscribe("a", Arc::new(CountingSink(count_a.clone())))
            .await;
        publisher
            .subscribe("b", Arc::new(CountingSink(count_b.clone())))
            .await;

        for i in 0..5 {
            publisher
                .publish(sample_event("t1", &format!("i{i}")))
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count_a.load(Ordering::SeqCst), 5);
        assert_eq!(count_b.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_stall_publish() {
        let publisher = EventPublisher::new(PublisherConfig::default());
        publisher.start().await;

        struct SlowSink;
        #[async_trait]
        impl EventSink for SlowSink {
            async fn handle(&self, _event: &ServiceEvent) -> Result<()> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            }
        }
        publisher.subscribe("slow", Arc::new(SlowSink)).await;

        let fast_count = Arc::new(AtomicUsize::new(0));
        publisher
            .subscribe("fast", Arc::new(CountingSink(fast_count.clone())))
            .await;

        for i in 0..3 {
            publisher
                .publish(sample_event("t1", &format!("i{i}")))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fast_count.load(Ordering::SeqCst), 3);
    }
}
