//! Rate limiter (§4.7): striped per-`(configId, key)` algorithm state,
//! with a background sweeper evicting state that's gone idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::config::{RateLimitConfig, RateLimitKeyStrategy, RateLimiterTuning};
use crate::error::{Error, Result};
use crate::ids::RateLimitConfigId;
use crate::ratelimit::algorithms::{AdmissionResult, AlgorithmState};

type StripeKey = (RateLimitConfigId, String);

pub struct RateLimiter {
    configs: DashMap<RateLimitConfigId, Arc<RateLimitConfig>>,
    state: DashMap<StripeKey, Arc<AsyncMutex<AlgorithmState>>>,
    tuning: RateLimiterTuning,
    sweeper: AsyncMutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl RateLimiter {
    pub fn new(tuning: RateLimiterTuning) -> Self {
        Self {
            configs: DashMap::new(),
            state: DashMap::new(),
            tuning,
            sweeper: AsyncMutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the active rate-limit config set (e.g. on a config-store
    /// change event). Existing striped state for a still-present config
    /// is left untouched so in-flight windows aren't reset by an
    /// unrelated reload.
    pub fn set_configs(&self, configs: Vec<RateLimitConfig>) {
        self.configs.clear();
        for config in configs {
            self.configs.insert(config.id.clone(), Arc::new(config));
        }
    }

    /// Admission check for `config_id` using `raw_key` (derived by the
    /// caller per the config's `key_strategy`). Creates striped state on
    /// first use.
    pub async fn check(&self, config_id: &RateLimitConfigId, raw_key: &str) -> Result<AdmissionResult> {
        let config = self
            .configs
            .get(config_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::NotFound(format!("rate limit config {} not found", config_id)))?;

        if !config.active {
            return Ok(AdmissionResult {
                admitted: true,
                limit: 0,
                remaining: 0,
                reset_after: Duration::ZERO,
            });
        }

        let stripe_key = (config_id.clone(), raw_key.to_string());
        let state = self
            .state
            .entry(stripe_key)
            .or_insert_with(|| Arc::new(AsyncMutex::new(AlgorithmState::new(&config))))
            .clone();

        let mut guard = state.lock().await;
        Ok(guard.check(&config, Instant::now()))
    }

    /// Start the idle sweeper: evicts `(configId, key)` entries whose
    /// algorithm state hasn't been touched in `idle_ttl_multiple *
    /// window` (§4.7 tuning).
    pub async fn start_sweeper(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(this.tuning.sweep_interval_secs.max(1)));
            loop {
                interval.tick().await;
                if this.stopped.load(Ordering::SeqCst) {
                    break;
                }
                this.sweep().await;
            }
        });
        *self.sweeper.lock().await = Some(handle);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let mut stale = Vec::new();
        for entry in self.state.iter() {
            let config_id = &entry.key().0;
            let Some(config) = self.configs.get(config_id) else {
                stale.push(entry.key().clone());
                continue;
            };
            let idle_limit = config.window() * self.tuning.idle_ttl_multiple.max(1);
            let guard = entry.value().lock().await;
            if now.saturating_duration_since(guard.last_touched()) > idle_limit {
                stale.push(entry.key().clone());
            }
        }
        for key in stale {
            self.state.remove(&key);
        }
    }
}

/// Derive the admission key for a request per the config's
/// `key_strategy` (§4.7).
pub fn derive_key(
    strategy: RateLimitKeyStrategy,
    client_ip: Option<&str>,
    user_id: Option<&str>,
    path: &str,
    service_name: Option<&str>,
    route_id: Option<&str>,
) -> String {
    match strategy {
        RateLimitKeyStrategy::Ip => client_ip.unwrap_or("unknown").to_string(),
        RateLimitKeyStrategy::User => user_id.unwrap_or("anonymous").to_string(),
        RateLimitKeyStrategy::Path => path.to_string(),
        RateLimitKeyStrategy::Service => service_name.unwrap_or("unknown").to_string(),
        RateLimitKeyStrategy::Route => route_id.unwrap_or("unknown").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigScope, RateLimitAlgorithm};

    fn config(id: &str, rate: f64, burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            tenant_id: "t1".into(),
            id: id.into(),
            scope: ConfigScope::Route,
            route_config_id: Some("r1".into()),
            algorithm: RateLimitAlgorithm::TokenBucket,
            key_strategy: RateLimitKeyStrategy::Ip,
            rate,
            burst,
            window_secs: 1,
            rejection_status_code: 429,
            rejection_message: "slow down".into(),
            active: true,
        }
    }

    #[tokio::test]
    async fn distinct_keys_have_independent_buckets() {
        let limiter = RateLimiter::new(RateLimiterTuning::default());
        limiter.set_configs(vec![config("rl1", 1.0, 2)]);

        assert!(limiter.check(&"rl1".into(), "1.1.1.1").await.unwrap().admitted);
        assert!(limiter.check(&"rl1".into(), "1.1.1.1").await.unwrap().admitted);
        assert!(!limiter.check(&"rl1".into(), "1.1.1.1").await.unwrap().admitted);

        assert!(limiter.check(&"rl1".into(), "2.2.2.2").await.unwrap().admitted);
    }

    #[tokio::test]
    async fn unknown_config_is_not_found() {
        let limiter = RateLimiter::new(RateLimiterTuning::default());
        let err = limiter.check(&"missing".into(), "k").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn inactive_config_always_admits() {
        let limiter = RateLimiter::new(RateLimiterTuning::default());
        let mut cfg = config("rl1", 1.0, 1);
        cfg.active = false;
        limiter.set_configs(vec![cfg]);

        for _ in 0..10 {
            assert!(limiter.check(&"rl1".into(), "k").await.unwrap().admitted);
        }
    }
}
