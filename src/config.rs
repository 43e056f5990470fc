use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GateError, Result};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub broadcast: BroadcastConfig,
    pub ingress: IngressConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    /// Interval between outbound ping frames
    pub heartbeat_interval_secs: u64,
    /// A connection whose last pong is older than this is force-closed
    pub heartbeat_timeout_secs: u64,
    /// Interval of the credential revalidation sweep
    pub revalidation_interval_secs: u64,
    /// Capacity of each connection's outbound frame channel
    pub frame_channel_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            broadcast: BroadcastConfig::default(),
            ingress: IngressConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
            revalidation_interval_secs: 60,
            frame_channel_capacity: 256,
        }
    }
}

impl GatewayConfig {
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn revalidation_interval(&self) -> Duration {
        Duration::from_secs(self.revalidation_interval_secs)
    }
}

/// Worker-pool broadcaster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Target sets at or below this size are sent directly in parallel;
    /// larger sets are split into batches of this size
    pub batch_threshold: usize,
    /// Fixed number of fan-out workers
    pub worker_count: usize,
    /// Bounded queue depth per worker
    pub queue_capacity: usize,
    /// How long an enqueue may wait before the batch is rejected (ms)
    pub enqueue_wait_ms: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            batch_threshold: 50,
            worker_count: 10,
            queue_capacity: 256,
            enqueue_wait_ms: 250,
        }
    }
}

impl BroadcastConfig {
    pub fn enqueue_wait(&self) -> Duration {
        Duration::from_millis(self.enqueue_wait_ms)
    }
}

/// Hybrid bus ingress configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Durable stream name
    pub stream: String,
    /// Best-effort pub/sub channel name
    pub channel: String,
    /// Consumer group for the durable stream
    pub group: String,
    /// This consumer's name within the group
    pub consumer: String,
    /// Delivery attempts per stream entry before dead-lettering
    pub retry_budget: u32,
    /// Pending entries idle longer than this are claimed from their consumer
    pub claim_idle_secs: u64,
    /// Sliding window for the pub/sub drop-rate estimator
    pub drop_window_secs: u64,
    /// Drop rate above this fraction raises an alert
    pub drop_alert_threshold: f64,
    /// Minimum gap between drop-rate alerts
    pub alert_cooldown_secs: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            stream: "events.durable".to_string(),
            channel: "events.volatile".to_string(),
            group: "gateway".to_string(),
            consumer: "gateway-0".to_string(),
            retry_budget: 3,
            claim_idle_secs: 30,
            drop_window_secs: 60,
            drop_alert_threshold: 0.05,
            alert_cooldown_secs: 300,
        }
    }
}

impl IngressConfig {
    pub fn claim_idle(&self) -> Duration {
        Duration::from_secs(self.claim_idle_secs)
    }

    pub fn drop_window(&self) -> Duration {
        Duration::from_secs(self.drop_window_secs)
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }
}

/// Circuit breaker configuration for the event bus dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing trial calls
    pub open_secs: u64,
    /// Successful trial calls required to close from half-open
    pub half_open_trials: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_secs: 30,
            half_open_trials: 3,
        }
    }
}

impl BreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_secs(self.open_secs)
    }
}

/// Decorrelated-jitter retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Builder pattern implementation for constructing GatewayConfig instances.
#[derive(Debug, Default)]
pub struct GatewayConfigBuilder {
    broadcast: Option<BroadcastConfig>,
    ingress: Option<IngressConfig>,
    breaker: Option<BreakerConfig>,
    retry: Option<RetryConfig>,
    heartbeat_interval_secs: Option<u64>,
    heartbeat_timeout_secs: Option<u64>,
    revalidation_interval_secs: Option<u64>,
    frame_channel_capacity: Option<usize>,
}

impl GatewayConfigBuilder {
    pub fn broadcast(mut self, v: BroadcastConfig) -> Self {
        self.broadcast = Some(v);
        self
    }
    pub fn ingress(mut self, v: IngressConfig) -> Self {
        self.ingress = Some(v);
        self
    }
    pub fn breaker(mut self, v: BreakerConfig) -> Self {
        self.breaker = Some(v);
        self
    }
    pub fn retry(mut self, v: RetryConfig) -> Self {
        self.retry = Some(v);
        self
    }
    pub fn heartbeat_interval_secs(mut self, v: u64) -> Self {
        self.heartbeat_interval_secs = Some(v);
        self
    }
    pub fn heartbeat_timeout_secs(mut self, v: u64) -> Self {
        self.heartbeat_timeout_secs = Some(v);
        self
    }
    pub fn revalidation_interval_secs(mut self, v: u64) -> Self {
        self.revalidation_interval_secs = Some(v);
        self
    }
    pub fn frame_channel_capacity(mut self, v: usize) -> Self {
        self.frame_channel_capacity = Some(v);
        self
    }

    pub fn build(self) -> Result<GatewayConfig> {
        let defaults = GatewayConfig::default();
        let cfg = GatewayConfig {
            broadcast: self.broadcast.unwrap_or(defaults.broadcast),
            ingress: self.ingress.unwrap_or(defaults.ingress),
            breaker: self.breaker.unwrap_or(defaults.breaker),
            retry: self.retry.unwrap_or(defaults.retry),
            heartbeat_interval_secs: self
                .heartbeat_interval_secs
                .unwrap_or(defaults.heartbeat_interval_secs),
            heartbeat_timeout_secs: self
                .heartbeat_timeout_secs
                .unwrap_or(defaults.heartbeat_timeout_secs),
            revalidation_interval_secs: self
                .revalidation_interval_secs
                .unwrap_or(defaults.revalidation_interval_secs),
            frame_channel_capacity: self
                .frame_channel_capacity
                .unwrap_or(defaults.frame_channel_capacity),
        };
        if cfg.broadcast.worker_count == 0 {
            return Err(GateError::InvalidConfig("worker_count must be > 0".into()));
        }
        if cfg.broadcast.batch_threshold == 0 {
            return Err(GateError::InvalidConfig(
                "batch_threshold must be > 0".into(),
            ));
        }
        if cfg.heartbeat_timeout_secs <= cfg.heartbeat_interval_secs {
            return Err(GateError::InvalidConfig(
                "heartbeat_timeout must exceed heartbeat_interval".into(),
            ));
        }
        if cfg.retry.base_delay_ms == 0 || cfg.retry.max_delay_ms < cfg.retry.base_delay_ms {
            return Err(GateError::InvalidConfig(
                "retry delays must satisfy 0 < base <= max".into(),
            ));
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = GatewayConfig::builder().build().unwrap();
        assert_eq!(cfg.broadcast.batch_threshold, 50);
        assert_eq!(cfg.broadcast.worker_count, 10);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.ingress.retry_budget, 3);
    }

    #[test]
    fn rejects_inverted_heartbeat() {
        let err = GatewayConfig::builder()
            .heartbeat_interval_secs(30)
            .heartbeat_timeout_secs(10)
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn rejects_zero_workers() {
        let err = GatewayConfig::builder()
            .broadcast(BroadcastConfig {
                worker_count: 0,
                ..BroadcastConfig::default()
            })
            .build();
        assert!(err.is_err());
    }
}
