use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker section of the configuration file.
///
/// Defaults match the values the valve was originally deployed with: the
/// public HiveMQ broker and the `control` / `schedule` topics.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: String,
    pub control_channel: String,
    pub schedule_channel: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "broker.hivemq.com".to_string(),
            port: "1883".to_string(),
            control_channel: "control".to_string(),
            schedule_channel: "schedule".to_string(),
            client_id: "subscribing_client".to_string(),
            keep_alive_secs: 400,
            connect_timeout_ms: 5000,
        }
    }
}

impl BrokerConfig {
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.host.clone(),
            port: self.port.clone(),
            control_channel: self.control_channel.clone(),
            schedule_channel: self.schedule_channel.clone(),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Where the session connects and which two channels it listens on.
///
/// Built once at startup and shared read-only between the session manager
/// and the dispatcher. The port stays a string until a socket is opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: String,
    pub control_channel: String,
    pub schedule_channel: String,
}

impl BrokerEndpoint {
    /// Both subscriptions, in the order they are issued after every connect.
    pub fn channels(&self) -> [&str; 2] {
        [&self.control_channel, &self.schedule_channel]
    }
}

/// Poll cadence and reconnect policy.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    pub poll_interval_ms: u64,
    pub step_budget_ms: u64,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    /// 0 retries forever
    pub reconnect_max_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            step_budget_ms: 100,
            reconnect_initial_backoff_ms: 500,
            reconnect_max_backoff_ms: 30_000,
            reconnect_max_attempts: 8,
        }
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn step_budget(&self) -> Duration {
        Duration::from_millis(self.step_budget_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_millis(self.reconnect_initial_backoff_ms),
            max: Duration::from_millis(self.reconnect_max_backoff_ms),
            max_attempts: self.reconnect_max_attempts,
        }
    }
}

/// Exponential reconnect delay, doubling per failed attempt up to `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Whether another attempt is allowed after `failed` consecutive failures.
    pub fn allows(&self, failed: u32) -> bool {
        self.max_attempts == 0 || failed < self.max_attempts
    }
}
