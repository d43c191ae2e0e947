use crate::types::{Feature, FeatureMode};
use std::time::Duration;

/// Default TCP control port of the device
pub const DEFAULT_PORT: u16 = 33336;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const DEFAULT_RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Default interval for features that never notify
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// A feature queried on a fixed interval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTarget {
    pub feature: String,
    pub interval: Duration,
}

impl PollTarget {
    pub fn new(feature: impl Into<String>, interval: Duration) -> Self {
        Self {
            feature: feature.into(),
            interval,
        }
    }
}

/// What a second `detect_subwoofer` call does while a probe is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DetectionPolicy {
    /// Wait for the running probe and share its result
    #[default]
    Coalesce,
    /// Fail immediately with `DetectionBusy`
    Reject,
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Port used when the address carries none
    pub port: u16,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// First reconnect backoff ceiling
    pub reconnect_initial: Duration,
    /// Largest reconnect backoff ceiling
    pub reconnect_max: Duration,
    pub poll_targets: Vec<PollTarget>,
    pub detection_policy: DetectionPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let poll_targets = Feature::ALL
            .into_iter()
            .filter(|f| f.mode() == FeatureMode::Poll)
            .map(|f| PollTarget::new(f.key(), DEFAULT_POLL_INTERVAL))
            .collect();

        Self {
            port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            reconnect_initial: DEFAULT_RECONNECT_INITIAL,
            reconnect_max: DEFAULT_RECONNECT_MAX,
            poll_targets,
            detection_policy: DetectionPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the reconnect backoff bounds
    pub fn with_reconnect_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_initial = initial;
        self.reconnect_max = max.max(initial);
        self
    }

    /// Replace the polled feature set
    pub fn with_poll_targets(mut self, targets: Vec<PollTarget>) -> Self {
        self.poll_targets = targets;
        self
    }

    pub fn with_detection_policy(mut self, policy: DetectionPolicy) -> Self {
        self.detection_policy = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_poll_the_notify_less_features() {
        let config = ClientConfig::default();
        let features: Vec<_> = config.poll_targets.iter().map(|t| t.feature.as_str()).collect();
        assert_eq!(features, vec!["audio.drangecomp", "audio.aav"]);
        assert!(config.poll_targets.iter().all(|t| t.interval == DEFAULT_POLL_INTERVAL));
        assert_eq!(config.port, 33336);
    }

    #[test]
    fn backoff_max_never_below_initial() {
        let config = ClientConfig::default()
            .with_reconnect_backoff(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(config.reconnect_max, Duration::from_secs(5));
    }
}
