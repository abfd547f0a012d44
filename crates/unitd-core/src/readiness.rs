use crate::config::{duration_secs, signal_name};
use crate::endpoint::HostPort;
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Backoff between connection attempts while polling a port
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Strategy deciding when a freshly spawned process is usable
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadinessDetector {
    /// Ready once the supervisor receives `signal`, raised by the child.
    ///
    /// The same signal is set to ignored in the child before exec, which is
    /// what makes X servers announce readiness to their parent.
    SignalWait {
        #[serde(deserialize_with = "signal_name::deserialize")]
        signal: Signal,
    },
    /// Ready once a TCP connect to `endpoint` succeeds
    PortPoll {
        endpoint: HostPort,
        #[serde(default = "default_retry_interval", deserialize_with = "duration_secs::deserialize")]
        retry_interval: Duration,
    },
    /// Ready as soon as the process has been spawned
    #[default]
    Immediate,
}

impl ReadinessDetector {
    pub fn signal(signal: Signal) -> Self {
        ReadinessDetector::SignalWait { signal }
    }

    pub fn port(endpoint: HostPort) -> Self {
        ReadinessDetector::PortPoll {
            endpoint,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Signal that must be ignored in the child so it announces readiness
    pub fn ignored_in_child(&self) -> Option<Signal> {
        match self {
            ReadinessDetector::SignalWait { signal } => Some(*signal),
            _ => None,
        }
    }
}

impl fmt::Display for ReadinessDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessDetector::SignalWait { signal } => write!(f, "signal {signal}"),
            ReadinessDetector::PortPoll { endpoint, .. } => write!(f, "port {endpoint}"),
            ReadinessDetector::Immediate => f.write_str("immediate"),
        }
    }
}

fn default_retry_interval() -> Duration {
    DEFAULT_RETRY_INTERVAL
}
