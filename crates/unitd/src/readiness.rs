use backon::{ConstantBuilder, Retryable};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};
use unitd_core::{HostPort, ReadinessDetector, UnitdError};
use unitd_unix::{SignalHub, SignalSubscription};

/// A readiness detector with everything it must hold before the process is
/// spawned already in place.
pub enum ArmedReadiness {
    Signal(SignalSubscription),
    Port {
        endpoint: HostPort,
        retry_interval: Duration,
    },
    Immediate,
}

impl ArmedReadiness {
    /// Subscribe to the ready signal, if any. Must happen before spawning so
    /// an early announcement is not lost.
    pub fn arm(detector: &ReadinessDetector, hub: &SignalHub) -> Result<Self, UnitdError> {
        Ok(match detector {
            ReadinessDetector::SignalWait { signal } => ArmedReadiness::Signal(hub.subscribe(*signal)?),
            ReadinessDetector::PortPoll {
                endpoint,
                retry_interval,
            } => ArmedReadiness::Port {
                endpoint: endpoint.clone(),
                retry_interval: *retry_interval,
            },
            ReadinessDetector::Immediate => ArmedReadiness::Immediate,
        })
    }

    /// Suspend until the process is ready. Dropping the future abandons the
    /// wait without confirming anything.
    pub async fn wait(&mut self) -> Result<(), UnitdError> {
        match self {
            ArmedReadiness::Signal(subscription) => subscription.recv().await,
            ArmedReadiness::Port {
                endpoint,
                retry_interval,
            } => poll_port(endpoint, *retry_interval).await,
            ArmedReadiness::Immediate => Ok(()),
        }
    }
}

/// Connect to `endpoint` until it accepts. Refused connections are retried
/// every `interval`; any other error ends the poll.
pub async fn poll_port(endpoint: &HostPort, interval: Duration) -> Result<(), UnitdError> {
    info!("Polling {} every {:?}", endpoint, interval);

    let backoff = ConstantBuilder::default()
        .with_delay(interval)
        .without_max_times();

    let connect = move || async move {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
        drop(stream);
        Ok::<(), std::io::Error>(())
    };

    connect
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .when(|e| e.kind() == ErrorKind::ConnectionRefused)
        .notify(|e, delay| debug!("{} not ready ({}), retrying in {:?}", endpoint, e, delay))
        .await
        .map_err(|e| UnitdError::ReadinessFailed(format!("cannot connect to {endpoint}: {e}")))?;

    info!("{} is accepting connections", endpoint);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{Signal, raise};
    use tokio::net::TcpListener;

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_immediate_is_ready() {
        let hub = SignalHub::new();
        let mut armed = ArmedReadiness::arm(&ReadinessDetector::Immediate, &hub).unwrap();
        armed.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_signal_armed_before_delivery() {
        let hub = SignalHub::new();
        let mut armed =
            ArmedReadiness::arm(&ReadinessDetector::signal(Signal::SIGUSR1), &hub).unwrap();
        assert!(hub.is_watched(Signal::SIGUSR1));

        // Delivered before anyone waits.
        raise(Signal::SIGUSR1).unwrap();
        tokio::time::timeout(Duration::from_secs(5), armed.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!hub.is_watched(Signal::SIGUSR1));
    }

    #[tokio::test]
    async fn test_port_poll_retries_until_listener() {
        let port = free_port().await;
        let endpoint = HostPort::new("127.0.0.1", port);

        let listener = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let _ = listener.accept().await;
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            poll_port(&endpoint, Duration::from_millis(50)),
        )
        .await
        .unwrap()
        .unwrap();
        listener.abort();
    }

    #[tokio::test]
    async fn test_port_poll_is_cancellable() {
        let port = free_port().await;
        let endpoint = HostPort::new("127.0.0.1", port);
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            poll_port(&endpoint, Duration::from_millis(20)),
        )
        .await;
        assert!(result.is_err());
    }
}
