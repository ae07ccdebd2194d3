/// Wireless sensor transport boundary
use async_trait::async_trait;
use log::info;
use tokio::sync::mpsc;
use tokio::time::Duration;

use crate::error::Result;
use crate::models::TransportEvent;
use crate::utils::execute_with_retry;

/// Source of "detected" and "data" events from performance sensors
#[async_trait]
pub trait SensorTransport: Send + Sync {
    /// Start listening; events arrive on the returned channel until
    /// [`SensorTransport::close`] is called
    async fn open(&self) -> Result<mpsc::Receiver<TransportEvent>>;

    async fn close(&self);
}

/// Open `transport`, retrying a fixed number of times with a fixed pause
pub async fn open_with_retry(
    transport: &dyn SensorTransport,
    attempts: usize,
    delay: Duration,
) -> Result<mpsc::Receiver<TransportEvent>> {
    let events = execute_with_retry("sensor transport open", attempts, delay, move || {
        transport.open()
    })
    .await?;
    info!("Sensor transport open");
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Fails a set number of opens before handing out a channel
    struct FlakyTransport {
        failures_left: AtomicUsize,
        opens: AtomicUsize,
    }

    impl FlakyTransport {
        fn new(failures: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(failures),
                opens: AtomicUsize::new(0),
            }
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SensorTransport for FlakyTransport {
        async fn open(&self) -> Result<mpsc::Receiver<TransportEvent>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::Transport("adapter not ready".into()));
            }
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_transient_failures() {
        let transport = FlakyTransport::new(2);
        let started = Instant::now();

        let result = open_with_retry(&transport, 3, Duration::from_secs(5)).await;
        assert!(result.is_ok());
        assert_eq!(transport.opens(), 3);
        // Two pauses, none after the successful attempt
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_last_attempt() {
        let transport = FlakyTransport::new(usize::MAX);
        let started = Instant::now();

        let result = open_with_retry(&transport, 3, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::RetriesExhausted(_))));
        assert_eq!(transport.opens(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }
}
