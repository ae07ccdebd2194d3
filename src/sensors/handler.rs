/// Performance handlers: consumers of routed sensor data
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;

use crate::fan::FanProfileController;
use crate::models::SensorReading;
use crate::performance::{Ingest, PerformanceAggregator, PerformanceSnapshot};
use crate::sensors::ambient::LatestAmbient;

/// Receives sensor data while the session is active
#[async_trait]
pub trait PerformanceHandler: Send + Sync {
    /// Called from the transport's event path; must not block
    fn on_data(&self, reading: &SensorReading);

    /// Called on standby and shutdown; must be safe to call repeatedly
    async fn clean_up(&self);
}

/// Drives the fan from aggregated performance data
pub struct FanMode {
    aggregator: Mutex<PerformanceAggregator>,
    controller: Arc<FanProfileController>,
    ambient: LatestAmbient,
}

impl FanMode {
    pub fn new(
        aggregator: PerformanceAggregator,
        controller: Arc<FanProfileController>,
        ambient: LatestAmbient,
    ) -> Self {
        Self {
            aggregator: Mutex::new(aggregator),
            controller,
            ambient,
        }
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        self.aggregator().snapshot()
    }

    pub fn controller(&self) -> &Arc<FanProfileController> {
        &self.controller
    }

    fn aggregator(&self) -> MutexGuard<'_, PerformanceAggregator> {
        match self.aggregator.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl PerformanceHandler for FanMode {
    fn on_data(&self, reading: &SensorReading) {
        let snapshot = {
            let mut aggregator = self.aggregator();
            if aggregator.ingest(reading, Instant::now()) != Ingest::Accepted {
                return;
            }
            aggregator.snapshot()
        };
        self.controller.trigger(snapshot, self.ambient.temperature_f());
    }

    async fn clean_up(&self) {
        self.aggregator().clean_up();
        self.controller.clean_up().await;
    }
}
