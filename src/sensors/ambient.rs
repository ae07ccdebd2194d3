/// Local temperature/humidity sensor boundary
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

use crate::error::Result;
use crate::models::AmbientReading;
use crate::performance::RollingWindow;

/// Readings older than this are ignored by the fan controller
pub const AMBIENT_MAX_AGE: Duration = Duration::from_secs(300);

const TEMPERATURE_WINDOW: usize = 5;

/// A short-range sensor that is scanned for while a session is active
#[async_trait]
pub trait AmbientSensor: Send + Sync {
    async fn start_scanning(&self) -> Result<()>;
    async fn stop_scanning(&self);
    fn is_scanning(&self) -> bool;
}

#[derive(Debug)]
struct Latest {
    temperature_f: RollingWindow,
    reading: Option<AmbientReading>,
    updated_at: Option<Instant>,
}

/// Shared cell holding the latest ambient readings.
///
/// The temperature is averaged over the last few readings so the
/// compensation step does not flap on sensor noise around a breakpoint.
#[derive(Debug, Clone)]
pub struct LatestAmbient {
    inner: Arc<Mutex<Latest>>,
}

impl Default for LatestAmbient {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Latest {
                temperature_f: RollingWindow::new(TEMPERATURE_WINDOW),
                reading: None,
                updated_at: None,
            })),
        }
    }
}

impl LatestAmbient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, reading: AmbientReading) {
        if let Ok(mut latest) = self.inner.lock() {
            latest.temperature_f.add(f64::from(reading.temperature_f));
            latest.reading = Some(reading);
            latest.updated_at = Some(Instant::now());
        }
    }

    pub fn reading(&self) -> Option<AmbientReading> {
        self.inner.lock().ok().and_then(|latest| latest.reading)
    }

    /// Averaged temperature in °F, if a reading arrived recently
    pub fn temperature_f(&self) -> Option<f32> {
        let latest = self.inner.lock().ok()?;
        let updated_at = latest.updated_at?;
        if updated_at.elapsed() > AMBIENT_MAX_AGE || latest.temperature_f.is_empty() {
            return None;
        }
        Some(latest.temperature_f.average() as f32)
    }

    pub fn clear(&self) {
        if let Ok(mut latest) = self.inner.lock() {
            latest.temperature_f.clear();
            latest.reading = None;
            latest.updated_at = None;
        }
    }
}
