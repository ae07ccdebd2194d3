/// Sensor activity tracking, event routing and standby handling
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

use crate::models::{SensorProfile, SensorReading, TransportEvent};
use crate::sensors::ambient::AmbientSensor;
use crate::sensors::handler::PerformanceHandler;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a profile stays active without a new "detected" event
    pub inactivity_timeout: Duration,
    /// Profiles that must all be active before data is processed
    pub required: Vec<SensorProfile>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(60),
            required: vec![SensorProfile::HeartRate, SensorProfile::Power],
        }
    }
}

struct ActiveDevice {
    device_id: u64,
    deadline: Instant,
    timer: JoinHandle<()>,
}

/// Owns the set of active sensor profiles and routes their data.
///
/// Each active profile has a timer task that sleeps until the profile's
/// deadline; a "detected" event only moves the deadline forward, so frequent
/// re-detections cost no task churn.
pub struct SensorConnectionManager {
    config: ManagerConfig,
    handlers: Vec<Arc<dyn PerformanceHandler>>,
    ambient: Option<Arc<dyn AmbientSensor>>,
    active: Mutex<HashMap<SensorProfile, ActiveDevice>>,
}

impl SensorConnectionManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            handlers: Vec::new(),
            ambient: None,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn PerformanceHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_ambient_sensor(mut self, ambient: Arc<dyn AmbientSensor>) -> Self {
        self.ambient = Some(ambient);
        self
    }

    fn active(&self) -> MutexGuard<'_, HashMap<SensorProfile, ActiveDevice>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Currently active profiles as `(profile, device id)`, sorted by profile
    pub fn active_devices(&self) -> Vec<(SensorProfile, u64)> {
        let mut devices: Vec<_> = self
            .active()
            .iter()
            .map(|(profile, device)| (*profile, device.device_id))
            .collect();
        devices.sort();
        devices
    }

    pub fn is_active(&self, profile: SensorProfile) -> bool {
        self.active().contains_key(&profile)
    }

    /// True when every required profile is active
    pub fn should_process(&self) -> bool {
        let active = self.active();
        self.config.required.iter().all(|p| active.contains_key(p))
    }

    /// Consume transport events until the channel closes
    pub async fn run(self: &Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Detected { profile, device_id } => {
                    self.on_detected(profile, device_id).await
                }
                TransportEvent::Data {
                    profile,
                    device_id,
                    reading,
                } => self.on_data(profile, device_id, &reading),
            }
        }
        debug!("Sensor event channel closed");
    }

    /// Mark `profile` active and push its inactivity deadline forward
    pub async fn on_detected(self: &Arc<Self>, profile: SensorProfile, device_id: u64) {
        let deadline = Instant::now() + self.config.inactivity_timeout;
        let became_active = {
            let mut active = self.active();
            match active.get_mut(&profile) {
                Some(device) => {
                    if device.device_id != device_id {
                        info!(
                            "{} sensor changed from {} to {}",
                            profile, device.device_id, device_id
                        );
                        device.device_id = device_id;
                    }
                    device.deadline = deadline;
                    false
                }
                None => {
                    let manager = Arc::clone(self);
                    let timer = tokio::spawn(async move { manager.watch(profile).await });
                    active.insert(
                        profile,
                        ActiveDevice {
                            device_id,
                            deadline,
                            timer,
                        },
                    );
                    true
                }
            }
        };

        if became_active {
            info!("{} sensor {} active", profile, device_id);
            if self.should_process() {
                info!("All required sensors active, processing performance data");
                self.start_ambient().await;
            }
        }
    }

    /// Route a reading to every handler while the session is active
    pub fn on_data(&self, profile: SensorProfile, device_id: u64, reading: &SensorReading) {
        if reading.profile() != profile {
            warn!(
                "Dropping {:?} reading delivered on {} device {}",
                reading, profile, device_id
            );
            return;
        }
        if !self.should_process() {
            debug!("Standby: ignoring {} data from {}", profile, device_id);
            return;
        }
        for handler in &self.handlers {
            handler.on_data(reading);
        }
    }

    /// Clear every timer and clean up all handlers
    pub async fn shutdown(&self) {
        let devices: Vec<ActiveDevice> = self.active().drain().map(|(_, device)| device).collect();
        for device in devices {
            device.timer.abort();
        }
        self.enter_standby().await;
    }

    async fn watch(&self, profile: SensorProfile) {
        loop {
            let deadline = match self.active().get(&profile) {
                Some(device) => device.deadline,
                None => return,
            };
            sleep_until(deadline).await;

            let expired = {
                let mut active = self.active();
                match active.get(&profile) {
                    Some(device) if device.deadline <= Instant::now() => {
                        active.remove(&profile);
                        true
                    }
                    Some(_) => false,
                    None => return,
                }
            };
            if expired {
                info!(
                    "{} sensor inactive for {} seconds",
                    profile,
                    self.config.inactivity_timeout.as_secs()
                );
                if !self.should_process() {
                    self.enter_standby().await;
                }
                return;
            }
        }
    }

    async fn start_ambient(&self) {
        let Some(ambient) = &self.ambient else {
            return;
        };
        if ambient.is_scanning() {
            return;
        }
        if let Err(e) = ambient.start_scanning().await {
            warn!("Failed to start ambient sensor scanning: {}", e);
        }
    }

    async fn enter_standby(&self) {
        info!("Entering standby");
        for handler in &self.handlers {
            handler.clean_up().await;
        }
        if let Some(ambient) = &self.ambient {
            if ambient.is_scanning() {
                ambient.stop_scanning().await;
            }
        }
    }
}
