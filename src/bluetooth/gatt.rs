/// Bluetooth LE GATT transport for heart rate, power and cadence sensors
use async_trait::async_trait;
use bluer::{Adapter, AdapterEvent, Address, Device, Uuid};
use futures_util::StreamExt;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::models::{SensorProfile, SensorReading, TransportEvent};
use crate::sensors::transport::SensorTransport;

const EVENT_CHANNEL_CAPACITY: usize = 256;
// Re-announce a streaming device this often
const DETECTED_INTERVAL: Duration = Duration::from_secs(5);

const fn assigned_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_1000_8000_0080_5f9b_34fb)
}

pub const HEART_RATE_SERVICE: Uuid = assigned_uuid(0x180D);
pub const HEART_RATE_MEASUREMENT: Uuid = assigned_uuid(0x2A37);
pub const CYCLING_POWER_SERVICE: Uuid = assigned_uuid(0x1818);
pub const CYCLING_POWER_MEASUREMENT: Uuid = assigned_uuid(0x2A63);
pub const CSC_SERVICE: Uuid = assigned_uuid(0x1816);
pub const CSC_MEASUREMENT: Uuid = assigned_uuid(0x2A5B);

fn service_for(profile: SensorProfile) -> (Uuid, Uuid) {
    match profile {
        SensorProfile::HeartRate => (HEART_RATE_SERVICE, HEART_RATE_MEASUREMENT),
        SensorProfile::Power => (CYCLING_POWER_SERVICE, CYCLING_POWER_MEASUREMENT),
        SensorProfile::Cadence => (CSC_SERVICE, CSC_MEASUREMENT),
    }
}

/// Device id derived from the six address bytes
pub fn device_id(address: Address) -> u64 {
    address.0.iter().fold(0u64, |id, byte| (id << 8) | *byte as u64)
}

/// Heart Rate Measurement (0x2A37): bpm as u8, or u16 when flag bit 0 is set
pub fn parse_heart_rate(data: &[u8]) -> Option<f64> {
    let flags = *data.first()?;
    if flags & 0x01 != 0 {
        let bytes = data.get(1..3)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]) as f64)
    } else {
        data.get(1).map(|bpm| *bpm as f64)
    }
}

/// Cycling Power Measurement (0x2A63): instantaneous power follows the flags
pub fn parse_cycling_power(data: &[u8]) -> Option<f64> {
    let bytes = data.get(2..4)?;
    Some(i16::from_le_bytes([bytes[0], bytes[1]]).max(0) as f64)
}

/// Crank revolution data carried by a CSC Measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrankData {
    pub revolutions: u16,
    /// Last crank event time in 1/1024 s
    pub event_time: u16,
}

/// CSC Measurement (0x2A5B): skips wheel data when present
pub fn parse_csc(data: &[u8]) -> Option<CrankData> {
    let flags = *data.first()?;
    if flags & 0x02 == 0 {
        return None;
    }
    let offset = if flags & 0x01 != 0 { 7 } else { 1 };
    let bytes = data.get(offset..offset + 4)?;
    Some(CrankData {
        revolutions: u16::from_le_bytes([bytes[0], bytes[1]]),
        event_time: u16::from_le_bytes([bytes[2], bytes[3]]),
    })
}

/// Turns cumulative crank data into a revolution counter and rpm
#[derive(Debug, Default)]
pub struct CadenceTracker {
    last: Option<CrankData>,
    total_revolutions: u32,
    rpm: f64,
}

impl CadenceTracker {
    /// Returns `(revolution count, rpm)`; None until two crank events are seen
    pub fn update(&mut self, crank: CrankData) -> Option<(u32, f64)> {
        let Some(last) = self.last.replace(crank) else {
            return None;
        };
        let revolutions = crank.revolutions.wrapping_sub(last.revolutions);
        if revolutions == 0 {
            return Some((self.total_revolutions, self.rpm));
        }
        let ticks = crank.event_time.wrapping_sub(last.event_time);
        if ticks == 0 {
            return None;
        }
        self.total_revolutions = self.total_revolutions.wrapping_add(revolutions as u32);
        self.rpm = revolutions as f64 * 60.0 * 1024.0 / ticks as f64;
        Some((self.total_revolutions, self.rpm))
    }
}

/// Per-subscription decoder state
struct Decoder {
    profile: SensorProfile,
    sequence: u32,
    cadence: CadenceTracker,
}

impl Decoder {
    fn new(profile: SensorProfile) -> Self {
        Self {
            profile,
            sequence: 0,
            cadence: CadenceTracker::default(),
        }
    }

    /// Each notification is a distinct transmission for HR and power
    fn decode(&mut self, data: &[u8]) -> Option<SensorReading> {
        match self.profile {
            SensorProfile::HeartRate => {
                let bpm = parse_heart_rate(data)?;
                self.sequence = self.sequence.wrapping_add(1);
                Some(SensorReading::HeartRate {
                    beat_count: self.sequence,
                    bpm,
                })
            }
            SensorProfile::Power => {
                let watts = parse_cycling_power(data)?;
                self.sequence = self.sequence.wrapping_add(1);
                Some(SensorReading::Power {
                    event_count: self.sequence,
                    watts,
                })
            }
            SensorProfile::Cadence => {
                let (revolution_count, rpm) = self.cadence.update(parse_csc(data)?)?;
                Some(SensorReading::Cadence {
                    revolution_count,
                    rpm,
                })
            }
        }
    }
}

/// Sensor transport that discovers GATT sensors and subscribes to their
/// measurement characteristics
pub struct BleTransport {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BleTransport {
    pub fn new() -> Self {
        Self {
            task: Mutex::new(None),
        }
    }
}

impl Default for BleTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SensorTransport for BleTransport {
    async fn open(&self) -> Result<mpsc::Receiver<TransportEvent>> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            uuids: SensorProfile::ALL
                .iter()
                .map(|profile| service_for(*profile).0)
                .collect(),
            ..Default::default()
        };
        if let Err(e) = adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        let discovery = adapter.discover_devices().await?;
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        info!("Discovering sensors on adapter {}", adapter.name());

        let handle = tokio::spawn(async move {
            // Keep the session alive for as long as discovery runs
            let _session = session;
            let connected: Arc<Mutex<HashSet<(Address, SensorProfile)>>> = Arc::default();
            let mut subscriptions = JoinSet::new();
            let mut discovery = Box::pin(discovery);

            while let Some(event) = discovery.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                for profile in matching_profiles(&adapter, address).await {
                    let claimed = match connected.lock() {
                        Ok(mut set) => set.insert((address, profile)),
                        Err(_) => false,
                    };
                    if !claimed {
                        continue;
                    }
                    let adapter = adapter.clone();
                    let tx = tx.clone();
                    let connected = Arc::clone(&connected);
                    subscriptions.spawn(async move {
                        if let Err(e) = stream_measurements(&adapter, address, profile, &tx).await {
                            warn!("{} sensor {}: {}", profile, address, e);
                        }
                        if let Ok(mut set) = connected.lock() {
                            set.remove(&(address, profile));
                        }
                    });
                }
                while subscriptions.try_join_next().is_some() {}
            }
            debug!("Discovery stream ended");
        });

        let previous = match self.task.lock() {
            Ok(mut task) => task.replace(handle),
            Err(poisoned) => poisoned.into_inner().replace(handle),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(rx)
    }

    async fn close(&self) {
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
            info!("Sensor transport closed");
        }
    }
}

async fn matching_profiles(adapter: &Adapter, address: Address) -> Vec<SensorProfile> {
    let uuids = match adapter.device(address) {
        Ok(device) => device.uuids().await.ok().flatten().unwrap_or_default(),
        Err(_) => return Vec::new(),
    };
    SensorProfile::ALL
        .into_iter()
        .filter(|profile| uuids.contains(&service_for(*profile).0))
        .collect()
}

async fn find_measurement(
    device: &Device,
    profile: SensorProfile,
) -> Result<bluer::gatt::remote::Characteristic> {
    let (service_uuid, characteristic_uuid) = service_for(profile);
    for service in device.services().await? {
        if service.uuid().await? != service_uuid {
            continue;
        }
        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == characteristic_uuid {
                return Ok(characteristic);
            }
        }
    }
    Err(Error::Transport(format!(
        "no {} measurement characteristic",
        profile
    )))
}

/// Connect, subscribe and forward decoded notifications until the device
/// disconnects or the receiver goes away
async fn stream_measurements(
    adapter: &Adapter,
    address: Address,
    profile: SensorProfile,
    tx: &mpsc::Sender<TransportEvent>,
) -> Result<()> {
    let device = adapter.device(address)?;
    if !device.is_connected().await? {
        device.connect().await?;
    }
    let characteristic = find_measurement(&device, profile).await?;
    let notifications = characteristic.notify().await?;
    let mut notifications = Box::pin(notifications);

    let id = device_id(address);
    let mut decoder = Decoder::new(profile);
    let mut last_detected: Option<Instant> = None;
    info!("Subscribed to {} sensor {}", profile, address);

    while let Some(value) = notifications.next().await {
        let now = Instant::now();
        if last_detected.map_or(true, |at| now.duration_since(at) >= DETECTED_INTERVAL) {
            last_detected = Some(now);
            let detected = TransportEvent::Detected {
                profile,
                device_id: id,
            };
            if tx.send(detected).await.is_err() {
                return Ok(());
            }
        }

        let Some(reading) = decoder.decode(&value) else {
            debug!("Undecodable {} notification: {:02x?}", profile, value);
            continue;
        };
        let data = TransportEvent::Data {
            profile,
            device_id: id,
            reading,
        };
        if tx.send(data).await.is_err() {
            return Ok(());
        }
    }

    info!("{} sensor {} disconnected", profile, address);
    Ok(())
}
