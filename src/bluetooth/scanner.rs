/// RuuviTag scanning for ambient temperature and humidity
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::error::Result;
use crate::models::AmbientReading;
use crate::sensors::ambient::{AmbientSensor, LatestAmbient};

// RuuviTag protocol constants
const RUUVITAG_MANUFACTURER_ID: u16 = 0x0499; // Ruuvi Innovations Ltd. manufacturer ID
const DATA_FORMAT: u8 = 5; // RuuviTag data format version 5
const SCAN_DURATION_SECS: u64 = 10; // How long to actively scan for devices

/// Atmospheric part of a RuuviTag format 5 advertisement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuuviData {
    pub temperature: f32,
    pub humidity: f32,
    pub pressure: f32,
}

impl From<RuuviData> for AmbientReading {
    fn from(data: RuuviData) -> Self {
        AmbientReading::from_celsius(data.temperature, data.humidity)
    }
}

/// Decode RuuviTag manufacturer data format 5
///
/// Only the atmospheric fields are read:
/// - Byte 0: Data format (5)
/// - Bytes 1-2: Temperature (signed 16-bit, 0.005°C resolution)
/// - Bytes 3-4: Humidity (unsigned 16-bit, 0.0025% resolution)
/// - Bytes 5-6: Pressure (unsigned 16-bit, +50000 Pa offset, 1 Pa resolution)
///
/// The remaining bytes (acceleration, battery, movement counter, sequence
/// number, MAC) are ignored.
///
/// # Returns
/// Some(RuuviData) if decoding succeeds, None if data is invalid
pub fn decode_ruuvi_data(data: &[u8]) -> Option<RuuviData> {
    if data.len() != 24 || data[0] != DATA_FORMAT {
        if !data.is_empty() {
            warn!(
                "Invalid RuuviTag data: len={}, format={}",
                data.len(),
                data[0]
            );
        }
        return None;
    }

    // 0x8000 marks an unavailable temperature
    let raw_temperature = i16::from_be_bytes([data[1], data[2]]);
    if raw_temperature == i16::MIN {
        return None;
    }

    let temperature = raw_temperature as f32 * 0.005;
    let humidity = (u16::from_be_bytes([data[3], data[4]]) as f32 * 0.0025).min(100.0);
    let pressure = (u16::from_be_bytes([data[5], data[6]]) as f32 + 50000.0) / 100.0;

    Some(RuuviData {
        temperature: (temperature * 100.0).round() / 100.0,
        humidity: (humidity * 100.0).round() / 100.0,
        pressure: (pressure * 100.0).round() / 100.0,
    })
}

/// Scan once for the configured RuuviTags and decode their advertisements
///
/// # Arguments
/// * `tags` - MAC address -> name of the sensors to look for
///
/// # Returns
/// HashMap of sensor MAC -> RuuviData for every tag that was heard
pub async fn scan_for_ruuvitags(
    tags: &HashMap<String, String>,
) -> Result<HashMap<String, RuuviData>> {
    let mut data = HashMap::new();

    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    // Configure discovery filter for Low Energy devices only
    let filter = bluer::DiscoveryFilter {
        transport: bluer::DiscoveryTransport::Le,
        duplicate_data: false,
        ..Default::default()
    };

    // Apply the discovery filter (warn if it fails, but continue)
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!("Failed to set discovery filter: {}", e);
    }

    // Start device discovery in background
    let discovery_stream = adapter.discover_devices().await?;
    let discovery_handle = tokio::spawn(async move {
        let mut stream = Box::pin(discovery_stream);
        while let Some(event) = stream.next().await {
            debug!("Discovery event: {:?}", event);
        }
    });

    // Let discovery run for the configured duration
    sleep(Duration::from_secs(SCAN_DURATION_SECS)).await;
    discovery_handle.abort();

    for addr in adapter.device_addresses().await? {
        let device = match adapter.device(addr) {
            Ok(device) => device,
            Err(_) => continue,
        };

        let addr_str = device.address().to_string().to_uppercase();
        if !tags.contains_key(&addr_str) {
            continue;
        }

        match device.manufacturer_data().await {
            Ok(Some(manufacturer_data)) => {
                if let Some(sensor_data) = manufacturer_data
                    .get(&RUUVITAG_MANUFACTURER_ID)
                    .and_then(|raw| decode_ruuvi_data(raw))
                {
                    debug!(
                        "Received data from {}: temp={:.2}°C, humidity={:.2}%, pressure={:.2} hPa",
                        addr_str,
                        sensor_data.temperature,
                        sensor_data.humidity,
                        sensor_data.pressure
                    );
                    data.insert(addr_str, sensor_data);
                }
            }
            Ok(None) => debug!("No manufacturer data for {}", addr_str),
            Err(e) => debug!("Failed to get manufacturer data for {}: {}", addr_str, e),
        }
    }

    Ok(data)
}

/// Ambient sensor backed by periodic RuuviTag scans
pub struct RuuviScanner {
    tags: HashMap<String, String>,
    interval: Duration,
    latest: LatestAmbient,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RuuviScanner {
    pub fn new(tags: HashMap<String, String>, interval: Duration, latest: LatestAmbient) -> Self {
        Self {
            tags,
            interval,
            latest,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl AmbientSensor for RuuviScanner {
    async fn start_scanning(&self) -> Result<()> {
        let mut task = match self.task.lock() {
            Ok(task) => task,
            Err(poisoned) => poisoned.into_inner(),
        };
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Ok(());
        }

        let tags = self.tags.clone();
        let interval = self.interval;
        let latest = self.latest.clone();
        info!("Scanning for {} RuuviTag sensor(s)", tags.len());

        *task = Some(tokio::spawn(async move {
            loop {
                match scan_for_ruuvitags(&tags).await {
                    Ok(readings) => {
                        for (mac, reading) in readings {
                            let name = tags.get(&mac).map(String::as_str).unwrap_or("Unknown");
                            debug!("Ambient {}: {:.2}°C", name, reading.temperature);
                            latest.update(reading.into());
                        }
                    }
                    Err(e) => error!("RuuviTag scan failed: {}", e),
                }
                sleep(interval).await;
            }
        }));
        Ok(())
    }

    async fn stop_scanning(&self) {
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
            info!("Stopped RuuviTag scanning");
        }
        self.latest.clear();
    }

    fn is_scanning(&self) -> bool {
        match self.task.lock() {
            Ok(task) => task.as_ref().is_some_and(|handle| !handle.is_finished()),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Example payload from the RuuviTag data format 5 documentation
    const VALID: [u8; 24] = [
        0x05, 0x12, 0xFC, 0x53, 0x94, 0xC3, 0x7C, 0x00, 0x04, 0xFF, 0xFC, 0x04, 0x0C, 0xAC, 0x36,
        0x42, 0x00, 0xCD, 0xCB, 0xB8, 0x33, 0x4C, 0x88, 0x4F,
    ];

    #[test]
    fn decodes_format_5() {
        let data = decode_ruuvi_data(&VALID).unwrap();
        assert_eq!(data.temperature, 24.3);
        assert_eq!(data.humidity, 53.49);
        assert_eq!(data.pressure, 1000.44);
    }

    #[test]
    fn converts_to_fahrenheit() {
        let reading: AmbientReading = decode_ruuvi_data(&VALID).unwrap().into();
        assert!((reading.temperature_f - 75.74).abs() < 0.01);
        assert_eq!(reading.humidity_percent, 53.49);
    }

    #[test]
    fn rejects_wrong_format_and_length() {
        let mut other_format = VALID;
        other_format[0] = 3;
        assert_eq!(decode_ruuvi_data(&other_format), None);
        assert_eq!(decode_ruuvi_data(&VALID[..20]), None);
        assert_eq!(decode_ruuvi_data(&[]), None);
    }

    #[test]
    fn rejects_unavailable_temperature() {
        let mut payload = VALID;
        payload[1] = 0x80;
        payload[2] = 0x00;
        assert_eq!(decode_ruuvi_data(&payload), None);
    }
}
