use std::fmt;
use std::str::FromStr;

/// Logical sensor profile a device is registered under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorProfile {
    HeartRate,
    Power,
    Cadence,
}

impl SensorProfile {
    pub const ALL: [SensorProfile; 3] = [Self::HeartRate, Self::Power, Self::Cadence];

    pub fn tag(&self) -> &'static str {
        match self {
            Self::HeartRate => "HR",
            Self::Power => "PWR",
            Self::Cadence => "CAD",
        }
    }
}

impl fmt::Display for SensorProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for SensorProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HR" => Ok(Self::HeartRate),
            "PWR" => Ok(Self::Power),
            "CAD" => Ok(Self::Cadence),
            other => Err(format!("unknown sensor profile '{}'", other)),
        }
    }
}

/// One decoded transmission from a performance sensor.
///
/// Every variant carries the device's event counter; a repeated counter means
/// the same measurement was transmitted again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SensorReading {
    HeartRate { beat_count: u32, bpm: f64 },
    Power { event_count: u32, watts: f64 },
    Cadence { revolution_count: u32, rpm: f64 },
}

impl SensorReading {
    pub fn profile(&self) -> SensorProfile {
        match self {
            Self::HeartRate { .. } => SensorProfile::HeartRate,
            Self::Power { .. } => SensorProfile::Power,
            Self::Cadence { .. } => SensorProfile::Cadence,
        }
    }

    pub fn counter(&self) -> u32 {
        match *self {
            Self::HeartRate { beat_count, .. } => beat_count,
            Self::Power { event_count, .. } => event_count,
            Self::Cadence { revolution_count, .. } => revolution_count,
        }
    }

    pub fn value(&self) -> f64 {
        match *self {
            Self::HeartRate { bpm, .. } => bpm,
            Self::Power { watts, .. } => watts,
            Self::Cadence { rpm, .. } => rpm,
        }
    }
}

/// Events delivered by a sensor transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Detected {
        profile: SensorProfile,
        device_id: u64,
    },
    Data {
        profile: SensorProfile,
        device_id: u64,
        reading: SensorReading,
    },
}

/// Reading from the local temperature/humidity sensor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmbientReading {
    pub temperature_c: f32,
    pub temperature_f: f32,
    pub humidity_percent: f32,
}

impl AmbientReading {
    pub fn from_celsius(temperature_c: f32, humidity_percent: f32) -> Self {
        Self {
            temperature_c,
            temperature_f: temperature_c * 9.0 / 5.0 + 32.0,
            humidity_percent,
        }
    }
}

/// Appliance state as last reported by the fan
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FanState {
    pub power_on: bool,
    pub wind_level: u8,
    pub temperature_f: Option<f32>,
}
