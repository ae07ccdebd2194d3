/// Application configuration loaded from the environment
use log::{debug, info};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::fan::controller::{FanControlConfig, ABSOLUTE_MAX_SPEED};
use crate::models::SensorProfile;
use crate::performance::{AggregatorConfig, SmoothingMode, ZoneBand, ZoneTable};
use crate::sensors::ManagerConfig;

const DEFAULT_HR_ZONES: &str = "40-60,60-70,70-80,80-90,90-100";
const DEFAULT_POWER_ZONES: &str = "0-55,55-75,75-90,90-105,105-120,120-150";
const DEFAULT_CADENCE_ZONES: &str = "0-67,67-89,89-100,100-111,111-150";
const RECENT_NP_SAMPLES: usize = 300; // Window means kept for the recent NP metric

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub hr_rest: f64,
    pub hr_max: f64,
    pub hr_bands: Vec<ZoneBand>,
    pub ftp: f64,
    pub power_bands: Vec<ZoneBand>,
    pub cadence_reference: f64,
    pub cadence_bands: Vec<ZoneBand>,
    pub smoothing: SmoothingMode,
    pub np_window: Duration,
    pub fan: FanControlConfig,
    pub fan_state_cache: Duration,
    pub manager: ManagerConfig,
    pub transport_retries: usize,
    pub transport_retry_delay: Duration,
    pub shutdown_timeout: Duration,
    /// RuuviTag MAC -> name; empty disables the ambient sensor
    pub ruuvi_tags: HashMap<String, String>,
    pub ambient_scan_interval: Duration,
}

impl AppConfig {
    /// Load from the process environment, reading `.env` first if present
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let vars = Vars(vars);

        let mode = vars.get("SMOOTHING_MODE").unwrap_or("ema").to_ascii_lowercase();
        let smoothing = match mode.as_str() {
            "ema" => {
                let alpha_up = vars.alpha("SMOOTHING_ALPHA_UP", 0.5)?;
                let alpha_down = vars.alpha("SMOOTHING_ALPHA_DOWN", 0.1)?;
                // Falls must be followed more slowly than rises
                if alpha_down >= alpha_up {
                    return Err(ConfigError::Range(format!(
                        "SMOOTHING_ALPHA_DOWN ({}) must be below SMOOTHING_ALPHA_UP ({})",
                        alpha_down, alpha_up
                    )));
                }
                SmoothingMode::Ema {
                    alpha_up,
                    alpha_down,
                }
            }
            "window" => {
                let size = vars.parse("SMOOTHING_WINDOW", 5usize)?;
                if size == 0 {
                    return Err(ConfigError::Range("SMOOTHING_WINDOW must be at least 1".into()));
                }
                SmoothingMode::Window { size }
            }
            other => {
                return Err(ConfigError::Invalid {
                    key: "SMOOTHING_MODE".into(),
                    value: other.into(),
                })
            }
        };

        let fan = FanControlConfig {
            device_id: vars.get("FAN_DEVICE_ID").unwrap_or("fan").to_string(),
            min_speed: vars.parse("FAN_SPEED_MIN", 1u8)?,
            max_speed: vars.parse("FAN_SPEED_MAX", 7u8)?,
            hr_weight: vars.parse("FAN_HR_WEIGHT", 0.5)?,
            power_weight: vars.parse("FAN_POWER_WEIGHT", 0.5)?,
            update_interval: vars.millis("FAN_UPDATE_INTERVAL_MS", 5000)?,
            override_frequency: vars.millis("OSCILLATION_OVERRIDE_FREQUENCY_MS", 600_000)?,
            override_duration: vars.millis("OSCILLATION_OVERRIDE_DURATION_MS", 60_000)?,
            command_retries: vars.parse("FAN_COMMAND_RETRIES", 3usize)?,
            retry_delay: vars.millis("FAN_COMMAND_RETRY_DELAY_MS", 1000)?,
        };
        if fan.min_speed > fan.max_speed || fan.max_speed > ABSOLUTE_MAX_SPEED {
            return Err(ConfigError::Range(format!(
                "fan speed range {}-{} must satisfy 0 <= min <= max <= {}",
                fan.min_speed, fan.max_speed, ABSOLUTE_MAX_SPEED
            )));
        }
        if fan.command_retries == 0 {
            return Err(ConfigError::Range("FAN_COMMAND_RETRIES must be at least 1".into()));
        }

        let manager = ManagerConfig {
            inactivity_timeout: vars.secs("SENSOR_INACTIVITY_TIMEOUT_SECS", 60)?,
            required: parse_profiles(vars.get("REQUIRED_SENSORS").unwrap_or("HR,PWR"))?,
        };

        let transport_retries = vars.parse("TRANSPORT_OPEN_RETRIES", 10usize)?;
        if transport_retries == 0 {
            return Err(ConfigError::Range("TRANSPORT_OPEN_RETRIES must be at least 1".into()));
        }

        let config = AppConfig {
            hr_rest: vars.parse("HR_REST", 55.0)?,
            hr_max: vars.parse("HR_MAX", 180.0)?,
            hr_bands: parse_bands("HR_ZONES", vars.get("HR_ZONES").unwrap_or(DEFAULT_HR_ZONES))?,
            ftp: vars.parse("POWER_FTP", 250.0)?,
            power_bands: parse_bands(
                "POWER_ZONES",
                vars.get("POWER_ZONES").unwrap_or(DEFAULT_POWER_ZONES),
            )?,
            cadence_reference: vars.parse("CADENCE_REFERENCE", 90.0)?,
            cadence_bands: parse_bands(
                "CADENCE_ZONES",
                vars.get("CADENCE_ZONES").unwrap_or(DEFAULT_CADENCE_ZONES),
            )?,
            smoothing,
            np_window: vars.secs("NP_WINDOW_SECS", 30)?,
            fan,
            fan_state_cache: vars.millis("FAN_STATE_CACHE_MS", 3000)?,
            manager,
            transport_retries,
            transport_retry_delay: vars.secs("TRANSPORT_RETRY_DELAY_SECS", 5)?,
            shutdown_timeout: vars.secs("SHUTDOWN_TIMEOUT_SECS", 20)?,
            ruuvi_tags: parse_ruuvi_tags(&vars),
            ambient_scan_interval: vars.secs("AMBIENT_SCAN_INTERVAL_SECS", 30)?,
        };

        if config.np_window.is_zero() {
            return Err(ConfigError::Range("NP_WINDOW_SECS must be at least 1".into()));
        }

        // Fail at startup rather than on the first reading
        config.hr_zones()?;
        config.power_zones()?;
        config.cadence_zones()?;

        Ok(config)
    }

    pub fn hr_zones(&self) -> Result<ZoneTable, ConfigError> {
        ZoneTable::heart_rate(self.hr_rest, self.hr_max, &self.hr_bands)
    }

    pub fn power_zones(&self) -> Result<ZoneTable, ConfigError> {
        ZoneTable::power(self.ftp, &self.power_bands)
    }

    pub fn cadence_zones(&self) -> Result<ZoneTable, ConfigError> {
        ZoneTable::power(self.cadence_reference, &self.cadence_bands)
    }

    pub fn aggregator_config(&self) -> Result<AggregatorConfig, ConfigError> {
        Ok(AggregatorConfig {
            hr_zones: self.hr_zones()?,
            power_zones: self.power_zones()?,
            cadence_zones: self.cadence_zones()?,
            hr_rest: self.hr_rest,
            ftp: self.ftp,
            smoothing: self.smoothing,
            np_window: self.np_window,
            recent_np_samples: RECENT_NP_SAMPLES,
        })
    }
}

struct Vars<'a>(&'a HashMap<String, String>);

impl Vars<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: value.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn millis(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_millis)
    }

    fn secs(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_secs)
    }

    fn alpha(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        let alpha = self.parse(key, default)?;
        if alpha > 0.0 && alpha <= 1.0 {
            Ok(alpha)
        } else {
            Err(ConfigError::Range(format!("{} must be in (0, 1], got {}", key, alpha)))
        }
    }
}

/// Parse "40-60,60-70,..." into zone bands
pub fn parse_bands(key: &str, value: &str) -> Result<Vec<ZoneBand>, ConfigError> {
    let mut bands = Vec::new();
    for band in value.split(',').map(str::trim).filter(|b| !b.is_empty()) {
        let bad_band = || ConfigError::BadBand {
            key: key.to_string(),
            band: band.to_string(),
        };
        let (min, max) = band.split_once('-').ok_or_else(bad_band)?;
        let min: f64 = min.trim().parse().map_err(|_| bad_band())?;
        let max: f64 = max.trim().parse().map_err(|_| bad_band())?;
        bands.push(ZoneBand::new(min, max));
    }
    if bands.is_empty() {
        return Err(ConfigError::EmptyZones);
    }
    Ok(bands)
}

fn parse_profiles(value: &str) -> Result<Vec<SensorProfile>, ConfigError> {
    let mut profiles = Vec::new();
    for tag in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        let profile: SensorProfile = tag.parse().map_err(|_| ConfigError::Invalid {
            key: "REQUIRED_SENSORS".into(),
            value: tag.to_string(),
        })?;
        if !profiles.contains(&profile) {
            profiles.push(profile);
        }
    }
    if profiles.is_empty() {
        return Err(ConfigError::Range("REQUIRED_SENSORS must name at least one profile".into()));
    }
    Ok(profiles)
}

/// RuuviTags from `RUUVI_TAGS="MAC=name,..."`, falling back to
/// `RUUVI_TAG_<N>_MAC` / `RUUVI_TAG_<N>_NAME` pairs
fn parse_ruuvi_tags(vars: &Vars<'_>) -> HashMap<String, String> {
    let mut tags = HashMap::new();

    if let Some(ruuvi_tags) = vars.get("RUUVI_TAGS") {
        debug!("Found RUUVI_TAGS: '{}'", ruuvi_tags);
        for pair in ruuvi_tags.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((mac, name)) => {
                    let (mac, name) = (mac.trim(), name.trim());
                    if !mac.is_empty() && !name.is_empty() {
                        tags.insert(mac.to_uppercase(), name.to_string());
                    }
                }
                None => debug!("Failed to split pair: '{}'", pair),
            }
        }
    } else {
        for (key, value) in vars.0 {
            if let Some(index) = key
                .strip_prefix("RUUVI_TAG_")
                .and_then(|s| s.strip_suffix("_MAC"))
            {
                if let Some(name) = vars.get(&format!("RUUVI_TAG_{}_NAME", index)) {
                    tags.insert(value.trim().to_uppercase(), name.to_string());
                }
            }
        }
    }

    for (mac, name) in &tags {
        info!("Ambient sensor: {} -> {}", mac, name);
    }
    tags
}
