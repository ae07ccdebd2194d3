/// Error types shared by the control loop, the transports and the bootstrap
use thiserror::Error;

/// Problems found while loading or validating configuration
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}'")]
    Invalid { key: String, value: String },

    #[error("{key}: zone band '{band}' is not of the form MIN-MAX")]
    BadBand { key: String, band: String },

    #[error("zone table needs at least one band")]
    EmptyZones,

    #[error("zone bounds must be strictly increasing (zone {zone}: {min} >= {max})")]
    NonIncreasing { zone: usize, min: f64, max: f64 },

    #[error("reference value {max} must exceed rest value {rest}")]
    BadReference { rest: f64, max: f64 },

    #[error("{0}")]
    Range(String),
}

/// Every fallible operation in the crate funnels into this type
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("sensor transport: {0}")]
    Transport(String),

    #[error("fan command '{command}' failed: {reason}")]
    Actuator { command: &'static str, reason: String },

    #[error("bluetooth: {0}")]
    Bluetooth(#[from] bluer::Error),

    #[error("max retries exceeded for {0}")]
    RetriesExhausted(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
