pub mod bluetooth;
pub mod config;
pub mod error;
pub mod fan;
pub mod models;
pub mod performance;
pub mod sensors;
pub mod shutdown;
pub mod utils;

pub use error::{ConfigError, Error, Result};
