pub mod ambient;
pub mod handler;
pub mod manager;
pub mod transport;

pub use ambient::{AmbientSensor, LatestAmbient};
pub use handler::{FanMode, PerformanceHandler};
pub use manager::{ManagerConfig, SensorConnectionManager};
pub use transport::{open_with_retry, SensorTransport};
