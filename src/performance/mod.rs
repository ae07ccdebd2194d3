pub mod aggregator;
pub mod smoothing;
pub mod zones;

pub use aggregator::{
    AggregatorConfig, Ingest, PerformanceAggregator, PerformanceSnapshot, SignalSnapshot,
};
pub use smoothing::{RollingWindow, SmoothedSample, Smoother, SmoothingMode};
pub use zones::{speed_offset, Zone, ZoneBand, ZoneTable};
