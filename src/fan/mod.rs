pub mod controller;
pub mod profile;
pub mod sink;

pub use controller::{
    compensate_for_temperature, CycleOutcome, Decision, FanControlConfig, FanProfileController,
    FanSetting, OverrideWindow,
};
pub use profile::{FanProfile, ProfileParams};
pub use sink::{CachedFan, FanCommand, FanSink, SimulatedFan};
