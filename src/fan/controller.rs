/// Maps aggregated performance onto fan profile and speed
///
/// A decision cycle reads the appliance state, derives a target setting from
/// the heart rate and power zones, and issues only the commands needed to
/// reach it. At most one cycle runs at a time: a trigger that arrives while a
/// cycle is in flight is dropped, never queued.
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::time::{sleep, Duration, Instant};

use crate::error::Result;
use crate::fan::profile::{settle_delay, FanProfile, FULL_TRAVEL_DEGREES, MIN_SETTLE};
use crate::fan::sink::FanSink;
use crate::models::FanState;
use crate::performance::{speed_offset, PerformanceSnapshot, ZoneTable};
use crate::shutdown::FaultReporter;
use crate::utils::execute_with_retry;

/// Hardware speed bounds of the appliance
pub const ABSOLUTE_MIN_SPEED: u8 = 1;
pub const ABSOLUTE_MAX_SPEED: u8 = 9;

#[derive(Debug, Clone)]
pub struct FanControlConfig {
    pub device_id: String,
    /// Speed range the zones are spread over; 0 allows idling the fan
    pub min_speed: u8,
    pub max_speed: u8,
    pub hr_weight: f64,
    pub power_weight: f64,
    /// Minimum time between two decision cycles
    pub update_interval: Duration,
    /// Zero disables the periodic vertical sweep
    pub override_frequency: Duration,
    pub override_duration: Duration,
    pub command_retries: usize,
    pub retry_delay: Duration,
}

impl Default for FanControlConfig {
    fn default() -> Self {
        Self {
            device_id: "fan".to_string(),
            min_speed: 1,
            max_speed: 7,
            hr_weight: 0.5,
            power_weight: 0.5,
            update_interval: Duration::from_secs(5),
            override_frequency: Duration::from_secs(600),
            override_duration: Duration::from_secs(60),
            command_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Profile and speed as applied to the appliance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanSetting {
    pub profile: FanProfile,
    pub speed: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Run(FanSetting),
    /// Lowest zone at a near-zero speed: switch the fan off
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle was in flight
    Busy,
    /// The session was cleaned up after the cycle was scheduled
    Standby,
    /// No heart rate or power data yet
    NoData,
    Applied(FanSetting),
    Unchanged(FanSetting),
    PoweredOff,
    AlreadyOff,
}

/// Periodic window during which the profile is forced to a vertical sweep
#[derive(Debug, Clone)]
pub struct OverrideWindow {
    frequency: Duration,
    duration: Duration,
    started: Instant,
}

impl OverrideWindow {
    pub fn new(frequency: Duration, duration: Duration, now: Instant) -> Self {
        Self {
            frequency,
            duration,
            started: now,
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.frequency.is_zero()
    }

    /// Whether the override applies at `now`. Once the window has run its
    /// full duration it restarts, so the next call is back to normal.
    pub fn evaluate(&mut self, now: Instant) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let elapsed = now.saturating_duration_since(self.started);
        let active = elapsed >= self.frequency;
        if elapsed >= self.frequency + self.duration {
            self.started = now;
        }
        active
    }

    pub fn restart(&mut self, now: Instant) {
        self.started = now;
    }
}

/// Step offsets by ambient temperature in °F: below 68 slows the fan by one,
/// 68 to 75 leaves it alone, 75 to 80 adds one and 80 or more adds two.
pub fn temperature_offset(temperature_f: Option<f32>) -> i16 {
    match temperature_f {
        Some(t) if t.is_nan() => 0,
        Some(t) if t < 68.0 => -1,
        Some(t) if t < 75.0 => 0,
        Some(t) if t < 80.0 => 1,
        Some(_) => 2,
        None => 0,
    }
}

/// Apply the temperature offset and clamp to the appliance's speed range
pub fn compensate_for_temperature(speed: u8, temperature_f: Option<f32>) -> u8 {
    (i16::from(speed) + temperature_offset(temperature_f))
        .clamp(i16::from(ABSOLUTE_MIN_SPEED), i16::from(ABSOLUTE_MAX_SPEED)) as u8
}

/// Validate blend weights, falling back to an even split
pub fn blend_weights(hr_weight: f64, power_weight: f64) -> (f64, f64) {
    let valid = hr_weight.is_finite()
        && power_weight.is_finite()
        && hr_weight >= 0.0
        && power_weight >= 0.0
        && ((hr_weight + power_weight) - 1.0).abs() < 1e-6;
    if valid {
        (hr_weight, power_weight)
    } else {
        warn!(
            "Fan blend weights {} + {} do not sum to 1, using 0.5 each",
            hr_weight, power_weight
        );
        (0.5, 0.5)
    }
}

struct ControllerState {
    last_applied: Option<FanSetting>,
    override_window: OverrideWindow,
    last_trigger: Option<Instant>,
}

/// Clears the busy flag when dropped, including on error paths
struct BusyGuard<'a> {
    busy: &'a AtomicBool,
    released: &'a Notify,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
        self.released.notify_waiters();
    }
}

pub struct FanProfileController {
    config: FanControlConfig,
    hr_weight: f64,
    power_weight: f64,
    hr_zones: ZoneTable,
    power_zones: ZoneTable,
    sink: Arc<dyn FanSink>,
    faults: Option<FaultReporter>,
    busy: AtomicBool,
    released: Notify,
    /// Bumped by every cleanup; cycles scheduled in an older session are dropped
    session: AtomicU64,
    state: Mutex<ControllerState>,
}

impl FanProfileController {
    pub fn new(
        config: FanControlConfig,
        hr_zones: ZoneTable,
        power_zones: ZoneTable,
        sink: Arc<dyn FanSink>,
    ) -> Self {
        let (hr_weight, power_weight) = blend_weights(config.hr_weight, config.power_weight);
        let override_window = OverrideWindow::new(
            config.override_frequency,
            config.override_duration,
            Instant::now(),
        );
        Self {
            config,
            hr_weight,
            power_weight,
            hr_zones,
            power_zones,
            sink,
            faults: None,
            busy: AtomicBool::new(false),
            released: Notify::new(),
            session: AtomicU64::new(0),
            state: Mutex::new(ControllerState {
                last_applied: None,
                override_window,
                last_trigger: None,
            }),
        }
    }

    /// Report fatal command failures from detached cycles to `faults`
    pub fn with_fault_reporter(mut self, faults: FaultReporter) -> Self {
        self.faults = Some(faults);
        self
    }

    pub fn last_applied(&self) -> Option<FanSetting> {
        self.state().last_applied
    }

    #[cfg(test)]
    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Zone of `value` and the speed it maps to.
    ///
    /// The speed range is divided evenly across the zones; the value's
    /// position inside its zone picks a step within that zone's share.
    pub fn zone_speed(&self, zones: &ZoneTable, value: f64) -> (usize, u8) {
        let zone = zones.classify(value);
        let count = zones.len() as f64;
        let min = f64::from(self.config.min_speed);
        let max = f64::from(self.config.max_speed.max(self.config.min_speed));
        let span = max - min;

        let low = min + (span * (zone - 1) as f64 / count).round();
        let high = min + (span * zone as f64 / count).round();
        let split = (high - low).max(0.0) as u32;
        let offset = zones
            .zone(zone)
            .map(|z| speed_offset(z.min, z.max, value, split))
            .unwrap_or(0);

        let speed = (low + f64::from(offset)).clamp(min, max);
        (zone, speed as u8)
    }

    /// Blended speed before temperature compensation, and whether every
    /// contributing signal sits in its lowest zone
    pub fn base_speed(&self, snapshot: &PerformanceSnapshot) -> Option<(f64, bool)> {
        let hr = snapshot
            .heart_rate
            .map(|s| self.zone_speed(&self.hr_zones, s.smoothed));
        let power = snapshot
            .power
            .map(|s| self.zone_speed(&self.power_zones, s.smoothed));

        match (hr, power) {
            (Some((hr_zone, hr_speed)), Some((power_zone, power_speed))) => Some((
                self.hr_weight * f64::from(hr_speed) + self.power_weight * f64::from(power_speed),
                hr_zone == 1 && power_zone == 1,
            )),
            (Some((zone, speed)), None) | (None, Some((zone, speed))) => {
                Some((f64::from(speed), zone == 1))
            }
            (None, None) => None,
        }
    }

    /// Target setting for `snapshot` at `now`. Advances the override window.
    pub fn decide(
        &self,
        snapshot: &PerformanceSnapshot,
        temperature_f: Option<f32>,
        now: Instant,
    ) -> Option<Decision> {
        let (blended, lowest_zone) = self.base_speed(snapshot)?;
        let speed = blended.round();
        if lowest_zone && speed < 1.0 {
            return Some(Decision::Idle);
        }

        let speed = compensate_for_temperature(speed as u8, temperature_f);
        let mut profile = FanProfile::for_speed(speed);
        if self.state().override_window.evaluate(now) {
            profile = FanProfile::VerticalSweep;
        }
        Some(Decision::Run(FanSetting { profile, speed }))
    }

    /// Schedule a decision cycle as a detached task, unless one ran less
    /// than the update interval ago. Returns whether a cycle was scheduled.
    pub fn trigger(
        self: &Arc<Self>,
        snapshot: PerformanceSnapshot,
        temperature_f: Option<f32>,
    ) -> bool {
        let now = Instant::now();
        {
            let mut state = self.state();
            if let Some(last) = state.last_trigger {
                if now.saturating_duration_since(last) < self.config.update_interval {
                    return false;
                }
            }
            state.last_trigger = Some(now);
        }

        let session = self.session.load(Ordering::Acquire);
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            match controller.cycle(session, snapshot, temperature_f).await {
                Ok(outcome) => debug!("Fan cycle finished: {:?}", outcome),
                Err(e) => match &controller.faults {
                    Some(faults) => faults.report(e),
                    None => error!("Fan cycle failed: {}", e),
                },
            }
        });
        true
    }

    /// One full decision cycle: read state, decide, apply
    pub async fn run_cycle(
        &self,
        snapshot: PerformanceSnapshot,
        temperature_f: Option<f32>,
    ) -> Result<CycleOutcome> {
        let session = self.session.load(Ordering::Acquire);
        self.cycle(session, snapshot, temperature_f).await
    }

    async fn cycle(
        &self,
        session: u64,
        snapshot: PerformanceSnapshot,
        temperature_f: Option<f32>,
    ) -> Result<CycleOutcome> {
        let _guard = match self.try_acquire() {
            Some(guard) => guard,
            None => {
                debug!("Fan adjustment already in progress, dropping trigger");
                return Ok(CycleOutcome::Busy);
            }
        };
        if self.session.load(Ordering::Acquire) != session {
            debug!("Session ended before the fan cycle ran, dropping it");
            return Ok(CycleOutcome::Standby);
        }

        let live = self.fetch_state().await?;
        let temperature_f = temperature_f.or_else(|| live.and_then(|s| s.temperature_f));

        match self.decide(&snapshot, temperature_f, Instant::now()) {
            None => Ok(CycleOutcome::NoData),
            Some(Decision::Idle) => self.power_off(live).await,
            Some(Decision::Run(setting)) => self.apply(live, setting).await,
        }
    }

    /// Switch the fan off and forget the applied setting
    pub async fn clean_up(&self) {
        self.session.fetch_add(1, Ordering::AcqRel);
        let _guard = self.acquire().await;

        let live = match self.fetch_state().await {
            Ok(live) => live,
            Err(e) => {
                warn!("Could not read fan state during cleanup: {}", e);
                None
            }
        };
        if live.map(|s| s.power_on).unwrap_or(true) {
            info!("Powering fan off");
            if let Err(e) = self.set_power(false).await {
                warn!("Failed to power fan off during cleanup: {}", e);
            }
        }

        let mut state = self.state();
        state.last_applied = None;
        state.last_trigger = None;
        state.override_window.restart(Instant::now());
    }

    fn try_acquire(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard {
                busy: &self.busy,
                released: &self.released,
            })
    }

    async fn acquire(&self) -> BusyGuard<'_> {
        loop {
            let released = self.released.notified();
            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            released.await;
        }
    }

    async fn apply(&self, live: Option<FanState>, setting: FanSetting) -> Result<CycleOutcome> {
        let last = self.state().last_applied;
        let powered = live.map(|s| s.power_on).unwrap_or(false);
        let live_speed = live.map(|s| s.wind_level);

        if powered && last == Some(setting) && live_speed == Some(setting.speed) {
            debug!(
                "Fan already at {} profile, speed {}",
                setting.profile, setting.speed
            );
            return Ok(CycleOutcome::Unchanged(setting));
        }

        if !powered {
            info!("Powering fan on");
            self.set_power(true).await?;
            sleep(MIN_SETTLE).await;
        }

        let previous_profile = last.map(|s| s.profile);
        if previous_profile != Some(setting.profile) {
            let params = setting.profile.params();
            let travel = previous_profile
                .map(|p| p.params().travel_to(&params))
                .unwrap_or(FULL_TRAVEL_DEGREES);
            let settle = settle_delay(travel);
            info!("Switching fan to {} profile", setting.profile);

            let sink = &self.sink;
            let id = self.config.device_id.as_str();
            let position = params.position();
            self.with_retry("fan position", move || sink.set_position(id, position)).await?;
            sleep(settle).await;

            let params = &params;
            self.with_retry("fan oscillation", move || sink.set_oscillation(id, params)).await?;
            sleep(settle).await;
        }

        if live_speed != Some(setting.speed) || last.map(|s| s.speed) != Some(setting.speed) {
            info!("Setting fan speed {}", setting.speed);
            let sink = &self.sink;
            let id = self.config.device_id.as_str();
            let speed = setting.speed;
            self.with_retry("fan speed", move || sink.set_speed(id, speed)).await?;
        }

        self.state().last_applied = Some(setting);
        Ok(CycleOutcome::Applied(setting))
    }

    async fn power_off(&self, live: Option<FanState>) -> Result<CycleOutcome> {
        self.state().last_applied = None;
        if !live.map(|s| s.power_on).unwrap_or(true) {
            return Ok(CycleOutcome::AlreadyOff);
        }
        info!("Lowest zone at idle speed, powering fan off");
        self.set_power(false).await?;
        Ok(CycleOutcome::PoweredOff)
    }

    async fn fetch_state(&self) -> Result<Option<FanState>> {
        let sink = &self.sink;
        let id = self.config.device_id.as_str();
        self.with_retry("fan state read", move || sink.get_state(id)).await
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        execute_with_retry(
            what,
            self.config.command_retries,
            self.config.retry_delay,
            operation,
        )
        .await
    }

    async fn set_power(&self, on: bool) -> Result<()> {
        let sink = &self.sink;
        let id = self.config.device_id.as_str();
        self.with_retry("fan power", move || sink.set_power(id, on)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fan::sink::{FanCommand, SimulatedFan};
    use crate::performance::{SignalSnapshot, ZoneBand};

    fn hr_zones() -> ZoneTable {
        let bands = [
            ZoneBand::new(40.0, 60.0),
            ZoneBand::new(60.0, 70.0),
            ZoneBand::new(70.0, 80.0),
            ZoneBand::new(80.0, 90.0),
            ZoneBand::new(90.0, 100.0),
        ];
        ZoneTable::heart_rate(55.0, 180.0, &bands).unwrap()
    }

    fn power_zones() -> ZoneTable {
        let bands = [
            ZoneBand::new(0.0, 55.0),
            ZoneBand::new(55.0, 75.0),
            ZoneBand::new(75.0, 90.0),
            ZoneBand::new(90.0, 105.0),
            ZoneBand::new(105.0, 150.0),
        ];
        ZoneTable::power(200.0, &bands).unwrap()
    }

    fn signal(value: f64) -> SignalSnapshot {
        SignalSnapshot {
            current: value,
            smoothed: value,
            max: value,
            zone: 0,
            time_in_zone: Duration::ZERO,
            average: value,
            samples: 1,
        }
    }

    fn hr_snapshot(bpm: f64) -> PerformanceSnapshot {
        PerformanceSnapshot {
            heart_rate: Some(signal(bpm)),
            ..Default::default()
        }
    }

    fn controller(config: FanControlConfig, fan: Arc<SimulatedFan>) -> FanProfileController {
        FanProfileController::new(config, hr_zones(), power_zones(), fan)
    }

    fn no_override() -> FanControlConfig {
        FanControlConfig {
            override_frequency: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn zone_speeds_cover_range() {
        let c = controller(no_override(), Arc::new(SimulatedFan::new()));
        let zones = hr_zones();
        assert_eq!(c.zone_speed(&zones, 60.0), (1, 1));
        assert_eq!(c.zone_speed(&zones, 129.0), (1, 2));
        assert_eq!(c.zone_speed(&zones, 130.0), (2, 2));
        assert_eq!(c.zone_speed(&zones, 170.0), (5, 6));
        assert_eq!(c.zone_speed(&zones, 180.0), (5, 7));
    }

    #[test]
    fn blends_heart_rate_and_power() {
        let c = controller(no_override(), Arc::new(SimulatedFan::new()));
        let snapshot = PerformanceSnapshot {
            heart_rate: Some(signal(180.0)),
            power: Some(signal(20.0)),
            ..Default::default()
        };
        // 0.5 * 7 + 0.5 * 1
        assert_eq!(c.base_speed(&snapshot), Some((4.0, false)));
    }

    #[test]
    fn bad_weights_fall_back_to_even_split() {
        assert_eq!(blend_weights(0.7, 0.3), (0.7, 0.3));
        assert_eq!(blend_weights(0.7, 0.7), (0.5, 0.5));
        assert_eq!(blend_weights(-0.5, 1.5), (0.5, 0.5));
        assert_eq!(blend_weights(f64::NAN, 0.5), (0.5, 0.5));
    }

    #[test]
    fn temperature_steps() {
        assert_eq!(compensate_for_temperature(7, Some(86.0)), 9);
        assert_eq!(compensate_for_temperature(2, Some(64.0)), 1);
        assert_eq!(compensate_for_temperature(5, Some(70.0)), 5);
        assert_eq!(compensate_for_temperature(5, Some(77.0)), 6);
        assert_eq!(compensate_for_temperature(1, Some(50.0)), 1);
        assert_eq!(compensate_for_temperature(4, None), 4);
    }

    #[test]
    fn no_data_no_decision() {
        let c = controller(no_override(), Arc::new(SimulatedFan::new()));
        assert_eq!(c.decide(&PerformanceSnapshot::default(), None, Instant::now()), None);
    }

    #[test]
    fn lowest_zone_at_zero_speed_idles() {
        let config = FanControlConfig {
            min_speed: 0,
            max_speed: 9,
            ..no_override()
        };
        let c = controller(config, Arc::new(SimulatedFan::new()));
        assert_eq!(c.decide(&hr_snapshot(100.0), None, Instant::now()), Some(Decision::Idle));
        assert!(matches!(
            c.decide(&hr_snapshot(125.0), None, Instant::now()),
            Some(Decision::Run(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn override_window_forces_sweep() {
        let config = FanControlConfig {
            override_frequency: Duration::from_millis(10_000),
            override_duration: Duration::from_millis(5_000),
            ..Default::default()
        };
        let c = controller(config, Arc::new(SimulatedFan::new()));
        let start = Instant::now();
        let snapshot = hr_snapshot(180.0);

        let at = |ms: u64| start + Duration::from_millis(ms);
        assert_eq!(
            c.decide(&snapshot, None, at(9_000)),
            Some(Decision::Run(FanSetting { profile: FanProfile::Widest, speed: 7 }))
        );
        for i in 0..6 {
            let decision = c.decide(&snapshot, None, at(10_500 + i * 1_000));
            assert_eq!(
                decision,
                Some(Decision::Run(FanSetting { profile: FanProfile::VerticalSweep, speed: 7 })),
                "call {}",
                i + 1
            );
        }
        assert_eq!(
            c.decide(&snapshot, None, at(16_500)),
            Some(Decision::Run(FanSetting { profile: FanProfile::Widest, speed: 7 }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_cycle_powers_on_and_sets_everything() {
        let fan = Arc::new(SimulatedFan::new());
        let c = controller(no_override(), fan.clone());
        let outcome = c.run_cycle(hr_snapshot(180.0), None).await.unwrap();
        let expected = FanSetting { profile: FanProfile::Widest, speed: 7 };
        assert_eq!(outcome, CycleOutcome::Applied(expected));
        let params = FanProfile::Widest.params();
        assert_eq!(
            fan.commands(),
            vec![
                FanCommand::Power(true),
                FanCommand::Position(params.position()),
                FanCommand::Oscillation(params),
                FanCommand::Speed(7),
            ]
        );
        assert_eq!(c.last_applied(), Some(expected));
    }

    #[tokio::test(start_paused = true)]
    async fn identical_setting_is_not_resent() {
        let fan = Arc::new(SimulatedFan::new());
        let c = controller(no_override(), fan.clone());
        c.run_cycle(hr_snapshot(150.0), None).await.unwrap();
        let sent = fan.commands().len();
        let outcome = c.run_cycle(hr_snapshot(150.0), None).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Unchanged(_)));
        assert_eq!(fan.commands().len(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_only_change_skips_profile_commands() {
        let fan = Arc::new(SimulatedFan::new());
        let c = controller(no_override(), fan.clone());
        // Both in zone 4, both in the wide bucket: speeds 5 and 6.
        c.run_cycle(hr_snapshot(156.0), None).await.unwrap();
        let sent = fan.commands().len();
        c.run_cycle(hr_snapshot(165.0), None).await.unwrap();
        assert_eq!(&fan.commands()[sent..], &[FanCommand::Speed(6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn appliance_temperature_used_without_ambient_sensor() {
        let fan = Arc::new(SimulatedFan::new());
        fan.set_temperature(Some(86.0));
        let c = controller(no_override(), fan.clone());
        let outcome = c.run_cycle(hr_snapshot(180.0), None).await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Applied(FanSetting { profile: FanProfile::Widest, speed: 9 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_cycle_is_dropped() {
        let fan = Arc::new(SimulatedFan::new().with_latency(Duration::from_millis(200)));
        let c = controller(no_override(), fan.clone());
        let (first, second) = tokio::join!(
            c.run_cycle(hr_snapshot(180.0), None),
            c.run_cycle(hr_snapshot(180.0), None)
        );
        assert!(matches!(first.unwrap(), CycleOutcome::Applied(_)));
        assert_eq!(second.unwrap(), CycleOutcome::Busy);
        assert_eq!(fan.commands().len(), 4);
        assert!(!c.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cycle_releases_busy_flag() {
        let fan = Arc::new(SimulatedFan::new());
        fan.fail_next(3);
        let c = controller(no_override(), fan.clone());
        assert!(c.run_cycle(hr_snapshot(180.0), None).await.is_err());
        assert!(!c.is_busy());
        assert!(c.run_cycle(hr_snapshot(180.0), None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let fan = Arc::new(SimulatedFan::new());
        fan.fail_next(2);
        let c = controller(no_override(), fan.clone());
        assert!(c.run_cycle(hr_snapshot(180.0), None).await.is_ok());
        assert_eq!(fan.commands()[0], FanCommand::Power(true));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_powers_off_once() {
        let fan = Arc::new(SimulatedFan::new());
        let config = FanControlConfig {
            min_speed: 0,
            max_speed: 9,
            ..no_override()
        };
        let c = controller(config, fan.clone());
        c.run_cycle(hr_snapshot(170.0), None).await.unwrap();
        assert_eq!(
            c.run_cycle(hr_snapshot(100.0), None).await.unwrap(),
            CycleOutcome::PoweredOff
        );
        assert_eq!(
            c.run_cycle(hr_snapshot(100.0), None).await.unwrap(),
            CycleOutcome::AlreadyOff
        );
        assert_eq!(fan.commands().last(), Some(&FanCommand::Power(false)));
        assert!(!fan.state().power_on);
        assert_eq!(c.last_applied(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_are_rate_limited() {
        let fan = Arc::new(SimulatedFan::new());
        let c = Arc::new(controller(no_override(), fan.clone()));
        assert!(c.trigger(hr_snapshot(150.0), None));
        assert!(!c.trigger(hr_snapshot(150.0), None));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(c.trigger(hr_snapshot(150.0), None));
    }

    #[tokio::test(start_paused = true)]
    async fn cycle_scheduled_before_clean_up_is_dropped() {
        let fan = Arc::new(SimulatedFan::new());
        let c = Arc::new(controller(no_override(), fan.clone()));
        assert!(c.trigger(hr_snapshot(180.0), None));
        c.clean_up().await;

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(!fan.state().power_on);
        assert!(fan.commands().is_empty());
        assert_eq!(c.last_applied(), None);

        // The next session drives the fan again
        assert!(c.trigger(hr_snapshot(180.0), None));
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(fan.state().power_on);
    }

    #[tokio::test(start_paused = true)]
    async fn clean_up_switches_fan_off() {
        let fan = Arc::new(SimulatedFan::new());
        let c = controller(no_override(), fan.clone());
        c.run_cycle(hr_snapshot(150.0), None).await.unwrap();
        c.clean_up().await;
        assert!(!fan.state().power_on);
        assert_eq!(c.last_applied(), None);

        let sent = fan.commands().len();
        c.clean_up().await;
        assert_eq!(fan.commands().len(), sent);
    }
}
