/// Aggregation of raw performance readings into zone, average and load metrics
use log::{debug, info};
use std::collections::VecDeque;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::models::SensorReading;
use crate::performance::smoothing::{RollingWindow, Smoother, SmoothingMode};
use crate::performance::zones::ZoneTable;
use crate::utils::format_datetime;

/// Gaps longer than this are treated as a paused or resumed session
pub const MAX_SAMPLE_GAP: Duration = Duration::from_secs(5);

const NP_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the aggregator needs to know about the athlete
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub hr_zones: ZoneTable,
    pub power_zones: ZoneTable,
    pub cadence_zones: ZoneTable,
    pub hr_rest: f64,
    pub ftp: f64,
    pub smoothing: SmoothingMode,
    pub np_window: Duration,
    pub recent_np_samples: usize,
}

/// Outcome of feeding one reading to the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Accepted,
    Duplicate,
    Invalid,
}

/// Point-in-time view of one signal
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSnapshot {
    pub current: f64,
    pub smoothed: f64,
    pub max: f64,
    pub zone: usize,
    pub time_in_zone: Duration,
    pub average: f64,
    pub samples: u64,
}

/// Point-in-time view of the whole session, handed to the fan controller
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PerformanceSnapshot {
    pub heart_rate: Option<SignalSnapshot>,
    pub power: Option<SignalSnapshot>,
    pub cadence: Option<SignalSnapshot>,
    pub normalized_power: f64,
    pub recent_normalized_power: f64,
    pub intensity_factor: f64,
    pub training_stress_score: f64,
}

#[derive(Debug, Clone)]
struct SignalState {
    zones: ZoneTable,
    smoother: Smoother,
    last_counter: Option<u32>,
    current: f64,
    max: f64,
    zone: usize,
    zone_entered_at: Option<Instant>,
    time_in_zone: Duration,
    cumulative: f64,
    elapsed: Duration,
    last_sample_at: Option<Instant>,
    samples: u64,
}

impl SignalState {
    fn new(zones: ZoneTable, smoother: Smoother) -> Self {
        Self {
            zones,
            smoother,
            last_counter: None,
            current: 0.0,
            max: 0.0,
            zone: 0,
            zone_entered_at: None,
            time_in_zone: Duration::ZERO,
            cumulative: 0.0,
            elapsed: Duration::ZERO,
            last_sample_at: None,
            samples: 0,
        }
    }

    fn accept(&mut self, counter: u32, value: f64, now: Instant) {
        self.last_counter = Some(counter);
        self.current = value;
        self.max = self.max.max(value);
        self.smoother.update(value);
        self.samples += 1;

        let zone = self.zones.classify(value);
        if zone != self.zone {
            self.zone = zone;
            self.zone_entered_at = Some(now);
            self.time_in_zone = Duration::ZERO;
        } else if let Some(entered) = self.zone_entered_at {
            self.time_in_zone = now.saturating_duration_since(entered);
        }

        if let Some(last) = self.last_sample_at {
            let dt = now.saturating_duration_since(last);
            if !dt.is_zero() && dt <= MAX_SAMPLE_GAP {
                self.cumulative += value * dt.as_secs_f64();
                self.elapsed += dt;
            }
        }
        self.last_sample_at = Some(now);
    }

    fn average(&self) -> f64 {
        if self.elapsed.is_zero() {
            return 0.0;
        }
        self.cumulative / self.elapsed.as_secs_f64()
    }

    fn snapshot(&self) -> Option<SignalSnapshot> {
        (self.samples > 0).then(|| SignalSnapshot {
            current: self.current,
            smoothed: self.smoother.value(),
            max: self.max,
            zone: self.zone,
            time_in_zone: self.time_in_zone,
            average: self.average(),
            samples: self.samples,
        })
    }

    fn reset(&mut self) {
        let zones = self.zones.clone();
        let mut smoother = self.smoother.clone();
        smoother.reset();
        *self = Self::new(zones, smoother);
    }
}

/// Rolling-window normalized power, sampled at most once per second
#[derive(Debug, Clone)]
struct NormalizedPower {
    window: Duration,
    buffer: VecDeque<(Instant, f64)>,
    last_sampled_at: Option<Instant>,
    fourth_sum: f64,
    count: u64,
    elapsed: Duration,
    recent: RollingWindow,
}

impl NormalizedPower {
    fn new(window: Duration, recent_samples: usize) -> Self {
        Self {
            window,
            buffer: VecDeque::new(),
            last_sampled_at: None,
            fourth_sum: 0.0,
            count: 0,
            elapsed: Duration::ZERO,
            recent: RollingWindow::new(recent_samples),
        }
    }

    fn push(&mut self, now: Instant, watts: f64) {
        self.buffer.push_back((now, watts));
        while let Some(&(at, _)) = self.buffer.front() {
            if now.saturating_duration_since(at) > self.window {
                self.buffer.pop_front();
            } else {
                break;
            }
        }

        let due = match self.last_sampled_at {
            Some(last) => now.saturating_duration_since(last) >= NP_SAMPLE_INTERVAL,
            None => true,
        };
        if !due {
            return;
        }

        let mean = self.buffer.iter().map(|&(_, w)| w).sum::<f64>() / self.buffer.len() as f64;
        self.fourth_sum += mean.powi(4);
        self.count += 1;
        self.recent.add(mean);

        if let Some(last) = self.last_sampled_at {
            let dt = now.saturating_duration_since(last);
            if dt <= MAX_SAMPLE_GAP {
                self.elapsed += dt;
            }
        }
        self.last_sampled_at = Some(now);
    }

    fn normalized(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.fourth_sum / self.count as f64).powf(0.25)
    }

    fn intensity_factor(&self, ftp: f64) -> f64 {
        if ftp <= 0.0 {
            return 0.0;
        }
        self.normalized() / ftp
    }

    fn training_stress_score(&self, ftp: f64) -> f64 {
        if ftp <= 0.0 {
            return 0.0;
        }
        let np = self.normalized();
        (self.elapsed.as_secs_f64() * np * self.intensity_factor(ftp)) / (ftp * 3600.0) * 100.0
    }

    fn reset(&mut self) {
        *self = Self::new(self.window, self.recent_capacity());
    }

    fn recent_capacity(&self) -> usize {
        self.recent.capacity()
    }
}

/// Per-session accumulator for heart rate, power and cadence
#[derive(Debug, Clone)]
pub struct PerformanceAggregator {
    ftp: f64,
    heart_rate: SignalState,
    power: SignalState,
    cadence: SignalState,
    normalized: NormalizedPower,
    session_started: Option<OffsetDateTime>,
}

impl PerformanceAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            ftp: config.ftp,
            heart_rate: SignalState::new(
                config.hr_zones,
                Smoother::new(config.smoothing, config.hr_rest),
            ),
            power: SignalState::new(config.power_zones, Smoother::new(config.smoothing, 0.0)),
            cadence: SignalState::new(config.cadence_zones, Smoother::new(config.smoothing, 0.0)),
            normalized: NormalizedPower::new(config.np_window, config.recent_np_samples),
            session_started: None,
        }
    }

    /// Feed one reading taken at `now`
    pub fn ingest(&mut self, reading: &SensorReading, now: Instant) -> Ingest {
        let counter = reading.counter();
        let value = reading.value();
        let signal = match reading {
            SensorReading::HeartRate { .. } => &mut self.heart_rate,
            SensorReading::Power { .. } => &mut self.power,
            SensorReading::Cadence { .. } => &mut self.cadence,
        };

        if value.is_nan() {
            debug!("Discarding {} reading: value is NaN", reading.profile());
            return Ingest::Invalid;
        }
        if signal.last_counter == Some(counter) {
            debug!(
                "Discarding duplicate {} reading (counter {})",
                reading.profile(),
                counter
            );
            return Ingest::Duplicate;
        }

        signal.accept(counter, value, now);
        if let SensorReading::Power { watts, .. } = reading {
            self.normalized.push(now, *watts);
        }
        if self.session_started.is_none() {
            self.session_started = Some(OffsetDateTime::now_utc());
        }
        Ingest::Accepted
    }

    pub fn snapshot(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            heart_rate: self.heart_rate.snapshot(),
            power: self.power.snapshot(),
            cadence: self.cadence.snapshot(),
            normalized_power: self.normalized.normalized(),
            recent_normalized_power: self.normalized.recent.normalized(),
            intensity_factor: self.normalized.intensity_factor(self.ftp),
            training_stress_score: self.normalized.training_stress_score(self.ftp),
        }
    }

    #[cfg(test)]
    fn has_samples(&self) -> bool {
        self.session_started.is_some()
    }

    /// Log the session summary (if anything was recorded) and reset all state
    pub fn clean_up(&mut self) {
        if let Some(started) = self.session_started {
            self.session_summary(started);
        }
        self.heart_rate.reset();
        self.power.reset();
        self.cadence.reset();
        self.normalized.reset();
        self.session_started = None;
    }

    fn session_summary(&self, started: OffsetDateTime) {
        let snapshot = self.snapshot();
        info!(
            "Session {} until {}:",
            format_datetime(&started),
            format_datetime(&OffsetDateTime::now_utc())
        );
        for (name, unit, signal) in [
            ("heart rate", "bpm", snapshot.heart_rate),
            ("power", "W", snapshot.power),
            ("cadence", "rpm", snapshot.cadence),
        ] {
            if let Some(s) = signal {
                info!(
                    "  Average {}: {:.0} {} (max {:.0}, {} samples)",
                    name, s.average, unit, s.max, s.samples
                );
            }
        }
        if snapshot.power.is_some() {
            info!("  Normalized power: {:.0} W", snapshot.normalized_power);
            info!("  Intensity factor: {:.2}", snapshot.intensity_factor);
            info!("  Training stress score: {:.1}", snapshot.training_stress_score);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performance::zones::ZoneBand;

    fn config() -> AggregatorConfig {
        let hr_bands = [
            ZoneBand::new(40.0, 60.0),
            ZoneBand::new(60.0, 70.0),
            ZoneBand::new(70.0, 80.0),
            ZoneBand::new(80.0, 90.0),
            ZoneBand::new(90.0, 100.0),
        ];
        let power_bands = [
            ZoneBand::new(0.0, 55.0),
            ZoneBand::new(55.0, 75.0),
            ZoneBand::new(75.0, 90.0),
            ZoneBand::new(90.0, 105.0),
            ZoneBand::new(105.0, 150.0),
        ];
        AggregatorConfig {
            hr_zones: ZoneTable::heart_rate(55.0, 180.0, &hr_bands).unwrap(),
            power_zones: ZoneTable::power(200.0, &power_bands).unwrap(),
            cadence_zones: ZoneTable::power(90.0, &power_bands).unwrap(),
            hr_rest: 55.0,
            ftp: 200.0,
            smoothing: SmoothingMode::Ema {
                alpha_up: 0.5,
                alpha_down: 0.1,
            },
            np_window: Duration::from_secs(30),
            recent_np_samples: 300,
        }
    }

    fn hr(beat_count: u32, bpm: f64) -> SensorReading {
        SensorReading::HeartRate { beat_count, bpm }
    }

    fn power(event_count: u32, watts: f64) -> SensorReading {
        SensorReading::Power { event_count, watts }
    }

    #[test]
    fn repeated_counter_is_discarded() {
        let mut agg = PerformanceAggregator::new(config());
        let t0 = Instant::now();
        assert_eq!(agg.ingest(&hr(1, 120.0), t0), Ingest::Accepted);
        let before = agg.snapshot();
        assert_eq!(agg.ingest(&hr(1, 150.0), t0 + Duration::from_secs(1)), Ingest::Duplicate);
        assert_eq!(agg.snapshot(), before);
    }

    #[test]
    fn nan_is_discarded() {
        let mut agg = PerformanceAggregator::new(config());
        assert_eq!(agg.ingest(&hr(1, f64::NAN), Instant::now()), Ingest::Invalid);
        assert_eq!(agg.snapshot().heart_rate, None);
        assert!(!agg.has_samples());
    }

    #[test]
    fn signals_are_deduplicated_independently() {
        let mut agg = PerformanceAggregator::new(config());
        let t0 = Instant::now();
        assert_eq!(agg.ingest(&hr(7, 120.0), t0), Ingest::Accepted);
        assert_eq!(agg.ingest(&power(7, 150.0), t0), Ingest::Accepted);
    }

    #[test]
    fn time_weighted_average_skips_long_gaps() {
        let mut agg = PerformanceAggregator::new(config());
        let t0 = Instant::now();
        agg.ingest(&power(1, 100.0), t0);
        agg.ingest(&power(2, 200.0), t0 + Duration::from_secs(1));
        agg.ingest(&power(3, 300.0), t0 + Duration::from_secs(3));
        // Resumed after a ten second pause: not counted.
        agg.ingest(&power(4, 1000.0), t0 + Duration::from_secs(13));

        let p = agg.snapshot().power.unwrap();
        // (200 * 1 + 300 * 2) / 3
        assert!((p.average - 800.0 / 3.0).abs() < 1e-9);
        assert_eq!(p.max, 1000.0);
        assert_eq!(p.samples, 4);
    }

    #[test]
    fn zone_timer_resets_on_zone_change() {
        let mut agg = PerformanceAggregator::new(config());
        let t0 = Instant::now();
        agg.ingest(&hr(1, 110.0), t0);
        agg.ingest(&hr(2, 115.0), t0 + Duration::from_secs(2));
        let s = agg.snapshot().heart_rate.unwrap();
        assert_eq!(s.zone, 1);
        assert_eq!(s.time_in_zone, Duration::from_secs(2));

        agg.ingest(&hr(3, 135.0), t0 + Duration::from_secs(3));
        let s = agg.snapshot().heart_rate.unwrap();
        assert_eq!(s.zone, 2);
        assert_eq!(s.time_in_zone, Duration::ZERO);
    }

    #[test]
    fn heart_rate_smoothing_starts_from_rest() {
        let mut agg = PerformanceAggregator::new(config());
        agg.ingest(&hr(1, 155.0), Instant::now());
        // 0.5 * 155 + 0.5 * 55
        assert_eq!(agg.snapshot().heart_rate.unwrap().smoothed, 105.0);
    }

    #[test]
    fn steady_power_normalizes_to_itself() {
        let mut agg = PerformanceAggregator::new(config());
        let t0 = Instant::now();
        for i in 0..60u32 {
            agg.ingest(&power(i, 200.0), t0 + Duration::from_secs(u64::from(i)));
        }
        let s = agg.snapshot();
        assert!((s.normalized_power - 200.0).abs() < 1e-6);
        assert!((s.recent_normalized_power - 200.0).abs() < 1e-6);
        assert!((s.intensity_factor - 1.0).abs() < 1e-9);
        // 59 s at IF 1.0: 59 / 3600 * 100
        assert!((s.training_stress_score - 59.0 / 36.0).abs() < 1e-6);
    }

    #[test]
    fn normalized_power_sampled_at_most_once_per_second() {
        let mut agg = PerformanceAggregator::new(config());
        let t0 = Instant::now();
        agg.ingest(&power(1, 100.0), t0);
        agg.ingest(&power(2, 300.0), t0 + Duration::from_millis(250));
        agg.ingest(&power(3, 300.0), t0 + Duration::from_millis(500));
        assert!((agg.snapshot().normalized_power - 100.0).abs() < 1e-9);
    }

    #[test]
    fn zero_ftp_gives_zero_intensity() {
        let mut cfg = config();
        cfg.ftp = 0.0;
        let mut agg = PerformanceAggregator::new(cfg);
        agg.ingest(&power(1, 250.0), Instant::now());
        let s = agg.snapshot();
        assert_eq!(s.intensity_factor, 0.0);
        assert_eq!(s.training_stress_score, 0.0);
    }

    #[test]
    fn clean_up_is_idempotent() {
        let mut agg = PerformanceAggregator::new(config());
        let t0 = Instant::now();
        agg.ingest(&hr(1, 150.0), t0);
        agg.ingest(&power(1, 150.0), t0);
        agg.clean_up();
        let first = agg.snapshot();
        agg.clean_up();
        assert_eq!(agg.snapshot(), first);
        assert_eq!(first, PerformanceSnapshot::default());

        // Counters are forgotten too, so the same counter is accepted again.
        assert_eq!(agg.ingest(&hr(1, 150.0), t0), Ingest::Accepted);
    }
}
