/// Smoothing primitives for noisy sensor signals
use std::collections::VecDeque;

/// Fixed-capacity rolling window over the most recent values.
///
/// Keeps running sums of `v` and `v^4` so that `add` and both averages are
/// O(1). The 4th-power mean is what normalized-power style metrics need; the
/// caller takes the 4th root (or uses [`RollingWindow::normalized`]).
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    values: VecDeque<f64>,
    sum: f64,
    sum_fourth: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
            sum: 0.0,
            sum_fourth: 0.0,
        }
    }

    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.values.len() == self.capacity {
            if let Some(oldest) = self.values.pop_front() {
                self.sum -= oldest;
                self.sum_fourth -= oldest.powi(4);
            }
        }
        self.values.push_back(value);
        self.sum += value;
        self.sum_fourth += value.powi(4);
    }

    /// Arithmetic mean, 0 when empty
    pub fn average(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.sum / self.values.len() as f64
    }

    /// Mean of v^4, 0 when empty
    pub fn average_fourth_power(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        // Running subtraction can leave a tiny negative residue.
        (self.sum_fourth / self.values.len() as f64).max(0.0)
    }

    pub fn normalized(&self) -> f64 {
        self.average_fourth_power().powf(0.25)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.sum = 0.0;
        self.sum_fourth = 0.0;
    }
}

/// Asymmetric exponential smoothing of a physiological signal.
///
/// Rises quickly (`alpha_up`) and falls slowly (`alpha_down`), which models
/// how body heat lags behind a drop in effort. The internal state is kept at
/// full precision; [`SmoothedSample::value`] rounds to whole units.
#[derive(Debug, Clone)]
pub struct SmoothedSample {
    baseline: f64,
    last_raw: f64,
    output: f64,
    updates: u64,
    alpha_up: f64,
    alpha_down: f64,
}

impl SmoothedSample {
    pub fn new(baseline: f64, alpha_up: f64, alpha_down: f64) -> Self {
        Self {
            baseline,
            last_raw: baseline,
            output: baseline,
            updates: 0,
            alpha_up: alpha_up.clamp(0.0, 1.0),
            alpha_down: alpha_down.clamp(0.0, 1.0),
        }
    }

    /// Feed a raw value and return the new rounded output
    pub fn update(&mut self, value: f64) -> f64 {
        if !value.is_finite() {
            return self.value();
        }
        let alpha = if value > self.output {
            self.alpha_up
        } else {
            self.alpha_down
        };
        self.output = alpha * value + (1.0 - alpha) * self.output;
        self.last_raw = value;
        self.updates += 1;
        self.value()
    }

    pub fn value(&self) -> f64 {
        self.output.round()
    }

    pub fn last_raw(&self) -> f64 {
        self.last_raw
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn reset(&mut self) {
        self.last_raw = self.baseline;
        self.output = self.baseline;
        self.updates = 0;
    }
}

/// Which smoothing strategy a signal uses
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmoothingMode {
    Ema { alpha_up: f64, alpha_down: f64 },
    Window { size: usize },
}

/// A signal smoother, either the asymmetric EMA or a plain rolling mean
#[derive(Debug, Clone)]
pub enum Smoother {
    Ema(SmoothedSample),
    Window { baseline: f64, window: RollingWindow },
}

impl Smoother {
    pub fn new(mode: SmoothingMode, baseline: f64) -> Self {
        match mode {
            SmoothingMode::Ema {
                alpha_up,
                alpha_down,
            } => Self::Ema(SmoothedSample::new(baseline, alpha_up, alpha_down)),
            SmoothingMode::Window { size } => Self::Window {
                baseline,
                window: RollingWindow::new(size),
            },
        }
    }

    pub fn update(&mut self, value: f64) -> f64 {
        match self {
            Self::Ema(sample) => sample.update(value),
            Self::Window { window, .. } => {
                window.add(value);
                self.value()
            }
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            Self::Ema(sample) => sample.value(),
            Self::Window { baseline, window } if window.is_empty() => baseline.round(),
            Self::Window { window, .. } => window.average().round(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            Self::Ema(sample) => sample.reset(),
            Self::Window { window, .. } => window.clear(),
        }
    }
}
