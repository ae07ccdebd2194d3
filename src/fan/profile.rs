/// Oscillation profiles the fan can be put into
use std::fmt;
use std::time::Duration;

/// Angular speed of the oscillation motor, degrees per second
pub const DEGREES_PER_SECOND: f64 = 5.0;

/// Shortest pause between two commands
pub const MIN_SETTLE: Duration = Duration::from_secs(1);

/// Travel assumed when the previous position is unknown
pub const FULL_TRAVEL_DEGREES: f64 = 180.0;

/// Discrete airflow patterns, from narrow to a full vertical sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FanProfile {
    /// Narrow oscillation centred on the rider
    Focused,
    /// Wider oscillation, still centred
    Wide,
    /// Widest horizontal oscillation
    Widest,
    /// Fixed heading, tilt sweeping up and down
    VerticalSweep,
}

/// Position and oscillation settings for one profile.
///
/// Horizontal angles are in the appliance's 5–355° frame where 180° faces
/// the rider; tilt is relative to level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileParams {
    pub horizontal: (u16, u16),
    pub tilt: (i16, i16),
    pub cruise: bool,
}

impl ProfileParams {
    /// Resting position: centre of the horizontal range, lowest tilt
    pub fn position(&self) -> [i16; 2] {
        let centre = (self.horizontal.0 + self.horizontal.1) / 2;
        [centre as i16, self.tilt.0]
    }

    #[cfg(test)]
    pub fn oscillates_horizontally(&self) -> bool {
        self.horizontal.0 != self.horizontal.1
    }

    #[cfg(test)]
    pub fn oscillates_vertically(&self) -> bool {
        self.tilt.0 != self.tilt.1
    }

    /// Largest single-axis distance the head moves to reach `other`
    pub fn travel_to(&self, other: &ProfileParams) -> f64 {
        let deltas = [
            i32::from(self.horizontal.0) - i32::from(other.horizontal.0),
            i32::from(self.horizontal.1) - i32::from(other.horizontal.1),
            i32::from(self.tilt.0) - i32::from(other.tilt.0),
            i32::from(self.tilt.1) - i32::from(other.tilt.1),
        ];
        deltas.iter().map(|d| d.unsigned_abs()).max().unwrap_or(0) as f64
    }
}

/// Time to wait after commanding `travel` degrees of head movement
pub fn settle_delay(travel_degrees: f64) -> Duration {
    Duration::from_secs_f64(travel_degrees / DEGREES_PER_SECOND).max(MIN_SETTLE)
}

impl FanProfile {
    pub fn params(&self) -> ProfileParams {
        match self {
            Self::Focused => ProfileParams {
                horizontal: (160, 200),
                tilt: (0, 0),
                cruise: false,
            },
            Self::Wide => ProfileParams {
                horizontal: (135, 225),
                tilt: (0, 0),
                cruise: false,
            },
            Self::Widest => ProfileParams {
                horizontal: (90, 270),
                tilt: (0, 0),
                cruise: false,
            },
            Self::VerticalSweep => ProfileParams {
                horizontal: (180, 180),
                tilt: (-20, 10),
                cruise: true,
            },
        }
    }

    /// Speed buckets: 1–3 focused, 4–6 wide, 7 and above widest
    pub fn for_speed(speed: u8) -> Self {
        match speed {
            0..=3 => Self::Focused,
            4..=6 => Self::Wide,
            _ => Self::Widest,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Focused => "focused",
            Self::Wide => "wide",
            Self::Widest => "widest",
            Self::VerticalSweep => "vertical-sweep",
        }
    }
}

impl fmt::Display for FanProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
