/// Heart rate and power zone tables
use crate::error::ConfigError;

/// One configured zone band, as percentages of the reserve (HR) or of FTP
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoneBand {
    pub min_pct: f64,
    pub max_pct: f64,
}

impl ZoneBand {
    pub const fn new(min_pct: f64, max_pct: f64) -> Self {
        Self { min_pct, max_pct }
    }
}

/// Absolute bounds of a single zone, in the signal's native units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Zone {
    pub min: f64,
    pub max: f64,
}

/// Ordered, contiguous zone ranges. Zone `i + 1` starts exactly where zone `i`
/// ends, so every value maps to exactly one zone.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneTable {
    zones: Vec<Zone>,
}

impl ZoneTable {
    /// Build zones with the Karvonen transform:
    /// `bound = rest + pct * (max - rest) / 100`.
    ///
    /// Dividing last keeps integer bounds exact, so a whole-number reading
    /// on a zone edge classifies into the zone that starts there.
    ///
    /// Each zone's lower bound is taken from the previous zone's upper bound
    /// rather than from its own band, which keeps the table free of gaps and
    /// overlaps when bands are written with rounded edges.
    pub fn build(rest: f64, max: f64, bands: &[ZoneBand]) -> Result<Self, ConfigError> {
        if bands.is_empty() {
            return Err(ConfigError::EmptyZones);
        }
        if !(max > rest) {
            return Err(ConfigError::BadReference { rest, max });
        }

        let bound = |pct: f64| rest + pct * (max - rest) / 100.0;
        let mut zones: Vec<Zone> = Vec::with_capacity(bands.len());

        for (i, band) in bands.iter().enumerate() {
            let min = match zones.last() {
                Some(previous) => previous.max,
                None => bound(band.min_pct),
            };
            let zone = Zone {
                min,
                max: bound(band.max_pct),
            };
            if !(zone.max > zone.min) {
                return Err(ConfigError::NonIncreasing {
                    zone: i + 1,
                    min: zone.min,
                    max: zone.max,
                });
            }
            zones.push(zone);
        }

        Ok(Self { zones })
    }

    /// Heart rate zones from resting and maximum heart rate
    pub fn heart_rate(
        rest_bpm: f64,
        max_bpm: f64,
        bands: &[ZoneBand],
    ) -> Result<Self, ConfigError> {
        Self::build(rest_bpm, max_bpm, bands)
    }

    /// Power zones as a percentage of FTP
    pub fn power(ftp: f64, bands: &[ZoneBand]) -> Result<Self, ConfigError> {
        Self::build(0.0, ftp, bands)
    }

    /// 1-based zone index for `value`.
    ///
    /// A value exactly on a boundary belongs to the zone that starts there.
    /// Values below zone 1 clamp to 1, values at or above the top clamp to N.
    pub fn classify(&self, value: f64) -> usize {
        if value.is_nan() || value < self.zones[0].min {
            return 1;
        }
        self.zones
            .iter()
            .position(|zone| value < zone.max)
            .map(|i| i + 1)
            .unwrap_or(self.zones.len())
    }

    /// Bounds of the 1-based zone `index`
    pub fn zone(&self, index: usize) -> Option<&Zone> {
        index.checked_sub(1).and_then(|i| self.zones.get(i))
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn bounds(&self) -> Vec<[f64; 2]> {
        self.zones.iter().map(|z| [z.min, z.max]).collect()
    }
}

/// Split `[zone_min, zone_max]` into `split + 1` equal-width fractions and
/// return the fraction `value` falls into, clamped to `[0, split]`.
pub fn speed_offset(zone_min: f64, zone_max: f64, value: f64, split: u32) -> u32 {
    if split < 1 || value.is_nan() {
        return 0;
    }
    let width = zone_max - zone_min;
    if width <= 0.0 {
        return if value >= zone_max { split } else { 0 };
    }
    let fraction = ((value - zone_min) * f64::from(split + 1) / width).floor();
    fraction.clamp(0.0, f64::from(split)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hr_bands() -> Vec<ZoneBand> {
        vec![
            ZoneBand::new(40.0, 60.0),
            ZoneBand::new(60.0, 70.0),
            ZoneBand::new(70.0, 80.0),
            ZoneBand::new(80.0, 90.0),
            ZoneBand::new(90.0, 100.0),
        ]
    }

    #[test]
    fn karvonen_bounds_for_rest_55_max_180() {
        let table = ZoneTable::heart_rate(55.0, 180.0, &hr_bands()).unwrap();
        assert_eq!(
            table.bounds(),
            vec![
                [105.0, 130.0],
                [130.0, 142.5],
                [142.5, 155.0],
                [155.0, 167.5],
                [167.5, 180.0],
            ]
        );
    }

    #[test]
    fn boundary_belongs_to_upper_zone() {
        let table = ZoneTable::heart_rate(55.0, 180.0, &hr_bands()).unwrap();
        assert_eq!(table.classify(129.0), 1);
        assert_eq!(table.classify(130.0), 2);
        assert_eq!(table.classify(142.5 - 1.0), 2);
        assert_eq!(table.classify(142.5), 3);
    }

    #[test]
    fn classify_clamps_outside_table() {
        let table = ZoneTable::heart_rate(55.0, 180.0, &hr_bands()).unwrap();
        assert_eq!(table.classify(40.0), 1);
        assert_eq!(table.classify(180.0), 5);
        assert_eq!(table.classify(220.0), 5);
        assert_eq!(table.classify(f64::NAN), 1);
    }

    #[test]
    fn gaps_between_bands_are_closed() {
        // 55-75 then 76-90: the second zone must start at 75 % of FTP, not 76 %.
        let bands = [
            ZoneBand::new(0.0, 55.0),
            ZoneBand::new(56.0, 75.0),
            ZoneBand::new(76.0, 90.0),
        ];
        let table = ZoneTable::power(200.0, &bands).unwrap();
        assert_eq!(
            table.bounds(),
            vec![[0.0, 110.0], [110.0, 150.0], [150.0, 180.0]]
        );
    }

    #[test]
    fn whole_number_on_lower_edge_starts_the_zone() {
        let bands = [
            ZoneBand::new(0.0, 55.0),
            ZoneBand::new(55.0, 75.0),
            ZoneBand::new(75.0, 90.0),
        ];
        let table = ZoneTable::power(200.0, &bands).unwrap();
        assert_eq!(table.zone(2).map(|z| z.min), Some(110.0));
        assert_eq!(table.classify(109.0), 1);
        assert_eq!(table.classify(110.0), 2);
        assert_eq!(table.classify(150.0), 3);

        // 67 % of 90 rpm
        let cadence_bands = [ZoneBand::new(0.0, 67.0), ZoneBand::new(67.0, 89.0)];
        let cadence = ZoneTable::power(90.0, &cadence_bands).unwrap();
        assert_eq!(cadence.classify(60.3), 2);
    }

    #[test]
    fn rejects_empty_and_inverted_tables() {
        assert_eq!(ZoneTable::power(250.0, &[]), Err(ConfigError::EmptyZones));
        assert!(matches!(
            ZoneTable::heart_rate(180.0, 55.0, &hr_bands()),
            Err(ConfigError::BadReference { .. })
        ));
        let bands = [ZoneBand::new(0.0, 60.0), ZoneBand::new(60.0, 50.0)];
        assert!(matches!(
            ZoneTable::power(250.0, &bands),
            Err(ConfigError::NonIncreasing { zone: 2, .. })
        ));
    }

    #[test]
    fn zone_lookup_is_one_based() {
        let table = ZoneTable::heart_rate(55.0, 180.0, &hr_bands()).unwrap();
        assert_eq!(table.zone(0), None);
        assert_eq!(table.zone(1), Some(&Zone { min: 105.0, max: 130.0 }));
        assert_eq!(table.zone(6), None);
    }

    #[test]
    fn speed_offset_splits_range() {
        assert_eq!(speed_offset(0.0, 90.0, 10.0, 2), 0);
        assert_eq!(speed_offset(0.0, 90.0, 30.0, 2), 1);
        assert_eq!(speed_offset(0.0, 90.0, 89.0, 2), 2);
        assert_eq!(speed_offset(0.0, 90.0, 500.0, 2), 2);
        assert_eq!(speed_offset(0.0, 90.0, -5.0, 2), 0);
    }

    #[test]
    fn speed_offset_without_split_is_zero() {
        for value in [0.0, 45.0, 90.0, 1000.0] {
            assert_eq!(speed_offset(0.0, 90.0, value, 0), 0);
        }
    }
}
