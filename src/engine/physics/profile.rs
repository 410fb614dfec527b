// ABOUTME: Basin geometry profile mapping between storage volume, water level, and wetted area
// ABOUTME: Level-from-storage inverts the integral of area over level segment by segment

use crate::engine::core::error::ValidationIssue;
use crate::engine::core::math::Dual;

/// Slope magnitude below which a profile segment is treated as having
/// constant area, avoiding an ill-conditioned quadratic inversion.
const FLAT_SEGMENT_SLOPE: f64 = 1e-12;

/// Monotone piecewise-linear basin geometry: at each breakpoint a level
/// [m], the wetted area [m²] at that level, and the storage [m³] below it.
/// Storage is the exact integral of area over level, so the two lookups
/// `level_from_storage` and `storage_from_level` are mutual inverses.
#[derive(Debug, Clone)]
pub struct BasinProfile {
    levels: Vec<f64>,
    areas: Vec<f64>,
    storages: Vec<f64>,
}

impl BasinProfile {
    /// Build a profile. When `storages` is omitted it is derived by
    /// trapezoidal integration of area over level.
    pub fn new(
        levels: Vec<f64>,
        areas: Vec<f64>,
        storages: Option<Vec<f64>>,
        context: &str,
        issues: &mut Vec<ValidationIssue>,
    ) -> Option<Self> {
        let mut ok = true;
        if levels.len() < 2 || levels.len() != areas.len() {
            issues.push(ValidationIssue::TableTooShort {
                node: context.to_string(),
                min: 2,
                actual: levels.len().min(areas.len()),
            });
            return None;
        }
        if levels.windows(2).any(|w| w[1] <= w[0]) {
            issues.push(ValidationIssue::ProfileLevelsNotIncreasing {
                node: context.to_string(),
            });
            ok = false;
        }
        if areas.windows(2).any(|w| w[1] < w[0]) {
            issues.push(ValidationIssue::ProfileAreasDecreasing {
                node: context.to_string(),
            });
            ok = false;
        }
        if areas[0] <= 0.0 {
            issues.push(ValidationIssue::ProfileZeroBottomArea {
                node: context.to_string(),
                area: areas[0],
            });
            ok = false;
        }
        if !ok {
            return None;
        }
        let storages = storages.unwrap_or_else(|| {
            let mut acc = vec![0.0];
            for i in 1..levels.len() {
                let dh = levels[i] - levels[i - 1];
                let slab = 0.5 * (areas[i] + areas[i - 1]) * dh;
                acc.push(acc[i - 1] + slab);
            }
            acc
        });
        Some(Self {
            levels,
            areas,
            storages,
        })
    }

    pub fn bottom_level(&self) -> f64 {
        self.levels[0]
    }

    /// Largest tabulated area; precipitation falls on this footprint.
    pub fn max_area(&self) -> f64 {
        *self.areas.last().unwrap()
    }

    pub fn max_storage(&self) -> f64 {
        *self.storages.last().unwrap()
    }

    /// Wetted area at a level. Constant beyond the table on both sides.
    pub fn area_from_level(&self, level: f64) -> f64 {
        let n = self.levels.len();
        if level <= self.levels[0] {
            return self.areas[0];
        }
        if level >= self.levels[n - 1] {
            return self.areas[n - 1];
        }
        let i = self.level_segment(level);
        let frac = (level - self.levels[i]) / (self.levels[i + 1] - self.levels[i]);
        self.areas[i] + frac * (self.areas[i + 1] - self.areas[i])
    }

    /// Storage below a level: exact integral of `area_from_level`,
    /// quadratic within a segment, linear with the top area above the
    /// table and with the bottom area below it (negative storages appear
    /// only transiently inside the solver).
    pub fn storage_from_level(&self, level: f64) -> f64 {
        let n = self.levels.len();
        if level <= self.levels[0] {
            return (level - self.levels[0]) * self.areas[0];
        }
        if level >= self.levels[n - 1] {
            return self.storages[n - 1] + (level - self.levels[n - 1]) * self.areas[n - 1];
        }
        let i = self.level_segment(level);
        let dh = level - self.levels[i];
        let slope = (self.areas[i + 1] - self.areas[i]) / (self.levels[i + 1] - self.levels[i]);
        self.storages[i] + self.areas[i] * dh + 0.5 * slope * dh * dh
    }

    /// Water level at a storage: inverse of `storage_from_level`.
    pub fn level_from_storage(&self, storage: f64) -> f64 {
        let n = self.storages.len();
        if storage <= 0.0 {
            return self.levels[0] + storage / self.areas[0];
        }
        if storage >= self.storages[n - 1] {
            return self.levels[n - 1] + (storage - self.storages[n - 1]) / self.areas[n - 1];
        }
        let i = self.storage_segment(storage);
        let excess = storage - self.storages[i];
        let a0 = self.areas[i];
        let slope = (self.areas[i + 1] - self.areas[i]) / (self.levels[i + 1] - self.levels[i]);
        let dh = if slope.abs() < FLAT_SEGMENT_SLOPE {
            excess / a0
        } else {
            // Solve a0*dh + slope*dh^2/2 = excess for the positive root.
            (-a0 + (a0 * a0 + 2.0 * slope * excess).sqrt()) / slope
        };
        self.levels[i] + dh
    }

    /// Level as a dual number: dh/dS = 1 / area(h).
    pub fn level_from_storage_dual(&self, storage: Dual) -> Dual {
        let level = self.level_from_storage(storage.re);
        let area = self.area_from_level(level);
        Dual {
            re: level,
            eps: storage.eps / area,
        }
    }

    /// Area as a dual number in the level argument; constant (zero
    /// slope) outside the table.
    pub fn area_from_level_dual(&self, level: Dual) -> Dual {
        let n = self.levels.len();
        let re = self.area_from_level(level.re);
        if level.re <= self.levels[0] || level.re >= self.levels[n - 1] {
            return Dual { re, eps: 0.0 };
        }
        let i = self.level_segment(level.re);
        let slope = (self.areas[i + 1] - self.areas[i]) / (self.levels[i + 1] - self.levels[i]);
        Dual {
            re,
            eps: slope * level.eps,
        }
    }

    fn level_segment(&self, level: f64) -> usize {
        match self
            .levels
            .binary_search_by(|probe| probe.partial_cmp(&level).unwrap())
        {
            Ok(i) => i.min(self.levels.len() - 2),
            Err(i) => i - 1,
        }
    }

    fn storage_segment(&self, storage: f64) -> usize {
        match self
            .storages
            .binary_search_by(|probe| probe.partial_cmp(&storage).unwrap())
        {
            Ok(i) => i.min(self.storages.len() - 2),
            Err(i) => i - 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUND_TRIP_TOLERANCE: f64 = 1e-9;

    fn wedge() -> BasinProfile {
        // Area grows linearly from 100 to 300 m² over 2 m of level.
        let mut issues = Vec::new();
        let profile = BasinProfile::new(
            vec![0.0, 2.0],
            vec![100.0, 300.0],
            None,
            "Basin #1",
            &mut issues,
        )
        .unwrap();
        assert!(issues.is_empty());
        profile
    }

    #[test]
    fn derived_storage_is_trapezoidal() {
        let profile = wedge();
        assert_eq!(profile.max_storage(), 400.0);
        // Half way up: 100*1 + 0.5*100*1^2 = 150
        assert!((profile.storage_from_level(1.0) - 150.0).abs() < 1e-12);
    }

    #[test]
    fn storage_level_round_trip() {
        let profile = wedge();
        for storage in [0.0, 1.0, 10.0, 150.0, 399.0, 400.0, 650.0] {
            let level = profile.level_from_storage(storage);
            let back = profile.storage_from_level(level);
            assert!(
                (back - storage).abs() < ROUND_TRIP_TOLERANCE,
                "round trip failed for storage {storage}: got {back}"
            );
        }
    }

    #[test]
    fn dual_level_derivative_is_inverse_area() {
        let profile = wedge();
        let s = Dual::seeded(150.0);
        let h = profile.level_from_storage_dual(s);
        assert!((h.re - 1.0).abs() < 1e-12);
        assert!((h.eps - 1.0 / 200.0).abs() < 1e-12);
    }

    #[test]
    fn rejects_zero_bottom_area() {
        let mut issues = Vec::new();
        let profile = BasinProfile::new(
            vec![0.0, 1.0],
            vec![0.0, 10.0],
            None,
            "Basin #9",
            &mut issues,
        );
        assert!(profile.is_none());
        assert!(matches!(
            issues[0],
            ValidationIssue::ProfileZeroBottomArea { .. }
        ));
    }

    #[test]
    fn level_extends_linearly_above_table() {
        let profile = wedge();
        let level = profile.level_from_storage(400.0 + 300.0);
        assert!((level - 3.0).abs() < 1e-12);
    }
}
