// ABOUTME: Piecewise-linear interpolation kernel with per-side extrapolation policies
// ABOUTME: Backs every time series and lookup table: forcings, rating curves, thresholds, control functions

use crate::engine::core::error::ValidationIssue;
use crate::engine::core::math::Dual;

/// What to do left of the first or right of the last breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extrapolation {
    /// Hold the boundary ordinate.
    Constant,
    /// Continue the boundary segment's slope.
    Linear,
    /// Fold the query back into the table span. At an exact wrap instant
    /// the left limit is used, so a query landing on x0 + k*span (k > 0)
    /// evaluates to the last ordinate, not the first.
    Periodic,
}

/// A piecewise-linear curve y(x) over strictly increasing abscissae.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpolation {
    xs: Vec<f64>,
    ys: Vec<f64>,
    left: Extrapolation,
    right: Extrapolation,
}

impl Interpolation {
    /// Build a curve. `context` names the owning node in validation issues.
    pub fn new(
        xs: Vec<f64>,
        ys: Vec<f64>,
        left: Extrapolation,
        right: Extrapolation,
        context: &str,
    ) -> Result<Self, ValidationIssue> {
        if xs.len() < 2 || xs.len() != ys.len() {
            return Err(ValidationIssue::TableTooShort {
                node: context.to_string(),
                min: 2,
                actual: xs.len().min(ys.len()),
            });
        }
        if xs.windows(2).any(|w| w[1] <= w[0]) {
            return Err(ValidationIssue::TableNotIncreasing {
                node: context.to_string(),
            });
        }
        Ok(Self {
            xs,
            ys,
            left,
            right,
        })
    }

    /// A curve holding one value everywhere.
    pub fn constant(value: f64) -> Self {
        Self {
            xs: vec![0.0, 1.0],
            ys: vec![value, value],
            left: Extrapolation::Constant,
            right: Extrapolation::Constant,
        }
    }

    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    pub fn first_x(&self) -> f64 {
        self.xs[0]
    }

    pub fn last_x(&self) -> f64 {
        *self.xs.last().unwrap()
    }

    /// True when [a, b] is not fully covered by the table span, meaning
    /// extrapolation will be applied somewhere in that window.
    pub fn covers(&self, a: f64, b: f64) -> bool {
        self.first_x() <= a && b <= self.last_x()
    }

    /// Fold a query according to the periodic policy, returning the
    /// effective abscissa and whether the wrap left-limit applies.
    fn fold(&self, x: f64) -> f64 {
        let x0 = self.first_x();
        let x1 = self.last_x();
        if x >= x0 && x <= x1 {
            return x;
        }
        let periodic = (x < x0 && self.left == Extrapolation::Periodic)
            || (x > x1 && self.right == Extrapolation::Periodic);
        if !periodic {
            return x;
        }
        let span = x1 - x0;
        let mut folded = (x - x0) % span;
        if folded < 0.0 {
            folded += span;
        }
        // Left limit at the wrap instant: an exact multiple of the span
        // beyond the table evaluates at the right edge.
        if folded == 0.0 && x != x0 {
            return x1;
        }
        x0 + folded
    }

    /// Evaluate y(x).
    pub fn value_at(&self, x: f64) -> f64 {
        let x = self.fold(x);
        let n = self.xs.len();
        if x <= self.xs[0] {
            return match self.left {
                Extrapolation::Linear => {
                    let slope = (self.ys[1] - self.ys[0]) / (self.xs[1] - self.xs[0]);
                    self.ys[0] + slope * (x - self.xs[0])
                }
                _ => self.ys[0],
            };
        }
        if x >= self.xs[n - 1] {
            return match self.right {
                Extrapolation::Linear => {
                    let slope =
                        (self.ys[n - 1] - self.ys[n - 2]) / (self.xs[n - 1] - self.xs[n - 2]);
                    self.ys[n - 1] + slope * (x - self.xs[n - 1])
                }
                _ => self.ys[n - 1],
            };
        }
        let i = self.segment_index(x);
        let frac = (x - self.xs[i]) / (self.xs[i + 1] - self.xs[i]);
        self.ys[i] + frac * (self.ys[i + 1] - self.ys[i])
    }

    /// Slope dy/dx at x. At a breakpoint the right segment's slope is
    /// reported; outside the table the extrapolation slope.
    pub fn slope_at(&self, x: f64) -> f64 {
        let x = self.fold(x);
        let n = self.xs.len();
        if x < self.xs[0] {
            return match self.left {
                Extrapolation::Linear => (self.ys[1] - self.ys[0]) / (self.xs[1] - self.xs[0]),
                _ => 0.0,
            };
        }
        if x >= self.xs[n - 1] {
            return match self.right {
                Extrapolation::Linear => {
                    (self.ys[n - 1] - self.ys[n - 2]) / (self.xs[n - 1] - self.xs[n - 2])
                }
                _ => 0.0,
            };
        }
        let i = self.segment_index(x);
        (self.ys[i + 1] - self.ys[i]) / (self.xs[i + 1] - self.xs[i])
    }

    /// Evaluate with derivative propagation; the kink at a breakpoint
    /// resolves to the right segment's slope like `slope_at`.
    pub fn value_at_dual(&self, x: Dual) -> Dual {
        Dual {
            re: self.value_at(x.re),
            eps: self.slope_at(x.re) * x.eps,
        }
    }

    /// Exact integral of the curve over [a, b], a <= b. Extrapolated
    /// stretches integrate their policy's closed form; periodic windows
    /// decompose into whole spans plus a remainder.
    pub fn integrate(&self, a: f64, b: f64) -> f64 {
        assert!(b >= a);
        if a == b {
            return 0.0;
        }
        let periodic =
            self.left == Extrapolation::Periodic || self.right == Extrapolation::Periodic;
        if !periodic {
            return self.integrate_core(a, b);
        }
        let x0 = self.first_x();
        let x1 = self.last_x();
        if a >= x0 && b <= x1 {
            return self.integrate_core(a, b);
        }
        let span = x1 - x0;
        // Shift the window so it starts inside the base span.
        let k = ((a - x0) / span).floor();
        let a0 = a - k * span;
        let b0 = b - k * span;
        if b0 <= x1 {
            return self.integrate_core(a0, b0);
        }
        let head = self.integrate_core(a0, x1);
        let rem = b0 - x1;
        let cycles = (rem / span).floor();
        let tail = rem - cycles * span;
        head + cycles * self.integrate_core(x0, x1) + self.integrate_core(x0, x0 + tail)
    }

    /// Integral without periodic folding (a and b within or beyond the
    /// table under constant/linear policies).
    fn integrate_core(&self, a: f64, b: f64) -> f64 {
        let mut total = 0.0;
        let x0 = self.first_x();
        let x1 = self.last_x();
        // Left extrapolated stretch.
        if a < x0 {
            let hi = b.min(x0);
            let ya = self.value_at(a);
            let yb = self.value_at(hi);
            total += 0.5 * (ya + yb) * (hi - a);
        }
        // Interior, segment by segment.
        let lo = a.max(x0);
        let hi = b.min(x1);
        if hi > lo {
            let mut x = lo;
            while x < hi {
                let i = self.segment_index(x);
                let seg_end = self.xs[i + 1].min(hi);
                let ya = self.value_at(x);
                let yb = self.value_at(seg_end);
                total += 0.5 * (ya + yb) * (seg_end - x);
                x = seg_end;
            }
        }
        // Right extrapolated stretch.
        if b > x1 {
            let lo = a.max(x1);
            let ya = self.value_at(lo);
            let yb = self.value_at(b);
            total += 0.5 * (ya + yb) * (b - lo);
        }
        total
    }

    /// Index of the segment containing x, for x strictly inside the table.
    fn segment_index(&self, x: f64) -> usize {
        match self
            .xs
            .binary_search_by(|probe| probe.partial_cmp(&x).unwrap())
        {
            Ok(i) => i.min(self.xs.len() - 2),
            Err(i) => i - 1,
        }
    }

    /// Breakpoints of the curve within (a, b), used as integrator stop
    /// times so steps never straddle a derivative discontinuity.
    pub fn breakpoints_within(&self, a: f64, b: f64, out: &mut Vec<f64>) {
        for &x in &self.xs {
            if x > a && x < b {
                out.push(x);
            }
        }
        if self.right == Extrapolation::Periodic {
            let x0 = self.first_x();
            let span = self.last_x() - x0;
            let mut k = ((a - x0) / span).floor().max(1.0);
            loop {
                let base = x0 + k * span;
                if base > b {
                    break;
                }
                for &x in &self.xs {
                    let shifted = base + (x - x0);
                    if shifted > a && shifted < b {
                        out.push(shifted);
                    }
                }
                k += 1.0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line() -> Interpolation {
        Interpolation::new(
            vec![0.0, 10.0],
            vec![0.0, 20.0],
            Extrapolation::Constant,
            Extrapolation::Constant,
            "test",
        )
        .unwrap()
    }

    #[test]
    fn interpolates_linearly_between_breakpoints() {
        let curve = line();
        assert_eq!(curve.value_at(5.0), 10.0);
        assert_eq!(curve.slope_at(5.0), 2.0);
    }

    #[test]
    fn constant_extrapolation_holds_endpoints() {
        let curve = line();
        assert_eq!(curve.value_at(-5.0), 0.0);
        assert_eq!(curve.value_at(15.0), 20.0);
        assert_eq!(curve.slope_at(15.0), 0.0);
    }

    #[test]
    fn linear_extrapolation_continues_slope() {
        let curve = Interpolation::new(
            vec![0.0, 10.0],
            vec![0.0, 20.0],
            Extrapolation::Linear,
            Extrapolation::Linear,
            "test",
        )
        .unwrap();
        assert_eq!(curve.value_at(-5.0), -10.0);
        assert_eq!(curve.value_at(15.0), 30.0);
    }

    #[test]
    fn periodic_extrapolation_folds_and_uses_left_limit_at_wrap() {
        let curve = Interpolation::new(
            vec![0.0, 1.0, 4.0],
            vec![2.0, 8.0, 2.0],
            Extrapolation::Periodic,
            Extrapolation::Periodic,
            "test",
        )
        .unwrap();
        assert_eq!(curve.value_at(4.5), curve.value_at(0.5));
        assert_eq!(curve.value_at(-3.5), curve.value_at(0.5));
        // Exactly at the wrap: left limit, i.e. the end of the cycle.
        assert_eq!(curve.value_at(4.0), 2.0);
        assert_eq!(curve.value_at(8.0), 2.0);
    }

    #[test]
    fn integral_is_exact_for_trapezoids() {
        let curve = line();
        assert!((curve.integrate(0.0, 10.0) - 100.0).abs() < 1e-12);
        assert!((curve.integrate(2.0, 8.0) - (4.0 + 16.0) * 0.5 * 6.0).abs() < 1e-12);
        // Constant stretch beyond the table.
        assert!((curve.integrate(10.0, 20.0) - 200.0).abs() < 1e-12);
    }

    #[test]
    fn periodic_integral_decomposes_into_cycles() {
        let curve = Interpolation::new(
            vec![0.0, 2.0],
            vec![1.0, 3.0],
            Extrapolation::Periodic,
            Extrapolation::Periodic,
            "test",
        )
        .unwrap();
        let one_cycle = curve.integrate(0.0, 2.0);
        assert!((one_cycle - 4.0).abs() < 1e-12);
        assert!((curve.integrate(0.0, 6.0) - 3.0 * one_cycle).abs() < 1e-12);
        assert!((curve.integrate(1.0, 3.0) - one_cycle).abs() < 1e-12);
    }

    #[test]
    fn rejects_non_increasing_abscissae() {
        let result = Interpolation::new(
            vec![0.0, 0.0, 1.0],
            vec![1.0, 2.0, 3.0],
            Extrapolation::Constant,
            Extrapolation::Constant,
            "test",
        );
        assert!(matches!(
            result,
            Err(ValidationIssue::TableNotIncreasing { .. })
        ));
    }
}
