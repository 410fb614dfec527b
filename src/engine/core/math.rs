// ABOUTME: Forward-mode dual number used to differentiate flow formulas exactly
// ABOUTME: One evaluation yields value and directional derivative; flow kernels are written once against this type

use std::ops::{Add, Div, Mul, Neg, Sub};

/// First-order dual number a + b·ε with ε² = 0.
///
/// Flow formulas are written against this type only; a plain evaluation
/// seeds `eps = 0` and reads `re`, a Jacobian evaluation seeds `eps = 1`
/// on one storage and reads the propagated derivative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dual {
    pub re: f64,
    pub eps: f64,
}

impl Dual {
    pub const ZERO: Dual = Dual { re: 0.0, eps: 0.0 };
    pub const ONE: Dual = Dual { re: 1.0, eps: 0.0 };

    /// A constant (zero derivative).
    pub fn constant(re: f64) -> Self {
        Self { re, eps: 0.0 }
    }

    /// The seeded independent variable.
    pub fn seeded(re: f64) -> Self {
        Self { re, eps: 1.0 }
    }

    pub fn sqrt(self) -> Self {
        let root = self.re.sqrt();
        let eps = if root > 0.0 {
            self.eps / (2.0 * root)
        } else {
            0.0
        };
        Self { re: root, eps }
    }

    pub fn powf(self, exp: f64) -> Self {
        let re = self.re.powf(exp);
        let eps = if self.re > 0.0 {
            exp * self.re.powf(exp - 1.0) * self.eps
        } else {
            0.0
        };
        Self { re, eps }
    }

    pub fn abs(self) -> Self {
        if self.re < 0.0 {
            -self
        } else {
            self
        }
    }

    /// Branch by real part; kinks resolve toward the active branch.
    pub fn max(self, other: Dual) -> Self {
        if self.re >= other.re {
            self
        } else {
            other
        }
    }

    pub fn min(self, other: Dual) -> Self {
        if self.re <= other.re {
            self
        } else {
            other
        }
    }

    pub fn clamp(self, lo: f64, hi: f64) -> Self {
        self.max(Dual::constant(lo)).min(Dual::constant(hi))
    }

    pub fn is_finite(self) -> bool {
        self.re.is_finite() && self.eps.is_finite()
    }
}

impl From<f64> for Dual {
    fn from(re: f64) -> Self {
        Dual::constant(re)
    }
}

impl Add for Dual {
    type Output = Dual;
    fn add(self, rhs: Dual) -> Dual {
        Dual {
            re: self.re + rhs.re,
            eps: self.eps + rhs.eps,
        }
    }
}

impl Add<f64> for Dual {
    type Output = Dual;
    fn add(self, rhs: f64) -> Dual {
        Dual {
            re: self.re + rhs,
            eps: self.eps,
        }
    }
}

impl Sub for Dual {
    type Output = Dual;
    fn sub(self, rhs: Dual) -> Dual {
        Dual {
            re: self.re - rhs.re,
            eps: self.eps - rhs.eps,
        }
    }
}

impl Sub<f64> for Dual {
    type Output = Dual;
    fn sub(self, rhs: f64) -> Dual {
        Dual {
            re: self.re - rhs,
            eps: self.eps,
        }
    }
}

impl Sub<Dual> for f64 {
    type Output = Dual;
    fn sub(self, rhs: Dual) -> Dual {
        Dual {
            re: self - rhs.re,
            eps: -rhs.eps,
        }
    }
}

impl Mul for Dual {
    type Output = Dual;
    fn mul(self, rhs: Dual) -> Dual {
        Dual {
            re: self.re * rhs.re,
            eps: self.re * rhs.eps + self.eps * rhs.re,
        }
    }
}

impl Mul<f64> for Dual {
    type Output = Dual;
    fn mul(self, rhs: f64) -> Dual {
        Dual {
            re: self.re * rhs,
            eps: self.eps * rhs,
        }
    }
}

impl Mul<Dual> for f64 {
    type Output = Dual;
    fn mul(self, rhs: Dual) -> Dual {
        rhs * self
    }
}

impl Div for Dual {
    type Output = Dual;
    fn div(self, rhs: Dual) -> Dual {
        Dual {
            re: self.re / rhs.re,
            eps: (self.eps * rhs.re - self.re * rhs.eps) / (rhs.re * rhs.re),
        }
    }
}

impl Div<f64> for Dual {
    type Output = Dual;
    fn div(self, rhs: f64) -> Dual {
        Dual {
            re: self.re / rhs,
            eps: self.eps / rhs,
        }
    }
}

impl Neg for Dual {
    type Output = Dual;
    fn neg(self) -> Dual {
        Dual {
            re: -self.re,
            eps: -self.eps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DERIVATIVE_TOLERANCE: f64 = 1e-9;

    #[test]
    fn product_rule_propagates() {
        let x = Dual::seeded(3.0);
        let y = x * x; // d(x^2)/dx = 2x
        assert_eq!(y.re, 9.0);
        assert!((y.eps - 6.0).abs() < DERIVATIVE_TOLERANCE);
    }

    #[test]
    fn quotient_and_sqrt_match_analytic_derivatives() {
        let x = Dual::seeded(4.0);
        let y = Dual::constant(1.0) / x; // d(1/x)/dx = -1/x^2
        assert!((y.eps + 1.0 / 16.0).abs() < DERIVATIVE_TOLERANCE);
        let r = x.sqrt(); // d(sqrt x)/dx = 1/(2 sqrt x)
        assert!((r.eps - 0.25).abs() < DERIVATIVE_TOLERANCE);
    }

    #[test]
    fn powf_matches_finite_difference() {
        let x = 2.5;
        let h = 1e-7;
        let exact = Dual::seeded(x).powf(2.0 / 3.0).eps;
        let approx = (x + h).powf(2.0 / 3.0) - (x - h).powf(2.0 / 3.0);
        assert!((exact - approx / (2.0 * h)).abs() < 1e-6);
    }

    #[test]
    fn min_max_pick_active_branch() {
        let x = Dual::seeded(2.0);
        assert_eq!(x.min(Dual::constant(5.0)).eps, 1.0);
        assert_eq!(x.min(Dual::constant(1.0)).eps, 0.0);
        assert_eq!(x.clamp(0.0, 1.5).re, 1.5);
    }
}
