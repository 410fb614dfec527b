// ABOUTME: Reduction factors that keep the right-hand side continuously differentiable
// ABOUTME: Outflows shrink smoothly to zero near empty storage instead of being projected

use crate::engine::core::math::Dual;

/// Storage threshold [m³] under which outflows start shrinking.
pub const LOW_STORAGE_THRESHOLD_M3: f64 = 10.0;

/// Head-difference threshold [m] for smoothed level gates.
pub const LEVEL_GATE_THRESHOLD_M: f64 = 0.02;

/// Relaxation scale for the signed square root in the Manning formula.
pub const MANNING_RELAXATION: f64 = 1e-3;

/// C¹ cubic indicator: 0 for x ≤ 0, 1 for x ≥ threshold, and the
/// smoothstep 3p² − 2p³ in between. Strictly monotone on (0, threshold)
/// with zero slope at both ends.
pub fn reduction_factor(x: Dual, threshold: f64) -> Dual {
    if x.re <= 0.0 {
        Dual::ZERO
    } else if x.re >= threshold {
        Dual::ONE
    } else {
        let p = x / threshold;
        p * p * (Dual::constant(3.0) - 2.0 * p)
    }
}

/// Plain-value variant for accounting paths that never differentiate.
pub fn reduction_factor_value(x: f64, threshold: f64) -> f64 {
    reduction_factor(Dual::constant(x), threshold).re
}

/// Signed square root with a C¹ odd-polynomial relaxation near zero:
/// sign(x)·√|x| for |x| ≥ scale, and (5x/(4√s)) − x³/(4s^{5/2}) inside,
/// matching value and slope at ±scale.
pub fn relaxed_sqrt(x: Dual, scale: f64) -> Dual {
    if x.re.abs() >= scale {
        let root = x.abs().sqrt();
        if x.re < 0.0 {
            -root
        } else {
            root
        }
    } else {
        let root_scale = scale.sqrt();
        x * (5.0 / (4.0 * root_scale)) - (x * x * x) * (1.0 / (4.0 * scale * scale * root_scale))
    }
}

/// Low-storage factor ρ(S, ε_S) for a donor basin.
pub fn low_storage_factor(storage: Dual) -> Dual {
    reduction_factor(storage, LOW_STORAGE_THRESHOLD_M3)
}
