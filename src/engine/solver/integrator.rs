// ABOUTME: Adaptive implicit BDF1/BDF2 stepper with a damped Newton inner loop and step limiting
// ABOUTME: Accepted steps are projected back into the admissible set: cumulative flows monotone, storages non-negative

use nalgebra::{DMatrix, DVector};
use tracing::{debug, warn};

use crate::engine::core::error::HydronetError;
use crate::engine::solver::jacobian::JacobianEngine;
use crate::engine::solver::rhs::HydroSystem;

/// Integration method. Both are implicit; BDF2 upgrades order once a
/// step history exists and falls back to backward Euler after every
/// discontinuity (save reset, control transition, allocation update).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    Bdf2,
    ImplicitEuler,
}

#[derive(Debug, Clone)]
pub struct SolverOptions {
    pub algorithm: Algorithm,
    pub abstol: f64,
    pub reltol: f64,
    pub dt: Option<f64>,
    pub dtmin: f64,
    pub dtmax: f64,
    pub force_dtmin: bool,
    pub maxiters: u64,
    pub autodiff: bool,
    pub sparse: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Bdf2,
            abstol: 1e-6,
            reltol: 1e-6,
            dt: None,
            dtmin: 1e-4,
            dtmax: 24.0 * 3600.0,
            force_dtmin: false,
            maxiters: 1_000_000,
            autodiff: true,
            sparse: true,
        }
    }
}

/// Work counters surfaced in the solver_stats result table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolverStats {
    pub rhs_calls: u64,
    pub linear_solves: u64,
    pub accepted_steps: u64,
    pub rejected_steps: u64,
}

const NEWTON_MAX_ITERATIONS: usize = 10;
const NEWTON_TOLERANCE: f64 = 0.3;
const STEP_GROWTH_LIMIT: f64 = 5.0;
const STEP_SHRINK_LIMIT: f64 = 0.2;
const MAX_ATTEMPTS_PER_STEP: usize = 60;

struct History {
    u_prev: DVector<f64>,
    dt_prev: f64,
    /// f(t_{n-1}, u_{n-1}), reused by the second-order error predictor.
    f_prev: DVector<f64>,
}

/// The time stepper. Owns the state vector and step-size control;
/// everything model-specific arrives through `HydroSystem`.
pub struct Integrator {
    pub opts: SolverOptions,
    pub stats: SolverStats,
    pub t: f64,
    pub u: DVector<f64>,
    dt: f64,
    history: Option<History>,
    jacobian_dense: DMatrix<f64>,
    /// Storage change over the last accepted step, for bottleneck
    /// reporting when the step size collapses.
    last_storage_change: Vec<f64>,
}

impl Integrator {
    pub fn new(opts: SolverOptions, t0: f64, u0: DVector<f64>, n_basins: usize) -> Self {
        let n = u0.len();
        let dt = opts
            .dt
            .unwrap_or_else(|| (60.0_f64).clamp(opts.dtmin, opts.dtmax));
        Self {
            opts,
            stats: SolverStats::default(),
            t: t0,
            u: u0,
            dt,
            history: None,
            jacobian_dense: DMatrix::zeros(n, n),
            last_storage_change: vec![0.0; n_basins],
        }
    }

    /// Forget the BDF2 history; call after any discontinuous event.
    pub fn reset_history(&mut self) {
        self.history = None;
    }

    pub fn proposed_dt(&self) -> f64 {
        self.dt
    }

    /// Advance by exactly one accepted step, never stepping past
    /// `t_stop`. Returns true when `t_stop` has been reached.
    pub fn step_to(
        &mut self,
        system: &HydroSystem<'_>,
        jacobian: &mut JacobianEngine,
        t_stop: f64,
    ) -> Result<bool, HydronetError> {
        if self.t >= t_stop {
            return Ok(true);
        }
        let mut attempts = 0;
        loop {
            attempts += 1;
            let dt = self.dt.min(t_stop - self.t).max(0.0);
            let forced = self.opts.force_dtmin && dt <= self.opts.dtmin;
            match self.attempt_step(system, jacobian, dt, forced) {
                StepOutcome::Accepted { v, error, f0, order } => {
                    let storages_before = system.storages(&self.u);
                    let storages_after = system.storages(&v);
                    for (change, (after, before)) in self
                        .last_storage_change
                        .iter_mut()
                        .zip(storages_after.iter().zip(storages_before.iter()))
                    {
                        *change = after - before;
                    }
                    self.history = Some(History {
                        u_prev: std::mem::replace(&mut self.u, v),
                        dt_prev: dt,
                        f_prev: f0,
                    });
                    self.t += dt;
                    self.stats.accepted_steps += 1;
                    let exponent = -1.0 / (order as f64 + 1.0);
                    let growth = if error > 0.0 {
                        (0.9 * error.powf(exponent)).clamp(STEP_SHRINK_LIMIT, STEP_GROWTH_LIMIT)
                    } else {
                        STEP_GROWTH_LIMIT
                    };
                    self.dt = (self.dt * growth).clamp(self.opts.dtmin, self.opts.dtmax);
                    return Ok(self.t >= t_stop);
                }
                StepOutcome::Rejected { reason } => {
                    self.stats.rejected_steps += 1;
                    let next_dt = self.dt * 0.5;
                    debug!(
                        t = self.t,
                        dt = self.dt,
                        next_dt,
                        reason = reason.as_str(),
                        "step rejected"
                    );
                    if next_dt < self.opts.dtmin {
                        if self.opts.force_dtmin {
                            warn!(
                                t = self.t,
                                "continuing at dtmin despite failed error control"
                            );
                            self.dt = self.opts.dtmin;
                        } else {
                            return Err(self.dt_underflow_error(system, next_dt, &reason));
                        }
                    } else {
                        self.dt = next_dt;
                    }
                    if attempts >= MAX_ATTEMPTS_PER_STEP {
                        return Err(self.dt_underflow_error(system, self.dt, &reason));
                    }
                }
            }
        }
    }

    fn attempt_step(
        &mut self,
        system: &HydroSystem<'_>,
        jacobian: &mut JacobianEngine,
        dt: f64,
        forced: bool,
    ) -> StepOutcome {
        let n = self.u.len();
        let t_new = self.t + dt;

        // Explicit Euler predictor seeds the Newton iteration.
        let mut f0 = DVector::zeros(n);
        system.eval(self.t, &self.u, &mut f0);
        self.stats.rhs_calls += 1;
        let u_pred = &self.u + &f0 * dt;

        // Variable-step BDF2 once history exists, BDF1 otherwise. The
        // error reference is one order higher than the predictor used to
        // seed Newton: a second-order Taylor step built from the stored
        // f_{n-1}, so the estimate vanishes where BDF2 is exact.
        let (hist_combo, leading, error_reference, order) =
            match (&self.history, self.opts.algorithm) {
                (Some(history), Algorithm::Bdf2) => {
                    let rho = dt / history.dt_prev;
                    let denom = 1.0 + 2.0 * rho;
                    let a1 = (1.0 + rho).powi(2) / denom;
                    let a2 = -rho * rho / denom;
                    let b = (1.0 + rho) / denom;
                    let taylor = &self.u
                        + &f0 * dt
                        + (&f0 - &history.f_prev) * (dt * dt / (2.0 * history.dt_prev));
                    (&self.u * a1 + &history.u_prev * a2, b, taylor, 2u32)
                }
                _ => (self.u.clone(), 1.0, u_pred.clone(), 1u32),
            };

        let jacobian_evals = jacobian.eval(system, t_new, &u_pred, &mut self.jacobian_dense);
        self.stats.rhs_calls += jacobian_evals;
        let mut newton_matrix = DMatrix::identity(n, n);
        newton_matrix -= &self.jacobian_dense * (leading * dt);
        let lu = newton_matrix.lu();

        let mut v = u_pred.clone();
        let mut f = DVector::zeros(n);
        let mut converged = false;
        for _ in 0..NEWTON_MAX_ITERATIONS {
            system.eval(t_new, &v, &mut f);
            self.stats.rhs_calls += 1;
            let residual = &v - &hist_combo - &f * (leading * dt);
            let Some(delta) = lu.solve(&residual) else {
                return StepOutcome::Rejected {
                    reason: RejectReason::SingularNewtonMatrix,
                };
            };
            self.stats.linear_solves += 1;
            v -= &delta;
            if !v.iter().all(|x| x.is_finite()) {
                return StepOutcome::Rejected {
                    reason: RejectReason::NonFinite,
                };
            }
            if self.weighted_norm(&delta, &v) < NEWTON_TOLERANCE {
                converged = true;
                break;
            }
        }
        if !converged {
            return StepOutcome::Rejected {
                reason: RejectReason::NewtonDiverged,
            };
        }

        // Step limiter: single-signed cumulative flows may not decrease.
        let layout = &system.map.layout;
        for (i, entry) in layout.flow_entries.iter().enumerate() {
            if entry.kind.single_signed() {
                let index = layout.flow_index(i);
                if v[index] < self.u[index] {
                    v[index] = self.u[index];
                }
            }
        }

        let error = self.weighted_norm(&(&v - &error_reference), &v) * 0.5;
        if error > 1.0 && !forced {
            return StepOutcome::Rejected {
                reason: RejectReason::ErrorTooLarge,
            };
        }

        // Storages may only dip below zero within round-off.
        let storages = system.storages(&v);
        let tolerance = self.opts.abstol.max(1e-8);
        if storages.iter().any(|&s| s < -tolerance) && !forced {
            return StepOutcome::Rejected {
                reason: RejectReason::NegativeStorage,
            };
        }

        StepOutcome::Accepted {
            v,
            error,
            f0,
            order,
        }
    }

    /// Error-weighted RMS norm used by both the Newton and the step
    /// controller.
    fn weighted_norm(&self, x: &DVector<f64>, reference: &DVector<f64>) -> f64 {
        let n = x.len().max(1);
        let sum: f64 = x
            .iter()
            .zip(reference.iter())
            .map(|(xi, ri)| {
                let w = self.opts.abstol + self.opts.reltol * ri.abs();
                (xi / w) * (xi / w)
            })
            .sum();
        (sum / n as f64).sqrt()
    }

    fn dt_underflow_error(
        &self,
        system: &HydroSystem<'_>,
        dt: f64,
        reason: &RejectReason,
    ) -> HydronetError {
        // Rank basins by recent storage movement; these are where the
        // Newton iteration is fighting the dynamics.
        let mut ranked: Vec<(usize, f64)> = self
            .last_storage_change
            .iter()
            .enumerate()
            .map(|(b, &change)| (b, change.abs()))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let bottlenecks: Vec<String> = ranked
            .iter()
            .take(3)
            .map(|&(b, change)| format!("{} (|ΔS| = {:.3e} m³)", system.basin_name(b), change))
            .collect();
        if matches!(reason, RejectReason::NonFinite) {
            // Name the first non-finite entry when that is what broke.
            if let Some(index) = self.u.iter().position(|x| !x.is_finite()) {
                return HydronetError::NonFiniteState {
                    t: self.t,
                    entry: system.map.layout.entry_name(system.graph, index),
                };
            }
        }
        HydronetError::DtLessThanMin {
            t: self.t,
            dt,
            dtmin: self.opts.dtmin,
            bottlenecks,
        }
    }
}

enum StepOutcome {
    Accepted {
        v: DVector<f64>,
        error: f64,
        f0: DVector<f64>,
        order: u32,
    },
    Rejected {
        reason: RejectReason,
    },
}

#[derive(Debug, Clone, Copy)]
enum RejectReason {
    ErrorTooLarge,
    NewtonDiverged,
    SingularNewtonMatrix,
    NegativeStorage,
    NonFinite,
}

impl RejectReason {
    fn as_str(&self) -> &'static str {
        match self {
            RejectReason::ErrorTooLarge => "error above tolerance",
            RejectReason::NewtonDiverged => "newton iteration diverged",
            RejectReason::SingularNewtonMatrix => "singular newton matrix",
            RejectReason::NegativeStorage => "negative storage",
            RejectReason::NonFinite => "non-finite state",
        }
    }
}
