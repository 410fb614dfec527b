// ABOUTME: Jacobian sparsity prototype from topology plus dual-number or finite-difference evaluation
// ABOUTME: A flow entry depends on at most two basin storages; the pattern composes those with the projection F

use nalgebra::{DMatrix, DVector};
use sprs::{CsMat, TriMat};

use crate::engine::core::math::Dual;
use crate::engine::physics::smoothing::low_storage_factor;
use crate::engine::solver::rhs::HydroSystem;
use crate::engine::solver::state::{FlowEntryKind, StateMap};

/// How the Jacobian is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JacobianMode {
    /// Forward-mode dual numbers, one seed per dependent basin storage.
    ForwardDual,
    /// One-sided finite differences over the prototype's columns.
    FiniteDifference,
}

/// Sparsity prototype and evaluation strategy for ∂(du)/∂u.
pub struct JacobianEngine {
    pub mode: JacobianMode,
    pub prototype: CsMat<f64>,
    /// Flow entries whose rate depends on each basin's storage.
    basin_dependents: Vec<Vec<usize>>,
    /// For finite differences: rows to fill per column.
    column_rows: Vec<Vec<usize>>,
    perturbation_scratch: DVector<f64>,
    base_scratch: DVector<f64>,
}

impl JacobianEngine {
    /// Derive the prototype from the state map. The PID output closure
    /// couples its slot to every term of the listened basin's balance,
    /// so models with active PID controllers always use finite
    /// differences; pure-network models may use duals.
    pub fn build(map: &StateMap, n_pid: usize, pid_rows: &[PidRowSpec], autodiff: bool) -> Self {
        let layout = &map.layout;
        let n = layout.total;
        let n_basins = layout.n_basins;

        let mut basin_dependents: Vec<Vec<usize>> = vec![Vec::new(); n_basins];
        for (i, entry) in layout.flow_entries.iter().enumerate() {
            let mut deps = Vec::new();
            if let Some(b) = entry.basin_up {
                deps.push(b);
            }
            if let Some(b) = entry.basin_down {
                deps.push(b);
            }
            if entry.kind == FlowEntryKind::UserReturn {
                // The return rate follows the inflow, which depends on
                // the user's source basin.
                if let Some(inflow) = layout
                    .flow_entries
                    .iter()
                    .position(|e| e.kind == FlowEntryKind::UserInflow && e.local == entry.local)
                {
                    if let Some(b) = layout.flow_entries[inflow].basin_up {
                        deps.push(b);
                    }
                }
            }
            for b in deps {
                if !basin_dependents[b].contains(&i) {
                    basin_dependents[b].push(i);
                }
            }
        }

        // Row dependencies in basin space, then composed through F.
        let mut triplets = TriMat::new((n, n));
        let mut push_basin_row = |triplets: &mut TriMat<f64>, row: usize, basin: usize| {
            let f_row = map.flow_to_storage.outer_view(basin).unwrap();
            for (col, _) in f_row.iter() {
                triplets.add_triplet(row, col, 1.0);
            }
        };
        for b in 0..n_basins {
            push_basin_row(&mut triplets, layout.evaporation_index(b), b);
            push_basin_row(&mut triplets, layout.infiltration_index(b), b);
            for &entry in &basin_dependents[b] {
                push_basin_row(&mut triplets, layout.flow_index(entry), b);
            }
        }
        for spec in pid_rows {
            let integral_row = layout.pid_integral_index(spec.index);
            push_basin_row(&mut triplets, integral_row, spec.listen_basin);
            // The closed output slot inherits the whole listened balance
            // plus the integral state.
            let slot = layout.flow_index(spec.target_entry);
            push_basin_row(&mut triplets, slot, spec.listen_basin);
            for &entry in &basin_dependents[spec.listen_basin] {
                for &b in &[
                    layout.flow_entries[entry].basin_up,
                    layout.flow_entries[entry].basin_down,
                ] {
                    if let Some(b) = b {
                        push_basin_row(&mut triplets, slot, b);
                    }
                }
            }
            triplets.add_triplet(slot, integral_row, 1.0);
        }
        let prototype: CsMat<f64> = triplets.to_csr();

        let mut column_rows: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (row, vec) in prototype.outer_iterator().enumerate() {
            for (col, _) in vec.iter() {
                if !column_rows[col].contains(&row) {
                    column_rows[col].push(row);
                }
            }
        }

        let mode = if autodiff && n_pid == 0 {
            JacobianMode::ForwardDual
        } else {
            JacobianMode::FiniteDifference
        };

        Self {
            mode,
            prototype,
            basin_dependents,
            column_rows,
            perturbation_scratch: DVector::zeros(n),
            base_scratch: DVector::zeros(n),
        }
    }

    pub fn nnz(&self) -> usize {
        self.prototype.nnz()
    }

    /// Fill `into` (dense, zeroed here) with ∂(du)/∂u at (t, u). Returns
    /// the number of RHS evaluations spent.
    pub fn eval(
        &mut self,
        system: &HydroSystem<'_>,
        t: f64,
        u: &DVector<f64>,
        into: &mut DMatrix<f64>,
    ) -> u64 {
        into.fill(0.0);
        match self.mode {
            JacobianMode::ForwardDual => self.eval_dual(system, t, u, into),
            JacobianMode::FiniteDifference => self.eval_fd(system, t, u, into),
        }
    }

    fn eval_dual(
        &mut self,
        system: &HydroSystem<'_>,
        t: f64,
        u: &DVector<f64>,
        into: &mut DMatrix<f64>,
    ) -> u64 {
        let layout = &system.map.layout;
        let storages = system.storages(u);
        system.eval(t, u, &mut self.base_scratch);
        let du_base = self.base_scratch.clone();
        for b in 0..layout.n_basins {
            let basin = &system.registry.basins[b];
            // ∂(du_row)/∂S_b for every row depending on basin b, then
            // J[row, col] += D * F[b, col].
            let mut scatter = |row: usize, d: f64, into: &mut DMatrix<f64>| {
                if d == 0.0 {
                    return;
                }
                let f_row = system.map.flow_to_storage.outer_view(b).unwrap();
                for (col, &f) in f_row.iter() {
                    into[(row, col)] += d * f;
                }
            };
            let seeded = Dual::seeded(storages[b]);
            let level = basin.profile.level_from_storage_dual(seeded);
            let area = basin.profile.area_from_level_dual(level);
            let rho = low_storage_factor(seeded);
            let evaporation = area * rho * basin.potential_evaporation.value_at(t);
            scatter(layout.evaporation_index(b), evaporation.eps, into);
            let infiltration = rho * basin.infiltration.value_at(t);
            scatter(layout.infiltration_index(b), infiltration.eps, into);
            for &i in &self.basin_dependents[b] {
                let entry = &layout.flow_entries[i];
                let rate = system.entry_rate(entry, t, &storages, Some(b), &du_base);
                scatter(layout.flow_index(i), rate.eps, into);
            }
        }
        1
    }

    fn eval_fd(
        &mut self,
        system: &HydroSystem<'_>,
        t: f64,
        u: &DVector<f64>,
        into: &mut DMatrix<f64>,
    ) -> u64 {
        system.eval(t, u, &mut self.base_scratch);
        let mut evals = 1;
        let mut perturbed = u.clone();
        for col in 0..self.column_rows.len() {
            if self.column_rows[col].is_empty() {
                continue;
            }
            let h = 1e-6 * u[col].abs().max(1.0);
            perturbed[col] = u[col] + h;
            system.eval(t, &perturbed, &mut self.perturbation_scratch);
            evals += 1;
            for &row in &self.column_rows[col] {
                into[(row, col)] = (self.perturbation_scratch[row] - self.base_scratch[row]) / h;
            }
            perturbed[col] = u[col];
        }
        evals
    }
}

/// What the prototype needs to know about one PID controller.
#[derive(Debug, Clone, Copy)]
pub struct PidRowSpec {
    pub index: usize,
    pub listen_basin: usize,
    pub target_entry: usize,
}
