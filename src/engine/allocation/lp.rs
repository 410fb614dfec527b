// ABOUTME: Linear program as a long-lived data structure: variables, constraints, deterministic simplex
// ABOUTME: Only bounds and right-hand sides mutate between allocation steps; serialization is byte-stable

use std::fmt::Write as _;

/// Pivot and feasibility tolerance of the simplex.
const PIVOT_TOLERANCE: f64 = 1e-9;
/// Phase-1 objective above this means the constraints are inconsistent.
const FEASIBILITY_TOLERANCE: f64 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Eq,
    Le,
    Ge,
}

impl Relation {
    fn symbol(&self) -> &'static str {
        match self {
            Relation::Eq => "=",
            Relation::Le => "<=",
            Relation::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone)]
pub struct Constraint {
    pub name: String,
    /// (variable index, coefficient), kept in insertion order.
    pub terms: Vec<(usize, f64)>,
    pub relation: Relation,
    pub rhs: f64,
    /// Disabled constraints are skipped by the solver; used by the IIS
    /// deletion filter.
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct Solution {
    pub values: Vec<f64>,
    pub objective: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LpError {
    Infeasible,
    Unbounded,
}

/// A bounded linear program. Lower bounds must be finite (the caller
/// substitutes large sentinels for conceptually unbounded variables);
/// upper bounds may be infinite.
#[derive(Debug, Clone, Default)]
pub struct LinearProgram {
    pub variables: Vec<Variable>,
    pub constraints: Vec<Constraint>,
    objective: Vec<f64>,
}

impl LinearProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_variable(&mut self, name: impl Into<String>, lower: f64, upper: f64) -> usize {
        assert!(lower.is_finite(), "lower bounds must be finite");
        self.variables.push(Variable {
            name: name.into(),
            lower,
            upper,
        });
        self.objective.push(0.0);
        self.variables.len() - 1
    }

    pub fn set_bounds(&mut self, variable: usize, lower: f64, upper: f64) {
        assert!(lower.is_finite(), "lower bounds must be finite");
        self.variables[variable].lower = lower;
        self.variables[variable].upper = upper;
    }

    pub fn add_constraint(
        &mut self,
        name: impl Into<String>,
        terms: Vec<(usize, f64)>,
        relation: Relation,
        rhs: f64,
    ) -> usize {
        self.constraints.push(Constraint {
            name: name.into(),
            terms,
            relation,
            rhs,
            enabled: true,
        });
        self.constraints.len() - 1
    }

    pub fn set_rhs(&mut self, constraint: usize, rhs: f64) {
        self.constraints[constraint].rhs = rhs;
    }

    /// Update (or insert) a single coefficient of an existing constraint.
    /// The symbolic structure of the program is meant to be stable; this
    /// only refreshes linearization coefficients between solves.
    pub fn set_term(&mut self, constraint: usize, variable: usize, coefficient: f64) {
        let terms = &mut self.constraints[constraint].terms;
        match terms.iter_mut().find(|(v, _)| *v == variable) {
            Some(term) => term.1 = coefficient,
            None => terms.push((variable, coefficient)),
        }
    }

    pub fn set_enabled(&mut self, constraint: usize, enabled: bool) {
        self.constraints[constraint].enabled = enabled;
    }

    pub fn clear_objective(&mut self) {
        self.objective.iter_mut().for_each(|c| *c = 0.0);
    }

    /// Add `coefficient` to the (minimized) objective term of a variable.
    pub fn add_objective_term(&mut self, variable: usize, coefficient: f64) {
        self.objective[variable] += coefficient;
    }

    pub fn objective_coefficients(&self) -> &[f64] {
        &self.objective
    }

    /// Deterministic text form, stable across runs of the same model:
    /// variables and constraints print in insertion order.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str("minimize\n  obj:");
        let mut first = true;
        for (i, &c) in self.objective.iter().enumerate() {
            if c != 0.0 {
                let _ = write!(out, " {}{} {}", if first { "" } else { "+ " }, c,
                    self.variables[i].name);
                first = false;
            }
        }
        if first {
            out.push_str(" 0");
        }
        out.push_str("\nsubject to\n");
        for constraint in self.constraints.iter().filter(|c| c.enabled) {
            let _ = write!(out, "  {}:", constraint.name);
            for &(variable, coefficient) in &constraint.terms {
                let _ = write!(out, " {} {}", coefficient, self.variables[variable].name);
            }
            let _ = writeln!(out, " {} {}", constraint.relation.symbol(), constraint.rhs);
        }
        out.push_str("bounds\n");
        for variable in &self.variables {
            let _ = writeln!(
                out,
                "  {} <= {} <= {}",
                variable.lower, variable.name, variable.upper
            );
        }
        out
    }

    /// Solve with a two-phase dense simplex under Bland's rule. The
    /// pivot order is a pure function of the model, so repeated solves
    /// of the same program take identical paths.
    pub fn solve(&self) -> Result<Solution, LpError> {
        Tableau::build(self)?.solve(self)
    }

    /// Deletion-filter an infeasible program down to an irreducible
    /// inconsistent subsystem; returns the names of the surviving
    /// constraints. Quadratic in solves, acceptable on the error path.
    pub fn compute_iis(&self) -> Vec<String> {
        let mut probe = self.clone();
        probe.clear_objective();
        for i in 0..probe.constraints.len() {
            if !probe.constraints[i].enabled {
                continue;
            }
            probe.constraints[i].enabled = false;
            match probe.solve() {
                Err(LpError::Infeasible) => {
                    // Still infeasible without it: not part of the IIS.
                }
                _ => {
                    probe.constraints[i].enabled = true;
                }
            }
        }
        probe
            .constraints
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.name.clone())
            .collect()
    }
}

/// Dense simplex tableau over shifted variables y = x − lower ≥ 0, with
/// finite upper bounds expressed as extra rows.
struct Tableau {
    /// m × (n_total + 1); the last column is the right-hand side.
    rows: Vec<Vec<f64>>,
    basis: Vec<usize>,
    n_structural: usize,
    n_total: usize,
    first_artificial: usize,
}

impl Tableau {
    fn build(lp: &LinearProgram) -> Result<Tableau, LpError> {
        let n = lp.variables.len();

        // Gather rows over shifted variables.
        let mut rows: Vec<(Vec<(usize, f64)>, Relation, f64)> = Vec::new();
        for constraint in lp.constraints.iter().filter(|c| c.enabled) {
            let mut rhs = constraint.rhs;
            for &(variable, coefficient) in &constraint.terms {
                rhs -= coefficient * lp.variables[variable].lower;
            }
            rows.push((constraint.terms.clone(), constraint.relation, rhs));
        }
        for (i, variable) in lp.variables.iter().enumerate() {
            if variable.upper.is_finite() {
                let range = variable.upper - variable.lower;
                if range < 0.0 {
                    return Err(LpError::Infeasible);
                }
                rows.push((vec![(i, 1.0)], Relation::Le, range));
            }
        }

        // Normalize to non-negative right-hand sides.
        for (terms, relation, rhs) in rows.iter_mut() {
            if *rhs < 0.0 {
                *rhs = -*rhs;
                for (_, c) in terms.iter_mut() {
                    *c = -*c;
                }
                *relation = match relation {
                    Relation::Le => Relation::Ge,
                    Relation::Ge => Relation::Le,
                    Relation::Eq => Relation::Eq,
                };
            }
        }

        let m = rows.len();
        let n_slack: usize = rows
            .iter()
            .filter(|(_, r, _)| *r != Relation::Eq)
            .count();
        let n_artificial: usize = rows
            .iter()
            .filter(|(_, r, _)| *r != Relation::Le)
            .count();
        let n_total = n + n_slack + n_artificial;
        let first_artificial = n + n_slack;

        let mut tableau = vec![vec![0.0; n_total + 1]; m];
        let mut basis = vec![0usize; m];
        let mut slack_cursor = n;
        let mut artificial_cursor = first_artificial;
        for (row, (terms, relation, rhs)) in rows.iter().enumerate() {
            for &(variable, coefficient) in terms {
                tableau[row][variable] += coefficient;
            }
            tableau[row][n_total] = *rhs;
            match relation {
                Relation::Le => {
                    tableau[row][slack_cursor] = 1.0;
                    basis[row] = slack_cursor;
                    slack_cursor += 1;
                }
                Relation::Ge => {
                    tableau[row][slack_cursor] = -1.0;
                    slack_cursor += 1;
                    tableau[row][artificial_cursor] = 1.0;
                    basis[row] = artificial_cursor;
                    artificial_cursor += 1;
                }
                Relation::Eq => {
                    tableau[row][artificial_cursor] = 1.0;
                    basis[row] = artificial_cursor;
                    artificial_cursor += 1;
                }
            }
        }

        Ok(Tableau {
            rows: tableau,
            basis,
            n_structural: n,
            n_total,
            first_artificial,
        })
    }

    fn solve(mut self, lp: &LinearProgram) -> Result<Solution, LpError> {
        // Phase 1: minimize the sum of artificials.
        let mut phase1_cost = vec![0.0; self.n_total];
        for j in self.first_artificial..self.n_total {
            phase1_cost[j] = 1.0;
        }
        let phase1_value = self.minimize(&phase1_cost, false)?;
        if phase1_value > FEASIBILITY_TOLERANCE {
            return Err(LpError::Infeasible);
        }
        self.pivot_out_artificials();

        // Phase 2: the real objective over structural variables.
        let mut cost = vec![0.0; self.n_total];
        cost[..self.n_structural].copy_from_slice(lp.objective_coefficients());
        let shifted_objective = self.minimize(&cost, true)?;

        // Recover x = y + lower and the unshifted objective value.
        let mut values: Vec<f64> = lp.variables.iter().map(|v| v.lower).collect();
        for (row, &basic) in self.basis.iter().enumerate() {
            if basic < self.n_structural {
                values[basic] += self.rows[row][self.n_total];
            }
        }
        let shift: f64 = lp
            .objective_coefficients()
            .iter()
            .zip(lp.variables.iter())
            .map(|(c, v)| c * v.lower)
            .sum();
        Ok(Solution {
            values,
            objective: shifted_objective + shift,
        })
    }

    /// Run simplex iterations under Bland's rule for the given cost
    /// vector; returns the achieved objective over shifted variables.
    /// `exclude_artificials` forbids artificials from re-entering.
    fn minimize(&mut self, cost: &[f64], exclude_artificials: bool) -> Result<f64, LpError> {
        loop {
            let reduced = self.reduced_costs(cost);
            // Bland: entering variable is the lowest-index negative.
            let entering = (0..self.n_total)
                .filter(|&j| !(exclude_artificials && j >= self.first_artificial))
                .find(|&j| reduced[j] < -PIVOT_TOLERANCE && !self.basis.contains(&j));
            let Some(entering) = entering else {
                return Ok(self.objective_value(cost));
            };
            // Ratio test; ties break toward the lowest basis index.
            let mut leaving: Option<(usize, f64)> = None;
            for row in 0..self.rows.len() {
                let coefficient = self.rows[row][entering];
                if coefficient > PIVOT_TOLERANCE {
                    let ratio = self.rows[row][self.n_total] / coefficient;
                    let better = match leaving {
                        None => true,
                        Some((best_row, best_ratio)) => {
                            ratio < best_ratio - PIVOT_TOLERANCE
                                || (ratio < best_ratio + PIVOT_TOLERANCE
                                    && self.basis[row] < self.basis[best_row])
                        }
                    };
                    if better {
                        leaving = Some((row, ratio));
                    }
                }
            }
            let Some((pivot_row, _)) = leaving else {
                return Err(LpError::Unbounded);
            };
            self.pivot(pivot_row, entering);
        }
    }

    fn reduced_costs(&self, cost: &[f64]) -> Vec<f64> {
        let mut reduced = cost.to_vec();
        for (row, &basic) in self.basis.iter().enumerate() {
            let basic_cost = cost[basic];
            if basic_cost != 0.0 {
                for j in 0..self.n_total {
                    reduced[j] -= basic_cost * self.rows[row][j];
                }
            }
        }
        reduced
    }

    fn objective_value(&self, cost: &[f64]) -> f64 {
        self.basis
            .iter()
            .enumerate()
            .map(|(row, &basic)| cost[basic] * self.rows[row][self.n_total])
            .sum()
    }

    fn pivot(&mut self, pivot_row: usize, entering: usize) {
        let pivot_value = self.rows[pivot_row][entering];
        for value in self.rows[pivot_row].iter_mut() {
            *value /= pivot_value;
        }
        for row in 0..self.rows.len() {
            if row == pivot_row {
                continue;
            }
            let factor = self.rows[row][entering];
            if factor != 0.0 {
                for j in 0..=self.n_total {
                    let delta = factor * self.rows[pivot_row][j];
                    self.rows[row][j] -= delta;
                }
            }
        }
        self.basis[pivot_row] = entering;
    }

    /// After phase 1, swap any artificial still basic at zero for a
    /// structural column; rows with no such column are redundant and
    /// harmless to keep.
    fn pivot_out_artificials(&mut self) {
        for row in 0..self.rows.len() {
            if self.basis[row] >= self.first_artificial {
                let replacement = (0..self.first_artificial)
                    .find(|&j| self.rows[row][j].abs() > PIVOT_TOLERANCE);
                if let Some(j) = replacement {
                    self.pivot(row, j);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOLUTION_TOLERANCE: f64 = 1e-6;

    #[test]
    fn solves_a_bounded_minimum() {
        // minimize x + 2y  s.t.  x + y >= 4, x <= 3, y <= 5
        let mut lp = LinearProgram::new();
        let x = lp.add_variable("x", 0.0, 3.0);
        let y = lp.add_variable("y", 0.0, 5.0);
        lp.add_constraint("cover", vec![(x, 1.0), (y, 1.0)], Relation::Ge, 4.0);
        lp.add_objective_term(x, 1.0);
        lp.add_objective_term(y, 2.0);
        let solution = lp.solve().unwrap();
        assert!((solution.values[x] - 3.0).abs() < SOLUTION_TOLERANCE);
        assert!((solution.values[y] - 1.0).abs() < SOLUTION_TOLERANCE);
        assert!((solution.objective - 5.0).abs() < SOLUTION_TOLERANCE);
    }

    #[test]
    fn respects_nonzero_lower_bounds() {
        // minimize x  s.t. x + y = 10, x >= 2, y in [0, 5]
        let mut lp = LinearProgram::new();
        let x = lp.add_variable("x", 2.0, f64::INFINITY);
        let y = lp.add_variable("y", 0.0, 5.0);
        lp.add_constraint("sum", vec![(x, 1.0), (y, 1.0)], Relation::Eq, 10.0);
        lp.add_objective_term(x, 1.0);
        let solution = lp.solve().unwrap();
        assert!((solution.values[x] - 5.0).abs() < SOLUTION_TOLERANCE);
        assert!((solution.values[y] - 5.0).abs() < SOLUTION_TOLERANCE);
    }

    #[test]
    fn detects_infeasibility_and_extracts_an_iis() {
        let mut lp = LinearProgram::new();
        let x = lp.add_variable("x", 0.0, 10.0);
        lp.add_constraint("at_least_six", vec![(x, 1.0)], Relation::Ge, 6.0);
        lp.add_constraint("at_most_two", vec![(x, 1.0)], Relation::Le, 2.0);
        lp.add_constraint("harmless", vec![(x, 1.0)], Relation::Le, 100.0);
        assert_eq!(lp.solve().unwrap_err(), LpError::Infeasible);
        let iis = lp.compute_iis();
        assert!(iis.contains(&"at_least_six".to_string()));
        assert!(iis.contains(&"at_most_two".to_string()));
        assert!(!iis.contains(&"harmless".to_string()));
    }

    #[test]
    fn detects_unboundedness() {
        let mut lp = LinearProgram::new();
        let x = lp.add_variable("x", 0.0, f64::INFINITY);
        lp.add_objective_term(x, -1.0);
        assert_eq!(lp.solve().unwrap_err(), LpError::Unbounded);
    }

    #[test]
    fn negative_allowed_variable_via_shifted_lower_bound() {
        // minimize |x| modeled as x = p - q; x must hit -3.
        let mut lp = LinearProgram::new();
        let x = lp.add_variable("x", -10.0, 10.0);
        lp.add_constraint("pin", vec![(x, 1.0)], Relation::Eq, -3.0);
        let solution = lp.solve().unwrap();
        assert!((solution.values[x] + 3.0).abs() < SOLUTION_TOLERANCE);
    }

    #[test]
    fn serialization_is_stable_across_identical_builds() {
        let build = || {
            let mut lp = LinearProgram::new();
            let x = lp.add_variable("flow[a]", 0.0, 4.5);
            let y = lp.add_variable("flow[b]", 0.0, f64::INFINITY);
            lp.add_constraint("mass", vec![(x, 1.0), (y, -1.0)], Relation::Eq, 0.0);
            lp.add_objective_term(y, 0.25);
            lp.serialize()
        };
        assert_eq!(build(), build());
    }
}
