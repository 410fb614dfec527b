// ABOUTME: Discrete truth-table control: compound variables against hysteresis thresholds
// ABOUTME: Truth states map through wildcard-expanded lookup tables to named parameter patches

use std::cell::RefCell;
use std::collections::BTreeMap;

use crate::engine::control::{ControlReadout, ListenVariable};
use crate::engine::core::error::ValidationIssue;
use crate::engine::core::interp::Interpolation;
use crate::engine::network::id::{NodeId, NodeIndex};

/// One term of a compound variable: a listened node variable with a
/// weight and a look-ahead into scheduled boundary values.
#[derive(Debug, Clone)]
pub struct SubVariable {
    pub listen: NodeIndex,
    pub variable: ListenVariable,
    pub weight: f64,
    pub look_ahead: f64,
}

/// A weighted linear combination of listened variables.
#[derive(Debug, Clone)]
pub struct CompoundVariable {
    pub subvariables: Vec<SubVariable>,
}

impl CompoundVariable {
    pub fn value(&self, readout: &dyn ControlReadout) -> f64 {
        self.subvariables
            .iter()
            .map(|sv| sv.weight * readout.observe(sv.listen, sv.variable, sv.look_ahead))
            .sum()
    }
}

/// A threshold with a hysteresis band. The truth bit rises when the
/// observed value reaches `high` and falls when it drops to `low`;
/// between the two the bit keeps its previous value. Both bounds are
/// time curves so seasonal thresholds work.
#[derive(Debug, Clone)]
pub struct Threshold {
    pub low: Interpolation,
    pub high: Interpolation,
}

impl Threshold {
    /// A threshold without hysteresis: low == high == `curve`.
    pub fn sharp(curve: Interpolation) -> Self {
        Self {
            low: curve.clone(),
            high: curve,
        }
    }

    pub fn banded(low: Interpolation, high: Interpolation) -> Self {
        Self { low, high }
    }
}

/// A parameter patch applied when a control state activates.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlAction {
    SetFlowRate { target: NodeIndex, rate: f64 },
    SetActive { target: NodeIndex, active: bool },
    SetRatingTable { target: NodeIndex, table: String },
    SetResistanceActive { target: NodeIndex, active: bool },
    SetPidActive { target: NodeIndex, active: bool },
}

/// A discrete control node. Truth bits are flattened variable-major:
/// all thresholds of variable 0 first, then variable 1, and so on.
#[derive(Debug)]
pub struct DiscreteControlParams {
    pub node: NodeId,
    pub variables: Vec<CompoundVariable>,
    /// Thresholds per compound variable, sorted ascending.
    pub thresholds: Vec<Vec<Threshold>>,
    /// Expanded truth-state lookup: bit vector → control state name.
    expanded: BTreeMap<Vec<bool>, String>,
    /// Parameter patches per control state name.
    pub states: BTreeMap<String, Vec<ControlAction>>,
    pub truth: RefCell<Vec<bool>>,
    pub current_state: RefCell<String>,
}

impl DiscreteControlParams {
    /// Build a discrete control node, expanding `*`-wildcards in the
    /// logic table and checking the expansion for contradictions and
    /// coverage of every reachable truth state.
    pub fn new(
        node: NodeId,
        variables: Vec<CompoundVariable>,
        thresholds: Vec<Vec<Threshold>>,
        logic: &[(String, String)],
        states: BTreeMap<String, Vec<ControlAction>>,
        issues: &mut Vec<ValidationIssue>,
    ) -> Option<Self> {
        let before = issues.len();
        let n_bits: usize = thresholds.iter().map(|t| t.len()).sum();
        let mut expanded: BTreeMap<Vec<bool>, String> = BTreeMap::new();
        for (pattern, state) in logic {
            if pattern.len() != n_bits {
                issues.push(ValidationIssue::TruthStateIllegalCharacter {
                    node: node.to_string(),
                    pattern: pattern.clone(),
                    illegal: '_',
                });
                continue;
            }
            if let Some(illegal) = pattern.chars().find(|c| !matches!(c, 'T' | 'F' | '*')) {
                issues.push(ValidationIssue::TruthStateIllegalCharacter {
                    node: node.to_string(),
                    pattern: pattern.clone(),
                    illegal,
                });
                continue;
            }
            for bits in expand_pattern(pattern) {
                match expanded.get(&bits) {
                    Some(existing) if existing != state => {
                        issues.push(ValidationIssue::TruthStateContradiction {
                            node: node.to_string(),
                            pattern: pattern.clone(),
                            existing: existing.clone(),
                        });
                    }
                    // First writer wins; an identical re-mapping is harmless.
                    Some(_) => {}
                    None => {
                        expanded.insert(bits, state.clone());
                    }
                }
            }
        }
        // Sorted thresholds make each variable's bits a thermometer code;
        // the reachable truth states are the products of those codes.
        for bits in thermometer_states(&thresholds) {
            if !expanded.contains_key(&bits) {
                issues.push(ValidationIssue::TruthStateNotCovered {
                    node: node.to_string(),
                    truth_state: format_truth(&bits),
                });
            }
        }
        for state in expanded.values() {
            if !states.contains_key(state) {
                issues.push(ValidationIssue::UnknownNode {
                    node: format!("{node}: control state '{state}' has no parameter patch"),
                });
            }
        }
        if issues.len() > before {
            return None;
        }
        let initial_truth = vec![false; n_bits];
        let initial_state = expanded
            .get(&initial_truth)
            .cloned()
            .unwrap_or_default();
        Some(Self {
            node,
            variables,
            thresholds,
            expanded,
            states,
            truth: RefCell::new(initial_truth),
            current_state: RefCell::new(initial_state),
        })
    }

    /// Re-evaluate all truth bits at time t. Returns the new
    /// (truth_state, control_state) pair when any bit toggled.
    pub fn transition(
        &self,
        t: f64,
        readout: &dyn ControlReadout,
    ) -> Option<(String, String)> {
        let mut truth = self.truth.borrow_mut();
        let mut changed = false;
        let mut bit = 0;
        for (variable, thresholds) in self.variables.iter().zip(&self.thresholds) {
            let value = variable.value(readout);
            for threshold in thresholds {
                let current = truth[bit];
                let next = if value >= threshold.high.value_at(t) {
                    true
                } else if value <= threshold.low.value_at(t) {
                    false
                } else {
                    current
                };
                if next != current {
                    truth[bit] = next;
                    changed = true;
                }
                bit += 1;
            }
        }
        if !changed {
            return None;
        }
        let state = self.expanded.get(&*truth)?.clone();
        *self.current_state.borrow_mut() = state.clone();
        Some((format_truth(&truth), state))
    }

    pub fn actions_of(&self, state: &str) -> &[ControlAction] {
        self.states
            .get(state)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn truth_string(&self) -> String {
        format_truth(&self.truth.borrow())
    }
}

fn format_truth(bits: &[bool]) -> String {
    bits.iter().map(|&b| if b { 'T' } else { 'F' }).collect()
}

/// Cartesian closure of a 'T'/'F'/'*' pattern.
fn expand_pattern(pattern: &str) -> Vec<Vec<bool>> {
    let mut states = vec![Vec::with_capacity(pattern.len())];
    for c in pattern.chars() {
        let choices: &[bool] = match c {
            'T' => &[true],
            'F' => &[false],
            _ => &[false, true],
        };
        let mut next = Vec::with_capacity(states.len() * choices.len());
        for state in &states {
            for &choice in choices {
                let mut extended = state.clone();
                extended.push(choice);
                next.push(extended);
            }
        }
        states = next;
    }
    states
}

/// All truth states reachable under sorted thresholds: per variable the
/// bits form a thermometer (k leading trues), combined across variables.
fn thermometer_states(thresholds: &[Vec<Threshold>]) -> Vec<Vec<bool>> {
    let mut states = vec![Vec::new()];
    for variable_thresholds in thresholds {
        let n = variable_thresholds.len();
        let mut next = Vec::new();
        for state in &states {
            for k in 0..=n {
                let mut extended = state.clone();
                // Value above the k lowest thresholds.
                for i in 0..n {
                    extended.push(i < k);
                }
                next.push(extended);
            }
        }
        states = next;
    }
    states
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::network::id::NodeType;

    struct FixedReadout(f64);

    impl ControlReadout for FixedReadout {
        fn observe(&self, _: NodeIndex, _: ListenVariable, _: f64) -> f64 {
            self.0
        }
    }

    fn single_variable_control(band: f64) -> DiscreteControlParams {
        let variables = vec![CompoundVariable {
            subvariables: vec![SubVariable {
                listen: NodeIndex(0),
                variable: ListenVariable::Level,
                weight: 1.0,
                look_ahead: 0.0,
            }],
        }];
        let thresholds = vec![vec![Threshold::banded(
            Interpolation::constant(5.0 - band),
            Interpolation::constant(5.0 + band),
        )]];
        let mut states = BTreeMap::new();
        states.insert("off".to_string(), vec![]);
        states.insert("on".to_string(), vec![]);
        let mut issues = Vec::new();
        let control = DiscreteControlParams::new(
            NodeId::new(NodeType::DiscreteControl, 1),
            variables,
            thresholds,
            &[
                ("F".to_string(), "off".to_string()),
                ("T".to_string(), "on".to_string()),
            ],
            states,
            &mut issues,
        )
        .unwrap();
        assert!(issues.is_empty());
        control
    }

    #[test]
    fn bit_rises_at_high_and_falls_at_low() {
        let control = single_variable_control(0.5);
        assert!(control.transition(0.0, &FixedReadout(5.6)).is_some());
        assert_eq!(control.truth_string(), "T");
        // Inside the band nothing toggles.
        assert!(control.transition(0.0, &FixedReadout(5.0)).is_none());
        assert_eq!(control.truth_string(), "T");
        let (truth, state) = control.transition(0.0, &FixedReadout(4.4)).unwrap();
        assert_eq!(truth, "F");
        assert_eq!(state, "off");
    }

    #[test]
    fn wildcard_expansion_covers_cartesian_closure() {
        let expanded = expand_pattern("T*");
        assert_eq!(
            expanded,
            vec![vec![true, false], vec![true, true]]
        );
    }

    #[test]
    fn contradictory_patterns_are_rejected() {
        let variables = vec![CompoundVariable {
            subvariables: vec![SubVariable {
                listen: NodeIndex(0),
                variable: ListenVariable::Level,
                weight: 1.0,
                look_ahead: 0.0,
            }],
        }];
        let thresholds = vec![vec![Threshold::sharp(Interpolation::constant(1.0))]];
        let mut states = BTreeMap::new();
        states.insert("a".to_string(), vec![]);
        states.insert("b".to_string(), vec![]);
        let mut issues = Vec::new();
        let control = DiscreteControlParams::new(
            NodeId::new(NodeType::DiscreteControl, 1),
            variables,
            thresholds,
            &[
                ("*".to_string(), "a".to_string()),
                ("T".to_string(), "b".to_string()),
            ],
            states,
            &mut issues,
        );
        assert!(control.is_none());
        assert!(issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::TruthStateContradiction { .. })));
    }

    #[test]
    fn missing_truth_state_is_reported() {
        let variables = vec![CompoundVariable {
            subvariables: vec![SubVariable {
                listen: NodeIndex(0),
                variable: ListenVariable::Level,
                weight: 1.0,
                look_ahead: 0.0,
            }],
        }];
        let thresholds = vec![vec![Threshold::sharp(Interpolation::constant(1.0))]];
        let mut states = BTreeMap::new();
        states.insert("on".to_string(), vec![]);
        let mut issues = Vec::new();
        let control = DiscreteControlParams::new(
            NodeId::new(NodeType::DiscreteControl, 1),
            variables,
            thresholds,
            &[("T".to_string(), "on".to_string())],
            states,
            &mut issues,
        );
        assert!(control.is_none());
        assert!(issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::TruthStateNotCovered { .. })));
    }
}
