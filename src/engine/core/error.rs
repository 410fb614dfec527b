// ABOUTME: Domain error taxonomy for model construction, integration, allocation, and IO
// ABOUTME: Validation issues aggregate into a single error so every problem is reported at once

use thiserror::Error;

/// A single problem found while validating a model under construction.
///
/// Issues are collected rather than returned one at a time so that a user
/// fixing a model sees the full list in one run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationIssue {
    #[error("{node}: expected between {min} and {max} {direction} flow links, got {actual}")]
    NeighborCount {
        node: String,
        direction: &'static str,
        min: usize,
        max: usize,
        actual: usize,
    },
    #[error("{node}: basin profile levels must be strictly increasing")]
    ProfileLevelsNotIncreasing { node: String },
    #[error("{node}: basin profile areas must be non-decreasing")]
    ProfileAreasDecreasing { node: String },
    #[error("{node}: basin profile must start with a positive area, got {area}")]
    ProfileZeroBottomArea { node: String, area: f64 },
    #[error("{node}: rating curve has repeated level {level}")]
    RatingCurveRepeatedLevel { node: String, level: f64 },
    #[error("{node}: truth state pattern '{pattern}' contains illegal character '{illegal}'")]
    TruthStateIllegalCharacter {
        node: String,
        pattern: String,
        illegal: char,
    },
    #[error("{node}: truth state pattern '{pattern}' expands to a state already mapped to '{existing}'")]
    TruthStateContradiction {
        node: String,
        pattern: String,
        existing: String,
    },
    #[error("{node}: truth state '{truth_state}' is reachable but has no control state")]
    TruthStateNotCovered { node: String, truth_state: String },
    #[error("subnetwork {subnetwork} is not connected")]
    SubnetworkDisconnected { subnetwork: u32 },
    #[error("link {link} crosses from subnetwork {from} into {to} outside a primary inlet")]
    SubnetworkBoundaryCrossing { link: String, from: u32, to: u32 },
    #[error("{node}: unknown node referenced")]
    UnknownNode { node: String },
    #[error("invalid flow topology: {message}")]
    InvalidTopology { message: String },
    #[error("link from {from} to {to} declared twice")]
    DuplicateLink { from: String, to: String },
    #[error("{node}: interpolation table needs at least {min} points, got {actual}")]
    TableTooShort {
        node: String,
        min: usize,
        actual: usize,
    },
    #[error("{node}: interpolation abscissae must be strictly increasing")]
    TableNotIncreasing { node: String },
    #[error("{node}: {parameter} must be positive, got {value}")]
    NonPositiveParameter {
        node: String,
        parameter: &'static str,
        value: f64,
    },
    #[error("{node}: return factor must lie in [0, 1], got {value}")]
    ReturnFactorOutOfRange { node: String, value: f64 },
    #[error("{node}: subgrid level sequences must be strictly increasing and of equal length")]
    SubgridTableInvalid { node: String },
    #[error(
        "subnetwork {subnetwork}: flow demand and level demand share priority {priority}; \
         the objective ordering would be ambiguous"
    )]
    AmbiguousPriority { subnetwork: u32, priority: u32 },
    #[error("{node}: control listens to variable '{variable}' which {target} does not expose")]
    UnknownListenVariable {
        node: String,
        target: String,
        variable: String,
    },
    #[error("{node}: demand priorities must be positive, got {priority}")]
    NonPositivePriority { node: String, priority: i64 },
}

/// Top-level error type. Every fallible public operation in the crate
/// returns this.
#[derive(Debug, Error)]
pub enum HydronetError {
    #[error("model validation failed with {} issue(s):\n{}", .0.len(), format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error(
        "time step {dt:.3e} s fell below dtmin {dtmin:.3e} s at t = {t:.3} s; \
         convergence bottlenecks: {bottlenecks:?}"
    )]
    DtLessThanMin {
        t: f64,
        dt: f64,
        dtmin: f64,
        bottlenecks: Vec<String>,
    },

    #[error("state entry '{entry}' became non-finite at t = {t:.3} s")]
    NonFiniteState { t: f64, entry: String },

    #[error(
        "allocation for subnetwork {subnetwork} infeasible at t = {t:.3} s \
         while optimizing '{objective}'. Set of incompatible constraints found: {iis:?}"
    )]
    AllocationInfeasible {
        subnetwork: u32,
        objective: String,
        t: f64,
        iis: Vec<String>,
    },

    #[error("update_until would move time backward: current t = {current:.3} s, requested {requested:.3} s")]
    BmiTimeBackward { current: f64, requested: f64 },

    #[error("unknown BMI variable '{0}'")]
    BmiUnknownVariable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("result writer error: {0}")]
    Csv(#[from] csv::Error),

    #[error("input table '{table}': {message}")]
    InputTable { table: String, message: String },
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("  - {issue}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl HydronetError {
    /// Wrap a non-empty list of validation issues; panics on an empty list
    /// in debug builds since that indicates a bookkeeping bug.
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        debug_assert!(!issues.is_empty());
        HydronetError::Validation(issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_issue() {
        let err = HydronetError::from_issues(vec![
            ValidationIssue::ProfileZeroBottomArea {
                node: "Basin #1".to_string(),
                area: 0.0,
            },
            ValidationIssue::SubnetworkDisconnected { subnetwork: 3 },
        ]);
        let text = err.to_string();
        assert!(text.contains("2 issue(s)"));
        assert!(text.contains("Basin #1"));
        assert!(text.contains("subnetwork 3"));
    }

    #[test]
    fn infeasibility_names_subnetwork_and_objective() {
        let err = HydronetError::AllocationInfeasible {
            subnetwork: 2,
            objective: "demand_priority[1]".to_string(),
            t: 86400.0,
            iis: vec!["volume_conservation[Basin #1]".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("subnetwork 2"));
        assert!(text.contains("Set of incompatible constraints found"));
        assert!(text.contains("volume_conservation[Basin #1]"));
    }
}
