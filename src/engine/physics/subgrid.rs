// ABOUTME: Subgrid level interpolation - maps a basin's water level onto finer auxiliary elements
// ABOUTME: Evaluated only when results are saved; has no feedback on the dynamics

use crate::engine::core::error::ValidationIssue;
use crate::engine::core::interp::{Extrapolation, Interpolation};
use crate::engine::network::id::NodeIndex;

/// One subgrid element: a piecewise-linear map from the parent basin's
/// level to the element's local level.
#[derive(Debug, Clone)]
pub struct SubgridElement {
    pub subgrid_id: i32,
    pub basin: NodeIndex,
    map: Interpolation,
}

impl SubgridElement {
    /// Both sequences must be strictly increasing and of equal length.
    pub fn new(
        subgrid_id: i32,
        basin: NodeIndex,
        basin_levels: Vec<f64>,
        element_levels: Vec<f64>,
        issues: &mut Vec<ValidationIssue>,
    ) -> Option<Self> {
        let context = format!("subgrid element {subgrid_id}");
        if basin_levels.len() != element_levels.len()
            || element_levels.windows(2).any(|w| w[1] <= w[0])
        {
            issues.push(ValidationIssue::SubgridTableInvalid { node: context });
            return None;
        }
        let map = match Interpolation::new(
            basin_levels,
            element_levels,
            Extrapolation::Constant,
            Extrapolation::Constant,
            &context,
        ) {
            Ok(map) => map,
            Err(issue) => {
                issues.push(issue);
                return None;
            }
        };
        Some(Self {
            subgrid_id,
            basin,
            map,
        })
    }

    pub fn level_at(&self, basin_level: f64) -> f64 {
        self.map.value_at(basin_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_basin_level_through_table() {
        let mut issues = Vec::new();
        let element = SubgridElement::new(
            7,
            NodeIndex(0),
            vec![0.0, 2.0],
            vec![10.0, 11.0],
            &mut issues,
        )
        .unwrap();
        assert!(issues.is_empty());
        assert_eq!(element.level_at(1.0), 10.5);
        // Clamped outside the table.
        assert_eq!(element.level_at(5.0), 11.0);
    }

    #[test]
    fn rejects_non_increasing_element_levels() {
        let mut issues = Vec::new();
        let element = SubgridElement::new(
            7,
            NodeIndex(0),
            vec![0.0, 1.0, 2.0],
            vec![10.0, 10.0, 11.0],
            &mut issues,
        );
        assert!(element.is_none());
        assert!(matches!(
            issues[0],
            ValidationIssue::SubgridTableInvalid { .. }
        ));
    }
}
