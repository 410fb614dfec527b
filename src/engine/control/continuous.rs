// ABOUTME: Continuous functional control: compound variable through a piecewise-linear function
// ABOUTME: Evaluated after every accepted step; the result lands in a controllable-rate override

use crate::engine::control::{CompoundVariable, ControlReadout};
use crate::engine::core::interp::Interpolation;
use crate::engine::network::id::{NodeId, NodeIndex};

/// What a continuous controller writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuousTarget {
    FlowRate,
}

#[derive(Debug)]
pub struct ContinuousControlParams {
    pub node: NodeId,
    pub variable: CompoundVariable,
    /// Maps the compound variable's value to the target parameter.
    pub function: Interpolation,
    pub target: NodeIndex,
    pub target_parameter: ContinuousTarget,
    /// Clamp bounds of the written parameter.
    pub min_value: f64,
    pub max_value: f64,
}

impl ContinuousControlParams {
    /// The parameter value to write at this instant.
    pub fn output(&self, readout: &dyn ControlReadout) -> f64 {
        let input = self.variable.value(readout);
        self.function
            .value_at(input)
            .clamp(self.min_value, self.max_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::control::{ListenVariable, SubVariable};
    use crate::engine::core::interp::Extrapolation;
    use crate::engine::network::id::NodeType;

    struct FixedReadout(f64);

    impl ControlReadout for FixedReadout {
        fn observe(&self, _: NodeIndex, _: ListenVariable, _: f64) -> f64 {
            self.0
        }
    }

    #[test]
    fn output_is_function_of_compound_variable_clamped() {
        let params = ContinuousControlParams {
            node: NodeId::new(NodeType::ContinuousControl, 1),
            variable: CompoundVariable {
                subvariables: vec![SubVariable {
                    listen: NodeIndex(0),
                    variable: ListenVariable::Level,
                    weight: 2.0,
                    look_ahead: 0.0,
                }],
            },
            function: Interpolation::new(
                vec![0.0, 10.0],
                vec![0.0, 5.0],
                Extrapolation::Constant,
                Extrapolation::Linear,
                "test",
            )
            .unwrap(),
            target: NodeIndex(1),
            target_parameter: ContinuousTarget::FlowRate,
            min_value: 0.0,
            max_value: 4.0,
        };
        // level 2 → compound 4 → function 2.0
        assert_eq!(params.output(&FixedReadout(2.0)), 2.0);
        // level 20 → compound 40 → function 20, clamped to 4
        assert_eq!(params.output(&FixedReadout(20.0)), 4.0);
    }
}
