//! Rectifier wrapper. Routes the signal through the forward activation mask.

use ndarray::{ArrayD, Zip};

use crate::core::{ForwardPass, PatternError, PatternLayer, PatternResult};
use crate::utils::relu;

#[derive(Debug, Clone, Copy, Default)]
pub struct PatternRelu;

impl PatternRelu {
    pub fn new() -> Self {
        Self
    }
}

impl PatternLayer for PatternRelu {
    fn name(&self) -> &'static str {
        "relu"
    }

    fn forward(&self, input: &ArrayD<f32>) -> PatternResult<ForwardPass> {
        Ok(ForwardPass::Rectified {
            output: input.mapv(relu),
            non_positive: input.mapv(|v| v <= 0.0),
        })
    }

    /// Zero the signal wherever the forward input was non-positive. `normalize` is ignored.
    fn backward(
        &self,
        signal: &ArrayD<f32>,
        pass: &ForwardPass,
        _normalize: bool,
    ) -> PatternResult<ArrayD<f32>> {
        let ForwardPass::Rectified { non_positive, .. } = pass else {
            return Err(pass.mismatch(self.name()));
        };
        if signal.shape() != non_positive.shape() {
            return Err(PatternError::ShapeMismatch(format!(
                "signal {:?} against rectifier mask {:?}",
                signal.shape(),
                non_positive.shape()
            )));
        }

        let mut routed = signal.clone();
        Zip::from(&mut routed)
            .and(non_positive)
            .for_each(|s, &blocked| {
                if blocked {
                    *s = 0.0;
                }
            });
        Ok(routed)
    }
}
