//! Max-pooling wrapper. The backward pass is max-unpooling through the recorded switches.

use ndarray::{ArrayD, Dimension, Ix4};

use super::{spatial, view4};
use crate::core::{ForwardPass, PatternError, PatternLayer, PatternResult};
use crate::layers::{MaxPool2d, MaxUnpool2d};

#[derive(Debug, Clone, Copy)]
pub struct PatternMaxPool2d {
    pool: MaxPool2d,
    unpool: MaxUnpool2d,
}

impl PatternMaxPool2d {
    pub fn new(pool: MaxPool2d) -> Self {
        Self {
            pool,
            unpool: MaxUnpool2d,
        }
    }

    pub fn forward_layer(&self) -> &MaxPool2d {
        &self.pool
    }
}

impl PatternLayer for PatternMaxPool2d {
    fn name(&self) -> &'static str {
        "maxpool2d"
    }

    fn forward(&self, input: &ArrayD<f32>) -> PatternResult<ForwardPass> {
        let x = view4(input, "pooling input")?;
        let (output, indices) = self.pool.forward(x)?;
        Ok(ForwardPass::Pooled {
            output: output.into_dyn(),
            indices: indices.into_dyn(),
            input_dim: input.raw_dim(),
        })
    }

    /// Unpool `signal` onto the recorded input shape. `normalize` is ignored.
    fn backward(
        &self,
        signal: &ArrayD<f32>,
        pass: &ForwardPass,
        _normalize: bool,
    ) -> PatternResult<ArrayD<f32>> {
        let ForwardPass::Pooled {
            indices, input_dim, ..
        } = pass
        else {
            return Err(pass.mismatch(self.name()));
        };
        let indices = indices.view().into_dimensionality::<Ix4>()?;
        let signal = view4(signal, "pooling signal")?;
        if signal.dim().0 != input_dim[0] || signal.dim().1 != input_dim[1] {
            return Err(PatternError::ShapeMismatch(format!(
                "signal {:?} does not belong to input {:?}",
                signal.dim(),
                input_dim.slice()
            )));
        }

        let unpooled = self.unpool.forward(signal, indices, spatial(input_dim)?)?;
        Ok(unpooled.into_dyn())
    }
}
