//! Dense (fully connected) layer: `y = x · W + b`.

use ndarray::{Array1, Array2, ArrayView2};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;

use crate::core::{PatternError, PatternResult};

/// Dense layer with weight `(in_features, out_features)` and optional bias.
///
/// Inputs are batches `(batch, in_features)`, one sample per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
}

impl Linear {
    /// # Errors
    /// - `ShapeMismatch` if the bias length differs from `out_features`
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> PatternResult<Self> {
        if let Some(b) = &bias {
            if b.len() != weight.ncols() {
                return Err(PatternError::ShapeMismatch(format!(
                    "bias of length {} for {} output features",
                    b.len(),
                    weight.ncols()
                )));
            }
        }
        Ok(Self { weight, bias })
    }

    /// Xavier/Glorot uniform weights `U(-limit, limit)`, `limit = sqrt(6 / (fan_in + fan_out))`,
    /// and a zero bias if requested.
    pub fn xavier(in_features: usize, out_features: usize, with_bias: bool) -> Self {
        let limit = (6.0f32 / (in_features + out_features).max(1) as f32).sqrt();
        let weight = Array2::random((in_features, out_features), Uniform::new(-limit, limit));
        let bias = with_bias.then(|| Array1::zeros(out_features));
        Self { weight, bias }
    }

    /// All-zero weight and no bias.
    pub fn zeros(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: Array2::zeros((in_features, out_features)),
            bias: None,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Array1<f32>> {
        self.bias.as_ref()
    }

    /// Replace the weight with one of the same shape.
    pub fn replace_weight(&mut self, weight: Array2<f32>) -> PatternResult<()> {
        if weight.dim() != self.weight.dim() {
            return Err(PatternError::ShapeMismatch(format!(
                "replacement weight {:?} for layer weight {:?}",
                weight.dim(),
                self.weight.dim()
            )));
        }
        self.weight = weight;
        Ok(())
    }

    /// `x · W`, without the bias.
    pub fn forward_wo_bias(&self, input: ArrayView2<f32>) -> PatternResult<Array2<f32>> {
        if input.ncols() != self.in_features() {
            return Err(PatternError::ShapeMismatch(format!(
                "input has {} features, layer expects {}",
                input.ncols(),
                self.in_features()
            )));
        }
        Ok(input.dot(&self.weight))
    }

    /// `x · W + b`.
    pub fn forward(&self, input: ArrayView2<f32>) -> PatternResult<Array2<f32>> {
        let mut output = self.forward_wo_bias(input)?;
        if let Some(b) = &self.bias {
            output += b;
        }
        Ok(output)
    }
}
