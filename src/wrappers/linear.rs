//! Dense layer wrapper.

use ndarray::{Array2, ArrayD, ArrayView2, Dimension};

use super::view2;
use crate::core::{FitState, ForwardPass, PatternError, PatternLayer, PatternResult, PatternType};
use crate::layers::Linear;
use crate::patterns::{compute_patterns_linear, Statistics};
use crate::utils::normalize_signal;
use crate::Config;

/// A [`Linear`] layer paired with a bias-free backward [`Linear`] of weight `(out, in)`.
///
/// The backward weight holds `Aᵀ` once patterns are installed, so
/// `backward(s) = s · Aᵀ`.
#[derive(Debug, Clone)]
pub struct PatternLinear {
    forward: Linear,
    backward: Linear,
    state: FitState,
    config: Config,
}

impl PatternLinear {
    pub fn new(forward: Linear) -> Self {
        Self::with_config(forward, Config::default())
    }

    pub fn with_config(forward: Linear, config: Config) -> Self {
        let backward = Linear::zeros(forward.out_features(), forward.in_features());
        Self {
            forward,
            backward,
            state: FitState::default(),
            config,
        }
    }

    pub fn forward_layer(&self) -> &Linear {
        &self.forward
    }

    /// Current backward weight `(out, in)`; zeros until patterns are installed.
    pub fn backward_weight(&self) -> &Array2<f32> {
        self.backward.weight()
    }

    pub fn state(&self) -> &FitState {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the layer on `(batch, in_features)`.
    pub fn forward_batch(&self, input: ArrayView2<f32>) -> PatternResult<ForwardPass> {
        let output_wo_bias = self.forward.forward_wo_bias(input)?;
        let (output, output_wo_bias) = match self.forward.bias() {
            Some(b) => {
                let output = &output_wo_bias + b;
                (output.into_dyn(), Some(output_wo_bias.into_dyn()))
            }
            None => (output_wo_bias.into_dyn(), None),
        };
        Ok(ForwardPass::Affine {
            output,
            output_wo_bias,
            input_dim: input.raw_dim().into_dyn(),
        })
    }

    /// `signal · Aᵀ`, optionally normalized into `[-1, 1]`.
    pub fn backward_batch(
        &self,
        signal: ArrayView2<f32>,
        normalize: bool,
    ) -> PatternResult<Array2<f32>> {
        self.state.require_installed(self.name())?;
        let mut reconstructed = self.backward.forward(signal)?;
        if normalize {
            normalize_signal(&mut reconstructed, self.config.normalize_floor);
        }
        Ok(reconstructed)
    }
}

impl PatternLayer for PatternLinear {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn forward(&self, input: &ArrayD<f32>) -> PatternResult<ForwardPass> {
        self.forward_batch(view2(input, "linear input")?)
    }

    fn backward(
        &self,
        signal: &ArrayD<f32>,
        pass: &ForwardPass,
        normalize: bool,
    ) -> PatternResult<ArrayD<f32>> {
        let ForwardPass::Affine { input_dim, .. } = pass else {
            return Err(pass.mismatch(self.name()));
        };
        let reconstructed = self.backward_batch(view2(signal, "linear signal")?, normalize)?;
        if reconstructed.shape() != input_dim.slice() {
            return Err(PatternError::ShapeMismatch(format!(
                "signal maps to {:?}, forward input was {:?}",
                reconstructed.shape(),
                input_dim.slice()
            )));
        }
        Ok(reconstructed.into_dyn())
    }

    fn compute_statistics(
        &mut self,
        input: &ArrayD<f32>,
        output: &ArrayD<f32>,
        output_wo_bias: Option<&ArrayD<f32>>,
    ) -> PatternResult<()> {
        let x = view2(input, "linear input")?;
        let y = view2(output, "linear output")?;
        let y_wo_b = match output_wo_bias {
            Some(wo_b) => view2(wo_b, "linear output_wo_bias")?,
            None => y,
        };
        if x.ncols() != self.forward.in_features() || y.ncols() != self.forward.out_features() {
            return Err(PatternError::ShapeMismatch(format!(
                "activations ({}, {}) for a {}→{} layer",
                x.ncols(),
                y.ncols(),
                self.forward.in_features(),
                self.forward.out_features()
            )));
        }

        let batch = Statistics::compute(x, y_wo_b, y)?;
        log::debug!("{}: {} rows", self.name(), batch.n);
        self.state.absorb(batch)
    }

    fn compute_patterns(&mut self) -> PatternResult<()> {
        let weight = self.forward.weight().view();
        let eps = self.config.denominator_eps;
        self.state
            .solve(|statistics| compute_patterns_linear(statistics, weight, eps))
    }

    fn set_patterns(&mut self, pattern_type: PatternType) -> PatternResult<()> {
        let backward = &mut self.backward;
        self.state.install(pattern_type, |a| {
            backward.replace_weight(a.t().as_standard_layout().into_owned())
        })?;
        log::debug!("{}: installed {} patterns", self.name(), pattern_type);
        Ok(())
    }

    fn statistics(&self) -> Option<&Statistics> {
        self.state.statistics()
    }

    fn restore_statistics(&mut self, statistics: Statistics) -> PatternResult<()> {
        let expected = (self.forward.in_features(), self.forward.out_features());
        if (statistics.d_in(), statistics.d_out()) != expected {
            return Err(PatternError::ShapeMismatch(format!(
                "statistics ({}, {}) for a {}→{} layer",
                statistics.d_in(),
                statistics.d_out(),
                expected.0,
                expected.1
            )));
        }
        self.state.restore(statistics);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn observed(layer: &mut PatternLinear, x: &Array2<f32>) {
        let input = x.clone().into_dyn();
        let pass = layer.forward(&input).unwrap();
        let wo_b = pass.output_wo_bias().cloned();
        layer
            .compute_statistics(&input, pass.output(), wo_b.as_ref())
            .unwrap();
    }

    #[test]
    fn test_backward_weight_is_pattern_transpose() {
        let forward = Linear::new(array![[0.5, -1.0], [1.0, 0.25], [0.0, 0.5]], None).unwrap();
        let mut layer = PatternLinear::new(forward);
        assert_eq!(layer.backward_weight().dim(), (2, 3));

        let x = array![
            [1.0, 0.5, -0.2],
            [-0.3, 1.2, 0.8],
            [0.9, -1.0, 0.4],
            [0.2, 0.1, -1.5],
            [1.5, 0.7, 0.3]
        ];
        observed(&mut layer, &x);
        layer.compute_patterns().unwrap();
        layer.set_patterns(PatternType::Linear).unwrap();

        let a = layer.state().patterns().unwrap().a_linear.clone();
        assert_eq!(layer.backward_weight(), &a.t().to_owned());

        let signal = array![[1.0, 0.0]];
        let back = layer.backward_batch(signal.view(), false).unwrap();
        for i in 0..3 {
            assert_abs_diff_eq!(back[[0, i]], a[[i, 0]], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_switching_pattern_type() {
        let forward = Linear::new(array![[1.0], [-1.0]], Some(array![-0.2])).unwrap();
        let mut layer = PatternLinear::new(forward);
        observed(
            &mut layer,
            &array![[1.0, 0.0], [0.0, 1.0], [2.0, 0.5], [0.3, 1.1], [-1.0, 0.4]],
        );
        layer.compute_patterns().unwrap();

        layer.set_patterns(PatternType::Relu).unwrap();
        let plus = layer.backward_weight().clone();
        assert_eq!(layer.state().installed(), Some(PatternType::Relu));
        layer.set_patterns(PatternType::Linear).unwrap();
        assert_eq!(layer.state().installed(), Some(PatternType::Linear));
        assert_eq!(
            &plus,
            &layer.state().patterns().unwrap().a_plus.t().to_owned()
        );
    }

    #[test]
    fn test_statistics_width_checked() {
        let mut layer = PatternLinear::new(Linear::xavier(3, 2, false));
        let x = Array2::<f32>::zeros((4, 5)).into_dyn();
        let y = Array2::<f32>::zeros((4, 2)).into_dyn();
        assert!(matches!(
            layer.compute_statistics(&x, &y, None),
            Err(PatternError::ShapeMismatch(_))
        ));
        assert_eq!(layer.state().name(), "unfit");
    }

    #[test]
    fn test_rejects_4d_input() {
        let layer = PatternLinear::new(Linear::xavier(4, 2, true));
        let x = ArrayD::<f32>::zeros(ndarray::IxDyn(&[1, 1, 2, 2]));
        assert!(matches!(
            layer.forward(&x),
            Err(PatternError::ShapeMismatch(_))
        ));
    }
}
