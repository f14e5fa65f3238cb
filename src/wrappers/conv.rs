//! Convolution wrapper.
//!
//! Statistics are collected on the dense (im2col) view of the convolution, where it
//! becomes a dense layer with `in_channels · kh · kw` inputs per output location.
//! Dilated kernels only contribute their real taps, so the patterns always have the
//! shape of the compact kernel.

use ndarray::{Array4, ArrayD, ArrayView4, Dimension};

use super::{spatial, view4};
use crate::core::{FitState, ForwardPass, PatternError, PatternLayer, PatternResult, PatternType};
use crate::layers::{Conv2d, ConvTranspose2d};
use crate::patterns::{
    compute_patterns_conv, conv_maps_to_dense, output_to_dense, unflatten_kernel, Statistics,
};
use crate::utils::normalize_signal;
use crate::Config;

/// A [`Conv2d`] paired with a pattern-driven [`ConvTranspose2d`].
#[derive(Debug, Clone)]
pub struct PatternConv2d {
    forward: Conv2d,
    backward: ConvTranspose2d,
    state: FitState,
    config: Config,
}

impl PatternConv2d {
    pub fn new(forward: Conv2d) -> Self {
        Self::with_config(forward, Config::default())
    }

    pub fn with_config(forward: Conv2d, config: Config) -> Self {
        let backward = ConvTranspose2d::for_conv(&forward);
        Self {
            forward,
            backward,
            state: FitState::default(),
            config,
        }
    }

    pub fn forward_layer(&self) -> &Conv2d {
        &self.forward
    }

    /// Current backward kernel `(out, in, kh, kw)`; zeros until patterns are installed.
    pub fn backward_weight(&self) -> &Array4<f32> {
        self.backward.weight()
    }

    pub fn state(&self) -> &FitState {
        &self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Dense width of the statistics: compact taps per output location.
    fn tap_count(&self) -> usize {
        let (kh, kw) = self.forward.kernel_size();
        self.forward.in_channels() * kh * kw
    }

    /// Run the convolution on `(B, C, H, W)`.
    pub fn forward_map(&self, input: ArrayView4<f32>) -> PatternResult<ForwardPass> {
        let output_wo_bias = self.forward.forward_wo_bias(input)?;
        let (output, output_wo_bias) = if self.forward.bias().is_some() {
            let output = self.forward.add_bias(output_wo_bias.clone());
            (output.into_dyn(), Some(output_wo_bias.into_dyn()))
        } else {
            (output_wo_bias.into_dyn(), None)
        };
        Ok(ForwardPass::Affine {
            output,
            output_wo_bias,
            input_dim: input.raw_dim().into_dyn(),
        })
    }

    /// Statistics of one batch of `(input, output, output_wo_bias)` activation maps.
    ///
    /// # Errors
    /// - `ShapeMismatch` if the maps do not fit the convolution's geometry or channels
    pub fn batch_statistics(
        &self,
        input: ArrayView4<f32>,
        output: ArrayView4<f32>,
        output_wo_bias: Option<ArrayView4<f32>>,
    ) -> PatternResult<Statistics> {
        if output.dim().1 != self.forward.out_channels() {
            return Err(PatternError::ShapeMismatch(format!(
                "output has {} channels, layer produces {}",
                output.dim().1,
                self.forward.out_channels()
            )));
        }

        let mask = self.forward.dilation_mask();
        let geometry = self.forward.geometry();
        let (x_dense, y_dense) = conv_maps_to_dense(
            input,
            output,
            mask.effective_kernel(),
            geometry.stride,
            geometry.padding,
        )?;
        let x_taps = mask.select(x_dense.view())?;

        let y_wo_b_dense = match output_wo_bias {
            Some(wo_b) => {
                if wo_b.dim() != output.dim() {
                    return Err(PatternError::ShapeMismatch(format!(
                        "output_wo_bias {:?} differs from output {:?}",
                        wo_b.dim(),
                        output.dim()
                    )));
                }
                output_to_dense(wo_b)?
            }
            None => y_dense.clone(),
        };

        Statistics::compute(x_taps.view(), y_wo_b_dense.view(), y_dense.view())
    }

    /// Transposed convolution of `signal` back onto the input grid of `input_size`.
    pub fn backward_map(
        &self,
        signal: ArrayView4<f32>,
        input_size: (usize, usize),
        normalize: bool,
    ) -> PatternResult<Array4<f32>> {
        self.state.require_installed(self.name())?;
        let mut reconstructed = self.backward.forward(signal, input_size)?;
        if normalize {
            normalize_signal(&mut reconstructed, self.config.normalize_floor);
        }
        Ok(reconstructed)
    }
}

impl PatternLayer for PatternConv2d {
    fn name(&self) -> &'static str {
        "conv2d"
    }

    fn forward(&self, input: &ArrayD<f32>) -> PatternResult<ForwardPass> {
        self.forward_map(view4(input, "conv input")?)
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
        let reconstructed =
            self.backward_map(view4(signal, "conv signal")?, spatial(input_dim)?, normalize)?;
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
        let output_wo_bias = match output_wo_bias {
            Some(wo_b) => Some(view4(wo_b, "conv output_wo_bias")?),
            None => None,
        };
        let batch = self.batch_statistics(
            view4(input, "conv input")?,
            view4(output, "conv output")?,
            output_wo_bias,
        )?;
        log::debug!(
            "{}: {} dense rows of width {}",
            self.name(),
            batch.n,
            batch.d_in()
        );
        self.state.absorb(batch)
    }

    fn compute_patterns(&mut self) -> PatternResult<()> {
        let kernel = self.forward.weight();
        let eps = self.config.denominator_eps;
        self.state
            .solve(|statistics| compute_patterns_conv(statistics, kernel, eps))
    }

    fn set_patterns(&mut self, pattern_type: PatternType) -> PatternResult<()> {
        let dim = self.forward.weight().dim();
        let backward = &mut self.backward;
        self.state.install(pattern_type, |a| {
            backward.replace_weight(unflatten_kernel(a, dim)?)
        })?;
        log::debug!("{}: installed {} patterns {:?}", self.name(), pattern_type, dim);
        Ok(())
    }

    fn statistics(&self) -> Option<&Statistics> {
        self.state.statistics()
    }

    fn restore_statistics(&mut self, statistics: Statistics) -> PatternResult<()> {
        let expected = (self.tap_count(), self.forward.out_channels());
        if (statistics.d_in(), statistics.d_out()) != expected {
            return Err(PatternError::ShapeMismatch(format!(
                "statistics ({}, {}) for a conv with {:?} taps × channels",
                statistics.d_in(),
                statistics.d_out(),
                expected
            )));
        }
        self.state.restore(statistics);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Geometry;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, Array1};

    fn ramp(dim: (usize, usize, usize, usize)) -> Array4<f32> {
        let len = dim.0 * dim.1 * dim.2 * dim.3;
        Array::linspace(-1.0, 1.0, len).into_shape(dim).unwrap()
    }

    fn fitted(conv: Conv2d, input: &Array4<f32>) -> PatternConv2d {
        let mut layer = PatternConv2d::new(conv);
        let x = input.clone().into_dyn();
        let pass = layer.forward(&x).unwrap();
        let output = pass.output().clone();
        let wo_b = pass.output_wo_bias().cloned();
        layer.compute_statistics(&x, &output, wo_b.as_ref()).unwrap();
        layer.compute_patterns().unwrap();
        layer
    }

    #[test]
    fn test_forward_exposes_bias_free_output() {
        let conv = Conv2d::new(
            ramp((2, 1, 2, 2)),
            Some(Array1::from(vec![0.5, -0.5])),
            Geometry::default(),
        )
        .unwrap();
        let layer = PatternConv2d::new(conv);
        let pass = layer.forward(&ramp((1, 1, 4, 4)).into_dyn()).unwrap();
        let diff = pass.output() - pass.output_wo_bias().unwrap();
        assert!(diff.index_axis(ndarray::Axis(1), 0).iter().all(|&d| (d - 0.5).abs() < 1e-6));
        assert!(diff.index_axis(ndarray::Axis(1), 1).iter().all(|&d| (d + 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_unbiased_forward_has_no_wo_bias() {
        let conv = Conv2d::xavier(1, 2, (2, 2), Geometry::default(), false).unwrap();
        let pass = PatternConv2d::new(conv)
            .forward(&ramp((1, 1, 3, 3)).into_dyn())
            .unwrap();
        assert!(pass.output_wo_bias().is_none());
    }

    #[test]
    fn test_statistics_width_uses_compact_taps() {
        let g = Geometry::default().with_dilation((2, 2)).with_padding((1, 1));
        let conv = Conv2d::xavier(2, 3, (3, 3), g, true).unwrap();
        let input = ramp((2, 2, 7, 7));
        let layer = fitted(conv, &input);
        let statistics = layer.statistics().unwrap();
        assert_eq!(statistics.d_in(), 2 * 3 * 3);
        assert_eq!(statistics.d_out(), 3);
        // (7 + 2 - 5) / 1 + 1 = 5 per side
        assert_eq!(statistics.n, 2 * 5 * 5);
    }

    #[test]
    fn test_backward_before_patterns_fails() {
        let conv = Conv2d::xavier(1, 2, (3, 3), Geometry::default(), false).unwrap();
        let layer = PatternConv2d::new(conv);
        let x = ramp((1, 1, 5, 5)).into_dyn();
        let pass = layer.forward(&x).unwrap();
        let result = layer.backward(pass.output(), &pass, false);
        assert!(matches!(result, Err(PatternError::InvalidState(_))));
    }

    #[test]
    fn test_compute_patterns_before_statistics_fails() {
        let conv = Conv2d::xavier(1, 2, (3, 3), Geometry::default(), false).unwrap();
        let mut layer = PatternConv2d::new(conv);
        assert!(matches!(
            layer.compute_patterns(),
            Err(PatternError::InvalidState(_))
        ));
    }

    #[test]
    fn test_set_patterns_fills_backward_kernel() {
        let conv = Conv2d::xavier(2, 3, (2, 2), Geometry::default(), true).unwrap();
        let mut layer = fitted(conv, &ramp((3, 2, 5, 5)).mapv(f32::sin));
        assert!(layer.backward_weight().iter().all(|&w| w == 0.0));

        layer.set_patterns(PatternType::Linear).unwrap();
        let expected = layer
            .state()
            .patterns()
            .unwrap()
            .kernel(PatternType::Linear, (3, 2, 2, 2))
            .unwrap();
        for (a, b) in layer.backward_weight().iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_backward_rejects_wrong_pass() {
        let conv = Conv2d::xavier(1, 1, (1, 1), Geometry::default(), false).unwrap();
        let layer = PatternConv2d::new(conv);
        let shape = ndarray::IxDyn(&[1, 1, 1, 1]);
        let pass = ForwardPass::Rectified {
            output: ArrayD::zeros(shape.clone()),
            non_positive: ArrayD::from_elem(shape.clone(), false),
        };
        let result = layer.backward(&ArrayD::zeros(shape), &pass, false);
        assert!(matches!(result, Err(PatternError::InvalidArgument(_))));
    }

    #[test]
    fn test_backward_rejects_signal_from_smaller_batch() {
        let conv = Conv2d::xavier(1, 2, (3, 3), Geometry::default().with_padding((1, 1)), true)
            .unwrap();
        let input = ramp((4, 1, 9, 9)).mapv(f32::cos);
        let mut layer = fitted(conv, &input);
        layer.set_patterns(PatternType::Relu).unwrap();

        let pass = layer.forward(&input.into_dyn()).unwrap();
        let partial = pass
            .output()
            .slice_axis(ndarray::Axis(0), ndarray::Slice::from(..2))
            .to_owned();
        assert!(matches!(
            layer.backward(&partial, &pass, false),
            Err(PatternError::ShapeMismatch(_))
        ));
        assert_eq!(
            layer.backward(pass.output(), &pass, false).unwrap().shape(),
            &[4, 1, 9, 9]
        );
    }

    #[test]
    fn test_restore_checks_widths() {
        let conv = Conv2d::xavier(2, 3, (3, 3), Geometry::default(), false).unwrap();
        let mut layer = PatternConv2d::new(conv);
        assert!(layer.restore_statistics(Statistics::empty(5, 3)).is_err());
        assert!(layer.restore_statistics(Statistics::empty(18, 3)).is_ok());
        assert_eq!(layer.state().name(), "unfit");
    }
}
