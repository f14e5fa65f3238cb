//! 2D convolution and its transpose, both computed as dense matrix products.
//!
//! ```text
//! forward:   Y_dense = select(unfold(x)) · W_flat            (B·H'·W', O)
//! transpose: x̂      = fold(scatter(S_dense · K_flatᵀ))       (B, C, H, W)
//! ```
//!
//! Dilated kernels are unfolded over their bounding box; the [`DilationMask`] picks the
//! real taps on the way in and scatters them back on the way out.

use ndarray::{Array1, Array4, ArrayView4};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;

use super::Geometry;
use crate::core::{PatternError, PatternResult};
use crate::patterns::dense::{dense_to_output, fold, output_extent, output_to_dense, unfold};
use crate::patterns::{flatten_kernel, DilationMask};

/// 2D convolution with weight `(out_channels, in_channels, kh, kw)` and optional bias.
#[derive(Debug, Clone)]
pub struct Conv2d {
    weight: Array4<f32>,
    bias: Option<Array1<f32>>,
    geometry: Geometry,
    mask: DilationMask,
}

impl Conv2d {
    /// # Errors
    /// - `ShapeMismatch` if the bias length differs from `out_channels`
    /// - `InvalidArgument` for a zero stride or dilation
    pub fn new(
        weight: Array4<f32>,
        bias: Option<Array1<f32>>,
        geometry: Geometry,
    ) -> PatternResult<Self> {
        geometry.validate()?;
        let (out_c, in_c, kh, kw) = weight.dim();
        if let Some(b) = &bias {
            if b.len() != out_c {
                return Err(PatternError::ShapeMismatch(format!(
                    "bias of length {} for {} output channels",
                    b.len(),
                    out_c
                )));
            }
        }
        let mask = DilationMask::new((kh, kw), geometry.dilation, in_c)?;
        Ok(Self {
            weight,
            bias,
            geometry,
            mask,
        })
    }

    /// Xavier/Glorot uniform kernel with `fan_in = in·kh·kw`, `fan_out = out·kh·kw`.
    pub fn xavier(
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        geometry: Geometry,
        with_bias: bool,
    ) -> PatternResult<Self> {
        let taps = kernel.0 * kernel.1;
        let limit = (6.0f32 / ((in_channels + out_channels) * taps).max(1) as f32).sqrt();
        let weight = Array4::random(
            (out_channels, in_channels, kernel.0, kernel.1),
            Uniform::new(-limit, limit),
        );
        let bias = with_bias.then(|| Array1::zeros(out_channels));
        Self::new(weight, bias, geometry)
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dim().0
    }

    /// Compact kernel size `(kh, kw)`.
    pub fn kernel_size(&self) -> (usize, usize) {
        self.mask.kernel()
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn weight(&self) -> &Array4<f32> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Array1<f32>> {
        self.bias.as_ref()
    }

    pub fn dilation_mask(&self) -> &DilationMask {
        &self.mask
    }

    /// Output spatial extent for an input of `(height, width)`.
    pub fn output_size(&self, input: (usize, usize)) -> Option<(usize, usize)> {
        let (eh, ew) = self.mask.effective_kernel();
        let g = &self.geometry;
        Some((
            output_extent(input.0, eh, g.stride.0, g.padding.0)?,
            output_extent(input.1, ew, g.stride.1, g.padding.1)?,
        ))
    }

    /// Convolution without the bias.
    pub fn forward_wo_bias(&self, input: ArrayView4<f32>) -> PatternResult<Array4<f32>> {
        let (batch, in_c, _, _) = input.dim();
        if in_c != self.in_channels() {
            return Err(PatternError::ShapeMismatch(format!(
                "input has {} channels, layer expects {}",
                in_c,
                self.in_channels()
            )));
        }

        let (dense, (out_h, out_w)) = unfold(
            input,
            self.mask.effective_kernel(),
            self.geometry.stride,
            self.geometry.padding,
        )?;
        let taps = self.mask.select(dense.view())?;
        let y_dense = taps.dot(&flatten_kernel(&self.weight)?);
        dense_to_output(y_dense.view(), (batch, self.out_channels(), out_h, out_w))
    }

    /// Convolution plus the per-channel bias.
    pub fn forward(&self, input: ArrayView4<f32>) -> PatternResult<Array4<f32>> {
        Ok(self.add_bias(self.forward_wo_bias(input)?))
    }

    /// Add the per-channel bias to a bias-free output, if the layer has one.
    pub fn add_bias(&self, mut output: Array4<f32>) -> Array4<f32> {
        if let Some(b) = &self.bias {
            for (mut channel, &bias) in output.axis_iter_mut(ndarray::Axis(1)).zip(b.iter()) {
                channel += bias;
            }
        }
        output
    }
}

/// Transposed convolution mapping a conv's output space back to its input space.
///
/// Weight `(out_channels, in_channels, kh, kw)` is indexed like the forward kernel it
/// stands in for: a signal on output channel `o` spreads over input channel `c` through
/// `weight[o, c]`. No bias.
#[derive(Debug, Clone)]
pub struct ConvTranspose2d {
    weight: Array4<f32>,
    geometry: Geometry,
    mask: DilationMask,
}

impl ConvTranspose2d {
    /// A zero-weight transpose matching `conv`.
    pub fn for_conv(conv: &Conv2d) -> Self {
        Self {
            weight: Array4::zeros(conv.weight.dim()),
            geometry: conv.geometry,
            mask: conv.mask.clone(),
        }
    }

    pub fn weight(&self) -> &Array4<f32> {
        &self.weight
    }

    /// Replace the kernel with one of the same shape.
    pub fn replace_weight(&mut self, weight: Array4<f32>) -> PatternResult<()> {
        if weight.dim() != self.weight.dim() {
            return Err(PatternError::ShapeMismatch(format!(
                "replacement kernel {:?} for kernel {:?}",
                weight.dim(),
                self.weight.dim()
            )));
        }
        self.weight = weight;
        Ok(())
    }

    /// Map `signal (B, O, H', W')` onto an input grid of `input_size = (H, W)`.
    ///
    /// # Errors
    /// - `ShapeMismatch` if the signal channels differ from the kernel, or a forward
    ///   conv over `input_size` would not produce the signal's extent
    pub fn forward(
        &self,
        signal: ArrayView4<f32>,
        input_size: (usize, usize),
    ) -> PatternResult<Array4<f32>> {
        let (out_c, in_c, kh, kw) = self.weight.dim();
        let (batch, sig_c, sig_h, sig_w) = signal.dim();
        if sig_c != out_c {
            return Err(PatternError::ShapeMismatch(format!(
                "signal has {} channels, kernel expects {}",
                sig_c, out_c
            )));
        }

        let kernel = self.mask.effective_kernel();
        let g = &self.geometry;
        let expected = (
            output_extent(input_size.0, kernel.0, g.stride.0, g.padding.0),
            output_extent(input_size.1, kernel.1, g.stride.1, g.padding.1),
        );
        if expected != (Some(sig_h), Some(sig_w)) {
            return Err(PatternError::ShapeMismatch(format!(
                "signal extent {:?} cannot come from input {:?}",
                (sig_h, sig_w),
                input_size
            )));
        }

        let s_dense = output_to_dense(signal)?;
        let k_rows = self
            .weight
            .as_standard_layout()
            .into_owned()
            .into_shape((out_c, in_c * kh * kw))?;
        let compact = s_dense.dot(&k_rows);
        let dilated = self.mask.scatter(compact.view())?;
        fold(
            dilated.view(),
            (batch, in_c, input_size.0, input_size.1),
            kernel,
            g.stride,
            g.padding,
        )
    }
}
