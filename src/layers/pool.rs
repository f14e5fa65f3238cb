//! Max-pooling with recorded switches, and the matching unpooling.

use ndarray::{Array4, ArrayView4};

use super::Geometry;
use crate::core::{PatternError, PatternResult};
use crate::patterns::dense::{effective_size, output_extent};

/// 2D max-pooling that always records where each maximum came from.
///
/// Indices are flat positions `h * W + w` within each `(batch, channel)` plane, so
/// unpooling needs the input extent as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxPool2d {
    kernel: (usize, usize),
    geometry: Geometry,
}

impl MaxPool2d {
    /// # Errors
    /// - `InvalidArgument` for an empty kernel or a zero stride or dilation
    pub fn new(kernel: (usize, usize), geometry: Geometry) -> PatternResult<Self> {
        geometry.validate()?;
        if kernel.0 == 0 || kernel.1 == 0 {
            return Err(PatternError::InvalidArgument(format!(
                "pooling kernel must be non-empty, got {:?}",
                kernel
            )));
        }
        Ok(Self { kernel, geometry })
    }

    /// Non-overlapping pooling: stride equals the kernel size.
    pub fn square(size: usize) -> PatternResult<Self> {
        Self::new(
            (size, size),
            Geometry::default().with_stride((size, size)),
        )
    }

    pub fn kernel_size(&self) -> (usize, usize) {
        self.kernel
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Pool `input (B, C, H, W)`, returning the maxima and their flat indices.
    ///
    /// Padding never wins: windows only compare positions inside the input.
    pub fn forward(
        &self,
        input: ArrayView4<f32>,
    ) -> PatternResult<(Array4<f32>, Array4<usize>)> {
        let (batch, channels, height, width) = input.dim();
        let g = &self.geometry;
        let eh = effective_size(self.kernel.0, g.dilation.0);
        let ew = effective_size(self.kernel.1, g.dilation.1);
        let (Some(out_h), Some(out_w)) = (
            output_extent(height, eh, g.stride.0, g.padding.0),
            output_extent(width, ew, g.stride.1, g.padding.1),
        ) else {
            return Err(PatternError::ShapeMismatch(format!(
                "input {:?} too small for pooling window {:?}",
                (height, width),
                (eh, ew)
            )));
        };

        let mut output = Array4::from_elem((batch, channels, out_h, out_w), f32::NEG_INFINITY);
        let mut indices = Array4::zeros((batch, channels, out_h, out_w));
        for b in 0..batch {
            for c in 0..channels {
                for i in 0..out_h {
                    for j in 0..out_w {
                        let mut best = f32::NEG_INFINITY;
                        let mut best_idx = None;
                        for u in 0..self.kernel.0 {
                            let Some(h) =
                                (i * g.stride.0 + u * g.dilation.0).checked_sub(g.padding.0)
                            else {
                                continue;
                            };
                            if h >= height {
                                continue;
                            }
                            for v in 0..self.kernel.1 {
                                let Some(w) =
                                    (j * g.stride.1 + v * g.dilation.1).checked_sub(g.padding.1)
                                else {
                                    continue;
                                };
                                if w >= width {
                                    continue;
                                }
                                let value = input[[b, c, h, w]];
                                if best_idx.is_none() || value > best || value.is_nan() {
                                    best = value;
                                    best_idx = Some(h * width + w);
                                }
                            }
                        }
                        let Some(idx) = best_idx else {
                            return Err(PatternError::ShapeMismatch(format!(
                                "pooling window ({}, {}) lies entirely in the padding",
                                i, j
                            )));
                        };
                        output[[b, c, i, j]] = best;
                        indices[[b, c, i, j]] = idx;
                    }
                }
            }
        }

        Ok((output, indices))
    }
}

/// Max-unpooling: routes each value back to the position its maximum came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaxUnpool2d;

impl MaxUnpool2d {
    /// Scatter `signal (B, C, H', W')` through `indices` onto zeros of `(B, C, H, W)`.
    ///
    /// Values routed to the same position by overlapping windows are summed.
    ///
    /// # Errors
    /// - `ShapeMismatch` if signal and indices differ in shape or an index lies outside
    ///   the `input_size` plane
    pub fn forward(
        &self,
        signal: ArrayView4<f32>,
        indices: ArrayView4<usize>,
        input_size: (usize, usize),
    ) -> PatternResult<Array4<f32>> {
        if signal.dim() != indices.dim() {
            return Err(PatternError::ShapeMismatch(format!(
                "signal {:?} and pooling indices {:?} differ",
                signal.dim(),
                indices.dim()
            )));
        }

        let (batch, channels, _, _) = signal.dim();
        let (height, width) = input_size;
        let plane = height * width;
        let mut output = Array4::zeros((batch, channels, height, width));
        for ((b, c, i, j), &value) in signal.indexed_iter() {
            let idx = indices[[b, c, i, j]];
            if idx >= plane {
                return Err(PatternError::ShapeMismatch(format!(
                    "pooling index {} outside a {}x{} plane",
                    idx, height, width
                )));
            }
            output[[b, c, idx / width, idx % width]] += value;
        }
        Ok(output)
    }
}
