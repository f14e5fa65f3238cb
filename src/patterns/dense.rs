//! Dilation masks and dense mapping of convolution activations.
//!
//! A convolution is a matrix product once its sliding windows are laid out as rows:
//!
//! ```text
//! X_dense: (B·H'·W', C·KH·KW)   one row per output location, one column per tap
//! Y_dense: (B·H'·W', O)         one row per output location, one column per channel
//! Y_dense = X_dense · W_flat
//! ```
//!
//! Rows are ordered `(b, i, j)` row-major, columns `(c, u, v)` row-major. Dilated kernels
//! are unfolded over their full bounding box `(KH, KW)`; [`DilationMask`] then selects
//! the columns that hold real kernel taps.

use ndarray::{s, Array2, Array4, ArrayView2, ArrayView4, Axis};

use crate::core::{PatternError, PatternResult};

/// Bounding box of a kernel of size `k` dilated by `d`: `k + (d - 1)(k - 1)`.
pub fn effective_size(k: usize, d: usize) -> usize {
    if k == 0 {
        return 0;
    }
    k + (d - 1) * (k - 1)
}

/// Binary support of a dilated kernel embedded in its bounding box.
///
/// Shape `(c1, c2, kh + (dh-1)(kh-1), kw + (dw-1)(kw-1))`, ones at rows `0, dh, 2dh, …`
/// and columns `0, dw, 2dw, …`.
pub fn dilation_mask(
    kernel_dim: (usize, usize, usize, usize),
    dilation: (usize, usize),
) -> Array4<f32> {
    let (c1, c2, kh, kw) = kernel_dim;
    let (dh, dw) = (dilation.0.max(1), dilation.1.max(1));
    let mut mask = Array4::zeros((c1, c2, effective_size(kh, dh), effective_size(kw, dw)));
    mask.slice_mut(s![.., .., ..;dh, ..;dw]).fill(1.0);
    mask
}

/// Cached dilation support for one convolution.
#[derive(Debug, Clone)]
pub struct DilationMask {
    kernel: (usize, usize),
    dilation: (usize, usize),
    in_channels: usize,
    /// Dense-column indices of real taps, in `(c, u, v)` order
    columns: Vec<usize>,
}

impl DilationMask {
    /// Build the mask for a `kernel` of `in_channels` dilated by `dilation`.
    ///
    /// # Errors
    /// - `InvalidArgument` if a dilation factor is zero
    pub fn new(
        kernel: (usize, usize),
        dilation: (usize, usize),
        in_channels: usize,
    ) -> PatternResult<Self> {
        if dilation.0 == 0 || dilation.1 == 0 {
            return Err(PatternError::InvalidArgument(format!(
                "dilation must be at least 1, got {:?}",
                dilation
            )));
        }

        let (kh, kw) = kernel;
        let eff_h = effective_size(kh, dilation.0);
        let eff_w = effective_size(kw, dilation.1);
        let mut columns = Vec::with_capacity(in_channels * kh * kw);
        for c in 0..in_channels {
            for u in 0..kh {
                for v in 0..kw {
                    let row = u * dilation.0;
                    let col = v * dilation.1;
                    columns.push((c * eff_h + row) * eff_w + col);
                }
            }
        }

        Ok(Self {
            kernel,
            dilation,
            in_channels,
            columns,
        })
    }

    pub fn kernel(&self) -> (usize, usize) {
        self.kernel
    }

    pub fn dilation(&self) -> (usize, usize) {
        self.dilation
    }

    pub fn is_dilated(&self) -> bool {
        self.dilation != (1, 1)
    }

    /// Bounding box of the dilated kernel.
    pub fn effective_kernel(&self) -> (usize, usize) {
        (
            effective_size(self.kernel.0, self.dilation.0),
            effective_size(self.kernel.1, self.dilation.1),
        )
    }

    /// Number of dense columns over the full bounding box.
    pub fn dilated_width(&self) -> usize {
        let (eh, ew) = self.effective_kernel();
        self.in_channels * eh * ew
    }

    pub fn columns(&self) -> &[usize] {
        &self.columns
    }

    /// The mask tensor for this kernel, shaped `(c1, c2, KH, KW)`.
    pub fn tensor(&self, c1: usize, c2: usize) -> Array4<f32> {
        dilation_mask((c1, c2, self.kernel.0, self.kernel.1), self.dilation)
    }

    /// Keep only the columns of real kernel taps: `(rows, C·KH·KW) → (rows, C·kh·kw)`.
    pub fn select(&self, dense: ArrayView2<f32>) -> PatternResult<Array2<f32>> {
        if dense.ncols() != self.dilated_width() {
            return Err(PatternError::ShapeMismatch(format!(
                "dense map has {} columns, dilated kernel expects {}",
                dense.ncols(),
                self.dilated_width()
            )));
        }
        if !self.is_dilated() {
            return Ok(dense.to_owned());
        }
        Ok(dense.select(Axis(1), &self.columns))
    }

    /// Place compact tap columns at their dilated positions, zeros elsewhere.
    pub fn scatter(&self, compact: ArrayView2<f32>) -> PatternResult<Array2<f32>> {
        if compact.ncols() != self.columns.len() {
            return Err(PatternError::ShapeMismatch(format!(
                "compact map has {} columns, kernel has {} taps",
                compact.ncols(),
                self.columns.len()
            )));
        }
        if !self.is_dilated() {
            return Ok(compact.to_owned());
        }

        let mut dilated = Array2::zeros((compact.nrows(), self.dilated_width()));
        for (src, &dst) in self.columns.iter().enumerate() {
            dilated.column_mut(dst).assign(&compact.column(src));
        }
        Ok(dilated)
    }
}

/// Output spatial extent of a sliding window, or `None` if the window does not fit.
pub fn output_extent(input: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = input + 2 * padding;
    if stride == 0 || kernel == 0 || padded < kernel {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

fn extent_or_err(
    input: (usize, usize),
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> PatternResult<(usize, usize)> {
    let h = output_extent(input.0, kernel.0, stride.0, padding.0);
    let w = output_extent(input.1, kernel.1, stride.1, padding.1);
    match (h, w) {
        (Some(h), Some(w)) => Ok((h, w)),
        _ => Err(PatternError::ShapeMismatch(format!(
            "input {:?} cannot hold kernel {:?} with stride {:?} and padding {:?}",
            input, kernel, stride, padding
        ))),
    }
}

/// Unfold sliding windows into a dense matrix (im2col).
///
/// Returns `X_dense` of shape `(B·H'·W', C·KH·KW)` and the output extent `(H', W')`.
/// Positions in the zero padding read as `0`.
pub fn unfold(
    input: ArrayView4<f32>,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> PatternResult<(Array2<f32>, (usize, usize))> {
    let (batch, channels, height, width) = input.dim();
    let (out_h, out_w) = extent_or_err((height, width), kernel, stride, padding)?;
    let (kh, kw) = kernel;

    let mut dense = Array2::zeros((batch * out_h * out_w, channels * kh * kw));
    for b in 0..batch {
        for i in 0..out_h {
            for j in 0..out_w {
                let row = (b * out_h + i) * out_w + j;
                let mut dense_row = dense.row_mut(row);
                for c in 0..channels {
                    for u in 0..kh {
                        let Some(h) = (i * stride.0 + u).checked_sub(padding.0) else {
                            continue;
                        };
                        if h >= height {
                            continue;
                        }
                        for v in 0..kw {
                            let Some(w) = (j * stride.1 + v).checked_sub(padding.1) else {
                                continue;
                            };
                            if w >= width {
                                continue;
                            }
                            dense_row[(c * kh + u) * kw + v] = input[[b, c, h, w]];
                        }
                    }
                }
            }
        }
    }

    Ok((dense, (out_h, out_w)))
}

/// Fold dense window columns back onto the input grid (col2im).
///
/// Inverse layout of [`unfold`]; taps of overlapping windows are summed and taps
/// falling into the padding are dropped.
pub fn fold(
    dense: ArrayView2<f32>,
    input_dim: (usize, usize, usize, usize),
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> PatternResult<Array4<f32>> {
    let (batch, channels, height, width) = input_dim;
    let (out_h, out_w) = extent_or_err((height, width), kernel, stride, padding)?;
    let (kh, kw) = kernel;

    let expected = (batch * out_h * out_w, channels * kh * kw);
    if dense.dim() != expected {
        return Err(PatternError::ShapeMismatch(format!(
            "cannot fold {:?} onto input {:?}: expected dense shape {:?}",
            dense.dim(),
            input_dim,
            expected
        )));
    }

    let mut folded = Array4::zeros(input_dim);
    for b in 0..batch {
        for i in 0..out_h {
            for j in 0..out_w {
                let dense_row = dense.row((b * out_h + i) * out_w + j);
                for c in 0..channels {
                    for u in 0..kh {
                        let Some(h) = (i * stride.0 + u).checked_sub(padding.0) else {
                            continue;
                        };
                        if h >= height {
                            continue;
                        }
                        for v in 0..kw {
                            let Some(w) = (j * stride.1 + v).checked_sub(padding.1) else {
                                continue;
                            };
                            if w >= width {
                                continue;
                            }
                            folded[[b, c, h, w]] += dense_row[(c * kh + u) * kw + v];
                        }
                    }
                }
            }
        }
    }

    Ok(folded)
}

/// Flatten a `(B, O, H', W')` activation map into `(B·H'·W', O)`.
pub fn output_to_dense(output: ArrayView4<f32>) -> PatternResult<Array2<f32>> {
    let (batch, channels, height, width) = output.dim();
    let rows = batch * height * width;
    let permuted = output.permuted_axes([0, 2, 3, 1]);
    Ok(permuted
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, channels))?)
}

/// Inverse of [`output_to_dense`].
pub fn dense_to_output(
    dense: ArrayView2<f32>,
    output_dim: (usize, usize, usize, usize),
) -> PatternResult<Array4<f32>> {
    let (batch, channels, height, width) = output_dim;
    if dense.dim() != (batch * height * width, channels) {
        return Err(PatternError::ShapeMismatch(format!(
            "dense map {:?} does not match activation shape {:?}",
            dense.dim(),
            output_dim
        )));
    }
    let spatial = dense
        .as_standard_layout()
        .into_owned()
        .into_shape((batch, height, width, channels))?;
    Ok(spatial
        .permuted_axes([0, 3, 1, 2])
        .as_standard_layout()
        .into_owned())
}

/// Map a convolution's input and output activations to dense matrices.
///
/// `kernel` is the effective (dilated) kernel size. Returns `(X_dense, Y_dense)` with
/// matching rows.
///
/// # Errors
/// - `ShapeMismatch` if batch sizes differ or the output extent does not follow from the
///   input extent and the geometry
pub fn conv_maps_to_dense(
    input: ArrayView4<f32>,
    output: ArrayView4<f32>,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> PatternResult<(Array2<f32>, Array2<f32>)> {
    if input.dim().0 != output.dim().0 {
        return Err(PatternError::ShapeMismatch(format!(
            "input batch {} != output batch {}",
            input.dim().0,
            output.dim().0
        )));
    }

    let (x_dense, extent) = unfold(input, kernel, stride, padding)?;
    let (_, _, out_h, out_w) = output.dim();
    if extent != (out_h, out_w) {
        return Err(PatternError::ShapeMismatch(format!(
            "output extent {:?} does not match expected {:?}",
            (out_h, out_w),
            extent
        )));
    }

    Ok((x_dense, output_to_dense(output)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    #[test]
    fn test_undilated_mask_is_all_ones() {
        let mask = dilation_mask((4, 3, 3, 5), (1, 1));
        assert_eq!(mask.dim(), (4, 3, 3, 5));
        assert!(mask.iter().all(|&m| m == 1.0));
    }

    #[test]
    fn test_dilated_mask_positions() {
        let mask = dilation_mask((1, 1, 3, 2), (2, 3));
        assert_eq!(mask.dim(), (1, 1, 5, 4));
        for h in 0..5 {
            for w in 0..4 {
                let expected = if h % 2 == 0 && w % 3 == 0 { 1.0 } else { 0.0 };
                assert_eq!(mask[[0, 0, h, w]], expected, "at ({h}, {w})");
            }
        }
        assert_eq!(mask.sum(), 6.0);
    }

    #[test]
    fn test_columns_match_mask_tensor() {
        let dm = DilationMask::new((2, 2), (2, 2), 2).unwrap();
        let flat: Vec<f32> = dm.tensor(1, 2).iter().copied().collect();
        let from_tensor: Vec<usize> = flat
            .iter()
            .enumerate()
            .filter(|(_, &m)| m == 1.0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(dm.columns(), &from_tensor[..]);
    }

    #[test]
    fn test_zero_dilation_rejected() {
        assert!(matches!(
            DilationMask::new((3, 3), (0, 1), 1),
            Err(PatternError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_select_then_scatter() {
        let dm = DilationMask::new((2, 2), (2, 1), 1).unwrap();
        assert_eq!(dm.effective_kernel(), (3, 2));
        let dense = Array::range(0.0, 12.0, 1.0).into_shape((2, 6)).unwrap();
        let compact = dm.select(dense.view()).unwrap();
        assert_eq!(compact, array![[0.0, 1.0, 4.0, 5.0], [6.0, 7.0, 10.0, 11.0]]);

        let scattered = dm.scatter(compact.view()).unwrap();
        assert_eq!(
            scattered,
            array![
                [0.0, 1.0, 0.0, 0.0, 4.0, 5.0],
                [6.0, 7.0, 0.0, 0.0, 10.0, 11.0]
            ]
        );
    }

    #[test]
    fn test_unfold_shape() {
        let input = Array4::<f32>::ones((2, 3, 6, 5));
        let (dense, extent) = unfold(input.view(), (3, 2), (1, 1), (0, 0)).unwrap();
        assert_eq!(extent, (4, 4));
        assert_eq!(dense.dim(), (2 * 4 * 4, 3 * 3 * 2));
    }

    #[test]
    fn test_unfold_values_with_padding() {
        // 1×1×2×2 input, 2×2 kernel, padding 1 → 3×3 windows
        let input = Array4::from_shape_vec((1, 1, 2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let (dense, extent) = unfold(input.view(), (2, 2), (1, 1), (1, 1)).unwrap();
        assert_eq!(extent, (3, 3));
        // top-left window only sees input[0][0] in its bottom-right tap
        assert_eq!(dense.row(0).to_vec(), vec![0.0, 0.0, 0.0, 1.0]);
        // centre window covers the whole image
        assert_eq!(dense.row(4).to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_unfold_rejects_small_input() {
        let input = Array4::<f32>::ones((1, 1, 2, 2));
        assert!(matches!(
            unfold(input.view(), (3, 3), (1, 1), (0, 0)),
            Err(PatternError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_fold_counts_overlaps() {
        let ones = Array2::<f32>::ones((4, 4));
        let folded = fold(ones.view(), (1, 1, 3, 3), (2, 2), (1, 1), (0, 0)).unwrap();
        let expected = array![[1.0, 2.0, 1.0], [2.0, 4.0, 2.0], [1.0, 2.0, 1.0]];
        assert_eq!(folded.index_axis(Axis(0), 0).index_axis(Axis(0), 0), expected);
    }

    #[test]
    fn test_output_dense_layout() {
        let output = Array::range(0.0, 16.0, 1.0).into_shape((2, 2, 2, 2)).unwrap();
        let dense = output_to_dense(output.view()).unwrap();
        assert_eq!(dense.dim(), (8, 2));
        // row (b=0, i=0, j=1) holds channel values output[0, :, 0, 1]
        assert_eq!(dense.row(1).to_vec(), vec![1.0, 5.0]);

        let back = dense_to_output(dense.view(), (2, 2, 2, 2)).unwrap();
        assert_eq!(back, output);
    }

    #[test]
    fn test_conv_maps_rejects_wrong_extent() {
        let input = Array4::<f32>::ones((1, 1, 5, 5));
        let output = Array4::<f32>::ones((1, 2, 4, 4));
        let result = conv_maps_to_dense(input.view(), output.view(), (3, 3), (1, 1), (0, 0));
        assert!(matches!(result, Err(PatternError::ShapeMismatch(_))));
    }
}
