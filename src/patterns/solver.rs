//! Closed-form signal estimators.
//!
//! For each output unit `j` with weight column `w_j`:
//!
//! ```text
//! a_j = Cov(x, s_j) / (w_jᵀ Cov(x, s_j))
//! ```
//!
//! - `A_linear`: `s = y_wo_b` over all rows
//! - `A_plus`:   `s = y_wo_b` over the rows where `y_j > 0`
//!
//! The normalization makes `w_jᵀ a_j = 1`, so a signal of strength `y_j` maps back to
//! `y_j · a_j` in input space. Columns whose denominator vanishes carry no recoverable
//! signal and are set to zero.

use ndarray::{Array2, Array4, ArrayView2, Axis};

use crate::core::{PatternError, PatternResult, PatternType};
use crate::patterns::Statistics;

/// Signal estimators of one layer.
///
/// Both matrices have shape `(d_in, d_out)`, where `d_in` is the input width of a dense
/// layer or `in_channels · kh · kw` for a convolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Patterns {
    /// Estimator for the linear regime
    pub a_linear: Array2<f32>,
    /// Estimator for the rectified regime
    pub a_plus: Array2<f32>,
    /// Columns zeroed because their denominator vanished (counted over both matrices)
    pub degenerate: usize,
}

impl Patterns {
    pub fn get(&self, pattern_type: PatternType) -> &Array2<f32> {
        match pattern_type {
            PatternType::Relu => &self.a_plus,
            PatternType::Linear => &self.a_linear,
        }
    }

    /// Reshape one estimator into a kernel `(out, in, kh, kw)` for a convolution.
    pub fn kernel(
        &self,
        pattern_type: PatternType,
        dim: (usize, usize, usize, usize),
    ) -> PatternResult<Array4<f32>> {
        unflatten_kernel(self.get(pattern_type), dim)
    }
}

/// Flatten a kernel `(out, in, kh, kw)` into `(in·kh·kw, out)`, matching the dense-map
/// column order `(c, u, v)`.
pub fn flatten_kernel(kernel: &Array4<f32>) -> PatternResult<Array2<f32>> {
    let (out_c, in_c, kh, kw) = kernel.dim();
    let rows = kernel
        .as_standard_layout()
        .into_owned()
        .into_shape((out_c, in_c * kh * kw))?;
    Ok(rows.reversed_axes().as_standard_layout().into_owned())
}

/// Inverse of [`flatten_kernel`]: `(in·kh·kw, out)` back to `(out, in, kh, kw)`.
pub fn unflatten_kernel(
    flat: &Array2<f32>,
    dim: (usize, usize, usize, usize),
) -> PatternResult<Array4<f32>> {
    let (out_c, in_c, kh, kw) = dim;
    if flat.dim() != (in_c * kh * kw, out_c) {
        return Err(PatternError::ShapeMismatch(format!(
            "pattern {:?} cannot form kernel {:?}",
            flat.dim(),
            dim
        )));
    }
    Ok(flat
        .t()
        .as_standard_layout()
        .into_owned()
        .into_shape(dim)?)
}

/// Patterns of a dense layer with weight `(d_in, d_out)`.
///
/// # Errors
/// - `ShapeMismatch` if the statistics widths differ from the weight shape
pub fn compute_patterns_linear(
    statistics: &Statistics,
    weight: ArrayView2<f32>,
    eps: f32,
) -> PatternResult<Patterns> {
    if weight.dim() != (statistics.d_in(), statistics.d_out()) {
        return Err(PatternError::ShapeMismatch(format!(
            "weight {:?} does not match statistics ({}, {})",
            weight.dim(),
            statistics.d_in(),
            statistics.d_out()
        )));
    }

    let (a_linear, zeroed_linear) = solve(statistics.cov_xy(), weight, eps);
    let (a_plus, zeroed_plus) = solve(statistics.cov_xy_plus(), weight, eps);

    let degenerate = zeroed_linear + zeroed_plus;
    if degenerate > 0 {
        log::warn!(
            "{} of {} pattern columns had a vanishing denominator and were zeroed",
            degenerate,
            2 * statistics.d_out()
        );
    }
    log::debug!(
        "solved patterns for {} inputs × {} outputs from {} rows",
        statistics.d_in(),
        statistics.d_out(),
        statistics.n
    );

    Ok(Patterns {
        a_linear,
        a_plus,
        degenerate,
    })
}

/// Patterns of a convolution with kernel `(out, in, kh, kw)`.
///
/// The statistics must be over the compact (non-dilated) tap columns.
pub fn compute_patterns_conv(
    statistics: &Statistics,
    kernel: &Array4<f32>,
    eps: f32,
) -> PatternResult<Patterns> {
    let weight = flatten_kernel(kernel)?;
    compute_patterns_linear(statistics, weight.view(), eps)
}

/// `cov[:, j] / (w[:, j]ᵀ cov[:, j])`, zeroing columns with `|den| < eps`.
fn solve(cov: Array2<f32>, weight: ArrayView2<f32>, eps: f32) -> (Array2<f32>, usize) {
    let denominators = (&weight * &cov).sum_axis(Axis(0));
    let mut zeroed = 0;
    let mut patterns = cov;
    for (mut column, &den) in patterns
        .columns_mut()
        .into_iter()
        .zip(denominators.iter())
    {
        if !den.is_finite() || den.abs() < eps {
            column.fill(0.0);
            zeroed += 1;
        } else {
            column.mapv_inplace(|v| v / den);
        }
    }
    patterns.mapv_inplace(|v| if v.is_finite() { v } else { 0.0 });
    (patterns, zeroed)
}
