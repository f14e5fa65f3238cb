//! Batch-mergeable statistics between layer inputs and outputs.
//!
//! Holds means and centred co-moments rather than raw sums, merged with Chan's
//! parallel update:
//!
//! ```text
//! n      = n_a + n_b
//! δx     = x̄_b - x̄_a,   δy = ȳ_b - ȳ_a
//! x̄      = x̄_a + δx · n_b / n
//! C_xy   = C_a + C_b + δx δyᵀ · n_a n_b / n
//! ```
//!
//! The gated (ReLU) terms follow the same update per output unit `j`, restricted to the
//! samples where `y_j > 0`, so each column carries its own count `n⁺_j`.

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::core::{PatternError, PatternResult};

/// Accumulated input/output statistics of one layer.
///
/// `x` has `d_in` features, `y` and `y_wo_b` have `d_out`.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    /// Number of rows seen
    pub n: usize,
    /// E[x], shape (d_in)
    pub mean_x: Array1<f32>,
    /// E[y], shape (d_out)
    pub mean_y: Array1<f32>,
    /// E[y_wo_b], shape (d_out)
    pub mean_y_wo_b: Array1<f32>,
    /// Σ (x - x̄)(y_wo_b - ȳ_wo_b)ᵀ, shape (d_in, d_out)
    pub comoment_xy: Array2<f32>,
    /// Per output unit: rows with y > 0, shape (d_out)
    pub n_plus: Array1<usize>,
    /// E[x | y_j > 0] in column j, shape (d_in, d_out)
    pub mean_x_plus: Array2<f32>,
    /// E[y_wo_b_j | y_j > 0], shape (d_out)
    pub mean_y_plus: Array1<f32>,
    /// Σ_{y_j > 0} (x - x̄⁺_j)(y_wo_b_j - ȳ⁺_j) in column j, shape (d_in, d_out)
    pub comoment_xy_plus: Array2<f32>,
}

impl Statistics {
    /// Zero statistics (`n = 0`) for the given widths.
    pub fn empty(d_in: usize, d_out: usize) -> Self {
        Self {
            n: 0,
            mean_x: Array1::zeros(d_in),
            mean_y: Array1::zeros(d_out),
            mean_y_wo_b: Array1::zeros(d_out),
            comoment_xy: Array2::zeros((d_in, d_out)),
            n_plus: Array1::zeros(d_out),
            mean_x_plus: Array2::zeros((d_in, d_out)),
            mean_y_plus: Array1::zeros(d_out),
            comoment_xy_plus: Array2::zeros((d_in, d_out)),
        }
    }

    /// Statistics of a single batch.
    ///
    /// Rows are samples (or output locations for convolutions). `y` is the full output
    /// and only decides the ReLU gate; moments are taken over `y_wo_b`.
    ///
    /// # Errors
    /// - `ShapeMismatch` if row counts differ or `y` and `y_wo_b` differ in width
    pub fn compute(
        x: ArrayView2<f32>,
        y_wo_b: ArrayView2<f32>,
        y: ArrayView2<f32>,
    ) -> PatternResult<Self> {
        let rows = x.nrows();
        if y_wo_b.nrows() != rows || y.nrows() != rows {
            return Err(PatternError::ShapeMismatch(format!(
                "row counts differ: x {}, y_wo_b {}, y {}",
                rows,
                y_wo_b.nrows(),
                y.nrows()
            )));
        }
        if y_wo_b.ncols() != y.ncols() {
            return Err(PatternError::ShapeMismatch(format!(
                "y_wo_b has {} columns, y has {}",
                y_wo_b.ncols(),
                y.ncols()
            )));
        }

        let (d_in, d_out) = (x.ncols(), y.ncols());
        if rows == 0 {
            return Ok(Self::empty(d_in, d_out));
        }

        let n = rows as f32;
        let mean_x = x.sum_axis(Axis(0)) / n;
        let mean_y = y.sum_axis(Axis(0)) / n;
        let mean_y_wo_b = y_wo_b.sum_axis(Axis(0)) / n;

        // Centre on the batch means; co-moments are shift invariant.
        let xc = &x - &mean_x;
        let yc = &y_wo_b - &mean_y_wo_b;
        let comoment_xy = xc.t().dot(&yc);

        // Gate G[r, j] = 1 where unit j fires on row r
        let gate = y.mapv(crate::utils::step);
        let n_plus = y.map_axis(Axis(0), |col| col.iter().filter(|&&v| v > 0.0).count());
        let counts = n_plus.mapv(|c| c as f32);

        let gated_y = &yc * &gate;
        let sum_xc_plus = xc.t().dot(&gate);
        let sum_yc_plus = gated_y.sum_axis(Axis(0));
        let mean_xc_plus = safe_column_divide(&sum_xc_plus, &counts);
        let mean_yc_plus = safe_divide(&sum_yc_plus, &counts);

        // Σ G (x - x̄⁺)(y - ȳ⁺) = Σ G xc yc - n⁺ x̄c⁺ ȳc⁺
        let comoment_xy_plus = xc.t().dot(&gated_y) - &mean_xc_plus * &(&mean_yc_plus * &counts);

        let mean_x_plus = &mean_xc_plus + &mean_x.view().insert_axis(Axis(1));
        let mean_y_plus = &mean_yc_plus + &mean_y_wo_b;

        Ok(Self {
            n: rows,
            mean_x,
            mean_y,
            mean_y_wo_b,
            comoment_xy,
            n_plus,
            mean_x_plus: mask_inactive(mean_x_plus, &counts),
            mean_y_plus: &mean_y_plus * &counts.mapv(|c| if c > 0.0 { 1.0 } else { 0.0 }),
            comoment_xy_plus,
        })
    }

    /// Merge one more batch into these statistics.
    ///
    /// Equivalent to computing over all rows seen so far plus this batch.
    pub fn update(
        &mut self,
        x: ArrayView2<f32>,
        y_wo_b: ArrayView2<f32>,
        y: ArrayView2<f32>,
    ) -> PatternResult<()> {
        let batch = Self::compute(x, y_wo_b, y)?;
        self.merge(&batch)
    }

    /// Merge another set of statistics into this one.
    ///
    /// # Errors
    /// - `ShapeMismatch` if feature widths differ, even when either side is empty
    pub fn merge(&mut self, other: &Statistics) -> PatternResult<()> {
        if self.d_in() != other.d_in() || self.d_out() != other.d_out() {
            return Err(PatternError::ShapeMismatch(format!(
                "cannot merge statistics ({}, {}) with ({}, {})",
                self.d_in(),
                self.d_out(),
                other.d_in(),
                other.d_out()
            )));
        }
        if other.n == 0 {
            return Ok(());
        }
        if self.n == 0 {
            *self = other.clone();
            return Ok(());
        }

        let (na, nb) = (self.n as f32, other.n as f32);
        let n = na + nb;

        let delta_x = &other.mean_x - &self.mean_x;
        let delta_y = &other.mean_y_wo_b - &self.mean_y_wo_b;
        let outer = delta_x
            .view()
            .insert_axis(Axis(1))
            .dot(&delta_y.view().insert_axis(Axis(0)));
        self.comoment_xy = &self.comoment_xy + &other.comoment_xy + &(outer * (na * nb / n));
        self.mean_x = &self.mean_x + &(delta_x * (nb / n));
        self.mean_y_wo_b = &self.mean_y_wo_b + &(delta_y * (nb / n));
        self.mean_y = &self.mean_y + &((&other.mean_y - &self.mean_y) * (nb / n));

        // Gated terms, one count per output column
        let na_plus = self.n_plus.mapv(|c| c as f32);
        let nb_plus = other.n_plus.mapv(|c| c as f32);
        let n_plus = &na_plus + &nb_plus;
        let weight_b = safe_divide(&nb_plus, &n_plus);
        let factor = safe_divide(&(&na_plus * &nb_plus), &n_plus);

        let delta_x_plus = &other.mean_x_plus - &self.mean_x_plus;
        let delta_y_plus = &other.mean_y_plus - &self.mean_y_plus;
        self.comoment_xy_plus = &self.comoment_xy_plus
            + &other.comoment_xy_plus
            + &(&delta_x_plus * &(&delta_y_plus * &factor));
        self.mean_x_plus = &self.mean_x_plus + &(&delta_x_plus * &weight_b);
        self.mean_y_plus = &self.mean_y_plus + &(&delta_y_plus * &weight_b);

        self.n_plus = &self.n_plus + &other.n_plus;
        self.n += other.n;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Input width.
    pub fn d_in(&self) -> usize {
        self.mean_x.len()
    }

    /// Output width.
    pub fn d_out(&self) -> usize {
        self.mean_y.len()
    }

    /// Cov(x, y_wo_b), shape (d_in, d_out).
    pub fn cov_xy(&self) -> Array2<f32> {
        if self.n == 0 {
            return Array2::zeros(self.comoment_xy.dim());
        }
        &self.comoment_xy / self.n as f32
    }

    /// Cov(x, y_wo_b_j | y_j > 0) in column j; zero where unit j never fired.
    pub fn cov_xy_plus(&self) -> Array2<f32> {
        safe_column_divide(&self.comoment_xy_plus, &self.n_plus.mapv(|c| c as f32))
    }

    /// E[x · 1[y_j > 0]] in column j, shape (d_in, d_out).
    pub fn mean_x_gated(&self) -> Array2<f32> {
        if self.n == 0 {
            return Array2::zeros(self.mean_x_plus.dim());
        }
        let fraction = self.n_plus.mapv(|c| c as f32 / self.n as f32);
        &self.mean_x_plus * &fraction
    }
}

/// Elementwise `num / den`, zero where `den == 0`.
fn safe_divide(num: &Array1<f32>, den: &Array1<f32>) -> Array1<f32> {
    let mut out = num.clone();
    out.zip_mut_with(den, |v, &d| *v = if d > 0.0 { *v / d } else { 0.0 });
    out
}

/// Divide column j of `num` by `den[j]`, zero where `den[j] == 0`.
fn safe_column_divide(num: &Array2<f32>, den: &Array1<f32>) -> Array2<f32> {
    let inv = den.mapv(|d| if d > 0.0 { 1.0 / d } else { 0.0 });
    num * &inv
}

fn mask_inactive(mut values: Array2<f32>, counts: &Array1<f32>) -> Array2<f32> {
    for (mut column, &count) in values.columns_mut().into_iter().zip(counts.iter()) {
        if count == 0.0 {
            column.fill(0.0);
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, concatenate, s};

    fn sample_batch() -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let x = array![
            [1.0, 0.5, -1.0],
            [2.0, -0.5, 0.0],
            [0.0, 1.5, 1.0],
            [-1.0, 2.0, 0.5],
            [3.0, 0.0, -2.0],
            [0.5, 0.5, 0.5],
        ];
        let w = array![[0.5, -1.0], [1.0, 0.2], [-0.3, 0.7]];
        let b = array![0.1, -0.2];
        let y_wo_b = x.dot(&w);
        let y = &y_wo_b + &b;
        (x, y_wo_b, y)
    }

    #[test]
    fn test_compute_means() {
        let (x, y_wo_b, y) = sample_batch();
        let stats = Statistics::compute(x.view(), y_wo_b.view(), y.view()).unwrap();
        assert_eq!(stats.n, 6);
        assert_abs_diff_eq!(stats.mean_x[0], 5.5 / 6.0, epsilon = 1e-6);
        assert_abs_diff_eq!(stats.mean_y[0] - stats.mean_y_wo_b[0], 0.1, epsilon = 1e-6);
    }

    #[test]
    fn test_covariance_matches_definition() {
        let (x, y_wo_b, y) = sample_batch();
        let stats = Statistics::compute(x.view(), y_wo_b.view(), y.view()).unwrap();
        let cov = stats.cov_xy();

        let mx = x.mean_axis(Axis(0)).unwrap();
        let my = y_wo_b.mean_axis(Axis(0)).unwrap();
        for i in 0..3 {
            for j in 0..2 {
                let mut expected = 0.0;
                for r in 0..6 {
                    expected += (x[[r, i]] - mx[i]) * (y_wo_b[[r, j]] - my[j]);
                }
                assert_abs_diff_eq!(cov[[i, j]], expected / 6.0, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_gated_terms_match_definition() {
        let (x, y_wo_b, y) = sample_batch();
        let stats = Statistics::compute(x.view(), y_wo_b.view(), y.view()).unwrap();
        let cov_plus = stats.cov_xy_plus();

        for j in 0..2 {
            let active: Vec<usize> = (0..6).filter(|&r| y[[r, j]] > 0.0).collect();
            assert_eq!(stats.n_plus[j], active.len());
            let k = active.len() as f32;
            let mx: Vec<f32> = (0..3)
                .map(|i| active.iter().map(|&r| x[[r, i]]).sum::<f32>() / k)
                .collect();
            let my = active.iter().map(|&r| y_wo_b[[r, j]]).sum::<f32>() / k;
            assert_abs_diff_eq!(stats.mean_y_plus[j], my, epsilon = 1e-5);
            for i in 0..3 {
                assert_abs_diff_eq!(stats.mean_x_plus[[i, j]], mx[i], epsilon = 1e-5);
                let expected: f32 = active
                    .iter()
                    .map(|&r| (x[[r, i]] - mx[i]) * (y_wo_b[[r, j]] - my))
                    .sum::<f32>()
                    / k;
                assert_abs_diff_eq!(cov_plus[[i, j]], expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_split_update_matches_full() {
        let (x, y_wo_b, y) = sample_batch();
        let full = Statistics::compute(x.view(), y_wo_b.view(), y.view()).unwrap();

        let mut split = Statistics::compute(
            x.slice(s![..2, ..]),
            y_wo_b.slice(s![..2, ..]),
            y.slice(s![..2, ..]),
        )
        .unwrap();
        split
            .update(
                x.slice(s![2.., ..]),
                y_wo_b.slice(s![2.., ..]),
                y.slice(s![2.., ..]),
            )
            .unwrap();

        assert_eq!(split.n, full.n);
        assert_eq!(split.n_plus, full.n_plus);
        for (a, b) in split.cov_xy().iter().zip(full.cov_xy().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
        for (a, b) in split.cov_xy_plus().iter().zip(full.cov_xy_plus().iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
        for (a, b) in split.mean_x_plus.iter().zip(full.mean_x_plus.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
        for (a, b) in split.mean_y.iter().zip(full.mean_y.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_merge_order_independent() {
        let (x, y_wo_b, y) = sample_batch();
        let head = Statistics::compute(
            x.slice(s![..4, ..]),
            y_wo_b.slice(s![..4, ..]),
            y.slice(s![..4, ..]),
        )
        .unwrap();
        let tail = Statistics::compute(
            x.slice(s![4.., ..]),
            y_wo_b.slice(s![4.., ..]),
            y.slice(s![4.., ..]),
        )
        .unwrap();

        let mut forward = head.clone();
        forward.merge(&tail).unwrap();
        let mut reverse = tail;
        reverse.merge(&head).unwrap();

        for (a, b) in forward.comoment_xy.iter().zip(reverse.comoment_xy.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
        for (a, b) in forward
            .comoment_xy_plus
            .iter()
            .zip(reverse.comoment_xy_plus.iter())
        {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let (x, y_wo_b, y) = sample_batch();
        let mut stats = Statistics::compute(x.view(), y_wo_b.view(), y.view()).unwrap();
        let before = stats.clone();
        stats
            .update(
                Array2::zeros((0, 3)).view(),
                Array2::zeros((0, 2)).view(),
                Array2::zeros((0, 2)).view(),
            )
            .unwrap();
        assert_eq!(stats, before);
    }

    #[test]
    fn test_unit_never_active() {
        let x = array![[1.0], [2.0]];
        let y = array![[-1.0], [-2.0]];
        let stats = Statistics::compute(x.view(), y.view(), y.view()).unwrap();
        assert_eq!(stats.n_plus[0], 0);
        assert_eq!(stats.cov_xy_plus()[[0, 0]], 0.0);
        assert_eq!(stats.mean_x_plus[[0, 0]], 0.0);
        assert_eq!(stats.mean_x_gated()[[0, 0]], 0.0);
    }

    #[test]
    fn test_gated_mean_matches_definition() {
        let (x, y_wo_b, y) = sample_batch();
        let stats = Statistics::compute(x.view(), y_wo_b.view(), y.view()).unwrap();
        let gated = stats.mean_x_gated();

        // (1/n) Σ_r x_r · 1[y_rj > 0]
        for j in 0..2 {
            for i in 0..3 {
                let expected = (0..6)
                    .filter(|&r| y[[r, j]] > 0.0)
                    .map(|r| x[[r, i]])
                    .sum::<f32>()
                    / 6.0;
                assert_abs_diff_eq!(gated[[i, j]], expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_empty_statistics_keep_their_width() {
        let x = Array2::<f32>::zeros((2, 5));
        let y = Array2::<f32>::zeros((2, 2));
        let mut stats = Statistics::empty(3, 2);
        assert!(matches!(
            stats.update(x.view(), y.view(), y.view()),
            Err(PatternError::ShapeMismatch(_))
        ));
        assert!(stats.is_empty());
        assert_eq!(stats.d_in(), 3);

        // an empty batch of the wrong width is rejected as well
        let (x, y_wo_b, y) = sample_batch();
        let mut full = Statistics::compute(x.view(), y_wo_b.view(), y.view()).unwrap();
        assert!(full.merge(&Statistics::empty(4, 2)).is_err());
        assert_eq!(full.n, 6);
    }

    #[test]
    fn test_shape_mismatch() {
        let x = Array2::<f32>::zeros((3, 2));
        let y = Array2::<f32>::zeros((2, 1));
        assert!(matches!(
            Statistics::compute(x.view(), y.view(), y.view()),
            Err(PatternError::ShapeMismatch(_))
        ));

        let (x, y_wo_b, y) = sample_batch();
        let mut stats = Statistics::compute(x.view(), y_wo_b.view(), y.view()).unwrap();
        let other = Statistics::compute(
            concatenate![Axis(1), x, x].view(),
            y_wo_b.view(),
            y.view(),
        )
        .unwrap();
        assert!(stats.merge(&other).is_err());
    }
}
