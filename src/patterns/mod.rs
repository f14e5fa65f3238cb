//! Statistics and pattern mathematics shared by the layer wrappers.
//!
//! ## Submodules
//!
//! - [`dense`] — Dilation masks and conv-to-matrix (im2col / col2im) mapping
//! - [`statistics`] — Batch-mergeable input/output co-moments
//! - [`solver`] — Closed-form `A_linear` / `A_plus` signal estimators
//!
//! For an output unit with weight column `w` the estimator is
//!
//! ```text
//! a = Cov(x, s) / (wᵀ Cov(x, s))
//! ```
//!
//! with `s = y_wo_b` over all samples for `A_linear`, and over the samples where the
//! unit fires (`y > 0`) for `A_plus`.

pub mod dense;
pub mod solver;
pub mod statistics;

pub use dense::{
    conv_maps_to_dense, dense_to_output, dilation_mask, fold, output_to_dense, unfold,
    DilationMask,
};
pub use solver::{
    compute_patterns_conv, compute_patterns_linear, flatten_kernel, unflatten_kernel, Patterns,
};
pub use statistics::Statistics;
