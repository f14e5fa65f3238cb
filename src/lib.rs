//! # patternnet
//!
//! PatternNet / PatternAttribution signal estimators for the layers of a trained
//! feed-forward network.
//!
//! ## Overview
//!
//! A gradient explains what a layer's weights *filter*; a pattern explains what *signal*
//! in the input those weights respond to. For each output unit the pattern is estimated
//! from the covariance between the layer's inputs and outputs over a data stream, and a
//! backward pass with the patterns in place of the transposed weights maps an output
//! signal back to input space.
//!
//! Each layer is wrapped once:
//!
//! ```text
//! forward ──▶ compute_statistics (per batch) ──▶ compute_patterns ──▶ set_patterns ──▶ backward
//! ```
//!
//! ## Structure
//!
//! - [`core`] — Errors, lifecycle state and the [`PatternLayer`] trait
//! - [`patterns`] — Dense mapping, running statistics and the pattern solver
//! - [`layers`] — Forward layers and their backward counterparts
//! - [`wrappers`] — Pattern-estimating wrappers for conv, dense, ReLU and max-pool layers
//! - [`checkpoint`] — JSON persistence of accumulated statistics
//! - [`utils`] — Rectifier helpers and signal normalization

pub mod checkpoint;
pub mod core;
pub mod layers;
pub mod patterns;
pub mod utils;
pub mod wrappers;

pub use core::{FitState, ForwardPass, PatternError, PatternLayer, PatternResult, PatternType};
pub use patterns::{Patterns, Statistics};
pub use wrappers::{PatternConv2d, PatternLinear, PatternMaxPool2d, PatternRelu};

/// Numeric settings shared by the pattern-estimating wrappers.
///
/// Passed to [`PatternConv2d::with_config`] and [`PatternLinear::with_config`]; the plain
/// constructors use the defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// A backward signal is only rescaled when its largest magnitude exceeds this.
    pub normalize_floor: f32,
    /// Pattern columns with `|wᵀ cov| < denominator_eps` are zeroed.
    pub denominator_eps: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            normalize_floor: 1e-6,
            denominator_eps: 1e-10,
        }
    }
}
