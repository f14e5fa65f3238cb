//! Shared contracts for pattern-wrapped layers.
//!
//! This module provides:
//! - The crate error type and result alias
//! - [`PatternType`], selecting which signal estimator drives the backward pass
//! - [`ForwardPass`], everything a forward call hands back to its backward call
//! - [`FitState`], the per-wrapper statistics → patterns → installed lifecycle
//! - The [`PatternLayer`] trait every wrapper implements
//!
//! ## Lifecycle
//!
//! ```text
//! Unfit ──compute_statistics──▶ Fitting ──compute_patterns──▶ Fitted ──set_patterns──▶ Installed
//!                                  ▲                              │                        │
//!                                  └──────compute_statistics──────┴────────────────────────┘
//! ```
//!
//! New statistics always demote a wrapper back to `Fitting`: patterns derived from the
//! old statistics are stale and must be solved again.

use ndarray::{Array2, ArrayD, IxDyn, ShapeError};
use std::error::Error;
use std::fmt;
use std::str::FromStr;

use crate::patterns::{Patterns, Statistics};

/// Error type for pattern operations.
#[derive(Debug, Clone, PartialEq)]
pub enum PatternError {
    /// Operation called before the wrapper reached the required state
    InvalidState(String),
    /// Unrecognized or out-of-range argument
    InvalidArgument(String),
    /// Tensor shape incompatible with the layer configuration
    ShapeMismatch(String),
    /// Checkpoint could not be written, read or decoded
    Checkpoint(String),
}

impl fmt::Display for PatternError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            PatternError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            PatternError::ShapeMismatch(msg) => write!(f, "Shape mismatch: {}", msg),
            PatternError::Checkpoint(msg) => write!(f, "Checkpoint error: {}", msg),
        }
    }
}

impl Error for PatternError {}

impl From<ShapeError> for PatternError {
    fn from(err: ShapeError) -> Self {
        PatternError::ShapeMismatch(err.to_string())
    }
}

pub type PatternResult<T> = Result<T, PatternError>;

/// Which signal estimator to install into a backward layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatternType {
    /// `A_plus`: estimated on samples where the unit is active (ReLU regime)
    #[default]
    Relu,
    /// `A_linear`: estimated on all samples
    Linear,
}

impl PatternType {
    pub fn name(&self) -> &'static str {
        match self {
            PatternType::Relu => "relu",
            PatternType::Linear => "linear",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PatternType {
    type Err = PatternError;

    fn from_str(s: &str) -> PatternResult<Self> {
        match s {
            "relu" => Ok(PatternType::Relu),
            "linear" => Ok(PatternType::Linear),
            other => Err(PatternError::InvalidArgument(format!(
                "unknown pattern type '{}', expected 'relu' or 'linear'",
                other
            ))),
        }
    }
}

/// Result of a wrapped forward call.
///
/// Carries the layer output plus whatever the matching backward call needs.
#[derive(Debug, Clone)]
pub enum ForwardPass {
    /// Convolution or dense layer.
    ///
    /// `output_wo_bias` is `Some` iff the forward layer has a bias term.
    /// `input_dim` is the shape of the input, so the backward pass can restore it exactly.
    Affine {
        output: ArrayD<f32>,
        output_wo_bias: Option<ArrayD<f32>>,
        input_dim: IxDyn,
    },
    /// Rectifier: `non_positive[i]` is true where the input was `<= 0`.
    Rectified {
        output: ArrayD<f32>,
        non_positive: ArrayD<bool>,
    },
    /// Max-pooling: flat `h * W + w` argmax per output element and per input plane.
    Pooled {
        output: ArrayD<f32>,
        indices: ArrayD<usize>,
        input_dim: IxDyn,
    },
}

impl ForwardPass {
    /// The layer output, regardless of variant.
    pub fn output(&self) -> &ArrayD<f32> {
        match self {
            ForwardPass::Affine { output, .. }
            | ForwardPass::Rectified { output, .. }
            | ForwardPass::Pooled { output, .. } => output,
        }
    }

    /// The output without bias, when the layer has one.
    pub fn output_wo_bias(&self) -> Option<&ArrayD<f32>> {
        match self {
            ForwardPass::Affine { output_wo_bias, .. } => output_wo_bias.as_ref(),
            _ => None,
        }
    }

    pub fn into_output(self) -> ArrayD<f32> {
        match self {
            ForwardPass::Affine { output, .. }
            | ForwardPass::Rectified { output, .. }
            | ForwardPass::Pooled { output, .. } => output,
        }
    }

    fn variant(&self) -> &'static str {
        match self {
            ForwardPass::Affine { .. } => "affine",
            ForwardPass::Rectified { .. } => "rectified",
            ForwardPass::Pooled { .. } => "pooled",
        }
    }

    /// Error for a backward call handed the wrong kind of forward pass.
    pub(crate) fn mismatch(&self, layer: &str) -> PatternError {
        PatternError::InvalidArgument(format!(
            "{} backward received a {} forward pass",
            layer,
            self.variant()
        ))
    }
}

/// Fitting lifecycle of a pattern-estimating wrapper.
#[derive(Debug, Clone, Default)]
pub enum FitState {
    /// No statistics yet
    #[default]
    Unfit,
    /// Statistics accumulated, no patterns solved
    Fitting { statistics: Statistics },
    /// Patterns solved but not installed into the backward layer
    Fitted {
        statistics: Statistics,
        patterns: Patterns,
    },
    /// Patterns of `pattern_type` live in the backward layer
    Installed {
        statistics: Statistics,
        patterns: Patterns,
        pattern_type: PatternType,
    },
}

impl FitState {
    pub fn name(&self) -> &'static str {
        match self {
            FitState::Unfit => "unfit",
            FitState::Fitting { .. } => "fitting",
            FitState::Fitted { .. } => "fitted",
            FitState::Installed { .. } => "installed",
        }
    }

    pub fn statistics(&self) -> Option<&Statistics> {
        match self {
            FitState::Unfit => None,
            FitState::Fitting { statistics }
            | FitState::Fitted { statistics, .. }
            | FitState::Installed { statistics, .. } => Some(statistics),
        }
    }

    pub fn patterns(&self) -> Option<&Patterns> {
        match self {
            FitState::Fitted { patterns, .. } | FitState::Installed { patterns, .. } => {
                Some(patterns)
            }
            _ => None,
        }
    }

    /// Pattern type currently installed in the backward layer, if any.
    pub fn installed(&self) -> Option<PatternType> {
        match self {
            FitState::Installed { pattern_type, .. } => Some(*pattern_type),
            _ => None,
        }
    }

    /// Merge a batch's statistics into the accumulated ones.
    ///
    /// Empty batches leave the state untouched. Any solved patterns are dropped.
    pub fn absorb(&mut self, batch: Statistics) -> PatternResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        match self {
            FitState::Unfit => {
                log::debug!("initialized statistics from {} rows", batch.n);
                *self = FitState::Fitting { statistics: batch };
                return Ok(());
            }
            FitState::Fitting { statistics }
            | FitState::Fitted { statistics, .. }
            | FitState::Installed { statistics, .. } => {
                statistics.merge(&batch)?;
                log::debug!("merged {} rows, total {}", batch.n, statistics.n);
            }
        }

        self.demote();
        Ok(())
    }

    /// Replace the statistics wholesale, e.g. after loading a checkpoint.
    pub fn restore(&mut self, statistics: Statistics) {
        *self = if statistics.is_empty() {
            FitState::Unfit
        } else {
            FitState::Fitting { statistics }
        };
    }

    /// Solve patterns from the current statistics and move to `Fitted`.
    pub fn solve<F>(&mut self, solver: F) -> PatternResult<()>
    where
        F: FnOnce(&Statistics) -> PatternResult<Patterns>,
    {
        let Some(statistics) = self.statistics() else {
            return Err(PatternError::InvalidState(
                "patterns requested before any statistics were computed".to_string(),
            ));
        };
        let patterns = solver(statistics)?;

        *self = match std::mem::take(self) {
            FitState::Fitting { statistics }
            | FitState::Fitted { statistics, .. }
            | FitState::Installed { statistics, .. } => FitState::Fitted {
                statistics,
                patterns,
            },
            FitState::Unfit => FitState::Unfit,
        };
        Ok(())
    }

    /// Hand the chosen pattern matrix to `install` and move to `Installed` on success.
    pub fn install<F>(&mut self, pattern_type: PatternType, install: F) -> PatternResult<()>
    where
        F: FnOnce(&Array2<f32>) -> PatternResult<()>,
    {
        let Some(patterns) = self.patterns() else {
            return Err(PatternError::InvalidState(format!(
                "cannot set {} patterns while {}; call compute_patterns first",
                pattern_type,
                self.name()
            )));
        };
        install(patterns.get(pattern_type))?;

        *self = match std::mem::take(self) {
            FitState::Fitted {
                statistics,
                patterns,
            }
            | FitState::Installed {
                statistics,
                patterns,
                ..
            } => FitState::Installed {
                statistics,
                patterns,
                pattern_type,
            },
            other => other,
        };
        Ok(())
    }

    /// Fail unless patterns are installed in the backward layer.
    pub fn require_installed(&self, layer: &str) -> PatternResult<PatternType> {
        self.installed().ok_or_else(|| {
            PatternError::InvalidState(format!(
                "{} backward called while {}; call set_patterns first",
                layer,
                self.name()
            ))
        })
    }

    fn demote(&mut self) {
        *self = match std::mem::take(self) {
            FitState::Fitted { statistics, .. } | FitState::Installed { statistics, .. } => {
                FitState::Fitting { statistics }
            }
            other => other,
        };
    }
}

/// Shared contract of the four layer wrappers.
///
/// Conv and dense wrappers estimate patterns; rectifier and pooling wrappers only route
/// the signal, so their fitting operations are no-ops.
pub trait PatternLayer {
    /// Name for debugging
    fn name(&self) -> &'static str;

    /// Run the forward layer, keeping what the backward pass needs.
    fn forward(&self, input: &ArrayD<f32>) -> PatternResult<ForwardPass>;

    /// Map an output-space signal back to input space.
    ///
    /// `pass` must be the result of the forward call this signal belongs to.
    /// `normalize` rescales into `[-1, 1]` (conv and dense only).
    fn backward(
        &self,
        signal: &ArrayD<f32>,
        pass: &ForwardPass,
        normalize: bool,
    ) -> PatternResult<ArrayD<f32>>;

    /// Accumulate statistics from one batch of activations.
    ///
    /// Without `output_wo_bias` the layer is treated as unbiased and `output` is used
    /// for both.
    fn compute_statistics(
        &mut self,
        _input: &ArrayD<f32>,
        _output: &ArrayD<f32>,
        _output_wo_bias: Option<&ArrayD<f32>>,
    ) -> PatternResult<()> {
        Ok(())
    }

    /// Solve patterns from the accumulated statistics.
    fn compute_patterns(&mut self) -> PatternResult<()> {
        Ok(())
    }

    /// Install the chosen patterns into the backward layer.
    fn set_patterns(&mut self, _pattern_type: PatternType) -> PatternResult<()> {
        Ok(())
    }

    /// Accumulated statistics, if this layer keeps any.
    fn statistics(&self) -> Option<&Statistics> {
        None
    }

    /// Replace accumulated statistics, e.g. from a checkpoint.
    fn restore_statistics(&mut self, _statistics: Statistics) -> PatternResult<()> {
        Err(PatternError::InvalidState(format!(
            "{} layers keep no statistics",
            self.name()
        )))
    }
}
