//! Forward and backward computation layers.
//!
//! Forward layers hold the host network's fixed parameters. Backward layers map an
//! output-space signal to input space; their weights start at zero and are replaced
//! with estimated patterns by the wrappers.
//!
//! | Forward       | Backward          |
//! |---------------|-------------------|
//! | [`Linear`]    | [`Linear`] without bias, shaped `(out, in)` |
//! | [`Conv2d`]    | [`ConvTranspose2d`] |
//! | [`MaxPool2d`] | [`MaxUnpool2d`]   |

pub mod conv;
pub mod linear;
pub mod pool;

pub use conv::{Conv2d, ConvTranspose2d};
pub use linear::Linear;
pub use pool::{MaxPool2d, MaxUnpool2d};

use crate::core::{PatternError, PatternResult};

/// Spatial hyperparameters of a sliding-window layer, as `(height, width)` pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
        }
    }
}

impl Geometry {
    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_dilation(mut self, dilation: (usize, usize)) -> Self {
        self.dilation = dilation;
        self
    }

    /// # Errors
    /// - `InvalidArgument` if a stride or dilation factor is zero
    pub fn validate(&self) -> PatternResult<()> {
        if self.stride.0 == 0 || self.stride.1 == 0 {
            return Err(PatternError::InvalidArgument(format!(
                "stride must be at least 1, got {:?}",
                self.stride
            )));
        }
        if self.dilation.0 == 0 || self.dilation.1 == 0 {
            return Err(PatternError::InvalidArgument(format!(
                "dilation must be at least 1, got {:?}",
                self.dilation
            )));
        }
        Ok(())
    }
}
