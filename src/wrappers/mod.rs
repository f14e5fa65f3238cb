//! Pattern-estimating wrappers around single forward layers.
//!
//! | Wrapper               | Forward       | Backward                          | Statistics |
//! |-----------------------|---------------|-----------------------------------|------------|
//! | [`PatternConv2d`]     | [`Conv2d`]    | [`ConvTranspose2d`] with patterns | yes        |
//! | [`PatternLinear`]     | [`Linear`]    | [`Linear`] with `Aᵀ`              | yes        |
//! | [`PatternRelu`]       | rectifier     | gate by the forward mask          | no         |
//! | [`PatternMaxPool2d`]  | [`MaxPool2d`] | [`MaxUnpool2d`]                   | no         |
//!
//! All four implement [`PatternLayer`] over dynamic-rank arrays so a host can drive a
//! heterogeneous stack; each also has typed methods for direct use.
//!
//! [`Conv2d`]: crate::layers::Conv2d
//! [`ConvTranspose2d`]: crate::layers::ConvTranspose2d
//! [`Linear`]: crate::layers::Linear
//! [`MaxPool2d`]: crate::layers::MaxPool2d
//! [`MaxUnpool2d`]: crate::layers::MaxUnpool2d
//! [`PatternLayer`]: crate::core::PatternLayer

pub mod conv;
pub mod linear;
pub mod maxpool;
pub mod relu;

pub use conv::PatternConv2d;
pub use linear::PatternLinear;
pub use maxpool::PatternMaxPool2d;
pub use relu::PatternRelu;

use ndarray::{ArrayD, ArrayView2, ArrayView4, Dimension, Ix2, Ix4, IxDyn};

use crate::core::{PatternError, PatternResult};

fn view2<'a>(array: &'a ArrayD<f32>, what: &str) -> PatternResult<ArrayView2<'a, f32>> {
    array.view().into_dimensionality::<Ix2>().map_err(|_| {
        PatternError::ShapeMismatch(format!(
            "{} must be (batch, features), got {:?}",
            what,
            array.shape()
        ))
    })
}

fn view4<'a>(array: &'a ArrayD<f32>, what: &str) -> PatternResult<ArrayView4<'a, f32>> {
    array.view().into_dimensionality::<Ix4>().map_err(|_| {
        PatternError::ShapeMismatch(format!(
            "{} must be (batch, channels, height, width), got {:?}",
            what,
            array.shape()
        ))
    })
}

/// Spatial `(H, W)` of a recorded 4D input shape.
fn spatial(input_dim: &IxDyn) -> PatternResult<(usize, usize)> {
    match input_dim.slice() {
        &[_, _, h, w] => Ok((h, w)),
        other => Err(PatternError::ShapeMismatch(format!(
            "recorded input shape {:?} is not 4D",
            other
        ))),
    }
}
