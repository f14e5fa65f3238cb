//! Rectifier helpers and signal normalization.

use ndarray::{ArrayBase, DataMut, Dimension};

/// Rectifier: max(0, x).
#[inline]
pub fn relu(x: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        0.0
    }
}

/// Indicator 1[x > 0], the derivative of the rectifier away from zero.
#[inline]
pub fn step(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        0.0
    }
}

/// Largest absolute value, `0.0` for an empty array.
pub fn abs_max<S, D>(values: &ArrayBase<S, D>) -> f32
where
    S: ndarray::Data<Elem = f32>,
    D: Dimension,
{
    values.iter().fold(0.0f32, |acc, &v| acc.max(v.abs()))
}

/// Rescale a signal into `[-1, 1]` in place.
///
/// Divides by the largest absolute value when it exceeds `floor`, then clips. Below the
/// floor the signal is only clipped, so near-zero signals are not blown up.
pub fn normalize_signal<S, D>(signal: &mut ArrayBase<S, D>, floor: f32)
where
    S: DataMut<Elem = f32>,
    D: Dimension,
{
    let absmax = abs_max(signal);
    if absmax > floor {
        signal.mapv_inplace(|v| v / absmax);
    }
    signal.mapv_inplace(|v| v.clamp(-1.0, 1.0));
}
