//! Checkpoint save/load for accumulated layer statistics.
//!
//! Statistics are the only fitted state worth persisting: patterns are solved from them
//! in one call, so a restored wrapper starts in the `Fitting` state. Arrays are stored
//! as nested `Vec`s.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::{PatternError, PatternResult};
use crate::patterns::Statistics;

/// Serializable statistics of one layer.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatisticsData {
    /// Layer name chosen by the host, e.g. `"features.3"`.
    pub name: String,
    pub n: usize,
    pub d_in: usize,
    pub d_out: usize,
    pub mean_x: Vec<f32>,
    pub mean_y: Vec<f32>,
    pub mean_y_wo_b: Vec<f32>,
    pub comoment_xy: Vec<Vec<f32>>,
    pub n_plus: Vec<usize>,
    pub mean_x_plus: Vec<Vec<f32>>,
    pub mean_y_plus: Vec<f32>,
    pub comoment_xy_plus: Vec<Vec<f32>>,
}

/// Serializable checkpoint data.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointData {
    pub layers: Vec<StatisticsData>,
}

fn array2_to_vecs(arr: &Array2<f32>) -> Vec<Vec<f32>> {
    arr.rows().into_iter().map(|row| row.to_vec()).collect()
}

/// Rebuild a `(rows, cols)` matrix; `cols` is needed when there are no rows.
fn vecs_to_array2(vecs: &[Vec<f32>], rows: usize, cols: usize) -> PatternResult<Array2<f32>> {
    if vecs.len() != rows || vecs.iter().any(|r| r.len() != cols) {
        return Err(PatternError::Checkpoint(format!(
            "matrix is not {}x{}",
            rows, cols
        )));
    }
    let flat: Vec<f32> = vecs.iter().flat_map(|r| r.iter().copied()).collect();
    Array2::from_shape_vec((rows, cols), flat)
        .map_err(|e| PatternError::Checkpoint(format!("failed to rebuild matrix: {e}")))
}

fn vec_of_len<T: Clone>(values: &[T], len: usize, field: &str) -> PatternResult<Array1<T>> {
    if values.len() != len {
        return Err(PatternError::Checkpoint(format!(
            "{} has {} entries, expected {}",
            field,
            values.len(),
            len
        )));
    }
    Ok(Array1::from(values.to_vec()))
}

impl StatisticsData {
    pub fn from_statistics(name: &str, statistics: &Statistics) -> Self {
        Self {
            name: name.to_string(),
            n: statistics.n,
            d_in: statistics.d_in(),
            d_out: statistics.d_out(),
            mean_x: statistics.mean_x.to_vec(),
            mean_y: statistics.mean_y.to_vec(),
            mean_y_wo_b: statistics.mean_y_wo_b.to_vec(),
            comoment_xy: array2_to_vecs(&statistics.comoment_xy),
            n_plus: statistics.n_plus.to_vec(),
            mean_x_plus: array2_to_vecs(&statistics.mean_x_plus),
            mean_y_plus: statistics.mean_y_plus.to_vec(),
            comoment_xy_plus: array2_to_vecs(&statistics.comoment_xy_plus),
        }
    }

    /// # Errors
    /// - `Checkpoint` if any stored array disagrees with `d_in` / `d_out`
    pub fn to_statistics(&self) -> PatternResult<Statistics> {
        let (d_in, d_out) = (self.d_in, self.d_out);
        Ok(Statistics {
            n: self.n,
            mean_x: vec_of_len(&self.mean_x, d_in, "mean_x")?,
            mean_y: vec_of_len(&self.mean_y, d_out, "mean_y")?,
            mean_y_wo_b: vec_of_len(&self.mean_y_wo_b, d_out, "mean_y_wo_b")?,
            comoment_xy: vecs_to_array2(&self.comoment_xy, d_in, d_out)?,
            n_plus: vec_of_len(&self.n_plus, d_out, "n_plus")?,
            mean_x_plus: vecs_to_array2(&self.mean_x_plus, d_in, d_out)?,
            mean_y_plus: vec_of_len(&self.mean_y_plus, d_out, "mean_y_plus")?,
            comoment_xy_plus: vecs_to_array2(&self.comoment_xy_plus, d_in, d_out)?,
        })
    }
}

/// Save named per-layer statistics to a JSON file, creating parent directories.
///
/// # Errors
///
/// Returns `Checkpoint` if the data cannot be serialized or the file cannot be written.
pub fn save_checkpoint(path: &Path, layers: &[(&str, &Statistics)]) -> PatternResult<()> {
    let data = CheckpointData {
        layers: layers
            .iter()
            .map(|(name, statistics)| StatisticsData::from_statistics(name, statistics))
            .collect(),
    };

    let json = serde_json::to_string_pretty(&data)
        .map_err(|e| PatternError::Checkpoint(format!("failed to serialize: {e}")))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            PatternError::Checkpoint(format!("failed to create checkpoint directory: {e}"))
        })?;
    }

    std::fs::write(path, json).map_err(|e| {
        PatternError::Checkpoint(format!("failed to write {}: {e}", path.display()))
    })?;
    log::debug!("saved statistics of {} layers to {}", layers.len(), path.display());
    Ok(())
}

/// Load named per-layer statistics from a JSON file, in saved order.
///
/// # Errors
///
/// Returns `Checkpoint` if the file cannot be read or parsed, or an array has the wrong
/// shape.
pub fn load_checkpoint(path: &Path) -> PatternResult<Vec<(String, Statistics)>> {
    let json = std::fs::read_to_string(path).map_err(|e| {
        PatternError::Checkpoint(format!("failed to read {}: {e}", path.display()))
    })?;

    let data: CheckpointData = serde_json::from_str(&json)
        .map_err(|e| PatternError::Checkpoint(format!("failed to parse: {e}")))?;

    data.layers
        .iter()
        .map(|layer| layer.to_statistics().map(|stats| (layer.name.clone(), stats)))
        .collect()
}
