use ndarray::{stack, Array2, Array4, ArrayView1, ArrayView3, ArrayView4, Axis};
use std::path::Path;
use std::sync::Mutex;

use crate::segmentation::normalization::Normalization;
use crate::segmentation::tiler::Tile;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),
    #[error("Batch size must be positive")]
    InvalidBatchSize,
    #[error("Model returned shape {actual:?} for a batch of shape {input:?}")]
    ShapeMismatch {
        input: (usize, usize, usize, usize),
        actual: (usize, usize, usize, usize),
    },
    #[error("Model reported {0} classes; class indices must fit in a byte")]
    TooManyClasses(usize),
    #[error("Model backend error: {0}")]
    Backend(String),
}

/// A pretrained segmentation network.
///
/// Batches are NHWC in RGB order after normalization; the output is NHWK class
/// probabilities with `K = num_classes()`.
pub trait SegmentationModel: Send {
    fn predict(&mut self, batch: ArrayView4<f32>) -> Result<Array4<f32>, InferenceError>;

    /// Spatial `(height, width)` the network was trained on.
    fn input_size(&self) -> (usize, usize);

    fn num_classes(&self) -> usize;

    fn name(&self) -> &str;
}

/// Loads the configured model artifact.
pub fn load_model(
    model_path: &Path,
    input_size: usize,
    num_classes: usize,
) -> Result<Box<dyn SegmentationModel>, InferenceError> {
    if !model_path.exists() {
        return Err(InferenceError::ModelUnavailable(format!(
            "Model file not found: {}",
            model_path.display()
        )));
    }

    load_backend(model_path, input_size, num_classes)
}

#[cfg(feature = "torch")]
fn load_backend(
    model_path: &Path,
    input_size: usize,
    num_classes: usize,
) -> Result<Box<dyn SegmentationModel>, InferenceError> {
    let model = crate::segmentation::torch_model::TorchScriptModel::load(
        model_path,
        input_size,
        num_classes,
    )?;
    Ok(Box::new(model))
}

#[cfg(not(feature = "torch"))]
fn load_backend(
    _model_path: &Path,
    _input_size: usize,
    _num_classes: usize,
) -> Result<Box<dyn SegmentationModel>, InferenceError> {
    Err(InferenceError::ModelUnavailable(
        "this build has no model backend; rebuild with `--features torch`".to_string(),
    ))
}

/// Single access point to the model.
///
/// At most one `predict` call runs at a time; tiles are normalized and batched here.
pub struct InferenceService {
    model: Option<Mutex<Box<dyn SegmentationModel>>>,
    normalization: Normalization,
}

impl InferenceService {
    pub fn new(model: Box<dyn SegmentationModel>, normalization: Normalization) -> Self {
        log::info!(
            "Inference service ready: model={}, input={:?}, classes={}, preprocessing={}",
            model.name(),
            model.input_size(),
            model.num_classes(),
            normalization.name()
        );
        Self {
            model: Some(Mutex::new(model)),
            normalization,
        }
    }

    pub fn unavailable(normalization: Normalization) -> Self {
        Self {
            model: None,
            normalization,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Returns one class-index map per tile, in input order.
    pub fn predict(
        &self,
        tiles: &[Tile],
        batch_size: usize,
    ) -> Result<Vec<Array2<u8>>, InferenceError> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| InferenceError::ModelUnavailable("no model backend loaded".to_string()))?;
        if batch_size == 0 {
            return Err(InferenceError::InvalidBatchSize);
        }

        // A panic in an earlier call poisons the lock; models keep no state between calls.
        let mut model = model.lock().unwrap_or_else(|poisoned| {
            log::warn!("Model lock was poisoned by a panicked inference call; recovering");
            poisoned.into_inner()
        });

        let mut predictions = Vec::with_capacity(tiles.len());
        for (index, chunk) in tiles.chunks(batch_size).enumerate() {
            let batch = self.prepare_batch(chunk)?;
            log::debug!("Running inference batch {} ({} tiles)", index, chunk.len());
            let probabilities = model.predict(batch.view())?;
            predictions.extend(class_maps(batch.view(), probabilities.view())?);
        }
        Ok(predictions)
    }

    fn prepare_batch(&self, tiles: &[Tile]) -> Result<Array4<f32>, InferenceError> {
        let views: Vec<ArrayView3<f32>> = tiles.iter().map(|tile| tile.pixels.view()).collect();
        let mut batch = stack(Axis(0), &views)
            .map_err(|e| InferenceError::Backend(format!("Failed to stack tiles: {}", e)))?;
        for tile in batch.outer_iter_mut() {
            self.normalization.apply(tile);
        }
        Ok(batch)
    }
}

fn class_maps(
    batch: ArrayView4<f32>,
    probabilities: ArrayView4<f32>,
) -> Result<Vec<Array2<u8>>, InferenceError> {
    let (n, h, w, _) = batch.dim();
    let (pn, ph, pw, classes) = probabilities.dim();
    if (pn, ph, pw) != (n, h, w) || classes == 0 {
        return Err(InferenceError::ShapeMismatch {
            input: batch.dim(),
            actual: probabilities.dim(),
        });
    }
    if classes > usize::from(u8::MAX) + 1 {
        return Err(InferenceError::TooManyClasses(classes));
    }

    Ok(probabilities
        .outer_iter()
        .map(|tile| tile.map_axis(Axis(2), argmax))
        .collect())
}

/// Index of the largest value; ties resolve to the lowest index.
fn argmax(values: ArrayView1<f32>) -> u8 {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (index, &value) in values.iter().enumerate() {
        if value > best_value {
            best = index;
            best_value = value;
        }
    }
    best as u8
}
