use ndarray::{Array2, Array3};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{ProcessingError, Result};
use crate::segmentation::model::InferenceService;
use crate::segmentation::reconstruct::{crop, reconstruct};
use crate::segmentation::tiler;

/// Tiles an image, runs the model per tile and stitches the class mask back together.
#[derive(Clone)]
pub struct Segmenter {
    inference: Arc<InferenceService>,
}

impl Segmenter {
    pub fn new(inference: Arc<InferenceService>) -> Self {
        Self { inference }
    }

    pub fn model_loaded(&self) -> bool {
        self.inference.is_loaded()
    }

    /// Returns the per-pixel class mask at the image's original resolution.
    pub fn segment(
        &self,
        image: &Array3<u8>,
        tile_size: usize,
        batch_size: usize,
    ) -> Result<Array2<u8>> {
        let start = Instant::now();
        let (height, width, channels) = image.dim();
        if channels != 3 {
            return Err(ProcessingError::internal(format!(
                "expected 3 channels, got {}",
                channels
            )));
        }
        log::info!("Processing image of shape ({}, {}, {})", height, width, channels);

        let pixels = image.mapv(f32::from);
        let tiling = tiler::tile(pixels.view(), tile_size)?;
        log::info!("Extracted {} patches", tiling.tiles.len());

        let predictions = self.inference.predict(&tiling.tiles, batch_size)?;
        let (padded_height, padded_width, _) = tiling.padded_shape;
        let full_mask = reconstruct(
            &predictions,
            &tiling.origins(),
            (padded_height, padded_width),
            tile_size,
        )?;
        let mask = crop(&full_mask, height, width)?;

        log::info!(
            "Segmentation completed in {:.2}s, classes present: {:?}",
            start.elapsed().as_secs_f64(),
            unique_classes(&mask)
        );
        Ok(mask)
    }
}

pub fn vegetation_mask(mask: &Array2<u8>, vegetation_classes: &[u8]) -> Array2<bool> {
    mask.mapv(|class| vegetation_classes.contains(&class))
}

/// Share of vegetation pixels in percent, rounded to two decimals.
pub fn vegetation_percentage(vegetation: &Array2<bool>) -> f64 {
    let total = vegetation.len();
    if total == 0 {
        return 0.0;
    }
    let covered = vegetation.iter().filter(|&&v| v).count();
    let percentage = covered as f64 * 100.0 / total as f64;
    (percentage * 100.0).round() / 100.0
}

pub fn unique_classes(mask: &Array2<u8>) -> Vec<u8> {
    mask.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
}
