use ndarray::{s, Array2};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReconstructError {
    #[error("Got {predictions} predictions for {origins} tile origins")]
    LengthMismatch { predictions: usize, origins: usize },
    #[error("Prediction has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("Tile at {origin:?} extends past the {height}x{width} mask")]
    OutOfBounds {
        origin: (usize, usize),
        height: usize,
        width: usize,
    },
    #[error("Cannot crop a {mask_height}x{mask_width} mask to {height}x{width}")]
    CropTooLarge {
        mask_height: usize,
        mask_width: usize,
        height: usize,
        width: usize,
    },
}

/// Merges per-tile class predictions into one mask of `padded_shape`.
///
/// Overlapping regions are averaged and rounded half-up to the nearest class index.
pub fn reconstruct(
    predictions: &[Array2<u8>],
    origins: &[(usize, usize)],
    padded_shape: (usize, usize),
    tile_size: usize,
) -> Result<Array2<u8>, ReconstructError> {
    if predictions.len() != origins.len() {
        return Err(ReconstructError::LengthMismatch {
            predictions: predictions.len(),
            origins: origins.len(),
        });
    }

    let (height, width) = padded_shape;
    let mut sum = Array2::<f32>::zeros((height, width));
    let mut count = Array2::<f32>::zeros((height, width));

    for (prediction, &(y, x)) in predictions.iter().zip(origins) {
        if prediction.dim() != (tile_size, tile_size) {
            return Err(ReconstructError::ShapeMismatch {
                expected: (tile_size, tile_size),
                actual: prediction.dim(),
            });
        }
        if y + tile_size > height || x + tile_size > width {
            return Err(ReconstructError::OutOfBounds {
                origin: (y, x),
                height,
                width,
            });
        }

        let window = s![y..y + tile_size, x..x + tile_size];
        sum.slice_mut(window)
            .zip_mut_with(prediction, |acc, &class| *acc += f32::from(class));
        count.slice_mut(window).mapv_inplace(|c| c + 1.0);
    }

    // A correct tiling covers every pixel; the floor only avoids dividing by zero.
    let mut mask = Array2::<u8>::zeros((height, width));
    ndarray::Zip::from(&mut mask)
        .and(&sum)
        .and(&count)
        .for_each(|out, &total, &n| {
            *out = (total / n.max(1.0)).round() as u8;
        });
    Ok(mask)
}

/// Drops the padding added by the tiler, keeping the top-left `height x width` region.
pub fn crop(mask: &Array2<u8>, height: usize, width: usize) -> Result<Array2<u8>, ReconstructError> {
    let (mask_height, mask_width) = mask.dim();
    if height > mask_height || width > mask_width {
        return Err(ReconstructError::CropTooLarge {
            mask_height,
            mask_width,
            height,
            width,
        });
    }
    Ok(mask.slice(s![..height, ..width]).to_owned())
}
