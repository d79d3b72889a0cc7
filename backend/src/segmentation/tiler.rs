use ndarray::{s, Array3, ArrayView3};
use std::collections::HashSet;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TileError {
    #[error("Tile size must be positive")]
    ZeroTileSize,
    #[error("Cannot tile an empty image ({height}x{width})")]
    EmptyImage { height: usize, width: usize },
}

/// A square window of the padded image and its top-left corner `(y, x)`.
#[derive(Debug, Clone)]
pub struct Tile {
    pub origin: (usize, usize),
    pub pixels: Array3<f32>,
}

#[derive(Debug, Clone)]
pub struct Tiling {
    pub tiles: Vec<Tile>,
    /// `(height, width, channels)` of the image after padding.
    pub padded_shape: (usize, usize, usize),
}

impl Tiling {
    pub fn origins(&self) -> Vec<(usize, usize)> {
        self.tiles.iter().map(|tile| tile.origin).collect()
    }
}

/// Splits `image` into `tile_size` squares covering every pixel at least once.
///
/// Images smaller than `tile_size` on either axis are reflect-padded up to `tile_size` first.
/// Tiles come out row-major at stride `tile_size`, followed by a bottom row flush against the
/// bottom edge, a right column flush against the right edge and the bottom-right corner,
/// each only when the corresponding dimension is not a multiple of `tile_size`.
pub fn tile(image: ArrayView3<f32>, tile_size: usize) -> Result<Tiling, TileError> {
    if tile_size == 0 {
        return Err(TileError::ZeroTileSize);
    }
    let (height, width, _) = image.dim();
    if height == 0 || width == 0 {
        return Err(TileError::EmptyImage { height, width });
    }

    let padded = pad_reflect(image, tile_size);
    let (h, w, c) = padded.dim();
    let origins = tile_origins(h, w, tile_size);

    let tiles = origins
        .into_iter()
        .map(|(y, x)| Tile {
            origin: (y, x),
            pixels: padded
                .slice(s![y..y + tile_size, x..x + tile_size, ..])
                .to_owned(),
        })
        .collect::<Vec<_>>();

    log::debug!(
        "Tiled {}x{} image (padded {}x{}) into {} tiles of {}px",
        height,
        width,
        h,
        w,
        tiles.len(),
        tile_size
    );

    Ok(Tiling {
        tiles,
        padded_shape: (h, w, c),
    })
}

/// Tile origins for an image that is at least `tile_size` on both axes.
///
/// Empty when no whole tile fits; `tile` pads before calling this.
pub(crate) fn tile_origins(height: usize, width: usize, tile_size: usize) -> Vec<(usize, usize)> {
    if tile_size == 0 || height < tile_size || width < tile_size {
        return Vec::new();
    }
    let mut origins = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |origin: (usize, usize), origins: &mut Vec<(usize, usize)>| {
        if seen.insert(origin) {
            origins.push(origin);
        }
    };

    let last_y = height - tile_size;
    let last_x = width - tile_size;

    for y in (0..=last_y).step_by(tile_size) {
        for x in (0..=last_x).step_by(tile_size) {
            push((y, x), &mut origins);
        }
    }

    if height % tile_size != 0 {
        for x in (0..=last_x).step_by(tile_size) {
            push((last_y, x), &mut origins);
        }
    }

    if width % tile_size != 0 {
        for y in (0..=last_y).step_by(tile_size) {
            push((y, last_x), &mut origins);
        }
    }

    if height % tile_size != 0 && width % tile_size != 0 {
        push((last_y, last_x), &mut origins);
    }

    origins
}

/// Pads the bottom and right edges by mirroring, excluding the edge pixel itself.
///
/// Axes already at least `min_size` long are left untouched.
pub fn pad_reflect<A: Clone>(image: ArrayView3<A>, min_size: usize) -> Array3<A> {
    let (h, w, c) = image.dim();
    let padded_h = h.max(min_size);
    let padded_w = w.max(min_size);
    if padded_h == h && padded_w == w {
        return image.to_owned();
    }

    Array3::from_shape_fn((padded_h, padded_w, c), |(y, x, ch)| {
        image[[reflect_index(y, h), reflect_index(x, w), ch]].clone()
    })
}

fn reflect_index(index: usize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let folded = index % period;
    if folded < len { folded } else { period - folded }
}
