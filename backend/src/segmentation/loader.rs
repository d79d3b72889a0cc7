use ndarray::Array3;
use std::io::Cursor;
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::tags::Tag;

#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    #[error("Unrecognized image data")]
    Unrecognized,
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Failed to decode raster: {0}")]
    Tiff(#[from] tiff::TiffError),
    #[error("Unsupported raster layout: {0}")]
    Layout(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An RGB image as `height x width x 3`, channel order fixed at load time.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub pixels: Array3<u8>,
}

impl LoadedImage {
    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }
}

pub fn load_image_path(path: &Path) -> Result<LoadedImage, LoaderError> {
    let bytes = std::fs::read(path)?;
    load_image_bytes(&bytes)
}

/// Decodes standard rasters through `image` and (Geo)TIFFs through `tiff`.
///
/// TIFFs may carry any number of bands; the first three become RGB.
pub fn load_image_bytes(bytes: &[u8]) -> Result<LoadedImage, LoaderError> {
    if bytes.is_empty() {
        return Err(LoaderError::Unrecognized);
    }
    let image = if is_tiff(bytes) {
        decode_tiff(bytes)?
    } else {
        decode_standard(bytes)?
    };
    log::info!(
        "Loaded image with shape: ({}, {}, 3)",
        image.height(),
        image.width()
    );
    Ok(image)
}

fn is_tiff(bytes: &[u8]) -> bool {
    bytes.starts_with(b"II*\0")
        || bytes.starts_with(b"MM\0*")
        || bytes.starts_with(b"II+\0")
        || bytes.starts_with(b"MM\0+")
}

fn decode_standard(bytes: &[u8]) -> Result<LoadedImage, LoaderError> {
    let format = image::guess_format(bytes).map_err(|_| LoaderError::Unrecognized)?;
    let rgb = image::load_from_memory_with_format(bytes, format)?.to_rgb8();
    let (width, height) = rgb.dimensions();
    let pixels = Array3::from_shape_vec((height as usize, width as usize, 3), rgb.into_raw())
        .map_err(|e| LoaderError::Layout(e.to_string()))?;
    Ok(LoadedImage { pixels })
}

fn decode_tiff(bytes: &[u8]) -> Result<LoadedImage, LoaderError> {
    let mut decoder = Decoder::new(Cursor::new(bytes))?.with_limits(Limits::unlimited());
    let (width, height) = decoder.dimensions()?;
    let (width, height) = (width as usize, height as usize);
    // 2 = separate planes, i.e. band-first sample order.
    let band_first = decoder
        .get_tag_u32(Tag::PlanarConfiguration)
        .map(|v| v == 2)
        .unwrap_or(false);

    let mut raw = Vec::new();
    let mut floating = false;
    if band_first {
        // `read_image` only yields the first plane; strips are stored plane after plane.
        let strips = decoder.get_tag_u32_vec(Tag::StripOffsets).map_err(|_| {
            LoaderError::Layout("band-first rasters must be stored in strips".to_string())
        })?;
        for index in 0..strips.len() {
            let chunk = decoder.read_chunk(index as u32)?;
            floating |= append_samples(&mut raw, chunk)?;
        }
    } else {
        floating = append_samples(&mut raw, decoder.read_image()?)?;
    }
    let samples: Vec<f32> = if floating {
        stretch(raw)
    } else {
        raw.into_iter().map(|v| v as f32).collect()
    };

    let pixel_count = width * height;
    if pixel_count == 0 || samples.len() % pixel_count != 0 {
        return Err(LoaderError::Layout(format!(
            "{} samples do not fit a {}x{} raster",
            samples.len(),
            width,
            height
        )));
    }
    let bands = samples.len() / pixel_count;
    log::debug!(
        "Decoded {}x{} raster with {} band(s){}",
        width,
        height,
        bands,
        if band_first { ", band-first" } else { "" }
    );

    let pixels = Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
        let band = if bands >= 3 { c } else { 0 };
        let index = if band_first {
            band * pixel_count + y * width + x
        } else {
            (y * width + x) * bands + band
        };
        samples[index].round().clamp(0.0, 255.0) as u8
    });
    Ok(LoadedImage { pixels })
}

/// Appends decoded samples on the 8-bit scale. Returns true for float samples,
/// which are left raw for `stretch`.
fn append_samples(out: &mut Vec<f64>, decoded: DecodingResult) -> Result<bool, LoaderError> {
    match decoded {
        DecodingResult::U8(buf) => out.extend(buf.into_iter().map(f64::from)),
        DecodingResult::U16(buf) => out.extend(buf.into_iter().map(|v| f64::from(v) / 257.0)),
        DecodingResult::F32(buf) => {
            out.extend(buf.into_iter().map(f64::from));
            return Ok(true);
        }
        DecodingResult::F64(buf) => {
            out.extend(buf);
            return Ok(true);
        }
        _ => {
            return Err(LoaderError::Layout(
                "only 8/16-bit unsigned and float samples are supported".to_string(),
            ));
        }
    }
    Ok(false)
}

/// Linearly maps the finite sample range onto 0..=255.
fn stretch(values: Vec<f64>) -> Vec<f32> {
    let (min, max) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if max <= min {
        return vec![0.0; values.len()];
    }
    values
        .into_iter()
        .map(|v| {
            if v.is_finite() {
                ((v - min) / (max - min) * 255.0) as f32
            } else {
                0.0
            }
        })
        .collect()
}
