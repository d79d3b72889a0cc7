use image::{GrayImage, Luma, Rgb, RgbImage};
use ndarray::{Array2, Array3};

/// Vegetation pixels white, everything else black.
pub fn binary_mask_image(vegetation: &Array2<bool>) -> GrayImage {
    let (height, width) = vegetation.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        Luma([if vegetation[[y as usize, x as usize]] { 255 } else { 0 }])
    })
}

/// Class indices spread over the grey range in steps of `255 / n_classes`.
pub fn class_visualization(mask: &Array2<u8>, n_classes: usize) -> GrayImage {
    let step = 255 / n_classes.max(1);
    let (height, width) = mask.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        let class = usize::from(mask[[y as usize, x as usize]]);
        Luma([(class * step).min(255) as u8])
    })
}

/// Blends `highlight` over vegetation pixels, keeping `alpha` of the original colour.
pub fn overlay_image(
    image: &Array3<u8>,
    vegetation: &Array2<bool>,
    highlight: [u8; 3],
    alpha: f32,
) -> RgbImage {
    let (height, width, _) = image.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (y, x) = (y as usize, x as usize);
        let mut pixel = [0u8; 3];
        for (c, out) in pixel.iter_mut().enumerate() {
            let original = f32::from(image[[y, x, c]]);
            let target = if vegetation[[y, x]] {
                f32::from(highlight[c])
            } else {
                original
            };
            *out = (alpha * original + (1.0 - alpha) * target)
                .round()
                .clamp(0.0, 255.0) as u8;
        }
        Rgb(pixel)
    })
}
