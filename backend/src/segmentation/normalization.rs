use ndarray::{ArrayViewMut3, Axis};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
/// ImageNet pixel means in BGR order, on the 0..255 scale.
const CAFFE_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];

/// Channel-wise input convention a backbone was trained with.
///
/// Inputs are HWC tiles in RGB order with values on the 0..255 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
    /// Raw pixel values; the network normalizes its own input.
    Identity,
    /// `x / 255`, then ImageNet mean/std per channel.
    Torch,
    /// `x / 127.5 - 1`.
    Tf,
    /// RGB to BGR, then ImageNet pixel-mean subtraction.
    Caffe,
}

impl Normalization {
    pub fn for_backbone(backbone: &str) -> Self {
        let name = backbone.to_ascii_lowercase();
        if name.starts_with("resnext") || name.starts_with("seresnet") || name.starts_with("senet")
        {
            return Normalization::Torch;
        }
        if name.starts_with("resnet") {
            return Normalization::Identity;
        }
        if name.starts_with("vgg") {
            return Normalization::Caffe;
        }
        if name.starts_with("inception") {
            return Normalization::Tf;
        }
        if name.starts_with("densenet")
            || name.starts_with("efficientnet")
            || name.starts_with("mobilenet")
        {
            return Normalization::Torch;
        }
        log::warn!(
            "No preprocessing preset for backbone '{}', using ImageNet mean/std",
            backbone
        );
        Normalization::Torch
    }

    pub fn name(&self) -> &'static str {
        match self {
            Normalization::Identity => "identity",
            Normalization::Torch => "torch",
            Normalization::Tf => "tf",
            Normalization::Caffe => "caffe",
        }
    }

    pub fn apply(&self, mut tile: ArrayViewMut3<f32>) {
        match self {
            Normalization::Identity => {}
            Normalization::Torch => {
                for (c, mut channel) in tile.axis_iter_mut(Axis(2)).enumerate().take(3) {
                    let (mean, std) = (IMAGENET_MEAN[c], IMAGENET_STD[c]);
                    channel.mapv_inplace(|v| (v / 255.0 - mean) / std);
                }
            }
            Normalization::Tf => tile.mapv_inplace(|v| v / 127.5 - 1.0),
            Normalization::Caffe => {
                if tile.len_of(Axis(2)) >= 3 {
                    for mut pixel in tile.lanes_mut(Axis(2)) {
                        pixel.swap(0, 2);
                    }
                }
                for (c, mut channel) in tile.axis_iter_mut(Axis(2)).enumerate().take(3) {
                    let mean = CAFFE_MEAN_BGR[c];
                    channel.mapv_inplace(|v| v - mean);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array3};

    fn pixel(r: f32, g: f32, b: f32) -> Array3<f32> {
        Array3::from_shape_vec((1, 1, 3), vec![r, g, b]).unwrap()
    }

    #[test]
    fn backbone_presets() {
        assert_eq!(Normalization::for_backbone("resnet34"), Normalization::Identity);
        assert_eq!(Normalization::for_backbone("ResNet50"), Normalization::Identity);
        assert_eq!(Normalization::for_backbone("resnext50"), Normalization::Torch);
        assert_eq!(Normalization::for_backbone("vgg16"), Normalization::Caffe);
        assert_eq!(Normalization::for_backbone("inceptionv3"), Normalization::Tf);
        assert_eq!(Normalization::for_backbone("efficientnetb0"), Normalization::Torch);
        assert_eq!(Normalization::for_backbone("unknown"), Normalization::Torch);
    }

    #[test]
    fn identity_leaves_pixels_alone() {
        let mut tile = pixel(10.0, 20.0, 30.0);
        Normalization::Identity.apply(tile.view_mut());
        assert_eq!(tile, pixel(10.0, 20.0, 30.0));
    }

    #[test]
    fn torch_uses_imagenet_statistics() {
        let mut tile = pixel(255.0, 0.0, 127.5);
        Normalization::Torch.apply(tile.view_mut());
        let expected = arr1(&[
            (1.0 - 0.485) / 0.229,
            (0.0 - 0.456) / 0.224,
            (0.5 - 0.406) / 0.225,
        ]);
        for (got, want) in tile.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-5);
        }
    }

    #[test]
    fn tf_scales_to_signed_unit_range() {
        let mut tile = pixel(0.0, 127.5, 255.0);
        Normalization::Tf.apply(tile.view_mut());
        assert_eq!(tile, pixel(-1.0, 0.0, 1.0));
    }

    #[test]
    fn caffe_swaps_to_bgr_and_subtracts_mean() {
        let mut tile = pixel(200.0, 100.0, 50.0);
        Normalization::Caffe.apply(tile.view_mut());
        let got: Vec<f32> = tile.iter().copied().collect();
        let want = [50.0 - 103.939, 100.0 - 116.779, 200.0 - 123.68];
        for (g, w) in got.iter().zip(want.iter()) {
            assert!((g - w).abs() < 1e-4);
        }
    }
}
