use ndarray::{Array4, ArrayView4};
use std::path::Path;
use tch::{CModule, Device, Kind, Tensor};

use crate::segmentation::model::{InferenceError, SegmentationModel};

impl From<tch::TchError> for InferenceError {
    fn from(err: tch::TchError) -> Self {
        InferenceError::Backend(err.to_string())
    }
}

/// TorchScript export of the segmentation network (NCHW in, NKHW logits out).
pub struct TorchScriptModel {
    module: CModule,
    device: Device,
    input_size: usize,
    num_classes: usize,
}

impl TorchScriptModel {
    pub fn load(path: &Path, input_size: usize, num_classes: usize) -> Result<Self, InferenceError> {
        let device = Device::cuda_if_available();
        log::info!("Loading TorchScript model from {} on {:?}", path.display(), device);
        let mut module = CModule::load_on_device(path, device)
            .map_err(|e| InferenceError::ModelUnavailable(format!("{}: {}", path.display(), e)))?;
        module.set_eval();
        Ok(Self {
            module,
            device,
            input_size,
            num_classes,
        })
    }
}

impl SegmentationModel for TorchScriptModel {
    fn predict(&mut self, batch: ArrayView4<f32>) -> Result<Array4<f32>, InferenceError> {
        let (n, h, w, c) = batch.dim();
        let data: Vec<f32> = batch.iter().copied().collect();
        let input = Tensor::f_from_slice(&data)?
            .f_reshape([n as i64, h as i64, w as i64, c as i64])?
            .f_permute([0, 3, 1, 2])?
            .f_to_device_(self.device, Kind::Float, false, false)?;

        let logits = tch::no_grad(|| self.module.forward_ts(&[input]))?;
        let probabilities = logits
            .f_softmax(1, Kind::Float)?
            .f_permute([0, 2, 3, 1])?
            .f_contiguous()?
            .f_to_device_(Device::Cpu, Kind::Float, false, false)?;

        let size = probabilities.size();
        let classes = match size.as_slice() {
            [pn, ph, pw, k] if (*pn, *ph, *pw) == (n as i64, h as i64, w as i64) && *k > 0 => {
                *k as usize
            }
            _ => {
                return Err(InferenceError::Backend(format!(
                    "Unexpected model output shape {:?} for a batch of {}x{}x{}",
                    size, n, h, w
                )));
            }
        };
        if classes != self.num_classes {
            log::warn!(
                "Model produced {} classes, configured for {}",
                classes,
                self.num_classes
            );
        }
        let numel = n * h * w * classes;
        let mut output = vec![0.0f32; numel];
        probabilities.f_copy_data(&mut output, numel)?;
        Array4::from_shape_vec((n, h, w, classes), output)
            .map_err(|e| InferenceError::Backend(format!("Unexpected model output: {}", e)))
    }

    fn input_size(&self) -> (usize, usize) {
        (self.input_size, self.input_size)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn name(&self) -> &str {
        "torchscript"
    }
}
