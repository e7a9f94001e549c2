use std::path::Path;

use tch::nn::{self, ModuleT};
use tch::{Device, Kind, Tensor};

use super::checkpoint::load_weights;
use super::error::{InferenceError, ModelLoadError};
use super::preprocess::ImageTensor;
use super::vit::{VisionTransformer, VitConfig};

pub const NUM_CLASSES: i64 = 2;
pub const HIDDEN_UNITS: i64 = 512;
pub const HEAD_DROPOUT: f64 = 0.3;

/// `classifier.{0..4}`: dropout, linear, relu, dropout, linear.
///
/// Only the two linear layers own parameters, at indices 1 and 4.
#[derive(Debug)]
pub struct ClassifierHead {
    fc1: nn::Linear,
    fc2: nn::Linear,
    dropout: f64,
}

impl ClassifierHead {
    pub fn new(p: nn::Path, num_features: i64) -> Self {
        Self {
            fc1: nn::linear(&p / 1, num_features, HIDDEN_UNITS, Default::default()),
            fc2: nn::linear(&p / 4, HIDDEN_UNITS, NUM_CLASSES, Default::default()),
            dropout: HEAD_DROPOUT,
        }
    }
}

impl ModuleT for ClassifierHead {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.dropout(self.dropout, train)
            .apply(&self.fc1)
            .relu()
            .dropout(self.dropout, train)
            .apply(&self.fc2)
    }
}

/// ViT backbone feeding the two-class head. Logits are `[fake, real]`.
pub struct DeepfakeVit {
    vs: nn::VarStore,
    vit: VisionTransformer,
    classifier: ClassifierHead,
}

impl DeepfakeVit {
    /// Builds the network with freshly initialized parameters.
    pub fn new(device: Device) -> Self {
        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let vit = VisionTransformer::new(&root / "vit", VitConfig::tiny_patch16_224());
        let classifier = ClassifierHead::new(&root / "classifier", vit.config().num_features());
        Self {
            vs,
            vit,
            classifier,
        }
    }

    /// Builds the network and assigns every parameter from the checkpoint at
    /// `path`. The returned model is frozen.
    pub fn load(path: &Path, device: Device) -> Result<Self, ModelLoadError> {
        let mut model = Self::new(device);
        let weights = load_weights(path, device)?;
        log::info!(
            "Checkpoint {} uses the {:?} layout with {} tensors",
            path.display(),
            weights.layout(),
            weights.len()
        );
        weights.assign(&model.vs)?;
        model.vs.freeze();
        Ok(model)
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub(crate) fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let features = self.vit.forward_t(xs, train);
        self.classifier.forward_t(&features, train)
    }

    /// Runs one image through the network in inference mode and returns the
    /// raw `[fake, real]` scores.
    pub fn scores(&self, image: &ImageTensor) -> Result<[f32; 2], InferenceError> {
        let input = image.to_tensor(self.device());
        let logits = tch::no_grad(|| self.forward_t(&input, false));
        let flat = logits
            .to_kind(Kind::Float)
            .to_device(Device::Cpu)
            .reshape([-1]);
        let values = Vec::<f32>::try_from(&flat)?;
        <[f32; 2]>::try_from(values).map_err(|values| {
            InferenceError::Processing(format!(
                "expected {} class scores, model produced {}",
                NUM_CLASSES,
                values.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::preprocess::{preprocess, tests::gradient_png};

    #[test]
    fn head_parameters_use_sequential_indices() {
        let model = DeepfakeVit::new(Device::Cpu);
        let variables = model.var_store().variables();

        assert_eq!(variables["classifier.1.weight"].size(), vec![512, 192]);
        assert_eq!(variables["classifier.1.bias"].size(), vec![512]);
        assert_eq!(variables["classifier.4.weight"].size(), vec![2, 512]);
        assert_eq!(variables["classifier.4.bias"].size(), vec![2]);
        assert!(!variables.keys().any(|name| name.starts_with("vit.head")));
    }

    #[test]
    fn parameter_count_matches_vit_tiny_plus_head() {
        let model = DeepfakeVit::new(Device::Cpu);
        let total: usize = model
            .var_store()
            .variables()
            .values()
            .map(|t| t.numel())
            .sum();
        // 5_524_416 backbone + 99_842 head
        assert_eq!(total, 5_624_258);
    }

    #[test]
    fn forward_produces_two_logits() {
        let model = DeepfakeVit::new(Device::Cpu);
        let input = Tensor::zeros([1, 3, 224, 224], (Kind::Float, Device::Cpu));
        let logits = tch::no_grad(|| model.forward_t(&input, false));
        assert_eq!(logits.size(), vec![1, 2]);
    }

    #[test]
    fn inference_mode_disables_dropout() {
        let model = DeepfakeVit::new(Device::Cpu);
        let image = preprocess(&gradient_png(64, 64, 11)).unwrap();

        let first = model.scores(&image).unwrap();
        let second = model.scores(&image).unwrap();

        assert_eq!(first, second);
        assert!(first.iter().all(|v| v.is_finite()));
    }
}
