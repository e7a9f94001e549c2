use std::path::Path;

use shared::{BatchEntry, Label, PredictionResponse, Probabilities};
use tch::Device;

use super::error::InferenceError;
use super::model::DeepfakeVit;
use super::preprocess::preprocess;

/// Owns the process-wide classifier. The model slot is filled once, before
/// the server starts, and only read afterwards.
pub struct InferenceService {
    model: Option<DeepfakeVit>,
    device: Device,
}

impl InferenceService {
    pub fn new(model: Option<DeepfakeVit>, device: Device) -> Self {
        Self { model, device }
    }

    /// Loads the checkpoint at `path`. A failed load is logged and leaves the
    /// service running without a model.
    pub fn load(path: &Path, device: Device) -> Self {
        match DeepfakeVit::load(path, device) {
            Ok(model) => {
                log::info!("Model loaded successfully on {}", describe_device(device));
                Self::new(Some(model), device)
            }
            Err(e) => {
                log::error!("Error loading model from {}: {}", path.display(), e);
                Self::new(None, device)
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    pub fn ensure_loaded(&self) -> Result<(), InferenceError> {
        self.model
            .as_ref()
            .map(|_| ())
            .ok_or(InferenceError::ModelUnavailable)
    }

    pub fn device_name(&self) -> String {
        describe_device(self.device)
    }

    pub fn infer(&self, image: &[u8]) -> Result<PredictionResponse, InferenceError> {
        let model = self.model.as_ref().ok_or(InferenceError::ModelUnavailable)?;
        let input = preprocess(image)?;
        let logits = model.scores(&input)?;
        prediction_from_logits(logits)
    }

    /// Runs every item independently. Item failures become error entries;
    /// only a missing model or an empty list fail the whole batch.
    pub fn infer_batch(
        &self,
        items: Vec<(String, Vec<u8>)>,
    ) -> Result<Vec<BatchEntry>, InferenceError> {
        self.ensure_loaded()?;
        if items.is_empty() {
            return Err(InferenceError::validation("No images selected."));
        }

        let results = items
            .into_iter()
            .map(|(filename, image)| match self.infer(&image) {
                Ok(result) => BatchEntry::Prediction { filename, result },
                Err(e) => {
                    log::warn!("Batch item {} failed: {}", filename, e);
                    BatchEntry::Error {
                        filename,
                        error: e.to_string(),
                    }
                }
            })
            .collect();
        Ok(results)
    }
}

pub fn describe_device(device: Device) -> String {
    match device {
        Device::Cpu => "cpu".to_string(),
        Device::Cuda(index) => format!("cuda:{}", index),
        other => format!("{:?}", other).to_lowercase(),
    }
}

/// Softmax over two logits with the max subtracted first.
pub fn softmax(logits: [f32; 2]) -> [f32; 2] {
    let max = f64::from(logits[0].max(logits[1]));
    let exps = logits.map(|logit| (f64::from(logit) - max).exp());
    let sum: f64 = exps.iter().sum();
    exps.map(|e| (e / sum) as f32)
}

pub fn prediction_from_logits(logits: [f32; 2]) -> Result<PredictionResponse, InferenceError> {
    if logits.iter().any(|logit| !logit.is_finite()) {
        return Err(InferenceError::Processing(format!(
            "model produced non-finite scores {:?}",
            logits
        )));
    }

    let probabilities = softmax(logits);
    // ties go to the first index, like torch.max
    let class_id: u8 = if probabilities[1] > probabilities[0] { 1 } else { 0 };
    let prediction = if class_id == 1 { Label::Real } else { Label::Fake };

    Ok(PredictionResponse {
        prediction,
        confidence: probabilities[usize::from(class_id)],
        probabilities: Probabilities {
            fake: probabilities[0],
            real: probabilities[1],
        },
        class_id,
    })
}
