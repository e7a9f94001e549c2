//! Checkpoint reading and strict parameter assignment.
//!
//! PyTorch checkpoints (`.pt`, `.pth`, `.bin`) are `torch.save` pickles of
//! either a bare state dict or a dict wrapping one under `model_state_dict`
//! or `state_dict` next to training metadata. Safetensors and libtorch `.ot`
//! archives are flat; a wrapper exported to them keeps the weights under a
//! `model_state_dict.` or `state_dict.` name prefix.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::pickle::PthTensors;
use tch::nn::VarStore;
use tch::{Device, TchError, Tensor};

use super::error::ModelLoadError;

pub const MODEL_STATE_DICT_KEY: &str = "model_state_dict";
pub const STATE_DICT_KEY: &str = "state_dict";

/// Where the weights live inside a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointLayout {
    ModelStateDict,
    StateDict,
    Raw,
}

impl CheckpointLayout {
    /// Layout of a flat checkpoint, judged from its tensor names.
    /// `model_state_dict` wins over `state_dict`; with neither present the
    /// whole checkpoint is the weights mapping.
    pub fn detect<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut state_dict = false;
        for name in names {
            if under_key(name, MODEL_STATE_DICT_KEY).is_some() {
                return CheckpointLayout::ModelStateDict;
            }
            if under_key(name, STATE_DICT_KEY).is_some() {
                state_dict = true;
            }
        }
        if state_dict {
            CheckpointLayout::StateDict
        } else {
            CheckpointLayout::Raw
        }
    }

    pub fn key(self) -> Option<&'static str> {
        match self {
            CheckpointLayout::ModelStateDict => Some(MODEL_STATE_DICT_KEY),
            CheckpointLayout::StateDict => Some(STATE_DICT_KEY),
            CheckpointLayout::Raw => None,
        }
    }

    /// Parameter name of `name` within this layout, or `None` if the tensor
    /// lies outside the weights mapping.
    pub fn parameter_name<'a>(self, name: &'a str) -> Option<&'a str> {
        match self.key() {
            Some(key) => under_key(name, key),
            None => Some(name),
        }
    }
}

fn under_key<'a>(name: &'a str, key: &str) -> Option<&'a str> {
    name.strip_prefix(key)
        .and_then(|rest| rest.strip_prefix('.'))
        .filter(|rest| !rest.is_empty())
}

/// Container format, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    SafeTensors,
    LibTorch,
    PyTorch,
}

impl CheckpointFormat {
    pub fn from_path(path: &Path) -> Self {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match extension.as_deref() {
            Some("safetensors") => CheckpointFormat::SafeTensors,
            Some("ot") => CheckpointFormat::LibTorch,
            _ => CheckpointFormat::PyTorch,
        }
    }

    fn read(self, path: &Path, device: Device) -> Result<ModelWeights, ModelLoadError> {
        let named = match self {
            CheckpointFormat::SafeTensors => Tensor::read_safetensors(path),
            CheckpointFormat::LibTorch => Tensor::load_multi_with_device(path, device),
            CheckpointFormat::PyTorch => return read_pickle(path, device),
        };
        let named = named.map_err(|source| corrupt(path, source))?;
        ModelWeights::from_named_tensors(named)
    }
}

fn corrupt(path: &Path, source: TchError) -> ModelLoadError {
    ModelLoadError::Corrupt {
        path: path.to_path_buf(),
        source,
    }
}

/// Reads a `torch.save` pickle. The first of `model_state_dict`,
/// `state_dict` found at the top level holds the weights, otherwise the
/// pickle itself is the state dict.
fn read_pickle(path: &Path, device: Device) -> Result<ModelWeights, ModelLoadError> {
    let unpickle = |source: candle_core::Error| ModelLoadError::Unpickle {
        path: path.to_path_buf(),
        source,
    };
    let open = |layout: CheckpointLayout| {
        PthTensors::new(path, layout.key()).map(|archive| (layout, archive))
    };

    let (layout, archive) = open(CheckpointLayout::ModelStateDict)
        .or_else(|_| open(CheckpointLayout::StateDict))
        .or_else(|_| open(CheckpointLayout::Raw))
        .map_err(unpickle)?;

    let mut tensors = BTreeMap::new();
    for name in archive.tensor_infos().keys() {
        let tensor = archive.get(name).map_err(unpickle)?.ok_or_else(|| {
            ModelLoadError::UnrecognizedLayout(format!("tensor {name} has no data"))
        })?;
        tensors.insert(name.clone(), to_tch(&tensor, device).map_err(unpickle)?);
    }
    ModelWeights::new(layout, tensors)
}

/// Copies a pickled tensor into libtorch as `f32`, keeping its shape.
fn to_tch(tensor: &candle_core::Tensor, device: Device) -> candle_core::Result<Tensor> {
    let shape: Vec<i64> = tensor.dims().iter().map(|&dim| dim as i64).collect();
    let values = tensor
        .to_dtype(candle_core::DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    Ok(Tensor::from_slice(&values)
        .reshape(shape.as_slice())
        .to_device(device))
}

/// The weights mapping extracted from a checkpoint, keyed by parameter name.
#[derive(Debug)]
pub struct ModelWeights {
    layout: CheckpointLayout,
    tensors: BTreeMap<String, Tensor>,
}

impl ModelWeights {
    pub fn new(
        layout: CheckpointLayout,
        tensors: BTreeMap<String, Tensor>,
    ) -> Result<Self, ModelLoadError> {
        if tensors.is_empty() {
            return Err(ModelLoadError::UnrecognizedLayout(
                "checkpoint contains no tensors".to_string(),
            ));
        }
        Ok(Self { layout, tensors })
    }

    /// Splits a flat name list into its weights mapping.
    pub fn from_named_tensors(named: Vec<(String, Tensor)>) -> Result<Self, ModelLoadError> {
        let layout = CheckpointLayout::detect(named.iter().map(|(name, _)| name.as_str()));
        let tensors = named
            .into_iter()
            .filter_map(|(name, tensor)| {
                layout
                    .parameter_name(&name)
                    .map(|param| (param.to_string(), tensor))
            })
            .collect();
        Self::new(layout, tensors)
    }

    pub fn layout(&self) -> CheckpointLayout {
        self.layout
    }

    pub(crate) fn len(&self) -> usize {
        self.tensors.len()
    }

    #[cfg(test)]
    pub(crate) fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    #[cfg(test)]
    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Copies every tensor into the matching variable of `vs`.
    ///
    /// Names must match exactly in both directions and shapes must agree;
    /// nothing is written unless the whole checkpoint validates.
    pub fn assign(self, vs: &VarStore) -> Result<(), ModelLoadError> {
        let mut variables = vs.variables();

        let mut missing: Vec<String> = variables
            .keys()
            .filter(|name| !self.tensors.contains_key(*name))
            .cloned()
            .collect();
        missing.sort();
        let unexpected: Vec<String> = self
            .tensors
            .keys()
            .filter(|name| !variables.contains_key(*name))
            .cloned()
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            return Err(ModelLoadError::ParameterMismatch {
                missing,
                unexpected,
            });
        }

        let mut pending = Vec::with_capacity(self.tensors.len());
        for (name, source) in self.tensors {
            let Some(target) = variables.remove(&name) else {
                continue;
            };
            if target.size() != source.size() {
                return Err(ModelLoadError::ShapeMismatch {
                    name,
                    expected: target.size(),
                    found: source.size(),
                });
            }
            pending.push((name, target, source));
        }

        for (name, mut target, source) in pending {
            tch::no_grad(|| target.f_copy_(&source))
                .map_err(|source| ModelLoadError::Assign { name, source })?;
        }
        Ok(())
    }
}

pub fn load_weights(path: &Path, device: Device) -> Result<ModelWeights, ModelLoadError> {
    if !path.is_file() {
        return Err(ModelLoadError::NotFound(path.to_path_buf()));
    }
    CheckpointFormat::from_path(path).read(path, device)
}
