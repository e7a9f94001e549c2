//! Image bytes to normalized model input.
//!
//! The pipeline is fixed: decode, force RGB, stretch to 224x224, scale to
//! [0, 1], normalize with the ImageNet statistics, lay out as NCHW.

use std::borrow::Cow;

use image::imageops::{self, FilterType};
use ndarray::Array4;
use tch::{Device, Tensor};

use super::error::ImageDecodeError;

pub const INPUT_SIZE: u32 = 224;
pub const CHANNELS: usize = 3;
pub const MEAN: [f32; CHANNELS] = [0.485, 0.456, 0.406];
pub const STD: [f32; CHANNELS] = [0.229, 0.224, 0.225];

/// A single preprocessed image, shape `[1, 3, 224, 224]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor(Array4<f32>);

impl ImageTensor {
    pub fn as_array(&self) -> &Array4<f32> {
        &self.0
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    /// Copies the values into a libtorch tensor on `device`.
    pub fn to_tensor(&self, device: Device) -> Tensor {
        let dims: Vec<i64> = self.0.shape().iter().map(|&d| d as i64).collect();
        let values: Cow<'_, [f32]> = match self.0.as_slice() {
            Some(slice) => Cow::Borrowed(slice),
            None => Cow::Owned(self.0.iter().copied().collect()),
        };
        Tensor::from_slice(&*values)
            .reshape(dims.as_slice())
            .to_device(device)
    }
}

pub fn preprocess(image: &[u8]) -> Result<ImageTensor, ImageDecodeError> {
    if image.is_empty() {
        return Err(ImageDecodeError::Empty);
    }

    let decoded = image::load_from_memory(image)?;
    // Alpha is dropped, grayscale expanded, palettes resolved.
    let rgb = decoded.to_rgb8();
    let resized = imageops::resize(&rgb, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, CHANNELS, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..CHANNELS {
            let scaled = f32::from(pixel[c]) / 255.0;
            tensor[[0, c, y as usize, x as usize]] = (scaled - MEAN[c]) / STD[c];
        }
    }

    Ok(ImageTensor(tensor))
}
