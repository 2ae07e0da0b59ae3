//! Preprocessing of patches before they are passed to a model.

use image::imageops::{self, FilterType};
use image::RgbImage;
use rten_imageproc::normalize_image;
use rten_tensor::NdTensor;
use serde::{Deserialize, Serialize};
use wsinfer_slide::{image_to_tensor, SlideError};

/// A preprocessing step, as listed in a model configuration.
///
/// Serialized as `{"name": "Resize", "arguments": {"size": 224}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "arguments")]
pub enum Transform {
    /// Resize the patch to `size x size` pixels.
    Resize { size: u32 },

    /// Convert a `u8` RGB image to a CHW float tensor with values in `[0, 1]`.
    ToTensor,

    /// Apply per-channel `(x - mean) / std` normalization.
    Normalize { mean: [f32; 3], std: [f32; 3] },
}

impl Transform {
    /// Return true if this transform operates on images rather than tensors.
    fn is_image_transform(&self) -> bool {
        matches!(self, Transform::Resize { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("invalid transform order: {0}")]
    InvalidOrder(String),

    #[error("invalid transform: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Tensor(#[from] SlideError),
}

/// Check that image transforms come before `ToTensor` and tensor transforms
/// after it.
///
/// When `ToTensor` is omitted, the first tensor transform converts the patch,
/// so no image transform or `ToTensor` may follow it.
pub fn validate_transforms(transforms: &[Transform]) -> Result<(), TransformError> {
    let mut seen_to_tensor = false;
    let mut is_tensor = false;
    for t in transforms {
        match t {
            Transform::ToTensor if seen_to_tensor => {
                return Err(TransformError::InvalidOrder(
                    "ToTensor appears more than once".into(),
                ))
            }
            Transform::ToTensor if is_tensor => {
                return Err(TransformError::InvalidOrder(
                    "ToTensor must come before tensor transforms".into(),
                ))
            }
            Transform::ToTensor => {
                seen_to_tensor = true;
                is_tensor = true;
            }
            t if t.is_image_transform() && is_tensor => {
                return Err(TransformError::InvalidOrder(format!(
                    "{:?} must come before ToTensor and tensor transforms",
                    t
                )))
            }
            Transform::Resize { size: 0 } => {
                return Err(TransformError::InvalidArgument(
                    "Resize size must be positive".into(),
                ))
            }
            Transform::Normalize { std, .. } if std.iter().any(|s| *s == 0.) => {
                return Err(TransformError::InvalidArgument(
                    "Normalize std must be non-zero".into(),
                ))
            }
            Transform::Normalize { .. } => is_tensor = true,
            Transform::Resize { .. } => {}
        }
    }
    Ok(())
}

/// Return the width and height of a `patch_size` patch after `transforms`.
pub fn output_size(transforms: &[Transform], patch_size: u32) -> u32 {
    transforms.iter().fold(patch_size, |size, t| match t {
        Transform::Resize { size } => *size,
        _ => size,
    })
}

/// Apply `transforms` to a patch and return a CHW tensor.
///
/// If the list does not contain `ToTensor`, the conversion happens after the
/// last image transform.
pub fn apply_transforms(
    patch: RgbImage,
    transforms: &[Transform],
) -> Result<NdTensor<f32, 3>, TransformError> {
    validate_transforms(transforms)?;

    let mut image = patch;
    let mut tensor: Option<NdTensor<f32, 3>> = None;

    for t in transforms {
        match t {
            Transform::Resize { size } => {
                if image.dimensions() != (*size, *size) {
                    // `imageops::resize` applies antialiasing when shrinking.
                    image = imageops::resize(&image, *size, *size, FilterType::Triangle);
                }
            }
            Transform::ToTensor => {
                tensor = Some(image_to_tensor(&image)?);
            }
            Transform::Normalize { mean, std } => {
                let chw = match tensor.as_mut() {
                    Some(chw) => chw,
                    None => tensor.insert(image_to_tensor(&image)?),
                };
                normalize_image(chw.view_mut(), *mean, *std);
            }
        }
    }

    match tensor {
        Some(tensor) => Ok(tensor),
        None => Ok(image_to_tensor(&image)?),
    }
}
