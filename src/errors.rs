use wsinfer_slide::SlideError;

use crate::geojson::GeoJsonError;
use crate::inference::InferenceError;
use crate::metadata::MetadataError;
use crate::model_config::ConfigError;
use crate::outputs::OutputError;
use crate::patching::PatchError;
use crate::transforms::TransformError;
use crate::zoo::ZooError;

/// Any error reported by the wsinfer library.
///
/// Each module has its own error type. This wraps all of them, so callers
/// which drive several stages of a run can propagate failures with `?`.
#[derive(Debug, thiserror::Error)]
pub enum WsinferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Slide(#[from] SlideError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Zoo(#[from] ZooError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error(transparent)]
    GeoJson(#[from] GeoJsonError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}
