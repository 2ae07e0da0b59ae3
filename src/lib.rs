//! wsinfer runs patch classification models over whole slide images.
//!
//! The pipeline for a directory of slides is:
//!
//! 1. Segment tissue on a thumbnail of each slide ([`tissue`]).
//! 2. Lay a grid of patches over the slide at the size and physical spacing
//!    the model expects, and keep the patches that touch tissue
//!    ([`patching`]).
//! 3. Read each patch from the full resolution level, preprocess it
//!    ([`transforms`]) and classify it in batches with an
//!    [rten](https://github.com/robertknight/rten) model ([`inference`]).
//! 4. Write per-patch class probabilities as CSV ([`outputs`]), a record of
//!    the run ([`metadata`]) and optionally GeoJSON ([`geojson`]).
//!
//! Slides are read using the [`wsinfer_slide`] crate.
//!
//! ```no_run
//! use std::path::Path;
//!
//! use wsinfer::inference::{run_inference, InferenceOptions, RtenClassifier};
//! use wsinfer::zoo::get_registered_model;
//! use wsinfer_slide::Backend;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let source = get_registered_model("breast-tumor-resnet34.tcga-brca")?;
//! let classifier = RtenClassifier::load(&source.model_path)?;
//! let summary = run_inference(
//!     Path::new("slides"),
//!     Path::new("results"),
//!     &source,
//!     &classifier,
//!     Backend::Tiff,
//!     &InferenceOptions::default(),
//! )?;
//! println!("wrote {} files", summary.written.len());
//! # Ok(())
//! # }
//! ```

pub mod cli;
mod errors;
pub mod geojson;
pub mod inference;
pub mod logging;
pub mod metadata;
pub mod model_config;
pub mod outputs;
pub mod patching;
mod preview;
pub mod tissue;
pub mod transforms;
pub mod zoo;

pub use errors::WsinferError;
pub use inference::{Classifier, RtenClassifier};
pub use model_config::ModelConfig;
pub use zoo::ModelSource;
