//! Patch classification.
//!
//! Patches are read from level 0 of a slide, preprocessed on a rayon thread
//! pool and classified in batches. The model runs on rten's own thread pool.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use image::RgbImage;
use rayon::prelude::*;
use rayon::ThreadPool;
use rten::{Dimension, Model, ModelLoadError, RunError, RunOptions};
use rten_tensor::errors::FromDataError;
use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, NdTensorView};
use tracing::{debug, error, info, warn};
use wsinfer_slide::{open_slide, Backend, Slide, SlideError};

use crate::model_config::ModelConfig;
use crate::outputs::{write_csv, OutputError, OutputRow, SlideOutputs, MODEL_OUTPUTS_DIR};
use crate::patching::{
    patch_path, segment_and_patch_directory_of_slides, slide_stem, PatchError, PatchSet,
    PatchSpec, PatchStatus, DEFAULT_THUMBSIZE,
};
use crate::tissue::TissueParams;
use crate::transforms::{apply_transforms, output_size, TransformError};
use crate::zoo::ModelSource;

/// Environment variable which enables rten's per-operator timing logs.
pub const TIMING_ENV: &str = "WSINFER_RTEN_TIMING";

pub const DEFAULT_BATCH_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("failed to load model: {0}")]
    Load(#[from] ModelLoadError),

    #[error("model execution failed: {0}")]
    Run(#[from] RunError),

    #[error("unexpected model output: {0}")]
    BadOutput(String),

    #[error("model returned {actual} classes but the config lists {expected}")]
    ClassCountMismatch { expected: usize, actual: usize },

    #[error("patches in a batch have different shapes: {0:?} and {1:?}")]
    MixedPatchShapes([usize; 3], [usize; 3]),

    #[error("patch set does not match the model: {0}")]
    PatchMismatch(String),

    #[error("invalid inference options: {0}")]
    InvalidOptions(String),

    #[error("failed to create thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to create batch: {0}")]
    Tensor(#[from] FromDataError),

    #[error(transparent)]
    Slide(#[from] SlideError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Output(#[from] OutputError),
}

/// A patch classification model.
pub trait Classifier {
    /// Classify a batch of `[N, C, H, W]` images and return `[N, classes]`
    /// logits.
    fn classify(&self, batch: NdTensor<f32, 4>) -> Result<NdTensor<f32, 2>, InferenceError>;

    /// Return the `[height, width]` of inputs that the model expects, if it
    /// specifies one.
    fn input_size(&self) -> Option<[usize; 2]> {
        None
    }
}

/// Classifier that runs an rten model.
pub struct RtenClassifier {
    model: Model,

    /// Log per-operator timings after each run.
    timing: bool,
}

impl RtenClassifier {
    pub fn load(path: &Path) -> Result<RtenClassifier, InferenceError> {
        let model = Model::load_file(path)?;
        let timing = env::var_os(TIMING_ENV).is_some();
        Ok(RtenClassifier { model, timing })
    }
}

impl Classifier for RtenClassifier {
    fn classify(&self, batch: NdTensor<f32, 4>) -> Result<NdTensor<f32, 2>, InferenceError> {
        let run_options = self.timing.then(|| RunOptions {
            timing: true,
            ..Default::default()
        });
        let output = self.model.run_one(batch.view().into(), run_options)?;
        let logits: NdTensor<f32, 2> = output
            .try_into()
            .map_err(|err| InferenceError::BadOutput(format!("{}", err)))?;
        Ok(logits)
    }

    fn input_size(&self) -> Option<[usize; 2]> {
        let &input_id = self.model.input_ids().first()?;
        let shape = self.model.node_info(input_id)?.shape()?;
        match &shape[..] {
            [_, _, Dimension::Fixed(h), Dimension::Fixed(w)] => Some([*h, *w]),
            _ => None,
        }
    }
}

/// Convert `[N, classes]` logits to probabilities.
///
/// Uses softmax over each row when there are multiple classes and sigmoid
/// when there is a single class.
pub fn logits_to_probs(logits: NdTensorView<f32, 2>) -> NdTensor<f32, 2> {
    let [rows, classes] = logits.shape();
    if classes == 1 {
        return logits.map(|x| 1. / (1. + (-x).exp()));
    }

    let mut probs = NdTensor::zeros([rows, classes]);
    for row in 0..rows {
        let max = (0..classes)
            .map(|c| logits[[row, c]])
            .fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.;
        for c in 0..classes {
            let e = (logits[[row, c]] - max).exp();
            probs[[row, c]] = e;
            sum += e;
        }
        for c in 0..classes {
            probs[[row, c]] /= sum;
        }
    }
    probs
}

/// Read a patch from level 0 and apply the model's preprocessing.
fn load_patch(
    slide: &dyn Slide,
    [x, y]: [u32; 2],
    size: u32,
    config: &ModelConfig,
) -> Result<NdTensor<f32, 3>, InferenceError> {
    let patch: RgbImage = slide.read_region(x as i64, y as i64, size, size)?;
    Ok(apply_transforms(patch, &config.transform)?)
}

/// Stack `[C, H, W]` patches into an `[N, C, H, W]` batch.
fn stack_patches(patches: Vec<NdTensor<f32, 3>>) -> Result<NdTensor<f32, 4>, InferenceError> {
    let Some(first) = patches.first() else {
        return Ok(NdTensor::zeros([0, 3, 0, 0]));
    };
    let [c, h, w] = first.shape();
    let mut data = Vec::with_capacity(patches.len() * c * h * w);
    for patch in &patches {
        if patch.shape() != [c, h, w] {
            return Err(InferenceError::MixedPatchShapes([c, h, w], patch.shape()));
        }
        data.extend(patch.iter().copied());
    }
    Ok(NdTensor::try_from_data([patches.len(), c, h, w], data)?)
}

/// Classify the patches of one slide.
///
/// Patches are loaded on `pool` one batch at a time and output rows are
/// returned in patch order.
pub fn run_inference_on_slide(
    slide: &dyn Slide,
    patch_set: &PatchSet,
    config: &ModelConfig,
    classifier: &dyn Classifier,
    pool: &ThreadPool,
    batch_size: usize,
) -> Result<SlideOutputs, InferenceError> {
    if batch_size == 0 {
        return Err(InferenceError::InvalidOptions(
            "batch size must be positive".into(),
        ));
    }
    let size = patch_set.patch_size;
    let mut rows = Vec::with_capacity(patch_set.coords.len());
    let num_batches = patch_set.coords.len().div_ceil(batch_size);

    for (i, coords) in patch_set.coords.chunks(batch_size).enumerate() {
        let patches = pool.install(|| {
            coords
                .par_iter()
                .map(|&xy| load_patch(slide, xy, size, config))
                .collect::<Result<Vec<_>, _>>()
        })?;
        let batch = stack_patches(patches)?;
        let logits = classifier.classify(batch)?;

        let [n, classes] = logits.shape();
        if classes != config.num_classes {
            return Err(InferenceError::ClassCountMismatch {
                expected: config.num_classes,
                actual: classes,
            });
        }
        if n != coords.len() {
            return Err(InferenceError::BadOutput(format!(
                "expected {} rows but model returned {}",
                coords.len(),
                n
            )));
        }

        let probs = logits_to_probs(logits.view());
        for (row, &[minx, miny]) in coords.iter().enumerate() {
            rows.push(OutputRow {
                minx,
                miny,
                width: size,
                height: size,
                probs: (0..classes).map(|c| probs[[row, c]]).collect(),
            });
        }
        debug!("classified batch {} of {}", i + 1, num_batches);
    }

    Ok(SlideOutputs {
        slide: slide.path().to_path_buf(),
        rows,
    })
}

/// Options for [`run_inference`].
#[derive(Clone, Debug)]
pub struct InferenceOptions {
    pub batch_size: usize,

    /// Number of threads used to read and preprocess patches.
    pub num_workers: usize,

    /// Size of the thumbnail used for tissue segmentation.
    pub thumbsize: u32,

    pub tissue: TissueParams,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        InferenceOptions {
            batch_size: DEFAULT_BATCH_SIZE,
            num_workers: num_cpus::get(),
            thumbsize: DEFAULT_THUMBSIZE,
            tissue: TissueParams::default(),
        }
    }
}

/// Result of [`run_inference`].
#[derive(Debug, Default)]
pub struct InferenceSummary {
    /// Slides which could not be patched.
    pub failed_patching: Vec<PathBuf>,

    /// Slides for which inference failed, with the error message.
    pub failed_inference: Vec<(PathBuf, String)>,

    /// Output CSVs written by this run.
    pub written: Vec<PathBuf>,
}

/// Path of the model output CSV for a slide.
pub fn output_csv_path(results_dir: &Path, slide_path: &Path) -> PathBuf {
    results_dir
        .join(MODEL_OUTPUTS_DIR)
        .join(format!("{}.csv", slide_stem(slide_path)))
}

fn check_patch_set(patch_set: &PatchSet, config: &ModelConfig) -> Result<(), InferenceError> {
    let same_spacing = (patch_set.patch_spacing_um_px - config.spacing_um_px).abs() < 1e-9;
    if patch_set.patch_size_px != config.patch_size_pixels || !same_spacing {
        return Err(InferenceError::PatchMismatch(format!(
            "patches are {}px at {} um/px but the model expects {}px at {} um/px",
            patch_set.patch_size_px,
            patch_set.patch_spacing_um_px,
            config.patch_size_pixels,
            config.spacing_um_px
        )));
    }
    Ok(())
}

fn run_one_slide(
    slide_path: &Path,
    results_dir: &Path,
    csv_path: &Path,
    source: &ModelSource,
    classifier: &dyn Classifier,
    backend: Backend,
    pool: &ThreadPool,
    batch_size: usize,
) -> Result<(), InferenceError> {
    let patch_set = PatchSet::load(&patch_path(results_dir, slide_path))?;
    check_patch_set(&patch_set, &source.config)?;
    let slide = open_slide(slide_path, backend)?;

    info!(
        "Running inference on {} patches of {}",
        patch_set.coords.len(),
        slide_path.display()
    );
    let outputs = run_inference_on_slide(
        slide.as_ref(),
        &patch_set,
        &source.config,
        classifier,
        pool,
        batch_size,
    )?;
    write_csv(csv_path, &outputs, &source.config.class_names)?;
    Ok(())
}

/// Patch every slide in `wsi_dir` and classify the patches.
///
/// Patches, previews and `model-outputs/<slide>.csv` files are written to
/// `results_dir`. Slides that already have an output CSV are skipped. A
/// slide which fails is logged and recorded in the summary, and the
/// remaining slides are still processed.
pub fn run_inference(
    wsi_dir: &Path,
    results_dir: &Path,
    source: &ModelSource,
    classifier: &dyn Classifier,
    backend: Backend,
    options: &InferenceOptions,
) -> Result<InferenceSummary, InferenceError> {
    if options.batch_size == 0 || options.num_workers == 0 {
        return Err(InferenceError::InvalidOptions(
            "batch size and number of workers must be positive".into(),
        ));
    }
    let config = &source.config;

    if let Some(input_size) = classifier.input_size() {
        let size = output_size(&config.transform, config.patch_size_pixels) as usize;
        if input_size != [size, size] {
            warn!(
                "Model expects {}x{} inputs but transforms produce {}x{} patches",
                input_size[1], input_size[0], size, size
            );
        }
    }

    let spec = PatchSpec::new(config.patch_size_pixels, config.spacing_um_px);
    let patching = segment_and_patch_directory_of_slides(
        wsi_dir,
        results_dir,
        &spec,
        backend,
        &options.tissue,
        options.thumbsize,
    )?;

    let mut summary = InferenceSummary {
        failed_patching: patching.failed().into_iter().map(Path::to_path_buf).collect(),
        ..Default::default()
    };

    fs::create_dir_all(results_dir.join(MODEL_OUTPUTS_DIR))?;
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.num_workers)
        .build()?;

    for (slide_path, status) in &patching.slides {
        if matches!(status, PatchStatus::Failed(_)) {
            continue;
        }
        let csv_path = output_csv_path(results_dir, slide_path);
        if csv_path.exists() {
            info!("Output for {} already exists, skipping", slide_path.display());
            continue;
        }

        let result = run_one_slide(
            slide_path,
            results_dir,
            &csv_path,
            source,
            classifier,
            backend,
            &pool,
            options.batch_size,
        );
        match result {
            Ok(()) => summary.written.push(csv_path),
            Err(err) => {
                error!("Inference failed for {}: {}", slide_path.display(), err);
                summary
                    .failed_inference
                    .push((slide_path.clone(), err.to_string()));
            }
        }
    }

    if !summary.failed_patching.is_empty() {
        warn!("{} slides could not be patched", summary.failed_patching.len());
    }
    if !summary.failed_inference.is_empty() {
        warn!("Inference failed for {} slides", summary.failed_inference.len());
    }
    Ok(summary)
}
