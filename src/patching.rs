//! Tissue segmentation and patch extraction for directories of slides.
//!
//! Patching a slide produces three files under the save directory:
//!
//! - `masks/<stem>.jpg` - thumbnail with the tissue outline
//! - `patches/<stem>.json` - the [`PatchSet`] of patch coordinates
//! - `stitches/<stem>.jpg` - thumbnail with the outline of every kept patch
//!
//! A summary of all slides is written to `process_list_autogen.csv`.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use rten_tensor::prelude::*;
use rten_tensor::NdTensorView;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use wsinfer_slide::{get_avg_mpp, open_slide, Backend, Slide, SlideError};

use crate::preview::{draw_patch_outlines, draw_tissue_contours, save_preview};
use crate::tissue::{segment_tissue, tissue_contours, TissueParams};

/// Default length of the longest side of the thumbnail used for tissue
/// segmentation.
pub const DEFAULT_THUMBSIZE: u32 = 2048;

/// Name of the per-directory summary file.
pub const PROCESS_LIST_NAME: &str = "process_list_autogen.csv";

/// Errors reported while patching slides.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error(transparent)]
    Slide(#[from] SlideError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize patches: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to write preview image: {0}")]
    Image(#[from] image::ImageError),

    #[error("failed to create preview: {0}")]
    Preview(#[from] rten_tensor::errors::FromDataError),

    #[error("invalid patch size: {0}")]
    InvalidPatchSize(String),

    #[error("no slides found in {}", .0.display())]
    NoSlides(PathBuf),
}

/// Size and physical spacing of the patches to extract.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PatchSpec {
    /// Patch width and height in pixels, at `patch_spacing_um_px`.
    pub patch_size: u32,

    /// Micrometers per pixel of the patches.
    pub patch_spacing_um_px: f64,

    /// Patches are kept if the fraction of their area covered by tissue is
    /// greater than this.
    pub min_tissue_fraction: f64,
}

impl PatchSpec {
    pub fn new(patch_size: u32, patch_spacing_um_px: f64) -> PatchSpec {
        PatchSpec {
            patch_size,
            patch_spacing_um_px,
            min_tissue_fraction: 0.,
        }
    }
}

/// Compute the size of a patch in level 0 pixels for a slide whose level 0
/// resolution is `slide_mpp` micrometers per pixel.
pub fn patch_size_at_level0(spec: &PatchSpec, slide_mpp: f64) -> Result<u32, PatchError> {
    if spec.patch_size == 0 || !(spec.patch_spacing_um_px > 0.) || !(slide_mpp > 0.) {
        return Err(PatchError::InvalidPatchSize(format!(
            "patch size {} at {} um/px with slide spacing {} um/px",
            spec.patch_size, spec.patch_spacing_um_px, slide_mpp
        )));
    }
    let size = (spec.patch_size as f64 * spec.patch_spacing_um_px / slide_mpp).round();
    if size < 1. || size > u32::MAX as f64 {
        return Err(PatchError::InvalidPatchSize(format!(
            "patch would be {} pixels at level 0",
            size
        )));
    }
    Ok(size as u32)
}

/// Return the top-left coordinates `[x, y]` of a grid of non-overlapping
/// patches covering a `width x height` image.
///
/// Coordinates are ordered by X, then Y. Patches in the last row and column
/// may extend past the image.
pub fn patch_grid(width: u32, height: u32, size: u32) -> Vec<[u32; 2]> {
    let step = size.max(1) as usize;
    (0..width)
        .step_by(step)
        .flat_map(|x| (0..height).step_by(step).map(move |y| [x, y]))
        .collect()
}

/// Return the fraction of the patch at `[x, y]` covered by tissue.
///
/// `scale` is the ratio of mask size to level 0 size along X and Y. Only the
/// part of the footprint that lies inside the mask is considered. Along an
/// axis where the footprint is narrower than one mask pixel, the mask pixel
/// nearest to the footprint's center is used.
fn tissue_fraction(mask: NdTensorView<bool, 2>, [x, y]: [u32; 2], size: u32, scale: (f64, f64)) -> f64 {
    let [rows, cols] = mask.shape();
    let span = |start: u32, scale: f64, len: usize| {
        if (size as f64) * scale < 1. {
            let center = ((start as f64 + size as f64 / 2.) * scale).floor() as usize;
            return if center < len { (center, center + 1) } else { (len, len) };
        }
        let lo = ((start as f64 * scale).floor() as usize).min(len);
        let hi = (((start + size) as f64 * scale).ceil() as usize).min(len);
        (lo, hi.max(lo))
    };
    let (x0, x1) = span(x, scale.0, cols);
    let (y0, y1) = span(y, scale.1, rows);

    let area = (x1 - x0) * (y1 - y0);
    if area == 0 {
        return 0.;
    }
    let mut tissue = 0;
    for my in y0..y1 {
        for mx in x0..x1 {
            tissue += mask[[my, mx]] as usize;
        }
    }
    tissue as f64 / area as f64
}

/// Keep only the patches whose tissue fraction exceeds `min_tissue_fraction`.
pub fn filter_patches_by_mask(
    coords: &[[u32; 2]],
    size: u32,
    mask: NdTensorView<bool, 2>,
    scale: (f64, f64),
    min_tissue_fraction: f64,
) -> Vec<[u32; 2]> {
    coords
        .iter()
        .copied()
        .filter(|&xy| tissue_fraction(mask.view(), xy, size, scale) > min_tissue_fraction)
        .collect()
}

/// Patch coordinates for one slide.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatchSet {
    pub slide_path: PathBuf,
    pub slide_width: u32,
    pub slide_height: u32,
    pub slide_mpp: f64,

    /// Requested patch size, in pixels at `patch_spacing_um_px`.
    pub patch_size_px: u32,
    pub patch_spacing_um_px: f64,

    /// Width and height of each patch in level 0 pixels.
    pub patch_size: u32,

    /// Top-left `[x, y]` coordinates of each patch, in level 0 pixels.
    pub coords: Vec<[u32; 2]>,
}

impl PatchSet {
    pub fn save(&self, path: &Path) -> Result<(), PatchError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<PatchSet, PatchError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Return the file name of `path` without its extension.
pub fn slide_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Path of the patch file for a slide inside a save directory.
pub fn patch_path(save_dir: &Path, slide_path: &Path) -> PathBuf {
    save_dir
        .join("patches")
        .join(format!("{}.json", slide_stem(slide_path)))
}

/// Segment tissue in `slide` and write its mask, patches and stitch
/// preview under `save_dir`.
pub fn segment_and_patch_one_slide(
    slide: &dyn Slide,
    spec: &PatchSpec,
    save_dir: &Path,
    params: &TissueParams,
    thumbsize: u32,
) -> Result<PatchSet, PatchError> {
    let slide_path = slide.path();
    let stem = slide_stem(slide_path);
    let slide_mpp = get_avg_mpp(slide)?;
    let (width, height) = slide.dimensions();
    let size = patch_size_at_level0(spec, slide_mpp)?;
    info!(
        "Patching {} ({}x{} at {:.4} um/px) with {}px patches at level 0",
        stem, width, height, slide_mpp, size
    );

    let thumb = slide.thumbnail(thumbsize)?;
    let (thumb_w, thumb_h) = thumb.dimensions();
    let scale = (thumb_w as f64 / width as f64, thumb_h as f64 / height as f64);
    let thumb_mpp = slide_mpp / ((scale.0 + scale.1) / 2.);
    debug!("thumbnail is {}x{} at {:.4} um/px", thumb_w, thumb_h, thumb_mpp);

    let mask = segment_tissue(&thumb, thumb_mpp, params);
    let contours = tissue_contours(mask.view());
    if contours.is_empty() {
        warn!("No tissue found in {}", stem);
    } else {
        debug!("found {} tissue regions in {}", contours.len(), stem);
    }

    let grid = patch_grid(width, height, size);
    let coords = filter_patches_by_mask(&grid, size, mask.view(), scale, spec.min_tissue_fraction);
    info!("Kept {} of {} patches in {}", coords.len(), grid.len(), stem);

    for dir in ["masks", "patches", "stitches"] {
        fs::create_dir_all(save_dir.join(dir))?;
    }

    let mask_preview = draw_tissue_contours(&thumb, &contours)?;
    save_preview(&save_dir.join("masks").join(format!("{}.jpg", stem)), &mask_preview)?;

    let stitch = draw_patch_outlines(&thumb, &coords, size, scale)?;
    save_preview(&save_dir.join("stitches").join(format!("{}.jpg", stem)), &stitch)?;

    let patch_set = PatchSet {
        slide_path: slide_path.to_path_buf(),
        slide_width: width,
        slide_height: height,
        slide_mpp,
        patch_size_px: spec.patch_size,
        patch_spacing_um_px: spec.patch_spacing_um_px,
        patch_size: size,
        coords,
    };
    patch_set.save(&patch_path(save_dir, slide_path))?;

    Ok(patch_set)
}

/// Outcome of patching one slide.
#[derive(Clone, Debug, PartialEq)]
pub enum PatchStatus {
    Processed { num_patches: usize, patch_size: u32, slide_mpp: f64 },
    AlreadyExist,
    Failed(String),
}

impl PatchStatus {
    fn label(&self) -> &'static str {
        match self {
            PatchStatus::Processed { .. } => "processed",
            PatchStatus::AlreadyExist => "already_exist",
            PatchStatus::Failed(_) => "failed",
        }
    }
}

/// Result of [`segment_and_patch_directory_of_slides`].
#[derive(Debug, Default)]
pub struct PatchSummary {
    /// Status of each slide, in processing order.
    pub slides: Vec<(PathBuf, PatchStatus)>,
}

impl PatchSummary {
    /// Paths of slides which could not be patched.
    pub fn failed(&self) -> Vec<&Path> {
        self.slides
            .iter()
            .filter(|(_, status)| matches!(status, PatchStatus::Failed(_)))
            .map(|(path, _)| path.as_path())
            .collect()
    }

    fn write_process_list(&self, path: &Path, spec: &PatchSpec) -> Result<(), PatchError> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(
            writer,
            "slide_id,status,num_patches,patch_size,patch_spacing_um_px,slide_mpp"
        )?;
        for (slide, status) in &self.slides {
            let (num_patches, patch_size, mpp) = match status {
                PatchStatus::Processed {
                    num_patches,
                    patch_size,
                    slide_mpp,
                } => (
                    num_patches.to_string(),
                    patch_size.to_string(),
                    slide_mpp.to_string(),
                ),
                _ => Default::default(),
            };
            let slide_id = slide
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            writeln!(
                writer,
                "{},{},{},{},{},{}",
                crate::outputs::escape_field(&slide_id),
                status.label(),
                num_patches,
                patch_size,
                spec.patch_spacing_um_px,
                mpp
            )?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// List the regular files in `dir`, sorted by name.
pub fn list_slide_paths(dir: &Path) -> Result<Vec<PathBuf>, PatchError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

/// Segment and patch every slide in `source_dir`, saving results in
/// `save_dir`.
///
/// Slides that cannot be read are logged and reported as failed in the
/// summary rather than aborting the whole directory.
pub fn segment_and_patch_directory_of_slides(
    source_dir: &Path,
    save_dir: &Path,
    spec: &PatchSpec,
    backend: Backend,
    params: &TissueParams,
    thumbsize: u32,
) -> Result<PatchSummary, PatchError> {
    let slide_paths = list_slide_paths(source_dir)?;
    if slide_paths.is_empty() {
        return Err(PatchError::NoSlides(source_dir.to_path_buf()));
    }
    fs::create_dir_all(save_dir)?;
    info!("Found {} slides in {}", slide_paths.len(), source_dir.display());

    let mut summary = PatchSummary::default();
    for slide_path in slide_paths {
        if patch_path(save_dir, &slide_path).exists() {
            info!("Patches for {} already exist, skipping", slide_path.display());
            summary.slides.push((slide_path, PatchStatus::AlreadyExist));
            continue;
        }

        let result = open_slide(&slide_path, backend)
            .map_err(PatchError::from)
            .and_then(|slide| {
                segment_and_patch_one_slide(slide.as_ref(), spec, save_dir, params, thumbsize)
            });

        let status = match result {
            Ok(patch_set) => PatchStatus::Processed {
                num_patches: patch_set.coords.len(),
                patch_size: patch_set.patch_size,
                slide_mpp: patch_set.slide_mpp,
            },
            Err(err) => {
                error!("Failed to patch {}: {}", slide_path.display(), err);
                PatchStatus::Failed(err.to_string())
            }
        };
        summary.slides.push((slide_path, status));
    }

    summary.write_process_list(&save_dir.join(PROCESS_LIST_NAME), spec)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use rten_tensor::prelude::*;
    use rten_tensor::NdTensor;
    use wsinfer_slide::{open_slide, Backend};
    use wsinfer_testing::{write_slide, SyntheticSlide, TestCases};

    use super::{
        filter_patches_by_mask, patch_grid, patch_size_at_level0,
        segment_and_patch_directory_of_slides, segment_and_patch_one_slide, PatchSet, PatchSpec,
        PatchStatus, PROCESS_LIST_NAME,
    };
    use crate::tissue::TissueParams;

    #[test]
    fn test_patch_size_at_level0() {
        #[derive(Debug)]
        struct Case {
            patch_size: u32,
            spacing: f64,
            slide_mpp: f64,
            expected: Option<u32>,
        }

        let cases = [
            Case {
                patch_size: 256,
                spacing: 0.25,
                slide_mpp: 0.25,
                expected: Some(256),
            },
            Case {
                patch_size: 256,
                spacing: 0.5,
                slide_mpp: 0.25,
                expected: Some(512),
            },
            Case {
                patch_size: 350,
                spacing: 0.25,
                slide_mpp: 0.25,
                expected: Some(350),
            },
            Case {
                patch_size: 100,
                spacing: 0.3,
                slide_mpp: 0.25,
                expected: Some(120),
            },
            Case {
                patch_size: 0,
                spacing: 0.5,
                slide_mpp: 0.25,
                expected: None,
            },
            Case {
                patch_size: 1,
                spacing: 0.1,
                slide_mpp: 1.,
                expected: None,
            },
        ];

        cases.test_each(|case| {
            let spec = PatchSpec::new(case.patch_size, case.spacing);
            let size = patch_size_at_level0(&spec, case.slide_mpp).ok();
            assert_eq!(size, case.expected);
        })
    }

    #[test]
    fn test_patch_grid() {
        #[derive(Debug)]
        struct Case {
            size: u32,
        }

        let cases = [Case { size: 256 }, Case { size: 512 }, Case { size: 350 }, Case { size: 120 }];

        cases.test_each(|case| {
            let coords = patch_grid(4096, 4096, case.size);
            let per_side = 4096u32.div_ceil(case.size) as usize;
            assert_eq!(coords.len(), per_side * per_side);

            let mut expected = Vec::new();
            for x in (0..4096).step_by(case.size as usize) {
                for y in (0..4096).step_by(case.size as usize) {
                    expected.push([x, y]);
                }
            }
            assert_eq!(coords, expected);
        })
    }

    #[test]
    fn test_filter_patches_by_mask() {
        // 4x4 mask of a 40x40 slide, with tissue in the top-left mask pixel.
        let mut mask = NdTensor::full([4, 4], false);
        mask[[0, 0]] = true;
        let grid = patch_grid(40, 40, 20);

        let kept = filter_patches_by_mask(&grid, 20, mask.view(), (0.1, 0.1), 0.);
        assert_eq!(kept, vec![[0, 0]]);

        // Tissue covers 1/4 of the first patch.
        let kept = filter_patches_by_mask(&grid, 20, mask.view(), (0.1, 0.1), 0.5);
        assert!(kept.is_empty());

        // Patches smaller than a mask pixel.
        let grid = patch_grid(40, 40, 5);
        let kept = filter_patches_by_mask(&grid, 5, mask.view(), (0.1, 0.1), 0.);
        assert_eq!(kept, vec![[0, 0], [0, 5], [5, 0], [5, 5]]);

        // A footprint which straddles two mask pixels uses the one its
        // center falls in.
        let grid = patch_grid(40, 40, 8);
        let kept = filter_patches_by_mask(&grid, 8, mask.view(), (0.1, 0.1), 0.);
        assert_eq!(kept, vec![[0, 0]]);
    }

    #[test]
    fn test_segment_and_patch_slide_covered_by_tissue() {
        let tmp = tempfile::tempdir().unwrap();
        let slide_path = tmp.path().join("purple.tif");
        write_slide(&slide_path, &SyntheticSlide::purple(1024, 1024)).unwrap();
        let slide = open_slide(&slide_path, Backend::Tiff).unwrap();

        // Tissue reaches every edge of the thumbnail.
        let save_dir = tmp.path().join("save");
        let patch_set = segment_and_patch_one_slide(
            slide.as_ref(),
            &PatchSpec::new(64, 0.25),
            &save_dir,
            &TissueParams::default(),
            256,
        )
        .unwrap();

        assert_eq!(patch_set.patch_size, 64);
        assert_eq!(patch_set.coords, patch_grid(1024, 1024, 64));
        assert!(save_dir.join("masks/purple.jpg").exists());
        assert!(save_dir.join("stitches/purple.jpg").exists());
    }

    #[test]
    fn test_segment_and_patch_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let slide_dir = tmp.path().join("slides");
        std::fs::create_dir(&slide_dir).unwrap();

        // 1024x1024 px at 0.25 um/px, so the slide is 256um wide.
        write_slide(&slide_dir.join("purple.tif"), &SyntheticSlide::purple(1024, 1024)).unwrap();
        std::fs::write(slide_dir.join("bad.svs"), b"").unwrap();

        let save_dir = tmp.path().join("save");
        let spec = PatchSpec::new(100, 0.5);
        let summary = segment_and_patch_directory_of_slides(
            &slide_dir,
            &save_dir,
            &spec,
            Backend::Tiff,
            &TissueParams::default(),
            256,
        )
        .unwrap();

        assert_eq!(summary.slides.len(), 2);
        assert_eq!(summary.failed().len(), 1);
        assert!(summary.failed()[0].ends_with("bad.svs"));

        assert!(save_dir.join("masks/purple.jpg").exists());
        assert!(save_dir.join("stitches/purple.jpg").exists());
        assert!(save_dir.join(PROCESS_LIST_NAME).exists());
        assert!(!save_dir.join("patches/bad.json").exists());

        let patches = PatchSet::load(&save_dir.join("patches/purple.json")).unwrap();
        assert_eq!(patches.patch_size, 200);
        assert_eq!(patches.coords, patch_grid(1024, 1024, 200));
        assert_eq!(patches.coords.len(), 36);

        let process_list = std::fs::read_to_string(save_dir.join(PROCESS_LIST_NAME)).unwrap();
        let lines: Vec<_> = process_list.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.contains(&"bad.svs,failed,,,0.5,"));
        assert!(lines.contains(&"purple.tif,processed,36,200,0.5,0.25"));

        // Running again skips slides which already have patches.
        let summary = segment_and_patch_directory_of_slides(
            &slide_dir,
            &save_dir,
            &spec,
            Backend::Tiff,
            &TissueParams::default(),
            256,
        )
        .unwrap();
        let purple = summary
            .slides
            .iter()
            .find(|(path, _)| path.ends_with("purple.tif"))
            .unwrap();
        assert_eq!(purple.1, PatchStatus::AlreadyExist);
    }
}
