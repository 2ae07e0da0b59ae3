//! Readers for whole slide images (WSIs).
//!
//! A slide is a large, usually pyramidal, RGB image together with its
//! physical resolution in micrometers per pixel (MPP). This crate provides a
//! [`Slide`] trait with two backends:
//!
//! - [`TiffSlide`] decodes tiled or stripped TIFF files lazily, one chunk at a
//!   time, so gigapixel slides can be read without loading them into memory.
//! - [`ImageSlide`] decodes the whole image with the `image` crate. It is only
//!   suitable for small images.
//!
//! Region coordinates are always given at level 0 (full resolution).

use std::error::Error;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use image::RgbImage;
use rten_tensor::errors::FromDataError;
use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, NdTensorView};

mod image_slide;
mod mpp;
mod tiff_slide;

pub use image_slide::ImageSlide;
pub use mpp::{mpp_from_description, mpp_from_resolution, ResolutionUnit};
pub use tiff_slide::TiffSlide;

/// Errors reported when opening or reading a slide.
#[derive(Debug, thiserror::Error)]
pub enum SlideError {
    #[error("failed to read slide: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode TIFF: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("failed to decode image: {0}")]
    Image(#[from] image::ImageError),

    #[error("unsupported sample format: {0}")]
    UnsupportedFormat(String),

    #[error("slide has no readable RGB levels")]
    NoLevels,

    #[error("could not read the spacing of slide {0}")]
    CannotReadSpacing(String),

    #[error("failed to create tensor: {0}")]
    Tensor(#[from] FromDataError),
}

/// Slide reading implementation to use.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Backend {
    /// Lazy chunked TIFF decoding.
    #[default]
    Tiff,

    /// Whole-image decoding with the `image` crate.
    Image,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Tiff => write!(f, "tiff"),
            Backend::Image => write!(f, "image"),
        }
    }
}

/// Error returned when parsing an unknown backend name.
#[derive(Debug, PartialEq)]
pub struct UnknownBackend(pub String);

impl fmt::Display for UnknownBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown backend \"{}\", expected \"tiff\" or \"image\"",
            self.0
        )
    }
}

impl Error for UnknownBackend {}

impl FromStr for Backend {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tiff" => Ok(Backend::Tiff),
            "image" => Ok(Backend::Image),
            _ => Err(UnknownBackend(s.to_string())),
        }
    }
}

/// One resolution level of a slide pyramid.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Level {
    pub width: u32,
    pub height: u32,

    /// Ratio of the level 0 width to this level's width.
    pub downsample: f64,
}

/// A whole slide image.
pub trait Slide: Send + Sync {
    /// Path the slide was opened from.
    fn path(&self) -> &Path;

    /// Resolution levels, largest first. Level 0 is the full resolution image.
    fn levels(&self) -> &[Level];

    /// Width and height of level 0.
    fn dimensions(&self) -> (u32, u32) {
        let level = self.levels()[0];
        (level.width, level.height)
    }

    /// Micrometers per pixel along X and Y at level 0, if known.
    fn mpp_xy(&self) -> Option<(f64, f64)>;

    /// Average micrometers per pixel at level 0, if known.
    fn mpp(&self) -> Option<f64> {
        self.mpp_xy().map(|(x, y)| (x + y) / 2.)
    }

    /// Read a `width x height` region whose top-left corner is `(x, y)` at
    /// level 0.
    ///
    /// Parts of the region outside the slide are filled with black.
    fn read_region(&self, x: i64, y: i64, width: u32, height: u32)
        -> Result<RgbImage, SlideError>;

    /// Return a downscaled copy of the slide whose longest side is at most
    /// `max_side` pixels.
    fn thumbnail(&self, max_side: u32) -> Result<RgbImage, SlideError>;
}

/// Open the slide at `path` using the given backend.
pub fn open_slide<P: AsRef<Path>>(path: P, backend: Backend) -> Result<Box<dyn Slide>, SlideError> {
    let path = path.as_ref();
    let slide: Box<dyn Slide> = match backend {
        Backend::Tiff => Box::new(TiffSlide::open(path)?),
        Backend::Image => Box::new(ImageSlide::open(path)?),
    };
    Ok(slide)
}

/// Return the average MPP of a slide, or an error if it is unknown.
pub fn get_avg_mpp(slide: &dyn Slide) -> Result<f64, SlideError> {
    slide
        .mpp()
        .ok_or_else(|| SlideError::CannotReadSpacing(slide.path().display().to_string()))
}

/// Compute the size of a thumbnail of an image of size `(width, height)`
/// whose longest side is at most `max_side`.
///
/// Images are never upscaled.
pub fn thumbnail_size(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= max_side || longest == 0 {
        return (width, height);
    }
    let scale = max_side as f64 / longest as f64;
    let scaled = |v: u32| ((v as f64 * scale).round() as u32).max(1);
    (scaled(width), scaled(height))
}

/// Convert an image into a CHW tensor with 3 channels and values in the range
/// [0, 1].
pub fn image_to_tensor(image: &RgbImage) -> Result<NdTensor<f32, 3>, SlideError> {
    let (width, height) = image.dimensions();
    let layout = image.sample_layout();

    let chw_tensor = NdTensorView::from_data_with_strides(
        [height as usize, width as usize, 3],
        image.as_raw().as_slice(),
        [
            layout.height_stride,
            layout.width_stride,
            layout.channel_stride,
        ],
    )?
    .permuted([2, 0, 1]) // HWC => CHW
    .map(|x| *x as f32 / 255.); // Rescale from [0, 255] to [0, 1]

    Ok(chw_tensor)
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};
    use rten_tensor::prelude::*;
    use wsinfer_testing::TestCases;

    use super::{image_to_tensor, thumbnail_size, Backend};

    #[test]
    fn test_backend_from_str() {
        assert_eq!("tiff".parse::<Backend>(), Ok(Backend::Tiff));
        assert_eq!("image".parse::<Backend>(), Ok(Backend::Image));

        let err = "openslide".parse::<Backend>().err().unwrap();
        assert!(err.to_string().contains("openslide"));
    }

    #[test]
    fn test_thumbnail_size() {
        #[derive(Debug)]
        struct Case {
            size: (u32, u32),
            max_side: u32,
            expected: (u32, u32),
        }

        let cases = [
            Case {
                size: (4096, 4096),
                max_side: 2048,
                expected: (2048, 2048),
            },
            Case {
                size: (1000, 250),
                max_side: 100,
                expected: (100, 25),
            },
            Case {
                size: (300, 200),
                max_side: 2048,
                expected: (300, 200),
            },
            Case {
                size: (10_000, 3),
                max_side: 100,
                expected: (100, 1),
            },
        ];

        cases.test_each(|case| {
            let (w, h) = case.size;
            assert_eq!(thumbnail_size(w, h, case.max_side), case.expected);
        })
    }

    #[test]
    fn test_image_to_tensor() {
        let mut image = RgbImage::new(3, 2);
        image.put_pixel(2, 1, Rgb([255, 0, 51]));

        let tensor = image_to_tensor(&image).unwrap();

        assert_eq!(tensor.shape(), [3, 2, 3]);
        assert_eq!(tensor[[0, 1, 2]], 1.0);
        assert_eq!(tensor[[1, 1, 2]], 0.0);
        assert!((tensor[[2, 1, 2]] - 0.2).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 0]], 0.0);
    }
}
