use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use tiff::decoder::Decoder;

use crate::mpp::read_tiff_mpp;
use crate::{thumbnail_size, Level, Slide, SlideError};

fn is_tiff(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "tif" | "tiff"))
        .unwrap_or(false)
}

/// Slide which is decoded into memory in full.
///
/// This supports any format the `image` crate can read. The spacing is only
/// known for TIFF files which carry resolution tags.
pub struct ImageSlide {
    path: PathBuf,
    image: RgbImage,
    levels: [Level; 1],
    mpp: Option<(f64, f64)>,
}

impl ImageSlide {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<ImageSlide, SlideError> {
        let path = path.as_ref().to_path_buf();
        let image = image::open(&path)?.into_rgb8();

        let mpp = if is_tiff(&path) {
            let mut decoder = Decoder::new(BufReader::new(File::open(&path)?))?;
            read_tiff_mpp(&mut decoder)?
        } else {
            None
        };

        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(SlideError::NoLevels);
        }

        Ok(ImageSlide {
            path,
            image,
            levels: [Level {
                width,
                height,
                downsample: 1.,
            }],
            mpp,
        })
    }
}

impl Slide for ImageSlide {
    fn path(&self) -> &Path {
        &self.path
    }

    fn levels(&self) -> &[Level] {
        &self.levels
    }

    fn mpp_xy(&self) -> Option<(f64, f64)> {
        self.mpp
    }

    fn read_region(
        &self,
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    ) -> Result<RgbImage, SlideError> {
        let (img_w, img_h) = self.image.dimensions();
        let region = RgbImage::from_fn(width, height, |dx, dy| {
            let sx = x + dx as i64;
            let sy = y + dy as i64;
            if sx >= 0 && sy >= 0 && sx < img_w as i64 && sy < img_h as i64 {
                *self.image.get_pixel(sx as u32, sy as u32)
            } else {
                Rgb([0, 0, 0])
            }
        });
        Ok(region)
    }

    fn thumbnail(&self, max_side: u32) -> Result<RgbImage, SlideError> {
        let (width, height) = self.image.dimensions();
        let (thumb_w, thumb_h) = thumbnail_size(width, height, max_side.max(1));
        if (thumb_w, thumb_h) == (width, height) {
            return Ok(self.image.clone());
        }
        Ok(imageops::resize(
            &self.image,
            thumb_w,
            thumb_h,
            FilterType::Triangle,
        ))
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};
    use wsinfer_testing::{write_slide, SyntheticSlide, PURPLE};

    use super::ImageSlide;
    use crate::{open_slide, Backend, Slide};

    #[test]
    fn test_image_slide_from_tiff() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("purple.tif");
        write_slide(&path, &SyntheticSlide::purple(64, 48)).unwrap();

        let slide = open_slide(&path, Backend::Image).unwrap();
        assert_eq!(slide.dimensions(), (64, 48));
        assert!((slide.mpp().unwrap() - 0.25).abs() < 1e-9);

        let region = slide.read_region(60, 0, 8, 8).unwrap();
        assert_eq!(region.get_pixel(0, 0).0, PURPLE);
        assert_eq!(region.get_pixel(7, 0).0, [0, 0, 0]);

        let thumb = slide.thumbnail(32).unwrap();
        assert_eq!(thumb.dimensions(), (32, 24));
    }

    #[test]
    fn test_image_slide_png_has_no_spacing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.png");
        RgbImage::from_pixel(10, 10, Rgb([1, 2, 3]))
            .save(&path)
            .unwrap();

        let slide = ImageSlide::open(&path).unwrap();
        assert_eq!(slide.mpp(), None);
        assert_eq!(slide.read_region(0, 0, 1, 1).unwrap().get_pixel(0, 0).0, [1, 2, 3]);
    }
}
