//! Internal testing utilities for the wsinfer crates.
//!
//! This provides table-driven test helpers and writers for small synthetic
//! slides, so that tests do not depend on multi-gigabyte scans.

use std::fmt::Debug;
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::panic::RefUnwindSafe;
use std::path::Path;

use tiff::encoder::{colortype, DirectoryEncoder, Rational, TiffEncoder, TiffKindStandard};
use tiff::tags::{ResolutionUnit, Tag};
use tiff::TiffResult;

/// Utility for creating parametrized (aka. table-driven) tests.
///
/// Create a collection of `Case` structs which implement `Debug`, then call
/// `cases.test_each` with the test function. All cases are run even if some
/// fail, and the failing cases are listed in the final panic message.
///
/// ```
/// use wsinfer_testing::TestCases;
///
/// #[derive(Debug)]
/// struct Case {
///     size: u32,
///     stride: u32,
///     expected: u32,
/// }
///
/// let cases = [Case { size: 10, stride: 4, expected: 3 }];
/// cases.test_each(|case| {
///     assert_eq!(case.size.div_ceil(case.stride), case.expected);
/// });
/// ```
pub trait TestCases {
    /// The data for a single test case.
    type Case;

    /// Call test function `test` with each test case in `self`, catching any panics.
    fn test_each(self, test: impl Fn(&Self::Case) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe;
}

impl<I: IntoIterator> TestCases for I {
    type Case = I::Item;

    fn test_each(self, test: impl Fn(&I::Item) + RefUnwindSafe)
    where
        Self::Case: Debug + RefUnwindSafe,
    {
        let failures: Vec<_> = self
            .into_iter()
            .filter(|case| std::panic::catch_unwind(|| test(case)).is_err())
            .collect();
        assert_eq!(
            failures.len(),
            0,
            "{} test cases failed: {:?}",
            failures.len(),
            failures
        );
    }
}

/// RGB value of the purple fill used by the synthetic slides.
pub const PURPLE: [u8; 3] = [160, 32, 240];

/// Options for [`write_slide`].
#[derive(Clone, Debug)]
pub struct SyntheticSlide {
    pub width: u32,
    pub height: u32,

    /// Fill color of the whole slide, unless `tissue_rect` is set.
    pub color: [u8; 3],

    /// If set, only pixels inside `[x, y, width, height]` get `color`. The
    /// rest of the slide is white, like empty glass.
    pub tissue_rect: Option<[u32; 4]>,

    /// Resolution in pixels per centimeter. `None` omits resolution tags.
    pub pixels_per_cm: Option<u32>,

    /// Value of the `ImageDescription` tag.
    pub description: Option<String>,

    /// Additional reduced-resolution levels, as downsample factors.
    pub downsamples: Vec<u32>,

    /// Store pixels in square tiles of this size instead of strips.
    pub tile_size: Option<u32>,
}

impl SyntheticSlide {
    /// A solid purple slide at 0.25 microns per pixel.
    pub fn purple(width: u32, height: u32) -> SyntheticSlide {
        SyntheticSlide {
            width,
            height,
            color: PURPLE,
            tissue_rect: None,
            pixels_per_cm: Some(40_000),
            description: None,
            downsamples: Vec::new(),
            tile_size: None,
        }
    }

    fn pixels(&self, downsample: u32) -> (u32, u32, Vec<u8>) {
        let width = (self.width / downsample).max(1);
        let height = (self.height / downsample).max(1);
        let mut data = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                let (x0, y0) = (x * downsample, y * downsample);
                let inside = match self.tissue_rect {
                    Some([rx, ry, rw, rh]) => {
                        x0 >= rx && x0 < rx + rw && y0 >= ry && y0 < ry + rh
                    }
                    None => true,
                };
                let rgb = if inside { self.color } else { [255, 255, 255] };
                data.extend_from_slice(&rgb);
            }
        }
        (width, height, data)
    }
}

/// Copy the `tile_size x tile_size` tile at `(x, y)` out of an RGB image.
/// Parts of the tile outside the image are zero.
fn tile_pixels(data: &[u8], width: u32, height: u32, x: u32, y: u32, tile_size: u32) -> Vec<u8> {
    let row_len = tile_size as usize * 3;
    let mut tile = vec![0; row_len * tile_size as usize];
    let cols = tile_size.min(width - x) as usize;
    for row in 0..tile_size.min(height - y) {
        let src = ((y + row) as usize * width as usize + x as usize) * 3;
        let dst = row as usize * row_len;
        tile[dst..dst + cols * 3].copy_from_slice(&data[src..src + cols * 3]);
    }
    tile
}

fn write_tiled_image<W: Write + Seek>(
    mut dir: DirectoryEncoder<W, TiffKindStandard>,
    (width, height, data): (u32, u32, Vec<u8>),
    tile_size: u32,
) -> TiffResult<DirectoryEncoder<W, TiffKindStandard>> {
    let mut offsets = Vec::new();
    let mut byte_counts = Vec::new();
    for y in (0..height).step_by(tile_size as usize) {
        for x in (0..width).step_by(tile_size as usize) {
            let tile = tile_pixels(&data, width, height, x, y, tile_size);
            offsets.push(dir.write_data(tile.as_slice())? as u32);
            byte_counts.push(tile.len() as u32);
        }
    }

    dir.write_tag(Tag::ImageWidth, width)?;
    dir.write_tag(Tag::ImageLength, height)?;
    dir.write_tag(Tag::BitsPerSample, &[8u16, 8, 8][..])?;
    dir.write_tag(Tag::Compression, 1u16)?;
    dir.write_tag(Tag::PhotometricInterpretation, 2u16)?;
    dir.write_tag(Tag::SamplesPerPixel, 3u16)?;
    dir.write_tag(Tag::PlanarConfiguration, 1u16)?;
    dir.write_tag(Tag::TileWidth, tile_size)?;
    dir.write_tag(Tag::TileLength, tile_size)?;
    dir.write_tag(Tag::TileOffsets, offsets.as_slice())?;
    dir.write_tag(Tag::TileByteCounts, byte_counts.as_slice())?;
    Ok(dir)
}

/// Write an RGB TIFF described by `slide` to `path`.
///
/// Level 0 is the first directory. Each entry in `slide.downsamples` adds a
/// further directory with the image reduced by that factor. Pixels are stored
/// uncompressed, in strips unless `slide.tile_size` is set.
pub fn write_slide(path: &Path, slide: &SyntheticSlide) -> TiffResult<()> {
    let file = BufWriter::new(File::create(path)?);
    let mut encoder = TiffEncoder::new(file)?;

    let levels = std::iter::once(1).chain(slide.downsamples.iter().copied());
    for downsample in levels {
        let resolution = slide.pixels_per_cm.map(|ppcm| Rational {
            n: ppcm / downsample,
            d: 1,
        });

        if let Some(tile_size) = slide.tile_size {
            let mut dir =
                write_tiled_image(encoder.new_directory()?, slide.pixels(downsample), tile_size)?;
            if let Some(resolution) = resolution {
                dir.write_tag(Tag::XResolution, resolution.clone())?;
                dir.write_tag(Tag::YResolution, resolution)?;
                dir.write_tag(Tag::ResolutionUnit, ResolutionUnit::Centimeter.to_u16())?;
            }
            if let Some(description) = &slide.description {
                dir.write_tag(Tag::ImageDescription, description.as_str())?;
            }
            dir.finish()?;
            continue;
        }

        let (width, height, data) = slide.pixels(downsample);
        let mut image = encoder.new_image::<colortype::RGB8>(width, height)?;
        if let Some(resolution) = resolution {
            image.resolution(ResolutionUnit::Centimeter, resolution);
        }
        if let Some(description) = &slide.description {
            image
                .encoder()
                .write_tag(Tag::ImageDescription, description.as_str())?;
        }
        image.write_data(&data)?;
    }

    Ok(())
}
