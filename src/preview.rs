//! Preview images of tissue masks and patch grids.

use std::path::Path;

use image::{Rgb, RgbImage};
use rten_imageproc::{Painter, Point, Polygons, Rect};
use rten_tensor::errors::FromDataError;
use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, NdTensorView};

/// Stroke color for tissue outlines.
const TISSUE_COLOR: [u8; 3] = [0, 255, 0];

/// Stroke color for patch outlines.
const PATCH_COLOR: [u8; 3] = [0, 0, 0];

/// Copy an image into a CHW tensor for drawing.
fn image_to_chw(image: &RgbImage) -> Result<NdTensor<u8, 3>, FromDataError> {
    let (width, height) = image.dimensions();
    let layout = image.sample_layout();
    let chw = NdTensorView::from_data_with_strides(
        [height as usize, width as usize, 3],
        image.as_raw().as_slice(),
        [
            layout.height_stride,
            layout.width_stride,
            layout.channel_stride,
        ],
    )?
    .permuted([2, 0, 1])
    .to_tensor();
    Ok(chw)
}

fn chw_to_image(chw: NdTensorView<u8, 3>) -> RgbImage {
    let [_, height, width] = chw.shape();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([chw[[0, y, x]], chw[[1, y, x]], chw[[2, y, x]]])
    })
}

/// Draw the outlines of tissue regions over a thumbnail.
///
/// Contours are stroked one pixel wide, since contours of tissue that reaches
/// the edge of the thumbnail lie on its border.
pub fn draw_tissue_contours(thumb: &RgbImage, contours: &Polygons) -> Result<RgbImage, FromDataError> {
    let mut surface = image_to_chw(thumb)?;
    let mut painter = Painter::new(surface.view_mut());
    painter.set_stroke(TISSUE_COLOR);
    for poly in contours.iter() {
        painter.draw_polygon(poly);
    }
    Ok(chw_to_image(surface.view()))
}

/// Draw the outline of each patch over a thumbnail.
///
/// `coords` and `patch_size` are in level 0 pixels. `scale` is the ratio of
/// thumbnail size to level 0 size along X and Y.
pub fn draw_patch_outlines(
    thumb: &RgbImage,
    coords: &[[u32; 2]],
    patch_size: u32,
    scale: (f64, f64),
) -> Result<RgbImage, FromDataError> {
    let (width, height) = thumb.dimensions();
    let (max_x, max_y) = (width as i32 - 1, height as i32 - 1);
    let mut surface = image_to_chw(thumb)?;
    let mut painter = Painter::new(surface.view_mut());
    painter.set_stroke(PATCH_COLOR);

    for &[x, y] in coords {
        let left = ((x as f64 * scale.0) as i32).min(max_x);
        let top = ((y as f64 * scale.1) as i32).min(max_y);
        let right = (((x + patch_size) as f64 * scale.0) as i32).min(max_x);
        let bottom = (((y + patch_size) as f64 * scale.1) as i32).min(max_y);
        let rect = Rect::from_tlbr(top, left, bottom, right);
        let corners: [Point; 4] = rect.corners();
        painter.draw_polygon(&corners);
    }

    Ok(chw_to_image(surface.view()))
}

/// Save a preview image. The format is chosen from the file extension.
pub fn save_preview(path: &Path, image: &RgbImage) -> Result<(), image::ImageError> {
    image.save(path)
}
