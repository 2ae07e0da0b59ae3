//! Tissue detection on slide thumbnails.
//!
//! Stained tissue is strongly saturated while empty glass is close to white
//! or gray, so tissue is found by thresholding the HSV saturation channel and
//! then cleaning up the mask with morphological operations.

use image::RgbImage;
use rayon::prelude::*;
use rten_imageproc::{find_contours, Polygons, RetrievalMode};
use rten_tensor::prelude::*;
use rten_tensor::{NdTensor, NdTensorView};

/// Parameters for [`segment_tissue`].
#[derive(Clone, Debug, PartialEq)]
pub struct TissueParams {
    /// Width of the square median filter window applied to the saturation
    /// channel.
    pub median_filter_size: usize,

    /// Saturation values (in `[0, 255]`) above this are tissue.
    pub binary_threshold: u8,

    /// Radius of the disk used for morphological closing.
    pub closing_kernel_size: usize,

    /// Connected tissue regions smaller than this area are discarded.
    pub min_object_size_um2: f64,

    /// Holes inside tissue smaller than this area are filled.
    pub min_hole_size_um2: f64,
}

impl Default for TissueParams {
    fn default() -> Self {
        TissueParams {
            median_filter_size: 7,
            binary_threshold: 7,
            closing_kernel_size: 6,
            min_object_size_um2: 200. * 200.,
            min_hole_size_um2: 190.,
        }
    }
}

/// Compute the HSV saturation of each pixel, scaled to `[0, 255]`.
pub fn saturation(image: &RgbImage) -> NdTensor<u8, 2> {
    let (width, height) = image.dimensions();
    let data = image
        .pixels()
        .map(|px| {
            let [r, g, b] = px.0;
            let max = r.max(g).max(b);
            let min = r.min(g).min(b);
            if max == 0 {
                0
            } else {
                ((max - min) as f32 / max as f32 * 255.).round() as u8
            }
        })
        .collect::<Vec<u8>>();
    NdTensor::from_data([height as usize, width as usize], data)
}

/// Apply a median filter with a `size x size` window.
///
/// Pixels outside the image take the value of the nearest edge pixel.
pub fn median_filter(image: NdTensorView<u8, 2>, size: usize) -> NdTensor<u8, 2> {
    let [rows, cols] = image.shape();
    if size <= 1 || rows == 0 || cols == 0 {
        return image.to_tensor();
    }
    let before = (size / 2) as isize;
    let after = (size - 1 - size / 2) as isize;

    let mut out = vec![0u8; rows * cols];
    out.par_chunks_mut(cols).enumerate().for_each(|(y, out_row)| {
        let mut window = Vec::with_capacity(size * size);
        for x in 0..cols {
            window.clear();
            for dy in -before..=after {
                let yy = (y as isize + dy).clamp(0, rows as isize - 1) as usize;
                for dx in -before..=after {
                    let xx = (x as isize + dx).clamp(0, cols as isize - 1) as usize;
                    window.push(image[[yy, xx]]);
                }
            }
            let mid = window.len() / 2;
            let (_, median, _) = window.select_nth_unstable(mid);
            out_row[x] = *median;
        }
    });

    NdTensor::from_data([rows, cols], out)
}

/// Return a mask where each element is true if `image` is above `threshold`.
pub fn threshold(image: NdTensorView<u8, 2>, threshold: u8) -> NdTensor<bool, 2> {
    image.map(|v| *v > threshold)
}

/// Dilate (`erode == false`) or erode (`erode == true`) a mask with a disk
/// of the given radius.
///
/// For erosion, pixels outside the mask count as set, so objects touching
/// the border are not eroded from that side.
fn morph_disk(mask: NdTensorView<bool, 2>, radius: usize, erode: bool) -> NdTensor<bool, 2> {
    let [rows, cols] = mask.shape();
    let r = radius as isize;

    // Half-width of the disk at each vertical offset.
    let half_widths: Vec<isize> = (0..=r)
        .map(|dy| (((r * r - dy * dy) as f64).sqrt()).floor() as isize)
        .collect();

    // Per-row prefix counts of set pixels.
    let prefix: Vec<Vec<u32>> = (0..rows)
        .map(|y| {
            let mut counts = Vec::with_capacity(cols + 1);
            counts.push(0);
            let mut total = 0;
            for x in 0..cols {
                total += mask[[y, x]] as u32;
                counts.push(total);
            }
            counts
        })
        .collect();

    let mut out = vec![false; rows * cols];
    out.par_chunks_mut(cols.max(1)).enumerate().for_each(|(y, out_row)| {
        for x in 0..cols {
            let mut value = erode;
            for dy in -r..=r {
                let yy = y as isize + dy;
                if yy < 0 || yy >= rows as isize {
                    continue;
                }
                let w = half_widths[dy.unsigned_abs()];
                let lo = (x as isize - w).max(0) as usize;
                let hi = ((x as isize + w + 1) as usize).min(cols);
                let row = &prefix[yy as usize];
                let count = (row[hi] - row[lo]) as usize;
                if erode && count != hi - lo {
                    value = false;
                    break;
                } else if !erode && count > 0 {
                    value = true;
                    break;
                }
            }
            out_row[x] = value;
        }
    });

    NdTensor::from_data([rows, cols], out)
}

/// Morphological closing (dilation followed by erosion) with a disk.
pub fn binary_closing(mask: NdTensorView<bool, 2>, radius: usize) -> NdTensor<bool, 2> {
    if radius == 0 {
        return mask.to_tensor();
    }
    let dilated = morph_disk(mask, radius, false);
    morph_disk(dilated.view(), radius, true)
}

/// Label 4-connected components of pixels equal to `value` and return, for
/// each pixel, the size of the component it belongs to (0 for other pixels).
fn component_sizes(mask: NdTensorView<bool, 2>, value: bool) -> Vec<usize> {
    let [rows, cols] = mask.shape();
    let mut sizes = vec![0usize; rows * cols];
    let mut visited = vec![false; rows * cols];
    let mut stack = Vec::new();
    let mut members = Vec::new();

    for start in 0..rows * cols {
        if visited[start] || mask[[start / cols, start % cols]] != value {
            continue;
        }
        visited[start] = true;
        stack.push(start);
        members.clear();

        while let Some(idx) = stack.pop() {
            members.push(idx);
            let (y, x) = (idx / cols, idx % cols);
            let neighbors = [
                (y > 0).then(|| idx - cols),
                (y + 1 < rows).then(|| idx + cols),
                (x > 0).then(|| idx - 1),
                (x + 1 < cols).then(|| idx + 1),
            ];
            for n in neighbors.into_iter().flatten() {
                if !visited[n] && mask[[n / cols, n % cols]] == value {
                    visited[n] = true;
                    stack.push(n);
                }
            }
        }

        for &idx in &members {
            sizes[idx] = members.len();
        }
    }

    sizes
}

/// Clear connected regions of set pixels whose area is below `min_size`.
pub fn remove_small_objects(mask: NdTensorView<bool, 2>, min_size: usize) -> NdTensor<bool, 2> {
    let [rows, cols] = mask.shape();
    let sizes = component_sizes(mask, true);
    let data = (0..rows * cols)
        .map(|idx| mask[[idx / cols, idx % cols]] && sizes[idx] >= min_size)
        .collect::<Vec<bool>>();
    NdTensor::from_data([rows, cols], data)
}

/// Set connected regions of unset pixels whose area is below `min_size`.
pub fn remove_small_holes(mask: NdTensorView<bool, 2>, min_size: usize) -> NdTensor<bool, 2> {
    let [rows, cols] = mask.shape();
    let sizes = component_sizes(mask, false);
    let data = (0..rows * cols)
        .map(|idx| mask[[idx / cols, idx % cols]] || sizes[idx] < min_size)
        .collect::<Vec<bool>>();
    NdTensor::from_data([rows, cols], data)
}

/// Convert a physical area to a pixel count at the given resolution.
fn area_to_pixels(area_um2: f64, mpp: f64) -> usize {
    (area_um2 / (mpp * mpp)).round().max(0.) as usize
}

/// Find tissue in a slide thumbnail whose pixels are `thumb_mpp`
/// micrometers wide.
///
/// Returns a `[height, width]` mask where true marks tissue.
pub fn segment_tissue(thumb: &RgbImage, thumb_mpp: f64, params: &TissueParams) -> NdTensor<bool, 2> {
    let sat = saturation(thumb);
    let sat = median_filter(sat.view(), params.median_filter_size);
    let mask = threshold(sat.view(), params.binary_threshold);
    let mask = binary_closing(mask.view(), params.closing_kernel_size);
    let mask = remove_small_objects(
        mask.view(),
        area_to_pixels(params.min_object_size_um2, thumb_mpp),
    );
    remove_small_holes(mask.view(), area_to_pixels(params.min_hole_size_um2, thumb_mpp))
}

/// Return the outlines of tissue regions in a mask.
pub fn tissue_contours(mask: NdTensorView<bool, 2>) -> Polygons {
    find_contours(mask, RetrievalMode::External)
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};
    use rten_tensor::prelude::*;
    use rten_tensor::NdTensor;
    use wsinfer_testing::{TestCases, PURPLE};

    use super::{
        binary_closing, median_filter, remove_small_holes, remove_small_objects, saturation,
        segment_tissue, threshold, tissue_contours, TissueParams,
    };

    fn mask_from_rows(rows: &[&str]) -> NdTensor<bool, 2> {
        let height = rows.len();
        let width = rows[0].len();
        let data = rows
            .iter()
            .flat_map(|row| row.chars().map(|c| c == '#'))
            .collect::<Vec<_>>();
        NdTensor::from_data([height, width], data)
    }

    fn count_set(mask: &NdTensor<bool, 2>) -> usize {
        mask.iter().filter(|v| **v).count()
    }

    #[test]
    fn test_saturation() {
        #[derive(Debug)]
        struct Case {
            rgb: [u8; 3],
            expected: u8,
        }

        let cases = [
            Case {
                rgb: [0, 0, 0],
                expected: 0,
            },
            Case {
                rgb: [255, 255, 255],
                expected: 0,
            },
            Case {
                rgb: [255, 0, 0],
                expected: 255,
            },
            Case {
                rgb: PURPLE,
                expected: 221,
            },
            Case {
                rgb: [200, 200, 190],
                expected: 13,
            },
        ];

        cases.test_each(|case| {
            let image = RgbImage::from_pixel(1, 1, Rgb(case.rgb));
            assert_eq!(saturation(&image)[[0, 0]], case.expected);
        })
    }

    #[test]
    fn test_median_filter_removes_speckle() {
        let mut image = NdTensor::<u8, 2>::zeros([5, 5]);
        image[[2, 2]] = 255;
        let filtered = median_filter(image.view(), 3);
        assert!(filtered.iter().all(|v| *v == 0));

        let image = NdTensor::<u8, 2>::full([4, 4], 9);
        let filtered = median_filter(image.view(), 7);
        assert!(filtered.iter().all(|v| *v == 9));
    }

    #[test]
    fn test_threshold() {
        let image = NdTensor::from_data([1, 3], vec![6u8, 7, 8]);
        let mask = threshold(image.view(), 7);
        assert_eq!(mask.to_vec(), vec![false, false, true]);
    }

    #[test]
    fn test_binary_closing_fills_gap() {
        let mask = mask_from_rows(&[
            ".........",
            ".###.###.",
            ".###.###.",
            ".###.###.",
            ".........",
        ]);
        let closed = binary_closing(mask.view(), 1);
        assert!(closed[[2, 4]], "gap between objects should be closed");
        assert!(!closed[[0, 0]]);

        // A fully set mask is unchanged, including at the borders.
        let full = NdTensor::full([6, 6], true);
        let closed = binary_closing(full.view(), 3);
        assert_eq!(count_set(&closed), 36);
    }

    #[test]
    fn test_remove_small_objects() {
        let mask = mask_from_rows(&[
            "##.....",
            "##.....",
            ".......",
            "....###",
            "....###",
            "....###",
        ]);
        let cleaned = remove_small_objects(mask.view(), 5);
        assert!(!cleaned[[0, 0]]);
        assert!(cleaned[[4, 5]]);
        assert_eq!(count_set(&cleaned), 9);

        // Diagonal neighbors are separate objects.
        let mask = mask_from_rows(&["#.", ".#"]);
        assert_eq!(count_set(&remove_small_objects(mask.view(), 2)), 0);
    }

    #[test]
    fn test_remove_small_holes() {
        let mask = mask_from_rows(&[
            "#####...",
            "#.###...",
            "#####...",
        ]);
        let filled = remove_small_holes(mask.view(), 2);
        assert!(filled[[1, 1]]);
        assert!(!filled[[0, 7]]);
    }

    #[test]
    fn test_segment_tissue() {
        // 60x40 thumbnail at 2um/px with a 30x20 block of tissue.
        let mut thumb = RgbImage::from_pixel(60, 40, Rgb([240, 240, 240]));
        for y in 10..30 {
            for x in 15..45 {
                thumb.put_pixel(x, y, Rgb(PURPLE));
            }
        }
        let params = TissueParams {
            min_object_size_um2: 40. * 40.,
            ..Default::default()
        };
        let mask = segment_tissue(&thumb, 2., &params);

        assert_eq!(mask.shape(), [40, 60]);
        assert!(mask[[20, 30]]);
        assert!(!mask[[2, 2]]);

        let contours = tissue_contours(mask.view());
        assert_eq!(contours.len(), 1);

        // The same block is discarded when it is physically too small.
        let params = TissueParams {
            min_hole_size_um2: 0.,
            ..params
        };
        let mask = segment_tissue(&thumb, 0.25, &params);
        assert_eq!(count_set(&mask), 0);
    }
}
