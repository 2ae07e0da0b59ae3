use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use image::{Rgb, RgbImage};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::{ColorType, TiffResult};
use tracing::{debug, warn};

use crate::mpp::read_tiff_mpp;
use crate::{thumbnail_size, Level, Slide, SlideError};

type TiffDecoder = Decoder<BufReader<File>>;

/// Maximum number of decoded chunks kept in memory per slide.
const CHUNK_CACHE_CAPACITY: usize = 256;

/// Pyramid levels whose aspect ratio differs from level 0 by more than this
/// fraction are assumed to be label or macro images.
const ASPECT_RATIO_TOLERANCE: f64 = 0.02;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Channels {
    Gray,
    Rgb,
    Rgba,
}

impl Channels {
    fn samples(self) -> usize {
        match self {
            Channels::Gray => 1,
            Channels::Rgb => 3,
            Channels::Rgba => 4,
        }
    }
}

/// Storage layout of one image directory in the file.
#[derive(Clone, Copy, Debug)]
struct LevelLayout {
    ifd: usize,
    width: u32,
    height: u32,
    chunk_width: u32,
    chunk_height: u32,
    channels: Channels,
}

impl LevelLayout {
    fn chunks_across(&self) -> u32 {
        self.width.div_ceil(self.chunk_width)
    }

    fn chunks_down(&self) -> u32 {
        self.height.div_ceil(self.chunk_height)
    }
}

/// A decoded tile or strip.
struct Chunk {
    /// Number of pixels per row of `data`.
    width: u32,
    height: u32,
    channels: Channels,
    data: Vec<u8>,
}

impl Chunk {
    fn rgb(&self, x: u32, y: u32) -> [u8; 3] {
        let samples = self.channels.samples();
        let offset = (y as usize * self.width as usize + x as usize) * samples;
        let px = &self.data[offset..offset + samples];
        match self.channels {
            Channels::Gray => [px[0]; 3],
            Channels::Rgb | Channels::Rgba => [px[0], px[1], px[2]],
        }
    }
}

/// FIFO cache of decoded chunks, keyed by `(level, chunk index)`.
struct ChunkCache {
    entries: HashMap<(usize, u32), Arc<Chunk>>,
    order: VecDeque<(usize, u32)>,
}

impl ChunkCache {
    fn new() -> ChunkCache {
        ChunkCache {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: (usize, u32)) -> Option<Arc<Chunk>> {
        self.entries.get(&key).cloned()
    }

    fn insert(&mut self, key: (usize, u32), chunk: Arc<Chunk>) {
        if self.entries.insert(key, chunk).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > CHUNK_CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

fn open_decoder(path: &Path) -> TiffResult<TiffDecoder> {
    let file = BufReader::new(File::open(path)?);
    Ok(Decoder::new(file)?.with_limits(Limits::unlimited()))
}

/// Describe the decoder's current image, or return `None` if it does not
/// hold 8-bit RGB, RGBA or grayscale pixels.
fn read_layout(decoder: &mut TiffDecoder, ifd: usize) -> TiffResult<Option<LevelLayout>> {
    let (width, height) = decoder.dimensions()?;
    let channels = match decoder.colortype()? {
        ColorType::Gray(8) => Channels::Gray,
        // JPEG compressed YCbCr data is converted to RGB when decoded.
        ColorType::RGB(8) | ColorType::YCbCr(8) => Channels::Rgb,
        ColorType::RGBA(8) => Channels::Rgba,
        other => {
            debug!("skipping image directory {} with color type {:?}", ifd, other);
            return Ok(None);
        }
    };
    let (chunk_width, chunk_height) = decoder.chunk_dimensions();
    if width == 0 || height == 0 || chunk_width == 0 || chunk_height == 0 {
        return Ok(None);
    }

    Ok(Some(LevelLayout {
        ifd,
        width,
        height,
        chunk_width,
        chunk_height,
        channels,
    }))
}

/// Slide backed by a tiled or stripped (pyramidal) TIFF file.
///
/// Each image directory holding 8-bit color data with the same aspect ratio
/// as the largest one is treated as a pyramid level. Pixel data is decoded
/// lazily, one chunk at a time.
pub struct TiffSlide {
    path: PathBuf,
    levels: Vec<Level>,
    layouts: Vec<LevelLayout>,
    mpp: Option<(f64, f64)>,

    /// Idle decoders. Each concurrent reader takes its own decoder from the
    /// pool, so reads on different threads do not serialize on one file
    /// handle.
    decoders: Mutex<Vec<TiffDecoder>>,
    cache: Mutex<ChunkCache>,
}

impl TiffSlide {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<TiffSlide, SlideError> {
        let path = path.as_ref().to_path_buf();
        let mut decoder = open_decoder(&path)?;

        let mut layouts = Vec::new();
        let mut ifd = 0;
        loop {
            match read_layout(&mut decoder, ifd) {
                Ok(Some(layout)) => layouts.push(layout),
                Ok(None) => {}
                Err(err) if ifd == 0 => return Err(err.into()),
                Err(err) => warn!(
                    "skipping unreadable image directory {} in {}: {}",
                    ifd,
                    path.display(),
                    err
                ),
            }
            if !decoder.more_images() {
                break;
            }
            decoder.next_image()?;
            ifd += 1;
        }

        layouts.sort_by_key(|l| std::cmp::Reverse(l.width as u64 * l.height as u64));
        let base = *layouts.first().ok_or(SlideError::NoLevels)?;
        let base_aspect = base.width as f64 / base.height as f64;
        layouts.retain(|l| {
            let aspect = l.width as f64 / l.height as f64;
            ((aspect - base_aspect) / base_aspect).abs() <= ASPECT_RATIO_TOLERANCE
        });

        let levels = layouts
            .iter()
            .map(|l| Level {
                width: l.width,
                height: l.height,
                downsample: base.width as f64 / l.width as f64,
            })
            .collect();

        decoder.seek_to_image(base.ifd)?;
        let mpp = read_tiff_mpp(&mut decoder)?;

        debug!(
            "opened {} with {} levels, dimensions {}x{}, mpp {:?}",
            path.display(),
            layouts.len(),
            base.width,
            base.height,
            mpp
        );

        Ok(TiffSlide {
            path,
            levels,
            layouts,
            mpp,
            decoders: Mutex::new(vec![decoder]),
            cache: Mutex::new(ChunkCache::new()),
        })
    }

    /// Run `f` with a decoder positioned at image directory `ifd`.
    fn with_decoder<T>(
        &self,
        ifd: usize,
        f: impl FnOnce(&mut TiffDecoder) -> TiffResult<T>,
    ) -> Result<T, SlideError> {
        let pooled = self
            .decoders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut decoder = match pooled {
            Some(decoder) => decoder,
            None => open_decoder(&self.path)?,
        };

        decoder.seek_to_image(ifd)?;
        let result = f(&mut decoder)?;

        self.decoders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(decoder);
        Ok(result)
    }

    fn decode_chunk(&self, level: usize, index: u32) -> Result<Chunk, SlideError> {
        let layout = self.layouts[level];
        let (data_width, result) = self.with_decoder(layout.ifd, |decoder| {
            let (data_width, _) = decoder.chunk_data_dimensions(index);
            let result = decoder.read_chunk(index)?;
            Ok((data_width, result))
        })?;

        let DecodingResult::U8(data) = result else {
            return Err(SlideError::UnsupportedFormat(
                "only 8-bit samples are supported".into(),
            ));
        };

        let samples = layout.channels.samples();
        let full_chunk_len =
            layout.chunk_width as usize * layout.chunk_height as usize * samples;

        // Edge chunks may be returned either padded to the full chunk size or
        // cropped to the image bounds.
        let width = if data.len() >= full_chunk_len {
            layout.chunk_width
        } else {
            data_width
        };
        let row_len = width as usize * samples;
        if row_len == 0 {
            return Err(SlideError::UnsupportedFormat("empty chunk".into()));
        }
        let height = (data.len() / row_len) as u32;

        Ok(Chunk {
            width,
            height,
            channels: layout.channels,
            data,
        })
    }

    fn cached_chunk(&self, level: usize, index: u32) -> Result<Arc<Chunk>, SlideError> {
        let key = (level, index);
        if let Some(chunk) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Ok(chunk);
        }

        let chunk = Arc::new(self.decode_chunk(level, index)?);
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, chunk.clone());
        Ok(chunk)
    }

    /// Read a region from pyramid level `level`, in that level's coordinates.
    fn read_level_region(
        &self,
        level: usize,
        x: i64,
        y: i64,
        width: u32,
        height: u32,
    ) -> Result<RgbImage, SlideError> {
        let layout = self.layouts[level];
        let mut out = RgbImage::new(width, height);

        let x0 = x.max(0);
        let y0 = y.max(0);
        let x1 = (x + width as i64).min(layout.width as i64);
        let y1 = (y + height as i64).min(layout.height as i64);
        if x0 >= x1 || y0 >= y1 {
            return Ok(out);
        }

        let cw = layout.chunk_width as i64;
        let ch = layout.chunk_height as i64;
        let across = layout.chunks_across() as i64;

        for cy in (y0 / ch)..=((y1 - 1) / ch) {
            for cx in (x0 / cw)..=((x1 - 1) / cw) {
                let chunk = self.cached_chunk(level, (cy * across + cx) as u32)?;
                let (chunk_x, chunk_y) = (cx * cw, cy * ch);

                let sx0 = x0.max(chunk_x);
                let sx1 = x1.min(chunk_x + chunk.width as i64);
                let sy0 = y0.max(chunk_y);
                let sy1 = y1.min(chunk_y + chunk.height as i64);

                for sy in sy0..sy1 {
                    for sx in sx0..sx1 {
                        let px = chunk.rgb((sx - chunk_x) as u32, (sy - chunk_y) as u32);
                        out.put_pixel((sx - x) as u32, (sy - y) as u32, Rgb(px));
                    }
                }
            }
        }

        Ok(out)
    }
}

/// For each output coordinate in `0..out_len`, return the nearest source
/// coordinate in `0..src_len`.
fn nearest_coords(out_len: u32, src_len: u32) -> Vec<u32> {
    let scale = src_len as f64 / out_len as f64;
    (0..out_len)
        .map(|i| (((i as f64 + 0.5) * scale) as u32).min(src_len - 1))
        .collect()
}

/// Group `(output coord, source coord)` pairs by the chunk that contains the
/// source coordinate.
fn group_by_chunk(coords: &[u32], chunk_size: u32, n_chunks: u32) -> Vec<Vec<(u32, u32)>> {
    let mut groups = vec![Vec::new(); n_chunks as usize];
    for (out, &src) in coords.iter().enumerate() {
        groups[(src / chunk_size) as usize].push((out as u32, src));
    }
    groups
}

impl Slide for TiffSlide {
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
        self.read_level_region(0, x, y, width, height)
    }

    fn thumbnail(&self, max_side: u32) -> Result<RgbImage, SlideError> {
        let (width, height) = self.dimensions();
        let (thumb_w, thumb_h) = thumbnail_size(width, height, max_side.max(1));

        // Smallest level which is still at least as large as the thumbnail.
        let level = self
            .levels
            .iter()
            .rposition(|l| l.width >= thumb_w && l.height >= thumb_h)
            .unwrap_or(0);
        let layout = self.layouts[level];
        debug!(
            "creating {}x{} thumbnail from level {} ({}x{})",
            thumb_w, thumb_h, level, layout.width, layout.height
        );

        let cols = group_by_chunk(
            &nearest_coords(thumb_w, layout.width),
            layout.chunk_width,
            layout.chunks_across(),
        );
        let rows = group_by_chunk(
            &nearest_coords(thumb_h, layout.height),
            layout.chunk_height,
            layout.chunks_down(),
        );

        let mut out = RgbImage::new(thumb_w, thumb_h);
        for (cy, row_group) in rows.iter().enumerate() {
            if row_group.is_empty() {
                continue;
            }
            for (cx, col_group) in cols.iter().enumerate() {
                if col_group.is_empty() {
                    continue;
                }

                // Chunks are decoded without caching since each is visited once.
                let index = cy as u32 * layout.chunks_across() + cx as u32;
                let chunk = self.decode_chunk(level, index)?;
                let chunk_x = cx as u32 * layout.chunk_width;
                let chunk_y = cy as u32 * layout.chunk_height;

                for &(out_y, src_y) in row_group {
                    for &(out_x, src_x) in col_group {
                        let (ix, iy) = (src_x - chunk_x, src_y - chunk_y);
                        if ix < chunk.width && iy < chunk.height {
                            out.put_pixel(out_x, out_y, Rgb(chunk.rgb(ix, iy)));
                        }
                    }
                }
            }
        }

        Ok(out)
    }
}
