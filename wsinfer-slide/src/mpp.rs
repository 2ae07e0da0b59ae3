//! Physical resolution (micrometers per pixel) of slides.

use std::io::{Read, Seek};

use tiff::decoder::{ifd::Value, Decoder};
use tiff::tags::Tag;
use tiff::TiffResult;

/// Values of the TIFF `ResolutionUnit` tag.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ResolutionUnit {
    None,
    Inch,
    Centimeter,
}

impl ResolutionUnit {
    fn from_tag(value: u32) -> Option<ResolutionUnit> {
        match value {
            1 => Some(ResolutionUnit::None),
            2 => Some(ResolutionUnit::Inch),
            3 => Some(ResolutionUnit::Centimeter),
            _ => None,
        }
    }

    /// Number of micrometers in one unit.
    fn microns(self) -> Option<f64> {
        match self {
            ResolutionUnit::None => None,
            ResolutionUnit::Inch => Some(25_400.),
            ResolutionUnit::Centimeter => Some(10_000.),
        }
    }
}

/// Resolutions below this many pixels per unit are treated as placeholders
/// written by software that does not know the physical size (eg. 72 DPI).
const MIN_PIXELS_PER_UNIT: f64 = 100.;

/// Convert a TIFF resolution rational `numerator / denominator` (pixels per
/// unit) into micrometers per pixel.
pub fn mpp_from_resolution(unit: ResolutionUnit, numerator: u32, denominator: u32) -> Option<f64> {
    let microns = unit.microns()?;
    if numerator == 0 || denominator == 0 {
        return None;
    }
    let pixels_per_unit = numerator as f64 / denominator as f64;
    if pixels_per_unit < MIN_PIXELS_PER_UNIT {
        return None;
    }
    Some(microns / pixels_per_unit)
}

/// Extract the `MPP = <value>` field from an Aperio `ImageDescription`.
///
/// Aperio descriptions are a header line followed by `|`-separated
/// `key = value` pairs.
pub fn mpp_from_description(description: &str) -> Option<f64> {
    description.split('|').find_map(|field| {
        let (key, value) = field.split_once('=')?;
        if key.trim() != "MPP" {
            return None;
        }
        value.trim().parse::<f64>().ok().filter(|mpp| *mpp > 0.)
    })
}

fn rational(value: Value) -> Option<(u32, u32)> {
    match value {
        Value::Rational(n, d) => Some((n, d)),
        Value::List(mut values) if values.len() == 1 => rational(values.remove(0)),
        _ => None,
    }
}

fn unsigned(value: Value) -> Option<u32> {
    match value {
        Value::Short(v) => Some(v as u32),
        Value::Unsigned(v) => Some(v),
        Value::List(mut values) if values.len() == 1 => unsigned(values.remove(0)),
        _ => None,
    }
}

/// Read the MPP along X and Y from the current image directory of `decoder`.
pub(crate) fn read_tiff_mpp<R: Read + Seek>(
    decoder: &mut Decoder<R>,
) -> TiffResult<Option<(f64, f64)>> {
    if let Some(Value::Ascii(description)) = decoder.find_tag(Tag::ImageDescription)? {
        if let Some(mpp) = mpp_from_description(&description) {
            return Ok(Some((mpp, mpp)));
        }
    }

    // The TIFF default unit is inches.
    let unit = decoder
        .find_tag(Tag::ResolutionUnit)?
        .and_then(unsigned)
        .map(ResolutionUnit::from_tag)
        .unwrap_or(Some(ResolutionUnit::Inch));
    let Some(unit) = unit else {
        return Ok(None);
    };

    let mut axis_mpp = |tag: Tag| -> TiffResult<Option<f64>> {
        let mpp = decoder
            .find_tag(tag)?
            .and_then(rational)
            .and_then(|(n, d)| mpp_from_resolution(unit, n, d));
        Ok(mpp)
    };
    let mpp_x = axis_mpp(Tag::XResolution)?;
    let mpp_y = axis_mpp(Tag::YResolution)?;

    Ok(mpp_x.zip(mpp_y))
}
