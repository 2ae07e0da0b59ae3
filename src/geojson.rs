//! Conversion of model outputs to GeoJSON for viewers such as QuPath.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::info;

use crate::outputs::{list_csv_files, read_csv, ModelOutputTable, OutputError, TableRow, MODEL_OUTPUTS_DIR};

#[derive(Debug, thiserror::Error)]
pub enum GeoJsonError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write GeoJSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("output directory {} already exists; use --overwrite to replace files in it", .0.display())]
    OutputExists(PathBuf),

    #[error("no model outputs found in {}", .0.display())]
    NoOutputs(PathBuf),
}

fn feature(row: &TableRow, prob_columns: &[String]) -> Value {
    let (minx, miny) = (row.minx as u64, row.miny as u64);
    let (maxx, maxy) = (row.maxx(), row.maxy());
    let measurements: Vec<Value> = prob_columns
        .iter()
        .zip(&row.probs)
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect();

    json!({
        "type": "Feature",
        "id": "PathTileObject",
        "geometry": {
            "type": "Polygon",
            "coordinates": [[
                [maxx, miny],
                [maxx, maxy],
                [minx, maxy],
                [minx, miny],
                [maxx, miny]
            ]]
        },
        "properties": {
            "isLocked": true,
            "measurements": measurements
        }
    })
}

/// Build a `FeatureCollection` with one tile per row of `table`.
pub fn table_to_geojson(table: &ModelOutputTable) -> Value {
    let features: Vec<Value> = table
        .rows
        .iter()
        .map(|row| feature(row, &table.prob_columns))
        .collect();
    json!({"type": "FeatureCollection", "features": features})
}

/// Convert one model output CSV to a GeoJSON file.
pub fn convert_csv_to_geojson(csv_path: &Path, out_path: &Path) -> Result<(), GeoJsonError> {
    let table = read_csv(csv_path)?;
    let geojson = table_to_geojson(&table);
    let mut writer = BufWriter::new(File::create(out_path)?);
    serde_json::to_writer(&mut writer, &geojson)?;
    writer.flush()?;
    Ok(())
}

/// Convert every CSV in `results_dir/model-outputs` to a `.json` file in
/// `output_dir`, returning the paths written.
pub fn convert_directory(
    results_dir: &Path,
    output_dir: &Path,
    overwrite: bool,
) -> Result<Vec<PathBuf>, GeoJsonError> {
    let csv_dir = results_dir.join(MODEL_OUTPUTS_DIR);
    if !csv_dir.is_dir() {
        return Err(GeoJsonError::NoOutputs(csv_dir));
    }
    let csv_paths = list_csv_files(&csv_dir)?;
    if csv_paths.is_empty() {
        return Err(GeoJsonError::NoOutputs(csv_dir));
    }
    if output_dir.exists() && !overwrite {
        return Err(GeoJsonError::OutputExists(output_dir.to_path_buf()));
    }
    fs::create_dir_all(output_dir)?;

    let mut written = Vec::with_capacity(csv_paths.len());
    for csv_path in csv_paths {
        let stem = csv_path.file_stem().unwrap_or_default().to_string_lossy();
        let out_path = output_dir.join(format!("{}.json", stem));
        convert_csv_to_geojson(&csv_path, &out_path)?;
        info!("Wrote {}", out_path.display());
        written.push(out_path);
    }
    Ok(written)
}
