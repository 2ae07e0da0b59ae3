use std::error::Error;
use std::fs;
use std::process::ExitCode;

use chrono::Local;
use tracing::{info, warn};
use wsinfer::cli::{parse_args, Command, ModelChoice, PatchArgs, RunArgs, ToGeoJsonArgs};
use wsinfer::geojson::convert_directory;
use wsinfer::inference::{run_inference, InferenceOptions, RtenClassifier};
use wsinfer::logging::init_logging;
use wsinfer::metadata::{run_metadata, write_run_metadata};
use wsinfer::patching::{segment_and_patch_directory_of_slides, PatchSpec};
use wsinfer::tissue::TissueParams;
use wsinfer::zoo::{get_registered_model, list_registered_models, zoo_dir, ModelSource};
use wsinfer::WsinferError;
use wsinfer_slide::Backend;

fn run(backend: Backend, args: RunArgs) -> Result<(), WsinferError> {
    let source = match args.model {
        ModelChoice::Registered(name) => get_registered_model(&name)?,
        ModelChoice::Local { config, model_path } => ModelSource::from_paths(&config, &model_path)?,
    };
    info!(
        "Using {} model with classes {:?}",
        source.config.architecture, source.config.class_names
    );
    let classifier = RtenClassifier::load(&source.model_path)?;

    fs::create_dir_all(&args.results_dir)?;
    let options = InferenceOptions {
        batch_size: args.batch_size,
        num_workers: args.num_workers,
        thumbsize: args.thumbsize,
        tissue: TissueParams::default(),
    };
    let summary = run_inference(
        &args.wsi_dir,
        &args.results_dir,
        &source,
        &classifier,
        backend,
        &options,
    )?;

    let now = Local::now();
    let metadata_path = write_run_metadata(&args.results_dir, &run_metadata(&source, now), now)?;
    info!("Saved run metadata to {}", metadata_path.display());

    for path in &summary.failed_patching {
        warn!("Patching failed for {}", path.display());
    }
    for (path, err) in &summary.failed_inference {
        warn!("Inference failed for {}: {}", path.display(), err);
    }
    info!(
        "Finished. Wrote {} model outputs to {}",
        summary.written.len(),
        args.results_dir.display()
    );
    Ok(())
}

fn patch(backend: Backend, args: PatchArgs) -> Result<(), WsinferError> {
    let spec = PatchSpec::new(args.patch_size, args.patch_spacing);
    let summary = segment_and_patch_directory_of_slides(
        &args.source,
        &args.save_dir,
        &spec,
        backend,
        &TissueParams::default(),
        args.thumbsize,
    )?;
    for path in summary.failed() {
        warn!("Patching failed for {}", path.display());
    }
    Ok(())
}

fn togeojson(args: ToGeoJsonArgs) -> Result<(), WsinferError> {
    let written = convert_directory(&args.results_dir, &args.output_dir, args.overwrite)?;
    info!(
        "Wrote {} GeoJSON files to {}",
        written.len(),
        args.output_dir.display()
    );
    Ok(())
}

fn list() -> Result<(), WsinferError> {
    let names = list_registered_models()?;
    if names.is_empty() {
        eprintln!("No models found in {}", zoo_dir()?.display());
    }
    for name in names {
        println!("{}", name);
    }
    Ok(())
}

fn main() -> Result<ExitCode, Box<dyn Error>> {
    let args = match parse_args(std::env::args_os()) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("error: {}", err);
            return Ok(ExitCode::from(2));
        }
    };
    init_logging(args.verbosity);

    match args.command {
        Command::Help(text) => print!("{}", text),
        Command::Run(run_args) => run(args.backend, run_args)?,
        Command::Patch(patch_args) => patch(args.backend, patch_args)?,
        Command::ToGeoJson(geojson_args) => togeojson(geojson_args)?,
        Command::List => list()?,
    }
    Ok(ExitCode::SUCCESS)
}
