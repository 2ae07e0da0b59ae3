//! Command line argument parsing for the `wsinfer` binary.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use wsinfer_slide::Backend;

use crate::inference::DEFAULT_BATCH_SIZE;
use crate::patching::DEFAULT_THUMBSIZE;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

/// Where the model for a run comes from.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelChoice {
    /// A model registered in the zoo.
    Registered(String),

    /// A model config and weights file outside the zoo.
    Local { config: PathBuf, model_path: PathBuf },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunArgs {
    pub wsi_dir: PathBuf,
    pub results_dir: PathBuf,
    pub model: ModelChoice,
    pub batch_size: usize,
    pub num_workers: usize,
    pub thumbsize: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PatchArgs {
    pub source: PathBuf,
    pub save_dir: PathBuf,
    pub patch_size: u32,
    pub patch_spacing: f64,
    pub thumbsize: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToGeoJsonArgs {
    pub results_dir: PathBuf,
    pub output_dir: PathBuf,
    pub overwrite: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Run(RunArgs),
    Patch(PatchArgs),
    ToGeoJson(ToGeoJsonArgs),
    List,

    /// Print the given help text and exit.
    Help(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Args {
    pub backend: Backend,
    pub verbosity: Verbosity,
    pub command: Command,
}

fn main_help(bin_name: &str) -> String {
    format!(
        "Run patch classification models on whole slide images.

Usage: {bin_name} [OPTIONS] <COMMAND>

Commands:
  run        Patch slides and run a model on the patches
  patch      Segment tissue and extract patch coordinates
  togeojson  Convert model outputs to GeoJSON
  list       List registered models

Options:
  --backend <tiff|image>  Slide reading backend [default: tiff]
  -v, --verbose           Enable debug logging
  -q, --quiet             Only log warnings and errors
  -h, --help              Print help

Run '{bin_name} <COMMAND> --help' for help on a command.
"
    )
}

fn run_help(bin_name: &str) -> String {
    format!(
        "Patch slides and run a model on the patches.

Usage: {bin_name} run --wsi-dir <DIR> --results-dir <DIR> (--model <NAME> | --config <FILE> --model-path <FILE>)

Options:
  -i, --wsi-dir <DIR>      Directory of whole slide images
  -o, --results-dir <DIR>  Directory for patches and model outputs
  -m, --model <NAME>       Name of a registered model
  -c, --config <FILE>      Model config JSON, for models outside the zoo
  -p, --model-path <FILE>  Model weights (.rten), for models outside the zoo
  -b, --batch-size <N>     Patches per batch [default: {DEFAULT_BATCH_SIZE}]
  -n, --num-workers <N>    Threads used to load patches [default: number of CPUs]
  --thumbsize <N>          Longest side of the segmentation thumbnail [default: {DEFAULT_THUMBSIZE}]
  -h, --help               Print help
"
    )
}

fn patch_help(bin_name: &str) -> String {
    format!(
        "Segment tissue and extract patch coordinates.

Usage: {bin_name} patch --source <DIR> --save-dir <DIR> --patch-size <N> --patch-spacing <UM_PX>

Options:
  --source <DIR>           Directory of whole slide images
  --save-dir <DIR>         Directory for masks, patches and stitches
  --patch-size <N>         Patch size in pixels at the patch spacing
  --patch-spacing <UM_PX>  Patch spacing in micrometers per pixel
  --thumbsize <N>          Longest side of the segmentation thumbnail [default: {DEFAULT_THUMBSIZE}]
  -h, --help               Print help
"
    )
}

fn togeojson_help(bin_name: &str) -> String {
    format!(
        "Convert model outputs to GeoJSON.

Usage: {bin_name} togeojson [OPTIONS] <RESULTS_DIR> <OUTPUT_DIR>

Options:
  --overwrite  Write into OUTPUT_DIR even if it exists
  -h, --help   Print help
"
    )
}

/// Check that `dir` is a directory containing at least one file.
fn check_wsi_dir(dir: &Path) -> Result<(), lexopt::Error> {
    let mut entries = fs::read_dir(dir)
        .map_err(|err| format!("cannot read --wsi-dir {}: {}", dir.display(), err))?;
    let has_file = entries.any(|e| e.is_ok_and(|e| e.path().is_file()));
    if !has_file {
        return Err(format!("no files found in --wsi-dir {}", dir.display()).into());
    }
    Ok(())
}

fn resolve_model(
    model: Option<String>,
    config: Option<PathBuf>,
    model_path: Option<PathBuf>,
) -> Result<ModelChoice, lexopt::Error> {
    match (model, config, model_path) {
        (None, None, None) => Err("one of --model or (--config and --model-path) is required.".into()),
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
            Err("--model is mutually exclusive with --config and --model-path.".into())
        }
        (Some(name), None, None) => Ok(ModelChoice::Registered(name)),
        (None, Some(config), Some(model_path)) => Ok(ModelChoice::Local { config, model_path }),
        (None, _, _) => Err("--config and --model-path must both be set if one is set.".into()),
    }
}

fn parse_run(parser: &mut lexopt::Parser, bin_name: &str) -> Result<Command, lexopt::Error> {
    use lexopt::prelude::*;

    let mut wsi_dir: Option<PathBuf> = None;
    let mut results_dir: Option<PathBuf> = None;
    let mut model = None;
    let mut config = None;
    let mut model_path = None;
    let mut batch_size = DEFAULT_BATCH_SIZE;
    let mut num_workers = num_cpus::get();
    let mut thumbsize = DEFAULT_THUMBSIZE;

    while let Some(arg) = parser.next()? {
        match arg {
            Short('i') | Long("wsi-dir") => wsi_dir = Some(parser.value()?.into()),
            Short('o') | Long("results-dir") => results_dir = Some(parser.value()?.into()),
            Short('m') | Long("model") => model = Some(parser.value()?.string()?),
            Short('c') | Long("config") => config = Some(PathBuf::from(parser.value()?)),
            Short('p') | Long("model-path") => model_path = Some(PathBuf::from(parser.value()?)),
            Short('b') | Long("batch-size") => batch_size = parser.value()?.parse()?,
            Short('n') | Long("num-workers") => num_workers = parser.value()?.parse()?,
            Long("thumbsize") => thumbsize = parser.value()?.parse()?,
            Short('h') | Long("help") => return Ok(Command::Help(run_help(bin_name))),
            _ => return Err(arg.unexpected()),
        }
    }

    let model = resolve_model(model, config, model_path)?;
    let wsi_dir = wsi_dir.ok_or("missing required option --wsi-dir")?;
    let results_dir = results_dir.ok_or("missing required option --results-dir")?;
    if batch_size == 0 || num_workers == 0 || thumbsize == 0 {
        return Err("--batch-size, --num-workers and --thumbsize must be positive".into());
    }
    check_wsi_dir(&wsi_dir)?;

    Ok(Command::Run(RunArgs {
        wsi_dir,
        results_dir,
        model,
        batch_size,
        num_workers,
        thumbsize,
    }))
}

fn parse_patch(parser: &mut lexopt::Parser, bin_name: &str) -> Result<Command, lexopt::Error> {
    use lexopt::prelude::*;

    let mut source: Option<PathBuf> = None;
    let mut save_dir: Option<PathBuf> = None;
    let mut patch_size: Option<u32> = None;
    let mut patch_spacing: Option<f64> = None;
    let mut thumbsize = DEFAULT_THUMBSIZE;

    while let Some(arg) = parser.next()? {
        match arg {
            Long("source") => source = Some(parser.value()?.into()),
            Long("save-dir") => save_dir = Some(parser.value()?.into()),
            Long("patch-size") => patch_size = Some(parser.value()?.parse()?),
            Long("patch-spacing") => patch_spacing = Some(parser.value()?.parse()?),
            Long("thumbsize") => thumbsize = parser.value()?.parse()?,
            Short('h') | Long("help") => return Ok(Command::Help(patch_help(bin_name))),
            _ => return Err(arg.unexpected()),
        }
    }

    Ok(Command::Patch(PatchArgs {
        source: source.ok_or("missing required option --source")?,
        save_dir: save_dir.ok_or("missing required option --save-dir")?,
        patch_size: patch_size.ok_or("missing required option --patch-size")?,
        patch_spacing: patch_spacing.ok_or("missing required option --patch-spacing")?,
        thumbsize,
    }))
}

fn parse_togeojson(parser: &mut lexopt::Parser, bin_name: &str) -> Result<Command, lexopt::Error> {
    use lexopt::prelude::*;

    let mut values: Vec<PathBuf> = Vec::new();
    let mut overwrite = false;

    while let Some(arg) = parser.next()? {
        match arg {
            Value(val) => values.push(val.into()),
            Long("overwrite") => overwrite = true,
            Short('h') | Long("help") => return Ok(Command::Help(togeojson_help(bin_name))),
            _ => return Err(arg.unexpected()),
        }
    }

    let mut values = values.into_iter();
    let results_dir = values.next().ok_or("missing `<RESULTS_DIR>` arg")?;
    let output_dir = values.next().ok_or("missing `<OUTPUT_DIR>` arg")?;
    if let Some(extra) = values.next() {
        return Err(format!("unexpected argument {}", extra.display()).into());
    }

    Ok(Command::ToGeoJson(ToGeoJsonArgs {
        results_dir,
        output_dir,
        overwrite,
    }))
}

/// Parse command line arguments. The first item is the binary name.
pub fn parse_args<I>(args: I) -> Result<Args, lexopt::Error>
where
    I: IntoIterator,
    I::Item: Into<OsString>,
{
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_iter(args);
    let bin_name = parser.bin_name().unwrap_or("wsinfer").to_string();
    let mut backend = Backend::default();
    let mut verbosity = Verbosity::default();

    while let Some(arg) = parser.next()? {
        match arg {
            Long("backend") => backend = parser.value()?.parse()?,
            Short('v') | Long("verbose") => verbosity = Verbosity::Verbose,
            Short('q') | Long("quiet") => verbosity = Verbosity::Quiet,
            Short('h') | Long("help") => {
                return Ok(Args {
                    backend,
                    verbosity,
                    command: Command::Help(main_help(&bin_name)),
                })
            }
            Value(cmd) => {
                let command = match cmd.string()?.as_str() {
                    "run" => parse_run(&mut parser, &bin_name)?,
                    "patch" => parse_patch(&mut parser, &bin_name)?,
                    "togeojson" => parse_togeojson(&mut parser, &bin_name)?,
                    "list" => {
                        if let Some(arg) = parser.next()? {
                            return Err(arg.unexpected());
                        }
                        Command::List
                    }
                    other => return Err(format!("unknown command \"{}\"", other).into()),
                };
                return Ok(Args {
                    backend,
                    verbosity,
                    command,
                });
            }
            _ => return Err(arg.unexpected()),
        }
    }

    Err(format!("missing command. Run '{} --help' for usage.", bin_name).into())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use wsinfer_slide::Backend;
    use wsinfer_testing::TestCases;

    use super::{parse_args, Args, Command, ModelChoice, ToGeoJsonArgs, Verbosity};

    fn parse(args: &[&str]) -> Result<Args, String> {
        let args = std::iter::once("wsinfer").chain(args.iter().copied());
        parse_args(args).map_err(|e| e.to_string())
    }

    #[test]
    fn test_parse_run() {
        let tmp = tempfile::tempdir().unwrap();
        let wsi_dir = tmp.path().join("slides");
        std::fs::create_dir(&wsi_dir).unwrap();
        std::fs::write(wsi_dir.join("a.svs"), b"").unwrap();
        let wsi = wsi_dir.to_str().unwrap();

        let args = parse(&[
            "--backend", "image", "-v", "run", "--wsi-dir", wsi, "--results-dir", "out", "--model",
            "tumor", "--batch-size", "8", "--num-workers", "2",
        ])
        .unwrap();
        assert_eq!(args.backend, Backend::Image);
        assert_eq!(args.verbosity, Verbosity::Verbose);
        let Command::Run(run) = args.command else {
            panic!("expected run command");
        };
        assert_eq!(run.model, ModelChoice::Registered("tumor".into()));
        assert_eq!(run.results_dir, PathBuf::from("out"));
        assert_eq!((run.batch_size, run.num_workers), (8, 2));
        assert_eq!(run.thumbsize, 2048);

        let args = parse(&[
            "run", "-i", wsi, "-o", "out", "-c", "config.json", "-p", "model.rten",
        ])
        .unwrap();
        let Command::Run(run) = args.command else {
            panic!("expected run command");
        };
        assert_eq!(
            run.model,
            ModelChoice::Local {
                config: "config.json".into(),
                model_path: "model.rten".into()
            }
        );
    }

    #[test]
    fn test_run_model_validation() {
        #[derive(Debug)]
        struct Case {
            model_args: &'static [&'static str],
            expected: &'static str,
        }

        let cases = [
            Case {
                model_args: &[],
                expected: "one of --model or (--config and --model-path) is required.",
            },
            Case {
                model_args: &["--config", "config.json"],
                expected: "--config and --model-path must both be set if one is set.",
            },
            Case {
                model_args: &["--model-path", "model.rten"],
                expected: "--config and --model-path must both be set if one is set.",
            },
            Case {
                model_args: &["--model", "tumor", "--config", "config.json"],
                expected: "--model is mutually exclusive with --config and --model-path.",
            },
            Case {
                model_args: &["--model", "tumor", "--model-path", "model.rten"],
                expected: "--model is mutually exclusive with --config and --model-path.",
            },
        ];

        cases.test_each(|case| {
            let mut args = vec!["run", "--wsi-dir", ".", "--results-dir", "out"];
            args.extend(case.model_args);
            let err = parse(&args).unwrap_err();
            assert_eq!(err, case.expected);
        })
    }

    #[test]
    fn test_run_empty_wsi_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let wsi = tmp.path().to_str().unwrap();
        let err = parse(&["run", "--wsi-dir", wsi, "--results-dir", "out", "-m", "x"]).unwrap_err();
        assert!(err.contains("no files found"), "{}", err);
    }

    #[test]
    fn test_parse_other_commands() {
        let args = parse(&["togeojson", "results", "geojson", "--overwrite"]).unwrap();
        assert_eq!(
            args.command,
            Command::ToGeoJson(ToGeoJsonArgs {
                results_dir: "results".into(),
                output_dir: "geojson".into(),
                overwrite: true,
            })
        );

        let args = parse(&[
            "-q",
            "patch",
            "--source",
            "slides",
            "--save-dir",
            "out",
            "--patch-size",
            "350",
            "--patch-spacing",
            "0.25",
        ])
        .unwrap();
        assert_eq!(args.verbosity, Verbosity::Quiet);
        let Command::Patch(patch) = args.command else {
            panic!("expected patch command");
        };
        assert_eq!((patch.patch_size, patch.patch_spacing), (350, 0.25));

        assert_eq!(parse(&["list"]).unwrap().command, Command::List);
        assert!(matches!(parse(&["--help"]).unwrap().command, Command::Help(_)));
        assert!(matches!(parse(&["run", "-h"]).unwrap().command, Command::Help(_)));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
        assert!(parse(&["--backend", "openslide", "list"]).is_err());
        assert!(parse(&["togeojson", "results"]).is_err());
        assert!(parse(&["patch", "--source", "slides"]).is_err());
    }
}
