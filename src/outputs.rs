//! CSV tables of per-patch model outputs.
//!
//! Each slide gets one table with the columns
//! `slide,minx,miny,width,height,prob_<class>...`. Coordinates are level 0
//! pixels.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Name of the directory, inside a results directory, that holds the CSVs.
pub const MODEL_OUTPUTS_DIR: &str = "model-outputs";

const COORD_COLUMNS: [&str; 5] = ["slide", "minx", "miny", "width", "height"];

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{}:{line}: {message}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },
}

/// Model output for a single patch.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputRow {
    pub minx: u32,
    pub miny: u32,
    pub width: u32,
    pub height: u32,

    /// Probability of each class, in class order.
    pub probs: Vec<f32>,
}

/// Model outputs for all patches of a slide, in patch order.
#[derive(Clone, Debug, PartialEq)]
pub struct SlideOutputs {
    pub slide: PathBuf,
    pub rows: Vec<OutputRow>,
}

/// Quote a CSV field if it contains a separator, quote or line break.
pub fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split a CSV line into fields, handling quoted fields.
///
/// Returns `None` if a quoted field is not terminated.
fn split_fields(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut chars = line.chars().peekable();
    let mut in_quotes = false;

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            ch => field.push(ch),
        }
    }
    if in_quotes {
        return None;
    }
    fields.push(field);
    Some(fields)
}

/// Split CSV text into records. Line breaks inside quoted fields do not end
/// a record. Returns `(line_number, record)` pairs with 1-based line numbers.
fn records(text: &str) -> Vec<(usize, String)> {
    let mut records = Vec::new();
    let mut current = String::new();
    let mut start_line = 1;
    let mut in_quotes = false;

    for (i, line) in text.lines().enumerate() {
        if current.is_empty() {
            start_line = i + 1;
        } else {
            current.push('\n');
        }
        current.push_str(line);
        in_quotes ^= line.matches('"').count() % 2 == 1;
        if !in_quotes {
            records.push((start_line, std::mem::take(&mut current)));
        }
    }
    if !current.is_empty() {
        records.push((start_line, current));
    }
    records
}

fn write_table<W: Write>(
    writer: &mut W,
    outputs: &SlideOutputs,
    class_names: &[String],
) -> std::io::Result<()> {
    let prob_columns = class_names.iter().map(|name| escape_field(&format!("prob_{}", name)));
    let header: Vec<String> = COORD_COLUMNS
        .iter()
        .map(|c| c.to_string())
        .chain(prob_columns)
        .collect();
    writeln!(writer, "{}", header.join(","))?;

    let slide = escape_field(&outputs.slide.to_string_lossy());
    for row in &outputs.rows {
        write!(
            writer,
            "{},{},{},{},{}",
            slide, row.minx, row.miny, row.width, row.height
        )?;
        for prob in &row.probs {
            write!(writer, ",{}", prob)?;
        }
        writeln!(writer)?;
    }
    writer.flush()
}

/// Path that [`write_csv`] writes to before moving the table into place.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

/// Write the outputs for one slide as CSV.
///
/// The table is written next to `path` and renamed once complete, so `path`
/// only ever holds a whole table.
pub fn write_csv(
    path: &Path,
    outputs: &SlideOutputs,
    class_names: &[String],
) -> Result<(), OutputError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = partial_path(path);
    let result = File::create(&partial).and_then(|file| {
        let mut writer = BufWriter::new(file);
        write_table(&mut writer, outputs, class_names)?;
        writer.into_inner().map_err(|err| err.into_error())?.sync_all()
    });
    if let Err(err) = result.and_then(|_| fs::rename(&partial, path)) {
        _ = fs::remove_file(&partial);
        return Err(err.into());
    }
    Ok(())
}

/// A row of a model output table.
#[derive(Clone, Debug, PartialEq)]
pub struct TableRow {
    pub slide: String,
    pub minx: u32,
    pub miny: u32,
    pub width: u32,
    pub height: u32,
    pub probs: Vec<f64>,
}

impl TableRow {
    pub fn maxx(&self) -> u64 {
        self.minx as u64 + self.width as u64
    }

    pub fn maxy(&self) -> u64 {
        self.miny as u64 + self.height as u64
    }
}

/// Contents of a model output CSV.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelOutputTable {
    /// Names of the probability columns, including the `prob_` prefix.
    pub prob_columns: Vec<String>,
    pub rows: Vec<TableRow>,
}

/// Read a CSV written by [`write_csv`].
pub fn read_csv(path: &Path) -> Result<ModelOutputTable, OutputError> {
    let text = fs::read_to_string(path)?;
    let malformed = |line: usize, message: String| OutputError::Malformed {
        path: path.to_path_buf(),
        line,
        message,
    };

    let mut records = records(&text).into_iter();
    let (_, header) = records
        .next()
        .ok_or_else(|| malformed(1, "missing header".into()))?;
    let header = split_fields(&header).ok_or_else(|| malformed(1, "unterminated quote".into()))?;
    if header.len() < COORD_COLUMNS.len() || header[..COORD_COLUMNS.len()] != COORD_COLUMNS {
        return Err(malformed(
            1,
            format!("expected header to start with {}", COORD_COLUMNS.join(",")),
        ));
    }
    let prob_columns = header[COORD_COLUMNS.len()..].to_vec();

    let mut rows = Vec::new();
    for (line, record) in records {
        if record.is_empty() {
            continue;
        }
        let fields =
            split_fields(&record).ok_or_else(|| malformed(line, "unterminated quote".into()))?;
        if fields.len() != header.len() {
            return Err(malformed(
                line,
                format!("expected {} fields but found {}", header.len(), fields.len()),
            ));
        }
        let coord = |i: usize| {
            fields[i].trim().parse::<u32>().map_err(|e| {
                malformed(line, format!("invalid {} \"{}\": {}", header[i], fields[i], e))
            })
        };
        let probs = fields[COORD_COLUMNS.len()..]
            .iter()
            .map(|f| {
                f.trim()
                    .parse::<f64>()
                    .map_err(|e| malformed(line, format!("invalid probability \"{}\": {}", f, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        rows.push(TableRow {
            slide: fields[0].clone(),
            minx: coord(1)?,
            miny: coord(2)?,
            width: coord(3)?,
            height: coord(4)?,
            probs,
        });
    }

    Ok(ModelOutputTable { prob_columns, rows })
}

/// List the CSV files in `dir`, sorted by name.
pub fn list_csv_files(dir: &Path) -> Result<Vec<PathBuf>, OutputError> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "csv") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use wsinfer_testing::TestCases;

    use super::{
        escape_field, list_csv_files, partial_path, read_csv, write_csv, write_table,
        OutputError, OutputRow, SlideOutputs, TableRow,
    };

    fn class_names() -> Vec<String> {
        vec!["notumor".into(), "tumor".into()]
    }

    #[test]
    fn test_escape_field() {
        #[derive(Debug)]
        struct Case {
            field: &'static str,
            expected: &'static str,
        }

        let cases = [
            Case {
                field: "slides/a.svs",
                expected: "slides/a.svs",
            },
            Case {
                field: "a,b.svs",
                expected: "\"a,b.svs\"",
            },
            Case {
                field: "say \"hi\".tif",
                expected: "\"say \"\"hi\"\".tif\"",
            },
        ];

        cases.test_each(|case| assert_eq!(escape_field(case.field), case.expected))
    }

    #[test]
    fn test_write_and_read_csv() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("model-outputs/slide.csv");
        let outputs = SlideOutputs {
            slide: PathBuf::from("slides/my,slide.svs"),
            rows: vec![
                OutputRow {
                    minx: 0,
                    miny: 0,
                    width: 350,
                    height: 350,
                    probs: vec![0.1, 0.9],
                },
                OutputRow {
                    minx: 0,
                    miny: 350,
                    width: 350,
                    height: 350,
                    probs: vec![0.123456789, 0.876543211],
                },
            ],
        };
        write_csv(&path, &outputs, &class_names()).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("slide,minx,miny,width,height,prob_notumor,prob_tumor")
        );
        assert_eq!(lines.next(), Some("\"slides/my,slide.svs\",0,0,350,350,0.1,0.9"));

        let table = read_csv(&path).unwrap();
        assert_eq!(table.prob_columns, ["prob_notumor", "prob_tumor"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(
            table.rows[0],
            TableRow {
                slide: "slides/my,slide.svs".into(),
                minx: 0,
                miny: 0,
                width: 350,
                height: 350,
                probs: vec![0.1, 0.9],
            }
        );
        assert_eq!(table.rows[1].maxy(), 700);
        assert_eq!(table.rows[1].probs[0] as f32, 0.123456789f32);
    }

    #[test]
    fn test_write_empty_csv() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.csv");
        let outputs = SlideOutputs {
            slide: PathBuf::from("empty.svs"),
            rows: Vec::new(),
        };
        write_csv(&path, &outputs, &class_names()).unwrap();

        let table = read_csv(&path).unwrap();
        assert_eq!(table.prob_columns.len(), 2);
        assert!(table.rows.is_empty());
    }

    /// Writer which fails after accepting `limit` bytes.
    struct FailingWriter {
        written: Vec<u8>,
        limit: usize,
    }

    impl std::io::Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.written.len() + buf.len() > self.limit {
                return Err(std::io::Error::other("disk full"));
            }
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_table_error() {
        let outputs = SlideOutputs {
            slide: PathBuf::from("slide.svs"),
            rows: vec![
                OutputRow {
                    minx: 0,
                    miny: 0,
                    width: 10,
                    height: 10,
                    probs: vec![0.5, 0.5],
                };
                100
            ],
        };
        let mut writer = FailingWriter {
            written: Vec::new(),
            limit: 200,
        };
        assert!(write_table(&mut writer, &outputs, &class_names()).is_err());
    }

    #[test]
    fn test_write_csv_failure_leaves_no_table() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("model-outputs");
        let path = dir.join("slide.csv");
        let outputs = SlideOutputs {
            slide: PathBuf::from("slide.svs"),
            rows: Vec::new(),
        };

        // A directory in the way of the partial file makes the write fail.
        std::fs::create_dir_all(partial_path(&path)).unwrap();
        assert!(matches!(
            write_csv(&path, &outputs, &class_names()),
            Err(OutputError::Io(_))
        ));
        assert!(!path.exists());
        std::fs::remove_dir(partial_path(&path)).unwrap();

        write_csv(&path, &outputs, &class_names()).unwrap();
        assert!(!partial_path(&path).exists());
        assert_eq!(list_csv_files(&dir).unwrap(), [path]);
    }

    #[test]
    fn test_read_malformed_csv() {
        #[derive(Debug)]
        struct Case {
            text: &'static str,
            line: usize,
        }

        let header = "slide,minx,miny,width,height,prob_tumor\n";
        let cases = [
            Case {
                text: "a,b,c\n",
                line: 1,
            },
            Case {
                text: "a.svs,0,0,10,10,0.5\na.svs,0,10,10\n",
                line: 3,
            },
            Case {
                text: "a.svs,0,0,10,ten,0.5\n",
                line: 2,
            },
            Case {
                text: "a.svs,0,0,10,10,high\n",
                line: 2,
            },
        ];

        cases.test_each(|case| {
            let tmp = tempfile::tempdir().unwrap();
            let path = tmp.path().join("bad.csv");
            let text = if case.line == 1 {
                case.text.to_string()
            } else {
                format!("{}{}", header, case.text)
            };
            std::fs::write(&path, text).unwrap();

            match read_csv(&path) {
                Err(OutputError::Malformed { line, .. }) => assert_eq!(line, case.line),
                other => panic!("expected malformed error, got {:?}", other),
            }
        })
    }
}
