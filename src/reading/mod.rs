pub mod ascii_grid;
pub mod csv_table;
pub mod format;

use std::{
    collections::BTreeMap,
    fs::File,
    io::Read,
    path::Path,
};

use chrono::NaiveDateTime;
use flate2::read::GzDecoder;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{HatError, Result};

pub use ascii_grid::AsciiGrid;
pub use csv_table::CsvTable;
pub use format::Format;

/// Encodes and decodes a [`Field`] to and from the text of a file.
pub trait TextCodec {
    fn decode(text: &str, variable: Option<&str>, origin: &Path) -> Result<Field>;
    fn encode(field: &Field, origin: &Path) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Georeference of an ESRI ascii grid.
pub struct GridHeader {
    pub ncols: usize,
    pub nrows: usize,
    pub xllcorner: f64,
    pub yllcorner: f64,
    pub cellsize: f64,
    pub nodata_value: f64,
}

/// A 2-D block of values: a raster, a table of section values or a time
/// series (one row per time step).
#[derive(Debug, Clone)]
pub struct Field {
    pub header: Option<GridHeader>,
    pub values: Array2<f64>,
    pub times: Vec<NaiveDateTime>,
    pub columns: Vec<String>,
}

impl Field {
    pub fn new(values: Array2<f64>) -> Self {
        Field {
            header: None,
            values,
            times: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn with_header(mut self, header: Option<GridHeader>) -> Self {
        self.header = header;
        self
    }

    pub fn with_times(mut self, times: Vec<NaiveDateTime>) -> Self {
        self.times = times;
        self
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }

    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn is_all_nan(&self) -> bool {
        self.values.iter().all(|v| v.is_nan())
    }

    pub fn scaled(mut self, factor: f64) -> Self {
        if factor != 1.0 {
            self.values.mapv_inplace(|v| v * factor);
        }
        self
    }

    pub fn to_record(&self, attrs: BTreeMap<String, String>) -> FieldRecord {
        let (rows, cols) = self.shape();
        FieldRecord {
            header: self.header.clone(),
            shape: [rows, cols],
            values: self
                .values
                .iter()
                .map(|v| if v.is_nan() { None } else { Some(*v) })
                .collect(),
            times: self.times.clone(),
            columns: self.columns.clone(),
            attrs,
        }
    }
}

/// Serialized form of a field: header, values and attributes. Undefined
/// values are stored as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRecord {
    pub header: Option<GridHeader>,
    pub shape: [usize; 2],
    pub values: Vec<Option<f64>>,
    #[serde(default)]
    pub times: Vec<NaiveDateTime>,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

impl FieldRecord {
    pub fn into_field(self, origin: &Path) -> Result<(Field, BTreeMap<String, String>)> {
        let values: Vec<f64> = self
            .values
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect();
        let values = Array2::from_shape_vec((self.shape[0], self.shape[1]), values)
            .map_err(|e| HatError::format(origin, e.to_string()))?;

        let field = Field {
            header: self.header,
            values,
            times: self.times,
            columns: self.columns,
        };

        Ok((field, self.attrs))
    }
}

pub struct JsonRecord;

impl TextCodec for JsonRecord {
    fn decode(text: &str, _variable: Option<&str>, origin: &Path) -> Result<Field> {
        let record: FieldRecord =
            serde_json::from_str(text).map_err(|e| HatError::format(origin, e.to_string()))?;
        Ok(record.into_field(origin)?.0)
    }

    fn encode(field: &Field, _origin: &Path) -> Result<String> {
        Ok(serde_json::to_string(&field.to_record(BTreeMap::new()))?)
    }
}

/// Reads the whole file as text, gunzipping when asked or when it ends in `.gz`.
pub fn read_text(path: &Path, compressed: bool) -> Result<String> {
    if !path.is_file() {
        return Err(HatError::DataUnavailable(path.to_path_buf()));
    }
    let file = File::open(path)?;

    let gzipped = compressed || path.extension().map_or(false, |ext| ext == "gz");
    let mut text = String::new();
    if gzipped {
        GzDecoder::new(file)
            .read_to_string(&mut text)
            .map_err(|e| HatError::format(path, format!("can't decompress: {}", e)))?;
    } else {
        let mut file = file;
        file.read_to_string(&mut text)
            .map_err(|e| HatError::format(path, e.to_string()))?;
    }

    Ok(text)
}

/// Reads one dataset file into a field.
pub fn read_field(
    path: &Path,
    format: Format,
    compressed: bool,
    variable: Option<&str>,
) -> Result<Field> {
    let decode: fn(&str, Option<&str>, &Path) -> Result<Field> = match format {
        Format::AsciiGrid => AsciiGrid::decode,
        Format::Csv => CsvTable::decode,
        Format::Json => JsonRecord::decode,
        Format::Parquet => {
            return Err(HatError::config(format!(
                "{} files can't be used as input ({})",
                format,
                path.display()
            )))
        }
    };
    let text = read_text(path, compressed)?;

    decode(&text, variable, path)
}

/// Renders a field in a text format. Only json keeps `attrs`.
pub fn encode_field(
    field: &Field,
    format: Format,
    attrs: &BTreeMap<String, String>,
    origin: &Path,
) -> Result<String> {
    match format {
        Format::AsciiGrid => AsciiGrid::encode(field, origin),
        Format::Csv => CsvTable::encode(field, origin),
        Format::Json => Ok(serde_json::to_string(&field.to_record(attrs.clone()))?),
        Format::Parquet => Err(HatError::config("parquet is not a text format")),
    }
}

// -- Tests -------------------------------------------------------------------
