//! Storage format of a dataset role.

use std::{fmt, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{HatError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
/// Formats the driver reads and writes. NetCDF, GeoTIFF and raw binary
/// grids are recognized names but are not handled by this tool.
pub enum Format {
    AsciiGrid,
    Csv,
    Json,
    Parquet,
}

impl Format {
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "ascii" | "asc" | "ascii_grid" => Ok(Format::AsciiGrid),
            "csv" => Ok(Format::Csv),
            "json" => Ok(Format::Json),
            "parquet" => Ok(Format::Parquet),
            unsupported @ ("netcdf" | "nc" | "tiff" | "geotiff" | "tif" | "binary") => {
                Err(HatError::config(format!(
                    "storage format `{}` is not supported",
                    unsupported
                )))
            }
            other => Err(HatError::config(format!("unknown storage format `{}`", other))),
        }
    }

    /// Infers the format from the file name, ignoring a trailing `.gz`.
    pub fn from_file(path: &Path) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let parts: Vec<&str> = file_name.split('.').collect();

        let extension = match parts.as_slice() {
            [.., ext, "gz"] if parts.len() > 2 => *ext,
            [_, .., ext] => *ext,
            _ => return None,
        };

        Format::from_name(extension).ok()
    }

    pub fn is_readable(&self) -> bool {
        !matches!(self, Format::Parquet)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Format::AsciiGrid => "ascii",
            Format::Csv => "csv",
            Format::Json => "json",
            Format::Parquet => "parquet",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl TryFrom<String> for Format {
    type Error = HatError;

    fn try_from(name: String) -> Result<Self> {
        Format::from_name(&name)
    }
}

impl From<Format> for String {
    fn from(format: Format) -> Self {
        format.name().to_string()
    }
}
