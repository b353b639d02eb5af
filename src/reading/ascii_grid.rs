//! ESRI ascii grids.
//!
//! ```text
//! ncols        3
//! nrows        2
//! xllcorner    12.5
//! yllcorner    42.0
//! cellsize     0.005
//! NODATA_value -9999
//! 1 2 3
//! 4 5 -9999
//! ```
//!
//! `xllcenter`/`yllcenter` are accepted and converted to corners.

use std::path::Path;

use ndarray::Array2;

use super::{Field, GridHeader, TextCodec};
use crate::error::{HatError, Result};

const DEFAULT_NODATA: f64 = -9999.0;

pub struct AsciiGrid;

impl TextCodec for AsciiGrid {
    fn decode(text: &str, _variable: Option<&str>, origin: &Path) -> Result<Field> {
        let mut ncols = None;
        let mut nrows = None;
        let mut xll = None;
        let mut yll = None;
        let mut centered = false;
        let mut cellsize = None;
        let mut nodata = DEFAULT_NODATA;

        let mut lines = text.lines().peekable();
        while let Some(&line) = lines.peek() {
            let mut parts = line.split_whitespace();
            let key = match parts.next() {
                Some(key) if key.starts_with(|c: char| c.is_ascii_alphabetic()) => key.to_lowercase(),
                Some(_) => break,
                None => {
                    lines.next();
                    continue;
                }
            };
            let value = parts
                .next()
                .ok_or_else(|| HatError::format(origin, format!("header `{}` has no value", key)))?;

            match key.as_str() {
                "ncols" => ncols = Some(parse_count(value, origin)?),
                "nrows" => nrows = Some(parse_count(value, origin)?),
                "xllcorner" => xll = Some(parse_number(value, origin)?),
                "yllcorner" => yll = Some(parse_number(value, origin)?),
                "xllcenter" => {
                    xll = Some(parse_number(value, origin)?);
                    centered = true;
                }
                "yllcenter" => {
                    yll = Some(parse_number(value, origin)?);
                    centered = true;
                }
                "cellsize" => cellsize = Some(parse_number(value, origin)?),
                "nodata_value" => nodata = parse_number(value, origin)?,
                other => {
                    return Err(HatError::format(
                        origin,
                        format!("unknown header `{}`", other),
                    ))
                }
            }
            lines.next();
        }

        let missing = |name: &str| HatError::format(origin, format!("header `{}` is missing", name));
        let ncols = ncols.ok_or_else(|| missing("ncols"))?;
        let nrows = nrows.ok_or_else(|| missing("nrows"))?;
        let cellsize = cellsize.ok_or_else(|| missing("cellsize"))?;
        let mut xllcorner = xll.ok_or_else(|| missing("xllcorner"))?;
        let mut yllcorner = yll.ok_or_else(|| missing("yllcorner"))?;
        if centered {
            xllcorner -= cellsize / 2.0;
            yllcorner -= cellsize / 2.0;
        }

        let cells = ncols.checked_mul(nrows).ok_or_else(|| {
            HatError::format(origin, format!("{} x {} cells is too large", nrows, ncols))
        })?;

        let mut values = Vec::new();
        for line in lines {
            for token in line.split_whitespace() {
                let value = parse_number(token, origin)?;
                values.push(if value == nodata { f64::NAN } else { value });
            }
        }
        if values.len() != cells {
            return Err(HatError::format(
                origin,
                format!(
                    "expected {} x {} values, found {}",
                    nrows,
                    ncols,
                    values.len()
                ),
            ));
        }

        let values = Array2::from_shape_vec((nrows, ncols), values)
            .map_err(|e| HatError::format(origin, e.to_string()))?;
        let header = GridHeader {
            ncols,
            nrows,
            xllcorner,
            yllcorner,
            cellsize,
            nodata_value: nodata,
        };

        Ok(Field::new(values).with_header(Some(header)))
    }

    fn encode(field: &Field, origin: &Path) -> Result<String> {
        let header = field
            .header
            .as_ref()
            .ok_or_else(|| HatError::format(origin, "an ascii grid needs a grid header"))?;
        let (nrows, ncols) = field.shape();
        if header.nrows != nrows || header.ncols != ncols {
            return Err(HatError::format(
                origin,
                format!(
                    "header is {} x {} but values are {} x {}",
                    header.nrows, header.ncols, nrows, ncols
                ),
            ));
        }

        let mut text = format!(
            "ncols        {}\nnrows        {}\nxllcorner    {}\nyllcorner    {}\ncellsize     {}\nNODATA_value {}\n",
            header.ncols,
            header.nrows,
            header.xllcorner,
            header.yllcorner,
            header.cellsize,
            header.nodata_value
        );

        for row in field.values.rows() {
            let line: Vec<String> = row
                .iter()
                .map(|v| {
                    if v.is_nan() {
                        header.nodata_value.to_string()
                    } else {
                        v.to_string()
                    }
                })
                .collect();
            text.push_str(&line.join(" "));
            text.push('\n');
        }

        Ok(text)
    }
}

fn parse_number(s: &str, origin: &Path) -> Result<f64> {
    s.parse::<f64>()
        .map_err(|_| HatError::format(origin, format!("`{}` is not a number", s)))
}

fn parse_count(s: &str, origin: &Path) -> Result<usize> {
    s.parse::<usize>()
        .map_err(|_| HatError::format(origin, format!("`{}` is not a count", s)))
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const GRID: &str = "ncols 3
nrows 2
xllcorner 12.5
yllcorner 42.0
cellsize 0.5
NODATA_value -9999
1 2 3
4 5 -9999
";

    #[test]
    fn should_decode_grid() {
        let field = AsciiGrid::decode(GRID, None, Path::new("grid.asc")).unwrap();
        let header = field.header.as_ref().unwrap();

        assert_eq!(field.shape(), (2, 3));
        assert_eq!(header.xllcorner, 12.5);
        assert_eq!(header.cellsize, 0.5);
        assert_eq!(field.values[[1, 1]], 5.0);
        assert!(field.values[[1, 2]].is_nan());
    }

    #[test]
    fn should_convert_cell_centers() {
        let grid = GRID
            .replace("xllcorner 12.5", "xllcenter 12.75")
            .replace("yllcorner 42.0", "yllcenter 42.25");
        let field = AsciiGrid::decode(&grid, None, Path::new("grid.asc")).unwrap();
        let header = field.header.unwrap();

        assert_eq!(header.xllcorner, 12.5);
        assert_eq!(header.yllcorner, 42.0);
    }

    #[test]
    fn should_fail_on_wrong_value_count() {
        let grid = GRID.replace("4 5 -9999\n", "4 5\n");
        let err = AsciiGrid::decode(&grid, None, Path::new("grid.asc")).unwrap_err();

        assert!(matches!(err, HatError::Format { .. }));
    }

    #[test]
    fn should_fail_on_oversized_header() {
        let grid = "ncols 10000000000\nnrows 10000000000\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2 3\n";
        let err = AsciiGrid::decode(grid, None, Path::new("grid.asc")).unwrap_err();

        assert!(matches!(err, HatError::Format { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn should_encode_nan_as_nodata() {
        let field = AsciiGrid::decode(GRID, None, Path::new("grid.asc")).unwrap();
        let text = AsciiGrid::encode(&field, Path::new("out.asc")).unwrap();

        assert!(text.starts_with("ncols        3\n"));
        assert!(text.ends_with("1 2 3\n4 5 -9999\n"));
    }

    #[test]
    fn should_refuse_to_encode_without_header() {
        let field = Field::new(Array2::zeros((2, 2)));
        assert!(AsciiGrid::encode(&field, Path::new("out.asc")).is_err());
    }
}
