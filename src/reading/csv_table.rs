//! Delimited tables: one column per variable, optional `time` column.

use std::path::Path;

use chrono::NaiveDateTime;
use ndarray::Array2;

use super::{Field, TextCodec};
use crate::error::{HatError, Result};

const TIME_COLUMN: &str = "time";
const TIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y%m%d%H%M"];
const TIME_OUTPUT_FORMAT: &str = "%Y-%m-%d %H:%M";

pub struct CsvTable;

impl TextCodec for CsvTable {
    fn decode(text: &str, variable: Option<&str>, origin: &Path) -> Result<Field> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());
        let malformed = |e: csv::Error| HatError::format(origin, e.to_string());
        let headers = reader.headers().map_err(malformed)?.clone();

        let idx_time = headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(TIME_COLUMN));
        let selected: Vec<usize> = match variable {
            Some(name) => vec![headers.iter().position(|h| h == name).ok_or_else(|| {
                HatError::format(origin, format!("no column `{}`", name))
            })?],
            None => (0..headers.len()).filter(|i| Some(*i) != idx_time).collect(),
        };
        if selected.is_empty() {
            return Err(HatError::format(origin, "table has no value columns"));
        }

        let mut values = Vec::new();
        let mut times = Vec::new();
        let mut rows = 0;
        for record in reader.records() {
            let record = record.map_err(malformed)?;
            if let Some(idx) = idx_time {
                let cell = record.get(idx).unwrap_or_default();
                times.push(parse_time(cell).ok_or_else(|| {
                    HatError::format(origin, format!("`{}` is not a time", cell))
                })?);
            }
            for idx in &selected {
                let cell = record.get(*idx).unwrap_or_default();
                values.push(cell.parse::<f64>().unwrap_or(f64::NAN));
            }
            rows += 1;
        }

        let values = Array2::from_shape_vec((rows, selected.len()), values)
            .map_err(|e| HatError::format(origin, e.to_string()))?;
        let columns = selected.iter().map(|i| headers[*i].to_string()).collect();

        Ok(Field::new(values).with_times(times).with_columns(columns))
    }

    fn encode(field: &Field, origin: &Path) -> Result<String> {
        let (rows, cols) = field.shape();
        let with_times = !field.times.is_empty();
        if with_times && field.times.len() != rows {
            return Err(HatError::format(
                origin,
                format!("{} time labels for {} rows", field.times.len(), rows),
            ));
        }

        let mut writer = csv::Writer::from_writer(Vec::new());

        let mut header: Vec<String> = Vec::with_capacity(cols + 1);
        if with_times {
            header.push(TIME_COLUMN.to_string());
        }
        if field.columns.len() == cols {
            header.extend(field.columns.iter().cloned());
        } else {
            header.extend((0..cols).map(|i| format!("value_{}", i)));
        }
        writer.write_record(&header)?;

        for (idx, row) in field.values.rows().into_iter().enumerate() {
            let mut record: Vec<String> = Vec::with_capacity(cols + 1);
            if with_times {
                record.push(field.times[idx].format(TIME_OUTPUT_FORMAT).to_string());
            }
            record.extend(row.iter().map(|v| {
                if v.is_nan() {
                    String::new()
                } else {
                    v.to_string()
                }
            }));
            writer.write_record(&record)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| HatError::format(origin, e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| HatError::format(origin, e.to_string()))
    }
}

fn parse_time(s: &str) -> Option<NaiveDateTime> {
    TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
}

// -- Tests -------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = "time,discharge,level
2024-10-01 10:00,12.5,1.2
2024-10-01 11:00,,1.3
2024-10-01 12:00,14.0,n/a
";

    #[test]
    fn should_decode_all_columns() {
        let field = CsvTable::decode(TABLE, None, Path::new("q.csv")).unwrap();

        assert_eq!(field.shape(), (3, 2));
        assert_eq!(field.columns, vec!["discharge", "level"]);
        assert_eq!(field.times.len(), 3);
        assert!(field.values[[1, 0]].is_nan());
        assert!(field.values[[2, 1]].is_nan());
    }

    #[test]
    fn should_select_variable() {
        let field = CsvTable::decode(TABLE, Some("level"), Path::new("q.csv")).unwrap();

        assert_eq!(field.shape(), (3, 1));
        assert_eq!(field.values[[0, 0]], 1.2);
    }

    #[test]
    fn should_fail_on_missing_variable() {
        let err = CsvTable::decode(TABLE, Some("rain"), Path::new("q.csv")).unwrap_err();
        assert!(matches!(err, HatError::Format { .. }));
    }

    #[test]
    fn should_fail_on_ragged_rows() {
        let err = CsvTable::decode("a,b\n1,2\n3\n", None, Path::new("q.csv")).unwrap_err();

        assert!(matches!(err, HatError::Format { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn should_encode_times_and_blank_nan() {
        let field = CsvTable::decode(TABLE, Some("discharge"), Path::new("q.csv")).unwrap();
        let text = CsvTable::encode(&field, Path::new("out.csv")).unwrap();

        assert_eq!(
            text,
            "time,discharge\n2024-10-01 10:00,12.5\n2024-10-01 11:00,\n2024-10-01 12:00,14\n"
        );
    }
}
