//! Writing analysis products to their destination files.

use std::{io::Write, path::Path};

use flate2::{write::GzEncoder, Compression};
use log::debug;

use crate::{
    analysis::Product,
    cache::{remove_if_exists, write_atomic},
    collection::DatasetRole,
    error::Result,
    parquet::save_field,
    reading::{encode_field, Format},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpOutcome {
    Written,
    /// The destination already existed and cleaning is off.
    Kept,
    /// Every value is undefined, nothing was written.
    Empty,
}

/// Writes `product` to `path` in the role's format.
///
/// With `cleaning` an existing file is deleted first, without it an
/// existing file is left as is. The file appears atomically.
pub fn dump_product(
    product: &Product,
    role: &DatasetRole,
    entity: &str,
    path: &Path,
    cleaning: bool,
) -> Result<DumpOutcome> {
    if cleaning {
        if remove_if_exists(path)? {
            debug!("removed previous {}", path.display());
        }
    } else if path.exists() {
        return Ok(DumpOutcome::Kept);
    }

    if product.field.is_all_nan() {
        return Ok(DumpOutcome::Empty);
    }

    match role.format {
        Format::Parquet => write_atomic(path, |file| {
            save_field(&product.field, entity, &product.attrs, role.compression, file)
        })?,
        format => {
            let text = encode_field(&product.field, format, &product.attrs, path)?;
            write_atomic(path, |file| {
                if role.compression {
                    let mut encoder = GzEncoder::new(file, Compression::default());
                    encoder.write_all(text.as_bytes())?;
                    encoder.finish()?;
                } else {
                    file.write_all(text.as_bytes())?;
                }
                Ok(())
            })?
        }
    }

    Ok(DumpOutcome::Written)
}

// -- Tests -------------------------------------------------------------------
