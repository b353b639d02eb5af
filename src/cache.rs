//! Ancillary (intermediate) files.
//!
//! The existence of an ancillary file is the only cache-hit signal. Files are
//! written through a temporary file in the target directory and renamed into
//! place, so a crash never leaves a partial file behind. There is no locking:
//! two processes working on the same tree may both compute and the last
//! rename wins.

use std::{
    fs::{self, File},
    io::{BufReader, BufWriter, ErrorKind, Write},
    path::Path,
};

use log::{debug, warn};
use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;

use crate::{
    error::{HatError, Result},
    reading::FieldRecord,
};

/// Header, values and attributes of one (entity, time step).
pub type AncillaryEntry = FieldRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Loaded,
    Computed,
}

/// Reads a serialized object, `None` if the file does not exist.
pub fn read_obj<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_reader(BufReader::new(file))
        .map(Some)
        .map_err(|e| HatError::CacheCorruption {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Serializes `obj` to `path`, replacing any existing file.
pub fn write_obj<T: Serialize>(path: &Path, obj: &T) -> Result<()> {
    write_atomic(path, |file| {
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, obj)?;
        writer.flush()?;
        Ok(())
    })
}

/// Writes through a temporary sibling file that is renamed over `path`.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    write(tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| HatError::Io(e.error))?;

    Ok(())
}

/// Removes `path`, returns whether there was something to remove.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Loads the object cached at `path` or computes and persists it.
///
/// `force` drops the cached file first. A file that can't be deserialized is
/// treated as a miss and rebuilt. When `compute` fails nothing is written.
pub fn get_or_compute<T, F>(path: &Path, force: bool, compute: F) -> Result<(T, CacheOutcome)>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Result<T>,
{
    if force && remove_if_exists(path)? {
        debug!("removed cached {}", path.display());
    }

    match read_obj(path) {
        Ok(Some(obj)) => return Ok((obj, CacheOutcome::Loaded)),
        Ok(None) => {}
        Err(HatError::CacheCorruption { path, reason }) => {
            warn!("ignoring corrupt cache {}: {}", path.display(), reason);
            remove_if_exists(&path)?;
        }
        Err(e) => return Err(e),
    }

    let obj = compute()?;
    write_obj(path, &obj)?;

    Ok((obj, CacheOutcome::Computed))
}

// -- Tests -------------------------------------------------------------------
