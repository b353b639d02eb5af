use anyhow::Result;

use super::make_driver;
use crate::cli::{create_spinner, RunArgs};

/// Deletes the ancillary and destination files of the reference time.
pub fn clean(args: &RunArgs) -> Result<usize> {
    let driver = make_driver(args)?;

    let bar = create_spinner("Removing files...".to_string());
    let removed = driver.clean()?;
    bar.finish_with_message(format!("{} files removed", removed));

    Ok(removed)
}
