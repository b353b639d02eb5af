pub mod clean;
pub mod resolve;
pub mod run;

use anyhow::{Context, Result};

pub use clean::clean;
pub use resolve::resolve;
pub use run::run;

use super::RunArgs;
use crate::{driver::DriverDynamic, settings::Settings};

/// Loads the settings and builds the driver for the requested reference time.
pub fn make_driver(args: &RunArgs) -> Result<DriverDynamic> {
    let settings = Settings::from_file(&args.settings_file)
        .with_context(|| format!("loading {}", args.settings_file.display()))?;
    let reference = settings.reference_time(args.time.as_deref())?;

    Ok(DriverDynamic::new(settings, reference)?)
}
