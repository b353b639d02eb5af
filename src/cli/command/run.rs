//! Full run: organize, analyze and dump every domain.

use anyhow::{bail, Result};

use super::make_driver;
use crate::{
    cli::{create_progress_bar, RunArgs},
    report::{Outcome, RunReport},
};

pub fn run(args: &RunArgs) -> Result<RunReport> {
    let driver = make_driver(args)?;
    let mut report = RunReport::new();

    let bar = create_progress_bar(driver.domains().len() as u64, "Processing domains".to_string());
    if let Err(e) = driver.run(&mut report, &bar) {
        bar.abandon_with_message("Run stopped");
        return Err(e.into());
    }

    if report.count(Outcome::Failed) > 0 {
        bail!("run finished with failures: {}", report.summary());
    }

    Ok(report)
}
