//! Dry run: prints every resolved path, whether the file exists and the tag
//! values its file name carries.

use anyhow::{anyhow, Result};

use super::make_driver;
use crate::cli::RunArgs;

pub fn resolve(args: &RunArgs, role: Option<&str>) -> Result<usize> {
    let driver = make_driver(args)?;
    let mut printed = 0;

    if let Some(role) = role {
        let pattern = driver
            .pattern(role)
            .map_err(|_| anyhow!("no role `{}` (roles are `group/name`)", role))?;
        println!("{}: {}", role, pattern);
    }

    for domain in driver.domains() {
        let (_, collection) = driver.resolve(domain)?;

        for (key, time, entity, path) in collection.iter() {
            if role.map_or(false, |r| r != key) {
                continue;
            }
            let mark = if path.exists() { "+" } else { "-" };
            let tags = driver
                .filename_tags(key, path)
                .map(|tags| {
                    tags.iter()
                        .map(|(tag, value)| format!("{}={}", tag, value))
                        .collect::<Vec<_>>()
                        .join(",")
                })
                .unwrap_or_default();
            println!(
                "{} {} {} {} {} {}",
                mark,
                key,
                time.format("%Y-%m-%d %H:%M"),
                entity,
                path.display(),
                tags
            );
            printed += 1;
        }
    }

    Ok(printed)
}
