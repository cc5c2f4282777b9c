//! `usbwatch config`

use anyhow::bail;
use std::path::Path;

use super::CommandResult;
use crate::config::AppConfig;

pub fn run(path: &Path, config: &AppConfig, init: bool, force: bool) -> CommandResult {
    if init {
        if path.exists() && !force {
            bail!(
                "{} already exists (use --force to overwrite)",
                path.display()
            );
        }
        AppConfig::default().save(path)?;
        println!("Wrote default config to {}", path.display());
        return Ok(());
    }

    let source = if path.exists() {
        "loaded"
    } else {
        "not found, using defaults"
    };
    println!("# {} ({})", path.display(), source);
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        run(&path, &AppConfig::default(), true, false).unwrap();
        assert!(path.exists());
        assert!(run(&path, &AppConfig::default(), true, false).is_err());
        run(&path, &AppConfig::default(), true, true).unwrap();
    }
}
