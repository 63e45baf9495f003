use super::ui;
use crate::core::config::AppConfig;
use anyhow::{Context, Result};
use std::path::Path;

const EXAMPLE_CONFIG: &str = include_str!("../../docs/example_config.yaml");

/// Writes the example configuration to the default location.
pub fn setup(force: bool) -> Result<()> {
    let path = AppConfig::default_config_path()?;
    let config = setup_at_path(&path, force)?;

    println!(
        "{}",
        ui::style_text("Configuration written", ui::StyleType::Title)
    );
    println!("  config: {}", path.display());
    println!("  cache:  {}", config.default_data_path()?.display());
    println!(
        "  {} owner(s), {} position(s) tracked",
        config.owners.len(),
        config.owners.iter().map(|o| o.positions.len()).sum::<usize>()
    );
    println!(
        "{}",
        ui::style_text(
            "Edit the owners section, then run `marketcache refresh`.",
            ui::StyleType::Subtle
        )
    );
    Ok(())
}

/// Writes the example configuration to `path` and returns it parsed.
/// An existing file is kept unless `force` is set.
pub fn setup_at_path<P: AsRef<Path>>(path: P, force: bool) -> Result<AppConfig> {
    let path = path.as_ref();
    if path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at {} (use --force to replace it)",
            path.display()
        );
    }

    let config: AppConfig =
        serde_yaml::from_str(EXAMPLE_CONFIG).context("Bundled example configuration is invalid")?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    std::fs::write(path, EXAMPLE_CONFIG)
        .with_context(|| format!("Failed to write config file to {}", path.display()))?;

    tracing::info!(path = %path.display(), force, "Wrote example configuration");
    Ok(config)
}
