//! `rowsync init [--source PATH] [--key COLUMN] [--force]`

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use rowsync_core::{config, paths, SyncConfig};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Source JSON export. Relative paths resolve under ~/.rowsync/.
    #[arg(long, value_name = "PATH")]
    pub source: Option<PathBuf>,

    /// Column that identifies a row.
    #[arg(long, value_name = "COLUMN")]
    pub key: Option<String>,

    /// Overwrite an existing config.yaml.
    #[arg(long)]
    pub force: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let config_path = paths::config_path(&home);
        if config_path.exists() && !self.force {
            bail!(
                "{} already exists; pass --force to overwrite",
                config_path.display()
            );
        }

        let mut config = SyncConfig::default();
        if let Some(source) = self.source {
            config.source_path = source;
        }
        if let Some(key) = self.key {
            config.key_column = key;
        }

        let saved = config::save_at(&home, &config).context("failed to write config")?;
        println!("✓ Wrote {}", saved.display());
        println!("  source: {}", config.source_path_at(&home).display());
        println!("  key column: {}", config.key_column);
        println!("  store: {}", config.store_path_at(&home).display());
        Ok(())
    }
}
