//! Global CLI options.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use scenegate_bridge::BridgeConfig;

#[derive(Args, Debug, Clone)]
pub struct ProjectOpts {
    /// Project root holding `airlock/`, `metadata/` and `logs/` (env: SCENEGATE_ROOT, default: cwd)
    #[arg(short = 'r', long, global = true, env = "SCENEGATE_ROOT")]
    pub root: Option<PathBuf>,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pub pretty: bool,
}

impl ProjectOpts {
    pub fn root(&self) -> Result<PathBuf> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => std::env::current_dir().context("resolve current directory"),
        }
    }

    /// Bridge configuration for the project: defaults, settings file, then
    /// environment.
    pub fn bridge_config(&self) -> Result<BridgeConfig> {
        let root = self.root()?;
        BridgeConfig::load(&root).with_context(|| format!("load config under {}", root.display()))
    }
}
