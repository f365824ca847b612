//! `scenegate audit verify` command.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;
use scenegate_kernel::audit::fs::read_log;
use scenegate_kernel::{KernelConfig, verify_chain};
use serde_json::json;

use crate::opts::ProjectOpts;
use crate::output::print_json;

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Audit log to check (default: <root>/logs/audit.jsonl)
    #[arg(long)]
    pub log: Option<PathBuf>,
}

pub fn cmd_verify(opts: &ProjectOpts, args: &VerifyArgs) -> Result<()> {
    let path = match &args.log {
        Some(path) => path.clone(),
        None => KernelConfig::rooted(opts.root()?)
            .audit_log_path
            .context("no audit log configured")?,
    };
    let entries = read_log(&path).with_context(|| format!("read {}", path.display()))?;
    match verify_chain(&entries) {
        Ok(count) => print_json(
            opts,
            &json!({ "valid": true, "entries": count, "log": path.display().to_string() }),
        ),
        Err(brk) => {
            print_json(
                opts,
                &json!({
                    "valid": false,
                    "entries": entries.len(),
                    "index": brk.index,
                    "kind": brk.kind,
                    "log": path.display().to_string(),
                }),
            )?;
            bail!("audit chain broken at entry {} ({:?})", brk.index, brk.kind)
        }
    }
}
