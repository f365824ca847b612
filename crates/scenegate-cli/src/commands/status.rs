//! `scenegate status` command.

use std::fs;
use std::io::ErrorKind;

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::commands::send::read_status;
use crate::opts::ProjectOpts;
use crate::output::print_json;

pub fn cmd_status(opts: &ProjectOpts) -> Result<()> {
    let config = opts.bridge_config()?;
    let status = read_status(&config.status_path)?;
    let health = match fs::read_to_string(&config.health_path) {
        Ok(text) => serde_json::from_str::<Value>(&text)
            .with_context(|| format!("parse {}", config.health_path.display()))?,
        Err(err) if err.kind() == ErrorKind::NotFound => Value::Null,
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", config.health_path.display()));
        }
    };
    print_json(opts, &json!({ "status": status, "health": health }))
}
