use anyhow::Result;
use serde_json::Value;

use crate::opts::ProjectOpts;

pub fn print_json(opts: &ProjectOpts, value: &Value) -> Result<()> {
    if opts.pretty {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}
