//! `scenegate send` command.

use std::fs;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, ValueEnum};
use scenegate_bridge::{BridgeConfig, StatusSnapshot};
use scenegate_kernel::WireCommand;
use serde_json::Value;

use crate::opts::ProjectOpts;
use crate::output::print_json;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Via {
    Mailbox,
    Http,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Action path, e.g. `object/rename`
    pub action: String,

    /// Argument as KEY=VALUE; `KEY=@file` reads the value from a file
    #[arg(short = 'a', long = "arg", value_parser = parse_key_value)]
    pub args: Vec<(String, String)>,

    /// Declared capability (`read`, or a mutating tag)
    #[arg(short = 'c', long)]
    pub capability: Option<String>,

    /// Intake channel
    #[arg(long, value_enum, default_value_t = Via::Mailbox)]
    pub via: Via,

    /// How long to wait for the response, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub timeout_ms: u64,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

pub async fn cmd_send(opts: &ProjectOpts, args: &SendArgs) -> Result<()> {
    let config = opts.bridge_config()?;
    let pairs = resolve_values(&args.args)?;
    let timeout = Duration::from_millis(args.timeout_ms);
    let body = match args.via {
        Via::Mailbox => send_mailbox(&config, args, pairs, timeout).await?,
        Via::Http => send_http(&config, args, pairs, timeout).await?,
    };
    print_json(opts, &body)?;
    if let Some(error) = body.get("error") {
        let code = body.get("code").and_then(Value::as_str).unwrap_or("ERROR");
        bail!("{code}: {}", error.as_str().unwrap_or_default());
    }
    Ok(())
}

fn resolve_values(args: &[(String, String)]) -> Result<Vec<(String, String)>> {
    args.iter()
        .map(|(key, value)| match value.strip_prefix('@') {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("read value of '{key}' from {path}"))?;
                Ok((key.clone(), text))
            }
            None => Ok((key.clone(), value.clone())),
        })
        .collect()
}

async fn send_mailbox(
    config: &BridgeConfig,
    args: &SendArgs,
    pairs: Vec<(String, String)>,
    timeout: Duration,
) -> Result<Value> {
    let name = format!("cli_{}.json", uuid::Uuid::new_v4().simple());
    let (keys, values) = pairs.into_iter().unzip();
    let wire = WireCommand {
        action: args.action.clone(),
        id: None,
        capability: args.capability.clone(),
        keys: Some(keys),
        values: Some(values),
    };

    fs::create_dir_all(&config.inbox)
        .with_context(|| format!("create {}", config.inbox.display()))?;
    let request = config.inbox.join(&name);
    // The bridge only picks up `.json` files, so stage under another name.
    let staged = request.with_extension("json.part");
    fs::write(&staged, serde_json::to_vec(&wire)?)
        .with_context(|| format!("write {}", staged.display()))?;
    fs::rename(&staged, &request).with_context(|| format!("publish {}", request.display()))?;
    tracing::debug!(file = %request.display(), "request queued");

    let response = config.outbox.join(format!("res_{name}"));
    match wait_for_file(&response, timeout).await? {
        Some(text) => {
            let _ = fs::remove_file(&response);
            serde_json::from_str(&text)
                .with_context(|| format!("parse response {}", response.display()))
        }
        None => {
            let withdrawn = fs::remove_file(&request).is_ok();
            bail!(
                "no response after {}ms{}; is `scenegate run` active under {}?",
                timeout.as_millis(),
                if withdrawn { " (request withdrawn)" } else { "" },
                config.root.display()
            )
        }
    }
}

async fn wait_for_file(path: &Path, timeout: Duration) -> Result<Option<String>> {
    let deadline = Instant::now() + timeout;
    loop {
        match fs::read_to_string(path) {
            Ok(text) => return Ok(Some(text)),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn send_http(
    config: &BridgeConfig,
    args: &SendArgs,
    pairs: Vec<(String, String)>,
    timeout: Duration,
) -> Result<Value> {
    let status = read_status(&config.status_path)?;
    let nonce = status
        .nonce
        .ok_or_else(|| anyhow!("bridge is {}; no session token published", status.state))?;

    let mut addr = config.http.bind;
    if addr.ip().is_unspecified() {
        addr = SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()));
    }
    let url = format!("http://{addr}/{}", args.action.trim_start_matches('/'));

    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let mut request = client
        .get(&url)
        .query(&pairs)
        .header(config.http.token_header.as_str(), nonce);
    if let Some(capability) = &args.capability {
        request = request.header(config.http.capability_header.as_str(), capability);
    }
    let response = request.send().await.with_context(|| format!("GET {url}"))?;
    let code = response.status();
    let body: Value = response.json().await.with_context(|| format!("decode response from {url}"))?;
    if !code.is_success() && body.get("error").is_none() {
        bail!("HTTP {code} from {url}");
    }
    Ok(body)
}

pub fn read_status(path: &Path) -> Result<StatusSnapshot> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            bail!("no status file at {}; has the bridge been started?", path.display())
        }
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))
}
