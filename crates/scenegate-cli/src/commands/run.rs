//! `scenegate run` command.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use scenegate_bridge::Bridge;
use scenegate_kernel::sim::{SimScene, demo_handlers};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

use crate::opts::ProjectOpts;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Interval between bridge ticks, in milliseconds
    #[arg(long, default_value_t = 16)]
    pub tick_ms: u64,

    /// Serve the mailbox only
    #[arg(long)]
    pub no_http: bool,

    /// Override the HTTP bind address
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Exit after this many ticks
    #[arg(long, hide = true)]
    pub max_ticks: Option<u64>,
}

pub async fn cmd_run(opts: &ProjectOpts, args: &RunArgs) -> Result<()> {
    setup_logging();

    let mut config = opts.bridge_config()?;
    if args.no_http {
        config.http.enabled = false;
    }
    if let Some(bind) = args.bind {
        config.http.bind = bind;
    }
    let root = config.root.clone();

    let mut bridge = Bridge::new(config, SimScene::demo(), demo_handlers())
        .with_context(|| format!("prepare bridge under {}", root.display()))?;
    bridge.start().context("start bridge")?;
    tracing::info!(
        root = %root.display(),
        http = ?bridge.http_addr(),
        "bridge running over the demo scene"
    );

    let mut interval = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut ticks = 0u64;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = interval.tick() => {
                bridge.tick();
                ticks += 1;
                if args.max_ticks.is_some_and(|max| ticks >= max) {
                    break;
                }
            }
        }
    }

    bridge.shutdown();
    tracing::info!(ticks, "bridge stopped");
    Ok(())
}

async fn shutdown_signal() {
    let mut term =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl-C received, shutting down...");
        }
        _ = async {
            match term.as_mut() {
                Some(t) => {
                    t.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        } => {
            tracing::info!("SIGTERM received, shutting down...");
        }
    }
}

/// Set up tracing subscriber for daemon logging. Kernel `log` records are
/// picked up through the subscriber's log bridge.
fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();
}
