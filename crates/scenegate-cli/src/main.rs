mod commands;
mod opts;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::audit::VerifyArgs;
use commands::run::RunArgs;
use commands::send::SendArgs;
use opts::ProjectOpts;

#[derive(Parser, Debug)]
#[command(name = "scenegate", version, about = "Governed scene mutation bridge")]
struct Cli {
    #[command(flatten)]
    opts: ProjectOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Host the bridge over a simulated scene until interrupted
    Run(RunArgs),

    /// Submit one command and wait for its response
    Send(SendArgs),

    /// Audit ledger commands
    #[command(subcommand)]
    Audit(AuditCommand),

    /// Show the bridge status and heartbeat files
    Status,
}

#[derive(Subcommand, Debug)]
enum AuditCommand {
    /// Verify the hash chain of an audit log offline
    Verify(VerifyArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let opts = &cli.opts;

    match cli.command {
        Command::Run(args) => commands::run::cmd_run(opts, &args).await,
        Command::Send(args) => commands::send::cmd_send(opts, &args).await,
        Command::Audit(cmd) => match cmd {
            AuditCommand::Verify(args) => commands::audit::cmd_verify(opts, &args),
        },
        Command::Status => commands::status::cmd_status(opts),
    }
}
