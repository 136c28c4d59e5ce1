//! gpiosync: device-side GPIO state sync agent.
//!
//! # Usage
//!
//! ```text
//! gpiosync init --device-id <id> [--pin <n>]... [--cloud-host <host>] [--local-host <host>] [--simulated]
//! gpiosync daemon start|stop|status
//! gpiosync pin set <pin> ON|OFF|TOGGLE
//! gpiosync pin show [--json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{daemon::DaemonCommand, init::InitArgs, pin::PinCommand};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "gpiosync",
    version,
    about = "Keep GPIO outputs in sync with cloud and local MQTT brokers",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the agent configuration to ~/.gpiosync/config.yaml.
    Init(InitArgs),

    /// Run or control the sync daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Drive or inspect output pins.
    Pin {
        #[command(subcommand)]
        command: PinCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Pin { command } => commands::pin::run(command),
    }
}
