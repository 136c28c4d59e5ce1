//! `gpiosync pin`: drive a pin through the daemon, or read persisted levels.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use gpiosync_core::{config, Action, Level, PinId};
use gpiosync_daemon::paths::state_dir;
use gpiosync_daemon::{request_set, DaemonError};
use gpiosync_engine::FileStore;

#[derive(Subcommand, Debug)]
pub enum PinCommand {
    /// Apply ON, OFF or TOGGLE to a pin via the running daemon.
    Set {
        pin: u32,
        /// ON | OFF | TOGGLE (case-sensitive).
        action: Action,
    },
    /// Show persisted levels of the configured pins (no daemon needed).
    Show(ShowArgs),
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn run(command: PinCommand) -> Result<()> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    match command {
        PinCommand::Set { pin, action } => set(&home, PinId(pin), action),
        PinCommand::Show(args) => show(&home, args.json),
    }
}

fn set(home: &std::path::Path, pin: PinId, action: Action) -> Result<()> {
    let applied = match request_set(home, pin, action) {
        Ok(applied) => applied,
        Err(DaemonError::DaemonNotRunning { .. }) => {
            anyhow::bail!("daemon is not running; start it with `gpiosync daemon start`")
        }
        Err(err) => return Err(err).with_context(|| format!("{action} on pin {pin} rejected")),
    };

    let level = applied["level"].as_str().unwrap_or("?");
    let links: Vec<&str> = applied["published"]
        .as_array()
        .map(|links| links.iter().filter_map(|l| l.as_str()).collect())
        .unwrap_or_default();
    println!(
        "pin {pin} -> {level} (published: {})",
        if links.is_empty() {
            "none".to_string()
        } else {
            links.join(", ")
        }
    );
    if applied["persisted"] == serde_json::Value::Bool(false) {
        println!("warning: level was applied but could not be persisted");
    }
    Ok(())
}

#[derive(Debug, Serialize, Tabled)]
struct PinRow {
    #[tabled(rename = "PIN")]
    pin: PinId,
    #[tabled(rename = "LEVEL")]
    level: Level,
    #[tabled(rename = "SOURCE")]
    source: &'static str,
}

fn show(home: &std::path::Path, json: bool) -> Result<()> {
    let config = config::load_at(home).context("failed to load config")?;
    let rows = persisted_rows(home, &config.storage.namespace, &config.pins)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).context("failed to render pins JSON")?
        );
        return Ok(());
    }

    if rows.is_empty() {
        println!("no pins configured");
        return Ok(());
    }
    println!("{}", Table::new(rows).with(Style::blank()));
    Ok(())
}

fn persisted_rows(home: &std::path::Path, namespace: &str, pins: &[PinId]) -> Result<Vec<PinRow>> {
    let root = state_dir(home);
    if !FileStore::namespace_path(&root, namespace).exists() {
        return Ok(pins
            .iter()
            .map(|&pin| PinRow {
                pin,
                level: Level::Off,
                source: "default",
            })
            .collect());
    }

    let store = FileStore::open(&root, namespace)
        .with_context(|| format!("failed to open state store under {}", root.display()))?;
    pins.iter()
        .map(|&pin| {
            let stored = store
                .lookup(pin)
                .with_context(|| format!("failed to read state of pin {pin}"))?;
            Ok(PinRow {
                pin,
                level: stored.unwrap_or_default(),
                source: if stored.is_some() { "stored" } else { "default" },
            })
        })
        .collect()
}
