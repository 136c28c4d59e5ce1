//! `gpiosync init --device-id <id> [--pin <n>]... [link options]`

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use gpiosync_core::config::{self, AgentConfig, GpioBackend};
use gpiosync_core::PinId;

/// Write a new agent configuration.
#[derive(Args, Debug)]
pub struct InitArgs {
    /// Device identifier used as the first topic segment (e.g. "esp32_02").
    #[arg(long)]
    pub device_id: String,

    /// Output pin restored at boot. Repeat for several pins.
    #[arg(long = "pin", value_name = "PIN")]
    pub pins: Vec<u32>,

    /// Heartbeat interval on the cloud link, in milliseconds.
    #[arg(long, value_name = "MS")]
    pub heartbeat_ms: Option<u64>,

    /// Cloud broker host. Enables the cloud link.
    #[arg(long)]
    pub cloud_host: Option<String>,

    #[arg(long, default_value_t = 8883)]
    pub cloud_port: u16,

    /// CA bundle (PEM) for a TLS cloud connection.
    #[arg(long, value_name = "FILE")]
    pub cloud_ca: Option<PathBuf>,

    /// Local broker host. Enables the local link.
    #[arg(long)]
    pub local_host: Option<String>,

    #[arg(long, default_value_t = 1883)]
    pub local_port: u16,

    /// Drive in-memory pins instead of /sys/class/gpio.
    #[arg(long)]
    pub simulated: bool,
}

impl InitArgs {
    pub fn run(self) -> Result<()> {
        let home = dirs::home_dir().context("could not determine home directory")?;
        let path = config::config_path_at(&home);
        if path.exists() {
            println!("config already exists: {}", path.display());
            return Ok(());
        }

        let config = self.into_config();
        let device_id = config.device_id.clone();
        let config = config::init_at(&home, config)
            .with_context(|| format!("failed to init agent '{device_id}'"))?;

        println!("{} Initialized agent '{}'", "✓".green(), config.device_id);
        println!("  Saved to: {}", path.display());
        if config.cloud.enabled {
            println!("  cloud: {}:{}", config.cloud.host, config.cloud.port);
        }
        if config.local.enabled {
            println!("  local: {}:{}", config.local.host, config.local.port);
        }
        Ok(())
    }

    fn into_config(self) -> AgentConfig {
        let mut config = AgentConfig::new(self.device_id);
        config.pins = self.pins.into_iter().map(PinId).collect();
        if let Some(ms) = self.heartbeat_ms {
            config.heartbeat_interval_ms = ms;
        }
        if let Some(host) = self.cloud_host {
            config.cloud.enabled = true;
            config.cloud.host = host;
        }
        config.cloud.port = self.cloud_port;
        config.cloud.ca_file = self.cloud_ca;
        if let Some(host) = self.local_host {
            config.local.enabled = true;
            config.local.host = host;
        }
        config.local.port = self.local_port;
        if self.simulated {
            config.gpio.backend = GpioBackend::Simulated;
        }
        config
    }
}
