use std::path::{Path, PathBuf};

pub use gpiosync_core::config::agent_root_at as agent_root;

pub const AGENT_SOCKET: &str = "agent.sock";

/// Persistent pin records, one JSON document per storage namespace.
pub fn state_dir(home: &Path) -> PathBuf {
    agent_root(home).join("state")
}

pub fn run_dir(home: &Path) -> PathBuf {
    agent_root(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    run_dir(home).join(AGENT_SOCKET)
}
