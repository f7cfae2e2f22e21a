//! Daemon-level configuration: listen address, the pre-shared key used to
//! construct the default cipher factory (§10.6), and the UDP idle-eviction
//! threshold that resolves the §9 open question about peer-map leaks.
//!
//! CLI flags (`clap`) take precedence over a TOML file (`serde` + `toml`);
//! everything has a default so a bare `ss-relayd` with a key is enough to run.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

fn default_bind() -> SocketAddr {
    "0.0.0.0:8388".parse().unwrap()
}

fn default_udp_idle_secs() -> u64 {
    300
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// File-sourced configuration overlay. Every field is optional so a file can
/// set only what it needs to; CLI flags win over whatever the file sets.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub bind: Option<SocketAddr>,
    pub password: Option<String>,
    pub udp_idle_secs: Option<u64>,
    pub log_filter: Option<String>,
}

/// Command-line arguments for the `ss-relayd` binary.
#[derive(Debug, Parser)]
#[command(name = "ss-relayd", about = "Shadowsocks-style TCP/UDP relay server")]
pub struct Cli {
    /// Path to an optional TOML config file overlay.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address and port to listen on for both TCP and UDP.
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Pre-shared key used to derive the default AEAD cipher's key material.
    #[arg(long)]
    pub password: Option<String>,

    /// Seconds of inactivity before a UDP peer's session is evicted.
    #[arg(long)]
    pub udp_idle_secs: Option<u64>,

    /// `tracing_subscriber::EnvFilter` directive, e.g. "debug" or "ss_relay=debug".
    #[arg(long)]
    pub log_filter: Option<String>,
}

/// Fully resolved configuration used to construct the acceptors.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub password: String,
    pub udp_idle_timeout: Duration,
    pub log_filter: String,
}

impl Config {
    /// Merges CLI flags over an optional file overlay, applying defaults
    /// last. Returns an error if no password is available from either
    /// source — the relay cannot construct a cipher without one.
    pub fn resolve(cli: Cli, file: FileConfig) -> anyhow::Result<Self> {
        let password = cli
            .password
            .or(file.password)
            .ok_or_else(|| anyhow::anyhow!("a password is required (--password or config file)"))?;

        Ok(Config {
            bind: cli.bind.or(file.bind).unwrap_or_else(default_bind),
            password,
            udp_idle_timeout: Duration::from_secs(
                cli.udp_idle_secs
                    .or(file.udp_idle_secs)
                    .unwrap_or_else(default_udp_idle_secs),
            ),
            log_filter: cli
                .log_filter
                .or(file.log_filter)
                .unwrap_or_else(default_log_filter),
        })
    }

    pub fn load_file(path: Option<&PathBuf>) -> anyhow::Result<FileConfig> {
        match path {
            None => Ok(FileConfig::default()),
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Ok(toml::from_str(&text)?)
            }
        }
    }
}
