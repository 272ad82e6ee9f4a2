use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::naming::replication::DEFAULT_REPLICATION_THRESHOLD;
use crate::naming::{NamingConfig, REGISTRATION_PORT, SERVICE_PORT};
use crate::rmi::skeleton::DEFAULT_MAX_WORKERS;
use crate::storage::StorageConfig;

/// Config file (TOML). All fields optional; CLI args take precedence.
/// Default location: `{config_dir}/net_dfs/config.toml`
/// (Linux: `~/.config/net_dfs/config.toml`)
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    pub service_addr: Option<SocketAddr>,
    pub registration_addr: Option<SocketAddr>,
    /// Shared locks a file takes before it is copied to every storage server.
    pub replication_threshold: Option<u32>,
    pub max_workers: Option<usize>,
    pub storage_root: Option<PathBuf>,
    pub storage_host: Option<IpAddr>,
    pub storage_port: Option<u16>,
    pub command_port: Option<u16>,
}

impl ConfigFile {
    fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(?path, error = %e, "Failed to parse config file, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

/// NetDfs: distributed file service with a central naming server.
#[derive(Parser, Debug)]
#[command(name = "net_dfs", about = "Distributed file service")]
pub struct CliArgs {
    #[command(subcommand)]
    pub mode: Mode,

    /// Path to config file (default: {config_dir}/net_dfs/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Naming server service address (default 127.0.0.1:6000).
    #[arg(long, global = true)]
    pub service_addr: Option<SocketAddr>,

    /// Naming server registration address (default 127.0.0.1:6001).
    #[arg(long, global = true)]
    pub registration_addr: Option<SocketAddr>,

    /// Maximum calls served at once per interface.
    #[arg(long, global = true)]
    pub max_workers: Option<usize>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Mode {
    /// Run the naming server.
    Naming {
        /// Shared locks before a file is replicated (default 20).
        #[arg(long)]
        replication_threshold: Option<u32>,
    },
    /// Run a storage server and register it with the naming server.
    Storage {
        /// Local directory holding this server's files.
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Address advertised to the naming server and clients.
        #[arg(long)]
        host: Option<IpAddr>,

        /// Port of the Storage interface (default: any free port).
        #[arg(long)]
        storage_port: Option<u16>,

        /// Port of the Command interface (default: any free port).
        #[arg(long)]
        command_port: Option<u16>,
    },
}

/// What the process runs, fully resolved.
pub enum Role {
    Naming(NamingConfig),
    Storage {
        storage: StorageConfig,
        registration_addr: SocketAddr,
    },
}

/// Resolved application configuration.
pub struct AppConfig {
    pub role: Role,
}

impl AppConfig {
    pub fn from_args(args: &CliArgs) -> anyhow::Result<Self> {
        let config_path = args.config.clone().or_else(|| {
            directories::ProjectDirs::from("", "", "net_dfs")
                .map(|p| p.config_dir().join("config.toml"))
        });
        let cfg = config_path
            .as_deref()
            .map(ConfigFile::load)
            .unwrap_or_default();
        Self::resolve(args, cfg)
    }

    /// Merge CLI args over a loaded config file, then over defaults.
    fn resolve(args: &CliArgs, cfg: ConfigFile) -> anyhow::Result<Self> {
        let service_addr = args
            .service_addr
            .or(cfg.service_addr)
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], SERVICE_PORT)));
        let registration_addr = args
            .registration_addr
            .or(cfg.registration_addr)
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], REGISTRATION_PORT)));
        let max_workers = args
            .max_workers
            .or(cfg.max_workers)
            .unwrap_or(DEFAULT_MAX_WORKERS);

        let role = match &args.mode {
            Mode::Naming {
                replication_threshold,
            } => Role::Naming(NamingConfig {
                service_addr,
                registration_addr,
                replication_threshold: replication_threshold
                    .or(cfg.replication_threshold)
                    .unwrap_or(DEFAULT_REPLICATION_THRESHOLD),
                max_workers,
            }),
            Mode::Storage {
                root,
                host,
                storage_port,
                command_port,
            } => {
                let root = root.clone().or(cfg.storage_root).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Storage root is required. Pass --root <path> or set `storage_root` in config file."
                    )
                })?;
                Role::Storage {
                    storage: StorageConfig {
                        root,
                        host: host
                            .or(cfg.storage_host)
                            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
                        storage_port: storage_port.or(cfg.storage_port).unwrap_or(0),
                        command_port: command_port.or(cfg.command_port).unwrap_or(0),
                        max_workers,
                    },
                    registration_addr,
                }
            }
        };

        Ok(Self { role })
    }
}
