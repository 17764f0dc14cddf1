//! Clap option structs for both binaries

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ClientConfig, ServerConfig};

/// Options for the `fileshared` server
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "File sharing server")]
pub struct DaemonOpts {
    /// TOML config file (default: ~/.config/fileshare/server.toml if present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Interface to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Directory holding uploaded files
    #[arg(long)]
    pub storage: Option<PathBuf>,

    /// Registry snapshot path (default: <storage>/files.json)
    #[arg(long)]
    pub registry: Option<PathBuf>,

    /// Append log lines to this file as well as stderr
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

impl DaemonOpts {
    pub fn apply(&self, mut cfg: ServerConfig) -> ServerConfig {
        if let Some(h) = &self.host {
            cfg.host = h.clone();
        }
        if let Some(p) = self.port {
            cfg.port = p;
        }
        if let Some(s) = &self.storage {
            cfg.storage_dir = s.clone();
        }
        if let Some(r) = &self.registry {
            cfg.registry_path = Some(r.clone());
        }
        if let Some(l) = &self.log_file {
            cfg.log_file = Some(l.clone());
        }
        cfg
    }
}

/// Options for the `fileshare` client
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "File sharing client")]
pub struct ClientOpts {
    /// TOML config file (default: ~/.config/fileshare/client.toml if present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Server address
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Name to connect as
    #[arg(short, long)]
    pub name: Option<String>,

    /// Remember host, port and name in the config file
    #[arg(long)]
    pub save_config: bool,

    /// Hide transfer progress bars
    #[arg(short, long)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: ClientCommand,
}

impl ClientOpts {
    pub fn apply(&self, mut cfg: ClientConfig) -> ClientConfig {
        if let Some(h) = &self.host {
            cfg.host = h.clone();
        }
        if let Some(p) = self.port {
            cfg.port = p;
        }
        if let Some(n) = &self.name {
            cfg.name = Some(n.clone());
        }
        if let ClientCommand::Download { dir: Some(d), .. } = &self.command {
            cfg.download_dir = d.clone();
        }
        cfg
    }
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// Upload a local file
    Upload { path: PathBuf },
    /// List files stored on the server
    List,
    /// Download another user's (or your own) file
    Download {
        owner: String,
        filename: String,
        /// Destination directory
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Delete one of your own files
    Delete { filename: String },
    /// Stay connected and read commands from stdin, printing notifications as they arrive
    Shell,
}
