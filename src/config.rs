//! TOML settings for `fileshared` and `fileshare`
//!
//! Command-line flags override whatever is loaded here.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write as _;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 9040;
pub const DEFAULT_REGISTRY_FILE: &str = "files.json";
pub const SERVER_CONFIG_FILE: &str = "server.toml";
pub const CLIENT_CONFIG_FILE: &str = "client.toml";

pub fn config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("Fileshare");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config").join("fileshare");
    }
    PathBuf::from(".fileshare")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    /// Defaults to `files.json` inside the storage directory
    pub registry_path: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            storage_dir: PathBuf::from("storage"),
            registry_path: None,
            log_file: None,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.registry_path
            .clone()
            .unwrap_or_else(|| self.storage_dir.join(DEFAULT_REGISTRY_FILE))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub name: Option<String>,
    pub download_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            name: None,
            download_dir: PathBuf::from("."),
        }
    }
}

/// Load `path`, or `config_dir()/default_file` when no path is given.
/// Only the implicit location may be absent; it then yields the defaults.
pub fn load<T>(path: Option<&Path>, default_file: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let (p, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (config_dir().join(default_file), false),
    };
    match std::fs::read_to_string(&p) {
        Ok(data) => toml::from_str(&data).with_context(|| format!("parse {}", p.display())),
        Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e).with_context(|| format!("read config {}", p.display())),
    }
}

pub fn save<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir).ok();
    let data = toml::to_string(value)?;
    // atomic write
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(data.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}
