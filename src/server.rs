//! Accept loop: one spawned session task per connection
//!
//! The registry is loaded and reconciled against the storage directory before
//! the first connection is accepted.

use crate::clients::ConnectedClients;
use crate::config::ServerConfig;
use crate::logger::Logger;
use crate::registry::{self, Registry};
use crate::session::{self, Shared};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    /// Load and reconcile the registry, then bind the listening socket.
    pub async fn bind(cfg: &ServerConfig, logger: Arc<dyn Logger>) -> Result<Self> {
        let registry = load_registry(&cfg.storage_dir, &cfg.registry_path(), logger.as_ref())?;
        let bind = cfg.bind_addr();
        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("bind {}", bind))?;
        let port = listener.local_addr()?.port();
        logger.info(&format!("Server started on port {}...", port));
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                storage_dir: cfg.storage_dir.clone(),
                registry: Arc::new(registry),
                clients: ConnectedClients::new(),
                logger,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    self.shared.logger.error("accept", &e.to_string());
                    // e.g. out of file descriptors
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    continue;
                }
            };
            let _ = stream.set_nodelay(true);
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let (rd, wr) = stream.into_split();
                if let Err(e) = session::handle_connection(rd, wr, Arc::clone(&shared)).await {
                    shared
                        .logger
                        .error(&format!("connection from {}", peer), &e.to_string());
                }
            });
        }
    }
}

/// Open the registry and drop entries whose backing file has disappeared.
pub fn load_registry(storage_dir: &Path, registry_path: &Path, logger: &dyn Logger) -> Result<Registry> {
    std::fs::create_dir_all(storage_dir)
        .with_context(|| format!("create storage directory {}", storage_dir.display()))?;
    let registry = Registry::open(registry_path)?;
    let existing = registry::scan_storage(storage_dir)
        .with_context(|| format!("scan {}", storage_dir.display()))?;
    for key in registry.reconcile_with_storage(&existing)? {
        logger.info(&format!(
            "File {} not found in directory. Removing from records.",
            key
        ));
    }
    logger.info("File records synchronized with the directory.");
    Ok(registry)
}
