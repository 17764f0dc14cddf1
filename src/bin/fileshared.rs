use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use fileshare::cli::DaemonOpts;
use fileshare::config::{self, ServerConfig};
use fileshare::logger::{ConsoleLogger, Logger, TeeLogger, TextLogger};
use fileshare::Server;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    let cfg: ServerConfig = config::load(opts.config.as_deref(), config::SERVER_CONFIG_FILE)?;
    let cfg = opts.apply(cfg);

    if cfg.storage_dir.exists() && !cfg.storage_dir.is_dir() {
        anyhow::bail!(
            "Error: Storage path is not a directory: {}",
            cfg.storage_dir.display()
        );
    }

    let logger: Arc<dyn Logger> = match &cfg.log_file {
        Some(path) => {
            let file = TextLogger::new(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            let console: Arc<dyn Logger> = Arc::new(ConsoleLogger);
            let file: Arc<dyn Logger> = Arc::new(file);
            Arc::new(TeeLogger::new(vec![console, file]))
        }
        None => Arc::new(ConsoleLogger),
    };

    println!("Starting fileshare server:");
    println!("  Storage:  {}", cfg.storage_dir.display());
    println!("  Registry: {}", cfg.registry_path().display());
    println!("  Bind:     {}", cfg.bind_addr());

    if cfg.host == "0.0.0.0" {
        eprintln!("⚠️  WARNING: Binding to 0.0.0.0 exposes the server to all network interfaces");
        eprintln!("   Transfers are unencrypted and names are not authenticated");
        eprintln!("");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async {
        let server = Server::bind(&cfg, Arc::clone(&logger)).await?;
        tokio::select! {
            res = server.run() => res,
            _ = tokio::signal::ctrl_c() => {
                logger.info("Shutting down.");
                Ok(())
            }
        }
    })
}
