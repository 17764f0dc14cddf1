//! fileshare - command-line client for a fileshare server
//!
//! One-shot subcommands connect, run one operation and disconnect. `shell`
//! keeps the session open so download notifications arrive while idle.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use fileshare::cli::{ClientCommand, ClientOpts};
use fileshare::config::{self, ClientConfig};
use fileshare::logger::Logger;
use fileshare::progress::ProgressLogger;
use fileshare::{Client, ListingEntry, TransferError};

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    let cfg: ClientConfig = config::load(opts.config.as_deref(), config::CLIENT_CONFIG_FILE)?;
    let cfg = opts.apply(cfg);
    let name = cfg
        .name
        .clone()
        .context("a name is required (--name, or `name` in the config file)")?;

    if opts.save_config {
        let path = opts
            .config
            .clone()
            .unwrap_or_else(|| config::config_dir().join(config::CLIENT_CONFIG_FILE));
        config::save(&cfg, &path).with_context(|| format!("save {}", path.display()))?;
    }

    let logger: Arc<dyn Logger> = Arc::new(ProgressLogger::new(!opts.quiet));
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    rt.block_on(run(opts.command, cfg, name, logger))
}

async fn run(command: ClientCommand, cfg: ClientConfig, name: String, logger: Arc<dyn Logger>) -> Result<()> {
    let mut client = Client::connect(&cfg.host, cfg.port, &name, Arc::clone(&logger))
        .await
        .with_context(|| format!("Error connecting to server {}:{}", cfg.host, cfg.port))?;

    match command {
        ClientCommand::Upload { path } => client.upload(&path).await?,
        ClientCommand::List => print_listing(&client.list().await?),
        ClientCommand::Download { owner, filename, .. } => {
            client.download(&owner, &filename, &cfg.download_dir).await?;
        }
        ClientCommand::Delete { filename } => client.delete(&filename).await?,
        ClientCommand::Shell => shell(&mut client, &cfg.download_dir, logger.as_ref()).await?,
    }
    client.close().await?;
    Ok(())
}

fn print_listing(entries: &[ListingEntry]) {
    if entries.is_empty() {
        println!("No files on the server.");
        return;
    }
    println!("Available Files:");
    for e in entries {
        println!("  {}", e);
    }
}

const SHELL_HELP: &str =
    "Commands: upload <path> | list | download <owner> <file> | delete <file> | help | quit";

async fn shell(client: &mut Client, download_dir: &Path, logger: &dyn Logger) -> Result<()> {
    println!("Connected as {}. {}", client.name(), SHELL_HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match shell_command(client, download_dir, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => logger.error("command", &e.to_string()),
                }
                client.take_notifications();
            }
            ready = client.readable() => {
                ready?;
                if client.next_notification().await?.is_none() {
                    logger.info("Server closed the connection.");
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Run one shell line. `Ok(false)` ends the shell.
async fn shell_command(client: &mut Client, download_dir: &Path, line: &str) -> Result<bool, TransferError> {
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match cmd {
        "" => {}
        "quit" | "exit" => return Ok(false),
        "help" => println!("{}", SHELL_HELP),
        "list" => print_listing(&client.list().await?),
        "upload" if !rest.is_empty() => client.upload(Path::new(rest)).await?,
        "delete" if !rest.is_empty() => client.delete(rest).await?,
        "download" => match rest.split_once(' ') {
            Some((owner, filename)) => {
                client.download(owner, filename.trim(), download_dir).await?;
            }
            None => println!("usage: download <owner> <file>"),
        },
        _ => println!("Unknown command: {}. {}", line, SHELL_HELP),
    }
    Ok(true)
}
