//! Server side of one connection: name handshake, then a command loop.
//!
//! Replies that carry a bulk payload hold the connection's writer from the
//! announce frame until the last payload byte, so a NOTIFY pushed by another
//! session can only ever land between complete reply units.

use crate::clients::{ConnectedClients, SessionHandle, SharedWriter};
use crate::codec::{self, keyword, reply, Request};
use crate::error::{ProtocolError, Result, TransferError};
use crate::logger::Logger;
use crate::registry::{self, Registry, Removal};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use uuid::Uuid;

/// State shared by every session of one server
pub struct Shared {
    pub storage_dir: PathBuf,
    pub registry: Arc<Registry>,
    pub clients: ConnectedClients,
    pub logger: Arc<dyn Logger>,
}

/// Reply text sent to the peer for a recoverable error.
pub fn reply_for(err: &TransferError) -> String {
    match err {
        TransferError::Protocol(ProtocolError::UnknownCommand(_)) => {
            reply::UNKNOWN_COMMAND.to_string()
        }
        TransferError::NotFound => reply::NOT_FOUND.to_string(),
        other => codec::error_reply(other),
    }
}

/// Drive one connection until the peer disconnects or a connection error occurs.
pub async fn handle_connection<R, W>(reader: R, writer: W, shared: Arc<Shared>) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let boxed: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
    let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(boxed));

    let Some(name) = codec::read_frame(&mut reader).await? else {
        return Ok(());
    };

    if codec::validate_client_name(&name).is_err() {
        shared
            .logger
            .info(&format!("Rejected connection with invalid name {:?}.", name));
        reject(&writer, reply::INVALID_NAME).await;
        return Ok(());
    }

    let id = Uuid::new_v4();
    let registered = shared.clients.try_register(SessionHandle {
        id,
        name: name.clone(),
        writer: Arc::clone(&writer),
    });
    if !registered {
        shared
            .logger
            .info(&format!("Rejected {}: name already in use.", name));
        reject(&writer, reply::NAME_IN_USE).await;
        return Ok(());
    }

    shared.logger.info(&format!("{} connected.", name));
    let mut session = Session {
        name,
        reader,
        writer,
        shared: Arc::clone(&shared),
    };
    let result = match session.reply(reply::CONNECTED).await {
        Ok(()) => session.command_loop().await,
        Err(e) => Err(e),
    };

    shared.clients.unregister(&session.name, id);
    if let Err(e) = &result {
        shared
            .logger
            .error(&format!("client {}", session.name), &e.to_string());
    }
    let _ = session.writer.lock().await.shutdown().await;
    shared.logger.info(&format!("{} disconnected.", session.name));
    result
}

async fn reject(writer: &SharedWriter, text: &str) {
    let mut w = writer.lock().await;
    let _ = codec::write_frame(&mut *w, text).await;
    let _ = w.shutdown().await;
}

struct Session<R> {
    name: String,
    reader: BufReader<R>,
    writer: SharedWriter,
    shared: Arc<Shared>,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn command_loop(&mut self) -> Result<()> {
        loop {
            let frame = match codec::read_frame(&mut self.reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.reply(&reply_for(&e)).await?;
                    continue;
                }
            };
            self.shared
                .logger
                .info(&format!("Command from {}: {}", self.name, frame));
            match self.dispatch(&frame).await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.shared.logger.error(
                        &format!("processing command from {}", self.name),
                        &e.to_string(),
                    );
                    self.reply(&reply_for(&e)).await?;
                }
            }
        }
    }

    async fn dispatch(&mut self, frame: &str) -> Result<()> {
        match Request::parse(frame)? {
            Request::Upload { filename, size } => self.upload(&filename, size).await,
            Request::List => self.list().await,
            Request::Download { owner, filename } => self.download(&owner, &filename).await,
            Request::Delete { filename } => self.delete(&filename).await,
        }
    }

    async fn reply(&self, text: &str) -> Result<()> {
        let mut w = self.writer.lock().await;
        codec::write_frame(&mut *w, text).await
    }

    /// Wait for the peer's answer to an announce frame.
    async fn read_ack(&mut self) -> Result<String> {
        codec::read_frame(&mut self.reader)
            .await?
            .ok_or_else(|| TransferError::Aborted("peer closed before acknowledging".into()))
    }

    async fn upload(&mut self, filename: &str, size: u64) -> Result<()> {
        if let Err(e) = codec::validate_filename(filename) {
            codec::drain_payload(&mut self.reader, size).await?;
            return Err(e.into());
        }
        let key = registry::storage_key(&self.name, filename);
        let dest = self.shared.storage_dir.join(&key);

        // Bytes land in a temp file and only become `key` once complete
        let tmp = match tempfile::NamedTempFile::new_in(&self.shared.storage_dir) {
            Ok(t) => t,
            Err(e) => {
                codec::drain_payload(&mut self.reader, size).await?;
                return Err(e.into());
            }
        };
        let (file, tmp_path) = tmp.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        codec::receive_payload(&mut self.reader, &mut file, size, |_| {}).await?;
        file.sync_all().await?;
        drop(file);
        tmp_path.persist(&dest).map_err(|e| TransferError::Io(e.error))?;

        let owner = self.name.clone();
        registry::run_blocking(&self.shared.registry, move |r| r.put(&key, &owner)).await?;
        self.shared
            .logger
            .info(&format!("{} uploaded {}.", self.name, filename));
        self.reply(reply::UPLOAD_OK).await
    }

    async fn list(&mut self) -> Result<()> {
        let lines: Vec<String> = self
            .shared
            .registry
            .list_all()
            .iter()
            .map(|r| format!("{} (Owner: {})", r.filename(), r.owner))
            .collect();
        let payload = lines.join("\n").into_bytes();
        let size = payload.len() as u64;
        self.shared
            .logger
            .info(&format!("Sending file list of size: {} bytes.", size));

        let writer = Arc::clone(&self.writer);
        let mut w = writer.lock().await;
        codec::write_frame(&mut *w, &codec::announce(keyword::LIST, size)).await?;
        let ack = self.read_ack().await?;
        if ack != reply::READY {
            self.shared
                .logger
                .info("Client failed to acknowledge list request.");
            return Ok(());
        }
        codec::send_payload(&mut payload.as_slice(), &mut *w, size, |_| {}).await?;
        Ok(())
    }

    async fn download(&mut self, owner: &str, filename: &str) -> Result<()> {
        codec::validate_filename(filename)?;
        let key = registry::storage_key(owner, filename);
        if self.shared.registry.lookup(&key).is_none() {
            return Err(TransferError::NotFound);
        }
        let mut file = tokio::fs::File::open(self.shared.storage_dir.join(&key)).await?;
        let size = file.metadata().await?.len();

        let writer = Arc::clone(&self.writer);
        let mut w = writer.lock().await;
        codec::write_frame(&mut *w, &codec::announce(keyword::DOWNLOAD, size)).await?;
        let ack = self.read_ack().await?;
        if ack != reply::READY {
            self.shared.logger.info(&format!(
                "{} cancelled download of {} from {}.",
                self.name, filename, owner
            ));
            return Ok(());
        }
        match codec::send_payload(&mut file, &mut *w, size, |_| {}).await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            // already announced: the peer is waiting for bytes that will never come
            Err(e) => return Err(TransferError::Aborted(format!("reading {}: {}", key, e))),
        }
        drop(w);

        self.shared.logger.info(&format!(
            "{} downloaded {} from {}.",
            self.name, filename, owner
        ));
        if owner != self.name {
            self.notify(
                owner,
                format!("{} downloaded your file {}.", self.name, filename),
            );
        }
        Ok(())
    }

    async fn delete(&mut self, filename: &str) -> Result<()> {
        codec::validate_filename(filename)?;
        let key = registry::storage_key(&self.name, filename);
        if self.shared.registry.lookup(&key).is_none() {
            return Err(TransferError::NotFound);
        }
        let path = self.shared.storage_dir.join(&key);
        // drop the record first: a file left behind is an orphan, a record
        // without its file is not allowed
        let removed =
            registry::run_blocking(&self.shared.registry, move |r| r.remove(&key)).await?;
        if removed == Removal::NotFound {
            return Err(TransferError::NotFound);
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => self
                .shared
                .logger
                .error(&format!("removing {}", path.display()), &e.to_string()),
        }
        self.shared
            .logger
            .info(&format!("{} deleted {}.", self.name, filename));
        self.reply(reply::DELETE_OK).await
    }

    /// Best-effort push to `owner` if they are online; never blocks this session.
    fn notify(&self, owner: &str, text: String) {
        let Some(handle) = self.shared.clients.lookup(owner) else {
            return;
        };
        let logger = Arc::clone(&self.shared.logger);
        tokio::spawn(async move {
            let mut w = handle.writer.lock().await;
            if let Err(e) = codec::write_frame(&mut *w, &codec::notify_frame(&text)).await {
                logger.error(&format!("notifying {}", handle.name), &e.to_string());
            }
        });
    }
}
