//! Client side of the protocol: one connection, one named session.
//!
//! Every operation is a request followed by its reply. `NOTIFY` frames the
//! server pushes in between are collected and handed to the logger instead of
//! being mistaken for a reply.

use crate::codec::{self, keyword, reply, Request};
use crate::error::{ProtocolError, Result, TransferError};
use crate::logger::Logger;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

// Upper bound on what a list announce may make us reserve up front
const LIST_PREALLOC_LIMIT: u64 = 1024 * 1024;

/// One line of a LIST reply: `<filename> (Owner: <owner>)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub filename: String,
    pub owner: String,
}

impl ListingEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let (filename, rest) = line.rsplit_once(" (Owner: ")?;
        let owner = rest.strip_suffix(')')?;
        Some(Self {
            filename: filename.to_string(),
            owner: owner.to_string(),
        })
    }
}

impl fmt::Display for ListingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Owner: {})", self.filename, self.owner)
    }
}

pub fn parse_listing(text: &str) -> Vec<ListingEntry> {
    text.lines().filter_map(ListingEntry::parse).collect()
}

fn closed_by_server() -> TransferError {
    TransferError::Connection(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "server closed the connection",
    ))
}

/// Turn a server error reply into the matching error kind.
fn check_error(frame: &str) -> Result<()> {
    match frame {
        reply::NOT_FOUND => Err(TransferError::NotFound),
        reply::NAME_IN_USE => Err(TransferError::NameCollision),
        reply::INVALID_NAME => Err(TransferError::InvalidName),
        _ => match codec::error_text(frame) {
            Some(text) => Err(TransferError::Server(text.to_string())),
            None => Ok(()),
        },
    }
}

pub struct Client {
    stream: TcpStream,
    name: String,
    logger: Arc<dyn Logger>,
    notifications: VecDeque<String>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("stream", &self.stream)
            .field("name", &self.name)
            .field("notifications", &self.notifications)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect and perform the name handshake.
    pub async fn connect(host: &str, port: u16, name: &str, logger: Arc<dyn Logger>) -> Result<Self> {
        codec::validate_client_name(name).map_err(|_| TransferError::InvalidName)?;
        let addr = format!("{}:{}", host, port);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(TransferError::Connection)?;
        let _ = stream.set_nodelay(true);
        let mut client = Self {
            stream,
            name: name.to_string(),
            logger,
            notifications: VecDeque::new(),
        };

        codec::write_frame(&mut client.stream, name).await?;
        let response = codec::read_frame(&mut client.stream)
            .await?
            .ok_or_else(closed_by_server)?;
        if let Err(e) = check_error(&response) {
            client.logger.info(&response);
            return Err(e);
        }
        if response != reply::CONNECTED {
            return Err(ProtocolError::Unexpected(response).into());
        }
        client.logger.info("Connected to server.");
        Ok(client)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn record_notification(&mut self, text: &str) {
        self.logger.info(text);
        self.notifications.push_back(text.to_string());
    }

    /// Next frame that is not a NOTIFY.
    async fn read_reply(&mut self) -> Result<String> {
        loop {
            let frame = codec::read_frame(&mut self.stream)
                .await?
                .ok_or_else(closed_by_server)?;
            match codec::parse_notify(&frame) {
                Some(text) => self.record_notification(text),
                None => return Ok(frame),
            }
        }
    }

    /// Send a local file; the server stores it under `<name>_<basename>`.
    pub async fn upload(&mut self, local_path: &Path) -> Result<()> {
        let filename = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ProtocolError::InvalidField {
                what: "filename",
                value: local_path.display().to_string(),
            })?
            .to_string();
        codec::validate_filename(&filename)?;
        let mut file = tokio::fs::File::open(local_path).await?;
        let size = file.metadata().await?.len();

        let request = Request::Upload {
            filename: filename.clone(),
            size,
        };
        codec::write_frame(&mut self.stream, &request.encode()?).await?;
        let logger = Arc::clone(&self.logger);
        let label = format!("upload {}", filename);
        match codec::send_payload(&mut file, &mut self.stream, size, |done| {
            logger.progress(&label, done, size)
        })
        .await
        {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            // the server is still counting bytes; this connection is unusable now
            Err(e) => return Err(TransferError::Aborted(format!("reading {}: {}", local_path.display(), e))),
        }

        let response = self.read_reply().await?;
        self.logger.info(&response);
        check_error(&response)?;
        if response != reply::UPLOAD_OK {
            return Err(ProtocolError::Unexpected(response).into());
        }
        Ok(())
    }

    /// Every stored file with its owner.
    pub async fn list(&mut self) -> Result<Vec<ListingEntry>> {
        codec::write_frame(&mut self.stream, &Request::List.encode()?).await?;
        let response = self.read_reply().await?;
        check_error(&response)?;
        let size = codec::parse_announce(&response, keyword::LIST)?;
        codec::write_frame(&mut self.stream, reply::READY).await?;

        let mut buf = Vec::with_capacity(size.min(LIST_PREALLOC_LIMIT) as usize);
        let logger = Arc::clone(&self.logger);
        codec::receive_payload(&mut self.stream, &mut buf, size, |done| {
            logger.progress("list", done, size)
        })
        .await?;
        let text = String::from_utf8(buf).map_err(|_| ProtocolError::NotUtf8)?;
        Ok(parse_listing(&text))
    }

    /// Fetch `owner`'s `filename` into `dest_dir`, returning the written path.
    ///
    /// The destination only appears once every announced byte has arrived.
    pub async fn download(&mut self, owner: &str, filename: &str, dest_dir: &Path) -> Result<PathBuf> {
        codec::validate_filename(filename)?;
        let request = Request::Download {
            owner: owner.to_string(),
            filename: filename.to_string(),
        };
        codec::write_frame(&mut self.stream, &request.encode()?).await?;
        let response = self.read_reply().await?;
        if let Err(e) = check_error(&response) {
            self.logger.info(&format!("Server error: {}", response));
            return Err(e);
        }
        let size = codec::parse_announce(&response, keyword::DOWNLOAD)?;

        let tmp = match tempfile::NamedTempFile::new_in(dest_dir) {
            Ok(t) => t,
            Err(e) => {
                codec::write_frame(&mut self.stream, reply::CANCEL).await?;
                return Err(e.into());
            }
        };
        codec::write_frame(&mut self.stream, reply::READY).await?;

        let (file, tmp_path) = tmp.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let logger = Arc::clone(&self.logger);
        let label = format!("download {}", filename);
        codec::receive_payload(&mut self.stream, &mut file, size, |done| {
            logger.progress(&label, done, size)
        })
        .await?;
        file.sync_all().await?;
        drop(file);

        let dest = dest_dir.join(filename);
        tmp_path.persist(&dest).map_err(|e| TransferError::Io(e.error))?;
        self.logger.info(&format!(
            "Downloaded file '{}' to '{}'.",
            filename,
            dest_dir.display()
        ));
        Ok(dest)
    }

    /// Delete one of this client's own files.
    pub async fn delete(&mut self, filename: &str) -> Result<()> {
        let request = Request::Delete {
            filename: filename.to_string(),
        };
        codec::write_frame(&mut self.stream, &request.encode()?).await?;
        let response = self.read_reply().await?;
        self.logger.info(&response);
        check_error(&response)?;
        if response != reply::DELETE_OK {
            return Err(ProtocolError::Unexpected(response).into());
        }
        Ok(())
    }

    /// NOTIFY messages received while waiting for replies.
    pub fn take_notifications(&mut self) -> Vec<String> {
        self.notifications.drain(..).collect()
    }

    /// Resolves once the server has sent something. Cancel-safe, so it can sit
    /// in a `select!` next to user input.
    pub async fn readable(&self) -> Result<()> {
        self.stream
            .readable()
            .await
            .map_err(TransferError::Connection)
    }

    /// Wait for the next unsolicited NOTIFY while no request is in flight.
    /// `Ok(None)` means the server closed the connection.
    pub async fn next_notification(&mut self) -> Result<Option<String>> {
        if let Some(text) = self.notifications.pop_front() {
            return Ok(Some(text));
        }
        let Some(frame) = codec::read_frame(&mut self.stream).await? else {
            return Ok(None);
        };
        match codec::parse_notify(&frame) {
            Some(text) => {
                self.logger.info(text);
                Ok(Some(text.to_string()))
            }
            None => Err(ProtocolError::Unexpected(frame).into()),
        }
    }

    pub async fn close(mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(TransferError::Connection)
    }
}
