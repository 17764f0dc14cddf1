//! Wire format shared by the server and the client
//!
//! Text frames are a 4-byte little-endian length followed by that many UTF-8
//! bytes. A frame body is a `|`-delimited list of fields, keyword first.
//! Raw bulk payloads follow an announce frame and carry exactly the announced
//! number of bytes, moved in `CHUNK_SIZE` pieces.

use crate::error::{ProtocolError, Result, TransferError};
use std::io;
use std::path::{Component, Path};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DELIMITER: char = '|';

// Text frames only carry commands and short replies; bulk data never goes through them
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

pub const FRAME_HEADER_LEN: usize = 4;

pub const CHUNK_SIZE: usize = 4096;

pub mod keyword {
    pub const UPLOAD: &str = "UPLOAD";
    pub const LIST: &str = "LIST";
    pub const DOWNLOAD: &str = "DOWNLOAD";
    pub const DELETE: &str = "DELETE";
    pub const NOTIFY: &str = "NOTIFY";
}

pub mod reply {
    pub const CONNECTED: &str = "Connected successfully.";
    pub const NAME_IN_USE: &str = "Error: Name already in use";
    pub const INVALID_NAME: &str = "Error: Invalid name.";
    pub const UPLOAD_OK: &str = "Upload successful.";
    pub const DELETE_OK: &str = "Delete successful.";
    pub const NOT_FOUND: &str = "Error: File not found.";
    pub const UNKNOWN_COMMAND: &str = "Error: Unknown command.";
    pub const READY: &str = "READY";
    pub const CANCEL: &str = "CANCEL";
    pub const ERROR_PREFIX: &str = "Error: ";
}

/// Build frame header (4 bytes, little-endian body length)
pub fn build_frame_header(payload_len: u32) -> [u8; FRAME_HEADER_LEN] {
    payload_len.to_le_bytes()
}

/// Parse frame header, returning the body length
pub fn parse_frame_header(header: &[u8; FRAME_HEADER_LEN]) -> usize {
    u32::from_le_bytes(*header) as usize
}

pub fn validate_frame_size(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(size));
    }
    Ok(())
}

/// Join fields into one frame body. Fields may not contain the delimiter.
pub fn encode_fields(fields: &[&str]) -> Result<String, ProtocolError> {
    for f in fields {
        if f.contains(DELIMITER) {
            return Err(ProtocolError::InvalidField {
                what: "field",
                value: f.to_string(),
            });
        }
    }
    Ok(fields.join("|"))
}

/// Split a frame body into its keyword and arguments.
pub fn split_fields(frame: &str) -> (&str, Vec<&str>) {
    let mut parts = frame.split(DELIMITER);
    let keyword = parts.next().unwrap_or("");
    (keyword, parts.collect())
}

/// A filename must be a single plain path component so that the storage key
/// maps to exactly one file directly inside the storage directory.
pub fn validate_filename(name: &str) -> Result<(), ProtocolError> {
    let invalid = || ProtocolError::InvalidField {
        what: "filename",
        value: name.to_string(),
    };
    if name.is_empty()
        || name.contains(DELIMITER)
        || name.chars().any(char::is_control)
        || name.contains('/')
        || name.contains('\\')
    {
        return Err(invalid());
    }
    let mut comps = Path::new(name).components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(invalid()),
    }
}

/// Client names become the prefix of every storage key they own, so `_` is
/// reserved as the key separator.
pub fn validate_client_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty()
        || name
            .chars()
            .any(|c| c == DELIMITER || c == '_' || c == '/' || c == '\\' || c.is_control())
    {
        return Err(ProtocolError::InvalidField {
            what: "name",
            value: name.to_string(),
        });
    }
    Ok(())
}

fn parse_size(s: &str) -> Result<u64, ProtocolError> {
    s.trim()
        .parse::<u64>()
        .map_err(|_| ProtocolError::InvalidSize(s.to_string()))
}

fn expect_fields(command: &str, args: &[&str], expected: usize) -> Result<(), ProtocolError> {
    // keyword counts as a field
    if args.len() + 1 != expected {
        return Err(ProtocolError::FieldCount {
            command: command.to_string(),
            expected,
            got: args.len() + 1,
        });
    }
    Ok(())
}

/// Commands a client may issue once the handshake has succeeded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Upload { filename: String, size: u64 },
    List,
    Download { owner: String, filename: String },
    Delete { filename: String },
}

impl Request {
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        let (kw, args) = split_fields(frame);
        match kw {
            keyword::UPLOAD => {
                expect_fields(kw, &args, 3)?;
                Ok(Request::Upload {
                    filename: args[0].to_string(),
                    size: parse_size(args[1])?,
                })
            }
            keyword::LIST => {
                expect_fields(kw, &args, 1)?;
                Ok(Request::List)
            }
            keyword::DOWNLOAD => {
                expect_fields(kw, &args, 3)?;
                Ok(Request::Download {
                    owner: args[0].to_string(),
                    filename: args[1].to_string(),
                })
            }
            keyword::DELETE => {
                expect_fields(kw, &args, 2)?;
                Ok(Request::Delete {
                    filename: args[0].to_string(),
                })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        match self {
            Request::Upload { filename, size } => {
                encode_fields(&[keyword::UPLOAD, filename, &size.to_string()])
            }
            Request::List => Ok(keyword::LIST.to_string()),
            Request::Download { owner, filename } => {
                encode_fields(&[keyword::DOWNLOAD, owner, filename])
            }
            Request::Delete { filename } => encode_fields(&[keyword::DELETE, filename]),
        }
    }
}

/// `LIST|<n>` or `DOWNLOAD|<n>`
pub fn announce(kw: &str, size: u64) -> String {
    format!("{kw}|{size}")
}

/// Parse an announce frame for the given keyword, returning the payload size.
pub fn parse_announce(frame: &str, kw: &str) -> Result<u64, ProtocolError> {
    let (got, args) = split_fields(frame);
    if got != kw {
        return Err(ProtocolError::Unexpected(frame.to_string()));
    }
    expect_fields(kw, &args, 2)?;
    parse_size(args[0])
}

pub fn error_reply(msg: impl std::fmt::Display) -> String {
    format!("{}{}", reply::ERROR_PREFIX, msg)
}

/// Server error text without the `Error: ` prefix, if the frame is an error reply.
pub fn error_text(frame: &str) -> Option<&str> {
    frame.strip_prefix(reply::ERROR_PREFIX)
}

pub fn notify_frame(text: &str) -> String {
    format!("{}|{}", keyword::NOTIFY, text)
}

pub fn parse_notify(frame: &str) -> Option<&str> {
    frame
        .strip_prefix(keyword::NOTIFY)
        .and_then(|rest| rest.strip_prefix(DELIMITER))
}

pub async fn write_frame<W>(stream: &mut W, text: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    validate_frame_size(text.len())?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + text.len());
    buf.extend_from_slice(&build_frame_header(text.len() as u32));
    buf.extend_from_slice(text.as_bytes());
    stream
        .write_all(&buf)
        .await
        .map_err(TransferError::Connection)?;
    stream.flush().await.map_err(TransferError::Connection)?;
    Ok(())
}

/// Read as many bytes as fit in `buf`, stopping early only at end of stream.
async fn read_full<R>(stream: &mut R, buf: &mut [u8]) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream
            .read(&mut buf[filled..])
            .await
            .map_err(TransferError::Connection)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Read one text frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(stream: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    let got = read_full(stream, &mut hdr).await?;
    if got == 0 {
        return Ok(None);
    }
    if got < FRAME_HEADER_LEN {
        return Err(TransferError::PeerClosed {
            expected: FRAME_HEADER_LEN as u64,
            received: got as u64,
        });
    }
    let len = parse_frame_header(&hdr);
    validate_frame_size(len)?;
    let mut body = vec![0u8; len];
    let got = read_full(stream, &mut body).await?;
    if got < len {
        return Err(TransferError::PeerClosed {
            expected: len as u64,
            received: got as u64,
        });
    }
    String::from_utf8(body)
        .map(Some)
        .map_err(|_| ProtocolError::NotUtf8.into())
}

/// Stream exactly `total` bytes from a local source to the connection.
///
/// A source that ends before `total` is a local I/O error; the connection is
/// left mid-payload and must not be reused.
pub async fn send_payload<R, W, F>(src: &mut R, dst: &mut W, total: u64, mut progress: F) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    while sent < total {
        let want = (total - sent).min(CHUNK_SIZE as u64) as usize;
        let n = src.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(TransferError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source ended after {sent} of {total} bytes"),
            )));
        }
        dst.write_all(&buf[..n])
            .await
            .map_err(TransferError::Connection)?;
        sent += n as u64;
        progress(sent);
    }
    dst.flush().await.map_err(TransferError::Connection)?;
    Ok(sent)
}

/// Receive exactly `total` bytes from the connection into a local sink.
///
/// If the sink fails the remaining bytes are still consumed so the connection
/// stays aligned on the next frame; the sink error is returned afterwards.
pub async fn receive_payload<R, W, F>(src: &mut R, dst: &mut W, total: u64, mut progress: F) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut received: u64 = 0;
    let mut sink_err: Option<io::Error> = None;
    while received < total {
        let want = (total - received).min(CHUNK_SIZE as u64) as usize;
        let n = src
            .read(&mut buf[..want])
            .await
            .map_err(TransferError::Connection)?;
        if n == 0 {
            return Err(TransferError::PeerClosed {
                expected: total,
                received,
            });
        }
        if sink_err.is_none() {
            if let Err(e) = dst.write_all(&buf[..n]).await {
                sink_err = Some(e);
            }
        }
        received += n as u64;
        progress(received);
    }
    if let Some(e) = sink_err {
        return Err(TransferError::Io(e));
    }
    dst.flush().await?;
    Ok(received)
}

/// Consume and discard an announced payload.
pub async fn drain_payload<R>(src: &mut R, total: u64) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    receive_payload(src, &mut tokio::io::sink(), total, |_| {}).await
}
