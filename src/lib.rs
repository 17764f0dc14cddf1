//! Fileshare library
//!
//! Named clients upload, list, download and delete files held by a central
//! server. Every stored file is owned by its uploader.

pub mod cli;
pub mod client;
pub mod clients;
pub mod codec;
pub mod config;
pub mod error;
pub mod logger;
pub mod progress;
pub mod registry;
pub mod server;
pub mod session;

pub use client::{Client, ListingEntry};
pub use error::{ProtocolError, TransferError};
pub use server::Server;
