use std::io;

use thiserror::Error;

/// The error type returned by the server and the URI parser.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid URI: {0}")]
    InvalidUri(String),
    #[error("could not resolve {0} to an address")]
    Resolve(String),
    #[error("failed to bind listening socket: {0}")]
    Bind(io::Error),
    #[error("failed to listen on socket: {0}")]
    Listen(io::Error),
    #[error("failed to set up TLS context: {0}")]
    TlsInit(#[from] openssl::error::ErrorStack),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
    #[error("failed to read request: {0}")]
    Read(io::Error),
    #[error("failed to write response: {0}")]
    Write(io::Error),
    #[error("accept_clients() called while already accepting clients")]
    AlreadyRunning,
    #[error("invalid state for this operation")]
    BadState,
}

pub type Result<T> = std::result::Result<T, Error>;
