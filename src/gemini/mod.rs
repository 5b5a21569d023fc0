//! An embeddable Gemini protocol server.
//!
//! The server owns the TLS listener, request parsing, response framing and
//! connection lifecycle; the host application supplies a [`Handler`] that
//! turns a request [`Uri`] and [`Client`] into a [`Response`].

/// Per-connection peer information.
mod client;
/// The error type returned by this module.
mod error;
/// Response codes and response bodies.
mod response;
/// The listener, the per-connection state machine and the server lifecycle.
pub mod server;
/// Server-side TLS configuration and peer certificate helpers.
pub(crate) mod tls;
/// Parse and validate Gemini request URIs.
mod uri;

pub use client::Client;
pub use error::{Error, Result};
pub use response::{Body, Response, ResponseCode};
pub use server::{Handler, Server, DEFAULT_GEMINI_PORT, DEFAULT_MAX_PARALLEL_CONNECTIONS};
pub use uri::Uri;
