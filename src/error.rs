//! Crate-wide error type. Handlers match on these variants to decide which
//! SIP status code (if any) to emit; see `SPEC_FULL.md` §7.

use std::net::SocketAddr;

use thiserror::Error;

use crate::message::Method;

/// Every fallible operation in this crate returns `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to parse SIP message: {0}")]
    ParseError(String),

    #[error("digest authentication failed")]
    AuthError,

    #[error("no live bindings for {0}")]
    NotRegistered(String),

    #[error("next hop resolves back to this server")]
    LoopDetected,

    #[error("network unreachable sending to {addr}: {source}")]
    NetworkUnreachable {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Max-Forwards exceeded")]
    MaxForwardsExceeded,

    #[error("could not resolve a next hop")]
    NoRoute,

    #[error("method {0:?} could not be forwarded")]
    GenericForwardError(Method),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("WAV decode error: {0}")]
    Wav(#[from] hound::Error),

    #[error("config key {0} is read-only or unknown")]
    ConfigKeyRejected(String),

    #[error("auto-dialer not running")]
    DialerNotRunning,
}
