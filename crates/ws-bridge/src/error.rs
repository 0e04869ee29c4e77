//! Error types for the bridging pipeline.

use std::io;

use thiserror::Error;

/// A listener could not be bound.
#[derive(Debug, Error)]
#[error("failed to bind listener on {addr}")]
pub struct BindError {
    pub addr: String,
    #[source]
    pub source: io::Error,
}

/// An in-place listener reload was rejected.
#[derive(Debug, Error)]
pub enum ReloadError {
    /// The requested spec changes the listener's fundamental mode (its bound
    /// stream transport), which cannot be done without rebinding. The caller
    /// is expected to stop the listener and create a fresh one.
    #[error("can't change a listener's fundamental mode in place")]
    IncompatibleMode,
}

/// The upstream connection could not be established.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("timed out connecting to upstream ircd at {address}")]
    Timeout { address: String },
    #[error("error connecting to upstream ircd at {address}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("upstream address {address:?} is not usable as a TLS server name")]
    ServerName { address: String },
}

/// A PROXY protocol header could not be decoded.
#[derive(Debug, Error)]
pub enum ProxyHeaderError {
    #[error("invalid PROXY protocol signature")]
    InvalidSignature,
    #[error("malformed PROXY v1 header")]
    MalformedV1,
    #[error("malformed PROXY v2 header")]
    MalformedV2,
    #[error("unsupported PROXY protocol version {0}")]
    UnsupportedVersion(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}
