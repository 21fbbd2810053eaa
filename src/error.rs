//! Error types for sdns.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use hickory_proto::error::ProtoError;
use thiserror::Error;

/// Errors that stop the proxy from loading or serving.
#[derive(Debug, Error)]
pub enum Error {
    /// Config file could not be read.
    #[error("failed to read config file {}: {source}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Config file is not valid TOML or has the wrong shape.
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The upstream list is empty.
    #[error("no forward server")]
    NoUpstream,

    /// A pattern rule is not a valid regular expression.
    #[error("invalid pattern rule {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// A rule target is neither an IPv4 address nor `self`.
    #[error("invalid target {target:?} for rule {rule:?}: expected an IPv4 address or \"self\"")]
    InvalidTarget { rule: String, target: String },

    /// None of the probe targets yielded a local IPv4 address.
    #[error("get self ip failed")]
    SelfAddrUnavailable,

    /// A listener could not be bound, or other socket failure.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// DNS message could not be encoded.
    #[error("DNS protocol error: {0}")]
    Proto(#[from] ProtoError),

    /// A listener task ended while the proxy was serving.
    #[error("{0} listener stopped")]
    ListenerStopped(&'static str),
}

/// Failure of a single exchange with one upstream.
///
/// The forwarder recovers from these by moving on to the next upstream.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("response id {got} does not match query id {expected}")]
    IdMismatch { expected: u16, got: u16 },

    #[error("malformed message: {0}")]
    Malformed(String),
}
