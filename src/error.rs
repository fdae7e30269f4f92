//! Crate-wide error types, one enum per component boundary.

use thiserror::Error;

/// Failures decoding an IPv6 literal or deriving mesh fields from one.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("malformed IPv6 literal: {0:?}")]
    MalformedLiteral(String),

    #[error("prefix length {0} out of range (0..=128)")]
    PrefixLenOutOfRange(u8),

    #[error("sink address requires prefix length >= 96, got {0}")]
    SinkAddrRequiresLongerPrefix(u8),

    #[error("node address requires prefix length == 128, got {0}")]
    NodeAddrRequiresFullPrefix(u8),

    #[error("address derivation requires a /64 prefix, got /{0}")]
    DerivationRequiresPrefix64(u8),
}

pub type AddrResult<T> = std::result::Result<T, AddrError>;

/// Failures decoding the network-config TLV record or the app-config envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TlvError {
    #[error("network config record is empty")]
    Empty,

    #[error("unsupported network config version {0}, expected 0")]
    UnsupportedVersion(u8),

    #[error("network config entry truncated at offset {0}")]
    TruncatedEntry(usize),

    #[error("duplicate prefix entry in network config")]
    DuplicatePrefixEntry,

    #[error("duplicate off-mesh entry in network config")]
    DuplicateOffMeshEntry,

    #[error("app-config envelope entry truncated at offset {0}")]
    TruncatedAppConfigEntry(usize),
}

pub type TlvResult<T> = std::result::Result<T, TlvError>;

/// Failures performing an operating-system networking operation.
#[derive(Debug, Error)]
pub enum OsNetError {
    #[error("command {command:?} failed: {detail}")]
    CommandFailed { command: String, detail: String },

    #[error("netlink operation failed: {0}")]
    Netlink(String),

    #[error("ioctl {name} failed: {source}")]
    Ioctl {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("router advertisement discovery on {interface} failed after {attempts} attempts: {detail}")]
    PrefixDiscoveryFailed {
        interface: String,
        attempts: u32,
        detail: String,
    },

    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type OsNetResult<T> = std::result::Result<T, OsNetError>;

/// Failures attaching a sink endpoint.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink {0} stack not started yet")]
    StackNotStarted(String),

    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error(transparent)]
    OsNet(#[from] OsNetError),

    #[error("mesh SDK error on sink {sink_id}: {detail}")]
    Mesh { sink_id: String, detail: String },
}

pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Top-level configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("malformed off_mesh_service address {0:?}: {1}")]
    MalformedOffMeshService(String, AddrError),
}
