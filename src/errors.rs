use thiserror::Error;

use crate::transport::NodeId;

/// Errors surfaced by the relay, OTA and transport layers.
#[derive(Debug, Error)]
pub enum QuakeError {
    /// Wrapper around JSON encode/decode errors.
    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Wrapper around IO errors (serial port, staging files, sockets).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapper around HTTP client errors (manifest, firmware, telemetry).
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A transport adapter refused or failed to send a payload.
    #[error("transport send failed: {0}")]
    Transport(String),

    /// The manifest could not be fetched or did not parse.
    #[error("manifest unavailable: {0}")]
    Manifest(String),

    /// The manifest carries no firmware asset for a role.
    #[error("no firmware asset for role {0}")]
    NoFirmware(String),

    /// Firmware download failed or produced an empty image.
    #[error("firmware download failed: {0}")]
    Download(String),

    /// Computed digest did not match the manifest reference digest.
    #[error("sha256 mismatch: expected {expected}, computed {computed}")]
    DigestMismatch { expected: String, computed: String },

    /// Flash-update sink failure on the receiving node.
    #[error("flash sink error: {0}")]
    Flash(String),

    /// A session is already open for the node.
    #[error("ota session already active for node {0}")]
    SessionActive(NodeId),

    /// The node has never been seen by this gateway.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// Configuration value rejected at load time.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The management loop is gone (shutdown in progress).
    #[error("gateway loop unavailable")]
    LoopClosed,
}

pub type QuakeResult<T> = std::result::Result<T, QuakeError>;
