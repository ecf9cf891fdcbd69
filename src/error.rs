use std::net::SocketAddr;

use thiserror::Error;
use uuid::Uuid;

/// Reasons a byte buffer is not a valid BF-2300 frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than one fixed-size frame
    #[error("frame too short: {len} bytes, expected {expected}")]
    TooShort { len: usize, expected: usize },

    /// Start marker is not 0xF0F0
    #[error("bad start marker {0:#06x}")]
    BadStartMarker(u16),

    /// End marker is not 0xF0F0
    #[error("bad end marker {0:#06x}")]
    BadEndMarker(u16),

    /// Trailing checksum byte does not match the sum of the preceding bytes
    #[error("checksum mismatch: frame carries {found:#04x}, computed {computed:#04x}")]
    Checksum { found: u8, computed: u8 },

    /// Caller tried to encode a data block longer than 32 bytes
    #[error("payload block is {len} bytes, maximum is {max}")]
    PayloadTooLong { len: usize, max: usize },
}

/// Application level error type used throughout the crate.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Malformed frame on the wire
    #[error("Frame format error: {0}")]
    Frame(#[from] FrameError),

    /// TCP connect did not complete within the connect timeout
    #[error("Connect timeout to {addr}")]
    ConnectTimeout { addr: SocketAddr },

    /// No complete response frame within the read timeout
    #[error("Read timeout from {addr}")]
    ReadTimeout { addr: SocketAddr },

    /// Box actively refused the connection
    #[error("Connection refused by {addr}")]
    ConnectionRefused { addr: SocketAddr },

    /// Any other transport failure (reset, unreachable network, early EOF)
    #[error("Network error talking to {addr}: {message}")]
    Network { addr: SocketAddr, message: String },

    /// Valid frame carrying a command this engine does not consume
    #[error("Unknown command {0:#06x}")]
    UnknownCommand(u16),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Alarm store write or read failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// I/O related failure outside the box transport
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error while parsing YAML configuration files
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error while encoding or decoding stored alarm records
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Alarm not found: {0}")]
    AlarmNotFound(Uuid),

    /// Alarm exists but has already been resolved
    #[error("Alarm {0} is resolved and can no longer change")]
    AlarmClosed(Uuid),

    #[error("Box not found: {0}")]
    BoxNotFound(String),

    #[error("Site not found: {0}")]
    SiteNotFound(String),
}

impl MonitorError {
    /// True for failures that belong to a single box's poll cycle.
    ///
    /// These only ever bump that box's failure counter; they never touch pin
    /// or alarm state.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            MonitorError::Frame(_)
                | MonitorError::ConnectTimeout { .. }
                | MonitorError::ReadTimeout { .. }
                | MonitorError::ConnectionRefused { .. }
                | MonitorError::Network { .. }
                | MonitorError::UnknownCommand(_)
        )
    }

    /// Short machine-friendly label, used for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorError::Frame(_) => "frame_format",
            MonitorError::ConnectTimeout { .. } => "connect_timeout",
            MonitorError::ReadTimeout { .. } => "read_timeout",
            MonitorError::ConnectionRefused { .. } => "connection_refused",
            MonitorError::Network { .. } => "network",
            MonitorError::UnknownCommand(_) => "unknown_command",
            MonitorError::Config(_) => "configuration",
            MonitorError::Persistence(_) => "persistence",
            MonitorError::Io(_) => "io",
            MonitorError::Yaml(_) => "yaml",
            MonitorError::Json(_) => "json",
            MonitorError::AlarmNotFound(_) => "alarm_not_found",
            MonitorError::AlarmClosed(_) => "alarm_closed",
            MonitorError::BoxNotFound(_) => "box_not_found",
            MonitorError::SiteNotFound(_) => "site_not_found",
        }
    }
}

/// Convenient alias over [`Result`] using [`MonitorError`]
pub type Result<T> = std::result::Result<T, MonitorError>;
