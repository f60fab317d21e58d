//! Error types for the lease server.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

/// Errors that can occur while loading configuration or serving leases.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system or network I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (settings, lease or device files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed DHCP packet received.
    ///
    /// This includes packets that are too short, have invalid magic cookies,
    /// truncated options, or too many relay hops.
    #[error("Invalid DHCP packet: {0}")]
    InvalidPacket(String),

    /// The DHCP configuration file could not be parsed.
    ///
    /// Parsing stops at the first error; no partial configuration is ever
    /// returned.
    #[error("{source_name}:{line}: {message}")]
    Parse {
        source_name: String,
        line: usize,
        message: String,
    },

    /// Invalid configuration.
    ///
    /// Returned for runtime settings that fail
    /// [`ServerConfig::validate`](crate::ServerConfig::validate) and for
    /// topologies that parse but are inconsistent (overlapping pools, ranges
    /// outside their subnet).
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Socket creation or configuration error.
    ///
    /// Typically occurs when binding to port 67 without administrator privileges,
    /// or when the specified network interface doesn't exist.
    #[error("Socket error: {0}")]
    Socket(String),

    /// A lease or device store failed to read or persist a record.
    #[error("Store error: {0}")]
    Store(String),

    /// A hardware address string could not be parsed.
    #[error("Invalid MAC address: {0}")]
    InvalidMac(String),
}

/// A specialized Result type for lease server operations.
pub type Result<T> = std::result::Result<T, Error>;
