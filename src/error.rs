//! Error types for the cache.

use thiserror::Error;

/// Main error type for the cache.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A cache group with this name already exists
    #[error("Cache group already exists: {0}")]
    GroupExists(String),

    /// A peer picker was already registered on this group
    #[error("Peer picker already registered for group: {0}")]
    PeerPickerAlreadyRegistered(String),

    /// Registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Peer transport error
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// General error
    #[error("{0}")]
    General(String),
}

/// Errors from the service-registry plane.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// Could not reach the coordination store
    #[error("Connection error: {0}")]
    Connection(String),

    /// Backend operation failed
    #[error("Backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// Service registration failed
    #[error("Registration failed: {0}")]
    Registration(String),
}

/// Errors from a remote peer call.
///
/// These never escape the cache group's public operations; a failed peer
/// call degrades to absent/false there. They are visible from
/// [`crate::peers::PeerClient::connect`], which is free to fail.
#[derive(Error, Debug)]
pub enum PeerError {
    /// The remote did not answer within the deadline
    #[error("Peer timed out: {0}")]
    Timeout(String),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote answered with an unexpected status
    #[error("Unexpected status {status} from {addr}")]
    Status {
        /// HTTP status code returned by the remote
        status: u16,
        /// Remote address
        addr: String,
    },

    /// The remote was unreachable at construction time
    #[error("Peer unreachable: {0}")]
    Unreachable(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
