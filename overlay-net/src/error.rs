//! Error types for the overlay messaging layer.

use {crate::port::PortKind, thiserror::Error};

/// Errors that can occur in the overlay messaging layer.
#[derive(Error, Debug)]
pub enum OverlayError {
    /// A malformed envelope or payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failed to (de)serialize the binary envelope.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Failed to (de)serialize a structured payload.
    #[error("payload encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge {
        /// Actual frame size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Transport-level I/O error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A non-blocking receive found the port empty.
    #[error("operation would block")]
    WouldBlock,

    /// A send found the port's buffer full.
    #[error("{0} port full")]
    PortFull(PortKind),

    /// The far end of a port has gone away.
    #[error("{0} port closed")]
    PortClosed(PortKind),

    /// The remote service answered with a nonzero error code.
    #[error("remote error: errnum {errnum}")]
    Remote {
        /// Error number carried by the response.
        errnum: i32,
    },

    /// The configuration is inconsistent.
    #[error("invalid overlay configuration: {0}")]
    InvalidConfig(String),

    /// The caller passed an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The key-value store backend failed.
    #[error("store error: {0}")]
    Store(String),
}

impl OverlayError {
    /// POSIX error number for this error, as carried in a RESPONSE.
    pub fn errnum(&self) -> i32 {
        match self {
            Self::Protocol(_) | Self::Serialization(_) | Self::Json(_) => libc::EPROTO,
            Self::MessageTooLarge { .. } => libc::EMSGSIZE,
            Self::Transport(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::WouldBlock | Self::PortFull(_) => libc::EAGAIN,
            Self::PortClosed(_) => libc::ECONNRESET,
            Self::Remote { errnum } => *errnum,
            Self::InvalidConfig(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::Store(_) => libc::EIO,
        }
    }

    /// Whether this is a malformed-message error that should be dropped
    /// rather than propagated.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::Serialization(_) | Self::Json(_)
        )
    }
}

/// Convenience result type for overlay operations.
pub type Result<T> = std::result::Result<T, OverlayError>;
