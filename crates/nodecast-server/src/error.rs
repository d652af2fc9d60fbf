//! Server-level errors.

/// Errors raised while starting or running the listeners.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A listener could not bind its address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested `host:port`.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// `listen` was called on a disposer that is already listening.
    #[error("listeners already started")]
    AlreadyListening,
    /// Other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
