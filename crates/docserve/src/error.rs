use crate::plugin::channel::ChannelError;

/// Unified error type for the docserve crate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Invalid input provided by the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker process could not be started or reached.
    #[error("failed to spawn plugin worker: {0}")]
    Spawn(String),

    /// A step of the hello → load → manifest handshake failed.
    #[error("plugin host handshake failed at {stage}: {source}")]
    Handshake {
        stage: &'static str,
        #[source]
        source: ChannelError,
    },

    /// A module specifier could not be resolved or imported.
    #[error("module load failed: {0}")]
    ModuleLoad(String),

    #[error("config error: {0}")]
    Config(String),
}

/// Result type alias using [`CoreError`].
pub type CoreResult<T> = Result<T, CoreError>;
