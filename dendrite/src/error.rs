use crate::mgmt::Word;
use thiserror::Error;

pub type RunResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The executable is malformed (e.g. more than one node config, or a
    /// non-head-node entry). Raised from `initialize`.
    #[error("invalid executable: {0}")]
    Config(String),

    /// An unexpected token was received on a channel.
    #[error("unexpected token {word} on channel {port}")]
    Protocol { port: String, word: Word },

    /// An operation was invoked in a state that does not support it.
    #[error("{0}")]
    Usage(String),

    /// One or more workers terminated with an exception. The individual
    /// diagnostics are logged when the actors are joined.
    #[error("{count} exception(s) occurred during execution")]
    WorkerExceptions { count: usize },

    /// The peer endpoint of a channel is gone.
    #[error("channel {port} disconnected")]
    ChannelClosed { port: String },
}
