use crate::wisp::CloseReason;
use thiserror::Error;

/// Coarse classification callers branch on instead of matching message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    EngineLoad,
    Throttled,
    Transport,
    InvalidRequest,
    RetriesExhausted,
    Config,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to load TLS engine: {0}")]
    EngineLoad(String),

    #[error("Wisp server closed: Throttled")]
    Throttled,

    #[error("Wisp server closed: {0}")]
    Closed(CloseReason),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("too many redirects (limit {0})")]
    TooManyRedirects(usize),

    #[error("still throttled after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("invalid tunnel configuration: {0}")]
    Config(String),
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::EngineLoad(_) => ErrorKind::EngineLoad,
            TunnelError::Throttled => ErrorKind::Throttled,
            TunnelError::Closed(_) | TunnelError::Transport(_) => ErrorKind::Transport,
            TunnelError::InvalidRequest(_) | TunnelError::TooManyRedirects(_) => {
                ErrorKind::InvalidRequest
            }
            TunnelError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            TunnelError::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn transport(err: impl std::fmt::Display) -> Self {
        TunnelError::Transport(err.to_string())
    }

    /// Engine failures carry the whole anyhow context chain.
    pub(crate) fn engine(err: anyhow::Error) -> Self {
        TunnelError::EngineLoad(format!("{err:#}"))
    }
}

impl From<CloseReason> for TunnelError {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Throttled => TunnelError::Throttled,
            other => TunnelError::Closed(other),
        }
    }
}
