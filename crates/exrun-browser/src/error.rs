use thiserror::Error;

/// Errors raised by browser-facing run stages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrowserError {
    #[error("{0}")]
    BuildNotFound(String),
    #[error("{0}")]
    ExtensionNotFound(String),
    #[error("workflow dispatch failed: {0}")]
    Dispatch(String),
    #[error("browser session lost: {0}")]
    SessionFault(String),
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("browser protocol error: {0}")]
    Protocol(String),
    #[error("page evaluation failed: {0}")]
    Evaluation(String),
}

impl BrowserError {
    /// Returns true when the error leaves the run unable to continue.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Dispatch(_))
    }
}
