use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kinds surfaced to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UserRejected,
    UnsupportedNetwork,
    NotConnected,
    RefreshFailed,
    InvalidAmount,
    SubmissionRejected,
    TransactionReverted,
    ConfirmationTimeout,
    PurchaseInProgress,
    Internal,
}

impl ErrorCode {
    /// Whether a background retry may clear this error without user action.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::RefreshFailed | Self::Internal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct SessionError {
    pub code: ErrorCode,
    pub message: String,
}

impl SessionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
