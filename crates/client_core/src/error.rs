use alloy_primitives::{Address, TxHash};
use shared::{
    domain::NetworkId,
    error::{ErrorCode, SessionError},
    units::UnitsError,
};
use thiserror::Error;

/// Failures of the sale client. Remote failures are converted into one of
/// these at the component that made the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaleError {
    #[error("wallet request was rejected by the user")]
    UserRejected,
    #[error("network {0} has no sale deployment")]
    UnsupportedNetwork(NetworkId),
    #[error("no wallet account is connected")]
    NotConnected,
    #[error("failed to refresh sale state: {0}")]
    Refresh(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("purchase was not submitted: {0}")]
    SubmissionRejected(String),
    #[error("transaction reverted: {0}")]
    TransactionReverted(String),
    #[error("transaction {0} was not confirmed before the timeout")]
    ConfirmationTimeout(TxHash),
    #[error("a purchase is already in progress for {0}")]
    PurchaseInProgress(Address),
    #[error("ledger request failed: {0}")]
    Rpc(String),
}

impl SaleError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UserRejected => ErrorCode::UserRejected,
            Self::UnsupportedNetwork(_) => ErrorCode::UnsupportedNetwork,
            Self::NotConnected => ErrorCode::NotConnected,
            Self::Refresh(_) => ErrorCode::RefreshFailed,
            Self::InvalidAmount(_) => ErrorCode::InvalidAmount,
            Self::SubmissionRejected(_) => ErrorCode::SubmissionRejected,
            Self::TransactionReverted(_) => ErrorCode::TransactionReverted,
            Self::ConfirmationTimeout(_) => ErrorCode::ConfirmationTimeout,
            Self::PurchaseInProgress(_) => ErrorCode::PurchaseInProgress,
            Self::Rpc(_) => ErrorCode::Internal,
        }
    }

    pub fn to_session_error(&self) -> SessionError {
        SessionError::new(self.code(), self.to_string())
    }
}

impl From<UnitsError> for SaleError {
    fn from(value: UnitsError) -> Self {
        Self::InvalidAmount(value.to_string())
    }
}

/// Failures reported by a wallet provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WalletError {
    #[error("user rejected the request")]
    UserRejected,
    #[error("execution reverted: {0}")]
    Reverted(String),
    #[error("wallet unavailable: {0}")]
    Unavailable(String),
}
