use alloy_primitives::{Address, Bytes, TxHash};
use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::NetworkId,
    protocol::{CallRequest, TransactionReceipt},
};
use tokio::sync::broadcast;

pub mod abi;
pub mod chain_link;
pub mod config;
pub mod error;
pub mod gateway;
pub mod purchase;
pub mod rpc;
pub mod session;
pub mod store;

pub use chain_link::{ChainLink, Signer};
pub use error::{SaleError, WalletError};
pub use gateway::{ContractDirectory, ContractGateway, PendingPurchase, SaleContracts};
pub use purchase::PurchaseOrchestrator;
pub use rpc::{JsonRpcClient, NodeWallet};
pub use session::{SessionController, SessionOptions, SessionView};
pub use store::SaleStateStore;

/// Account and network notifications pushed by a wallet provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(NetworkId),
    Disconnected,
}

/// The user's wallet: account access, network and transaction signing.
#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Prompts for account access; the first account is the active one.
    async fn request_accounts(&self) -> std::result::Result<Vec<Address>, WalletError>;
    async fn chain_id(&self) -> std::result::Result<NetworkId, WalletError>;
    /// Signs and broadcasts. Never retried by callers.
    async fn send_transaction(
        &self,
        transaction: CallRequest,
    ) -> std::result::Result<TxHash, WalletError>;
    async fn disconnect(&self) -> std::result::Result<(), WalletError>;
    fn subscribe_events(&self) -> broadcast::Receiver<WalletEvent>;
}

/// Read access to the ledger.
#[async_trait]
pub trait LedgerTransport: Send + Sync {
    async fn call(&self, request: CallRequest) -> Result<Bytes>;
    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>>;
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
