//! JSON-RPC adapters: a ledger transport over HTTP and a wallet backed by
//! node-managed accounts.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use alloy_primitives::{Address, Bytes, TxHash, U64};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use shared::{
    domain::NetworkId,
    protocol::{CallRequest, RpcRequest, RpcResponse, TransactionReceipt},
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use url::Url;

use crate::{abi, error::WalletError, LedgerTransport, WalletEvent, WalletProvider};

/// EIP-1193 "user rejected request".
pub const USER_REJECTED_CODE: i64 = 4001;
pub const METHOD_NOT_FOUND_CODE: i64 = -32601;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("failed to decode {method} result: {source}")]
    Decode {
        method: String,
        source: serde_json::Error,
    },
}

impl RpcError {
    pub fn remote_code(&self) -> Option<i64> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Reason carried by an execution-revert error, if the node reported one.
    pub fn revert_reason(&self) -> Option<String> {
        let Self::Remote { message, data, .. } = self else {
            return None;
        };
        let decoded = data
            .as_ref()
            .and_then(revert_data)
            .and_then(|bytes| abi::decode_revert_reason(&bytes));
        if decoded.is_some() {
            return decoded;
        }
        message
            .to_ascii_lowercase()
            .contains("revert")
            .then(|| message.clone())
    }
}

fn revert_data(data: &Value) -> Option<Bytes> {
    match data {
        Value::String(_) => serde_json::from_value(data.clone()).ok(),
        Value::Object(fields) => fields.get("data").and_then(revert_data),
        _ => None,
    }
}

pub struct JsonRpcClient {
    http: Client,
    url: Url,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: Url) -> Self {
        Self {
            http: Client::new(),
            url,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> std::result::Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, method, "rpc: request");
        let response: RpcResponse = self
            .http
            .post(self.url.clone())
            .json(&RpcRequest::new(id, method, params))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(RpcError::Remote {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        serde_json::from_value(response.result.unwrap_or(Value::Null)).map_err(|source| {
            RpcError::Decode {
                method: method.to_string(),
                source,
            }
        })
    }
}

#[async_trait]
impl LedgerTransport for JsonRpcClient {
    async fn call(&self, request: CallRequest) -> Result<Bytes> {
        Ok(self.request("eth_call", json!([request, "latest"])).await?)
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>> {
        Ok(self
            .request("eth_getTransactionReceipt", json!([hash]))
            .await?)
    }
}

/// Wallet over accounts managed by the node itself (development chains).
pub struct NodeWallet {
    rpc: Arc<JsonRpcClient>,
    events: broadcast::Sender<WalletEvent>,
}

impl NodeWallet {
    pub fn new(rpc: Arc<JsonRpcClient>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self { rpc, events }
    }
}

fn wallet_error(err: RpcError) -> WalletError {
    if err.remote_code() == Some(USER_REJECTED_CODE) {
        return WalletError::UserRejected;
    }
    match err.revert_reason() {
        Some(reason) => WalletError::Reverted(reason),
        None => WalletError::Unavailable(err.to_string()),
    }
}

#[async_trait]
impl WalletProvider for NodeWallet {
    async fn request_accounts(&self) -> std::result::Result<Vec<Address>, WalletError> {
        match self.rpc.request("eth_requestAccounts", json!([])).await {
            Ok(accounts) => Ok(accounts),
            Err(err) if err.remote_code() == Some(METHOD_NOT_FOUND_CODE) => self
                .rpc
                .request("eth_accounts", json!([]))
                .await
                .map_err(wallet_error),
            Err(err) => Err(wallet_error(err)),
        }
    }

    async fn chain_id(&self) -> std::result::Result<NetworkId, WalletError> {
        let chain_id: U64 = self
            .rpc
            .request("eth_chainId", json!([]))
            .await
            .map_err(wallet_error)?;
        Ok(NetworkId(chain_id.to::<u64>()))
    }

    async fn send_transaction(
        &self,
        transaction: CallRequest,
    ) -> std::result::Result<TxHash, WalletError> {
        self.rpc
            .request("eth_sendTransaction", json!([transaction]))
            .await
            .map_err(|err| {
                warn!("rpc: eth_sendTransaction failed: {err}");
                wallet_error(err)
            })
    }

    async fn disconnect(&self) -> std::result::Result<(), WalletError> {
        let _ = self.events.send(WalletEvent::Disconnected);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/rpc_tests.rs"]
mod tests;
