use std::{collections::HashMap, sync::Arc, time::Duration};

use alloy_primitives::{Address, Bytes, TxHash, U256};
use anyhow::{anyhow, Context};
use shared::{
    domain::{NetworkId, SaleParams},
    protocol::{CallRequest, DeploymentFile},
};
use tracing::{debug, info, warn};

use crate::{
    abi::{self, BALANCE_OF, BUY_TOKENS, MAX_TOKENS, PRICE, TOKENS_SOLD},
    chain_link::Signer,
    error::{SaleError, WalletError},
    LedgerTransport,
};

const DEFAULT_RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const GENERIC_REVERT_REASON: &str = "transaction reverted by the sale contract";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaleContracts {
    pub token: Address,
    pub sale: Address,
}

/// Static mapping from network id to the deployed token and sale contracts.
#[derive(Debug, Clone, Default)]
pub struct ContractDirectory {
    networks: HashMap<NetworkId, SaleContracts>,
}

impl ContractDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network(mut self, network_id: NetworkId, contracts: SaleContracts) -> Self {
        self.networks.insert(network_id, contracts);
        self
    }

    pub fn from_deployments(file: &DeploymentFile) -> anyhow::Result<Self> {
        let mut directory = Self::new();
        for (key, deployment) in file {
            let network_id = key
                .trim()
                .parse::<u64>()
                .with_context(|| format!("network key '{key}' is not a numeric chain id"))?;
            directory.networks.insert(
                NetworkId(network_id),
                SaleContracts {
                    token: deployment.token.address,
                    sale: deployment.crowdsale.address,
                },
            );
        }
        if directory.networks.is_empty() {
            return Err(anyhow!("deployment file lists no networks"));
        }
        Ok(directory)
    }

    pub fn resolve(&self, network_id: NetworkId) -> Result<SaleContracts, SaleError> {
        self.networks
            .get(&network_id)
            .copied()
            .ok_or(SaleError::UnsupportedNetwork(network_id))
    }

    pub fn supports(&self, network_id: NetworkId) -> bool {
        self.networks.contains_key(&network_id)
    }

    pub fn networks(&self) -> impl Iterator<Item = NetworkId> + '_ {
        self.networks.keys().copied()
    }
}

/// Typed access to the token and sale contracts. Handles are resolved per
/// call from the network id, never cached across identity changes.
pub struct ContractGateway {
    directory: ContractDirectory,
    transport: Arc<dyn LedgerTransport>,
    receipt_poll_interval: Duration,
}

impl ContractGateway {
    pub fn new(directory: ContractDirectory, transport: Arc<dyn LedgerTransport>) -> Self {
        Self {
            directory,
            transport,
            receipt_poll_interval: DEFAULT_RECEIPT_POLL_INTERVAL,
        }
    }

    pub fn with_receipt_poll_interval(mut self, interval: Duration) -> Self {
        self.receipt_poll_interval = interval;
        self
    }

    pub fn directory(&self) -> &ContractDirectory {
        &self.directory
    }

    pub fn resolve(&self, network_id: NetworkId) -> Result<SaleHandle<'_>, SaleError> {
        let contracts = self.directory.resolve(network_id)?;
        Ok(SaleHandle {
            gateway: self,
            network_id,
            contracts,
        })
    }
}

/// Contracts bound to one network.
pub struct SaleHandle<'a> {
    gateway: &'a ContractGateway,
    network_id: NetworkId,
    contracts: SaleContracts,
}

impl SaleHandle<'_> {
    pub fn network_id(&self) -> NetworkId {
        self.network_id
    }

    pub fn contracts(&self) -> SaleContracts {
        self.contracts
    }

    pub async fn read_balance(&self, account: Address) -> Result<U256, SaleError> {
        let data = abi::encode_call(BALANCE_OF, &[abi::address_word(account)]);
        self.read_uint(self.contracts.token, data, BALANCE_OF).await
    }

    /// Price, cap and sold counter, fetched concurrently as one batch.
    pub async fn read_sale_params(&self) -> Result<SaleParams, SaleError> {
        let sale = self.contracts.sale;
        let (price_wei, max_tokens_wei, tokens_sold_wei) = futures::try_join!(
            self.read_uint(sale, abi::encode_call(PRICE, &[]), PRICE),
            self.read_uint(sale, abi::encode_call(MAX_TOKENS, &[]), MAX_TOKENS),
            self.read_uint(sale, abi::encode_call(TOKENS_SOLD, &[]), TOKENS_SOLD),
        )?;
        Ok(SaleParams {
            price_wei,
            max_tokens_wei,
            tokens_sold_wei,
        })
    }

    pub async fn buy_tokens(
        &self,
        signer: &Signer,
        token_amount_wei: U256,
        eth_value_wei: U256,
    ) -> Result<PendingPurchase, SaleError> {
        let transaction = CallRequest {
            from: Some(signer.account()),
            to: self.contracts.sale,
            data: abi::encode_call(BUY_TOKENS, &[abi::uint_word(token_amount_wei)]),
            value: Some(eth_value_wei),
        };

        let hash = signer
            .send_transaction(transaction)
            .await
            .map_err(|err| match err {
                WalletError::UserRejected => {
                    SaleError::SubmissionRejected("user declined to sign the purchase".into())
                }
                WalletError::Reverted(reason) => SaleError::TransactionReverted(reason),
                WalletError::Unavailable(message) => SaleError::Rpc(message),
            })?;

        info!(
            network_id = self.network_id.0,
            account = %signer.account(),
            %token_amount_wei,
            %eth_value_wei,
            tx_hash = %hash,
            "sale: purchase broadcast"
        );

        Ok(PendingPurchase {
            hash,
            transport: Arc::clone(&self.gateway.transport),
            poll_interval: self.gateway.receipt_poll_interval,
        })
    }

    async fn read_uint(
        &self,
        to: Address,
        data: Bytes,
        method: &'static str,
    ) -> Result<U256, SaleError> {
        let raw = self
            .gateway
            .transport
            .call(CallRequest::read(to, data))
            .await
            .map_err(|err| SaleError::Rpc(format!("{method}: {err:#}")))?;
        let value =
            abi::decode_uint(&raw).map_err(|err| SaleError::Rpc(format!("{method}: {err}")))?;
        debug!(network_id = self.network_id.0, method, %value, "sale: contract read");
        Ok(value)
    }
}

/// A broadcast purchase awaiting inclusion.
pub struct PendingPurchase {
    hash: TxHash,
    transport: Arc<dyn LedgerTransport>,
    poll_interval: Duration,
}

impl PendingPurchase {
    pub fn hash(&self) -> TxHash {
        self.hash
    }

    /// Polls for the receipt until it arrives or `timeout` elapses. A timeout
    /// says nothing about the ledger-side outcome.
    pub async fn wait(self, timeout: Duration) -> Result<TxHash, SaleError> {
        let hash = self.hash;
        let poll = async {
            loop {
                match self.transport.transaction_receipt(hash).await {
                    Ok(Some(receipt)) if receipt.succeeded() => return Ok(hash),
                    Ok(Some(_)) => {
                        return Err(SaleError::TransactionReverted(
                            GENERIC_REVERT_REASON.to_string(),
                        ))
                    }
                    Ok(None) => {}
                    Err(err) => warn!(tx_hash = %hash, "sale: receipt lookup failed: {err:#}"),
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| SaleError::ConfirmationTimeout(hash))?
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
