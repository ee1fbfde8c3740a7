use alloy_primitives::{Address, TxHash, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(NetworkId);

/// Wallet account and network as currently observed by the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<NetworkId>,
}

impl Identity {
    pub fn new(account: Option<Address>, network_id: Option<NetworkId>) -> Self {
        Self {
            account,
            network_id,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.account.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleParams {
    pub price_wei: U256,
    pub max_tokens_wei: U256,
    pub tokens_sold_wei: U256,
}

/// One refresh cycle's worth of sale data. Never mutated after construction;
/// the store swaps whole snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleState {
    pub cycle: u64,
    pub identity: Identity,
    pub price_wei: U256,
    pub max_tokens_wei: U256,
    pub tokens_sold_wei: U256,
    /// Only read when the identity carries an account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_balance_wei: Option<U256>,
    pub refreshed_at: DateTime<Utc>,
}

impl SaleState {
    pub fn empty(cycle: u64, identity: Identity, refreshed_at: DateTime<Utc>) -> Self {
        Self {
            cycle,
            identity,
            price_wei: U256::ZERO,
            max_tokens_wei: U256::ZERO,
            tokens_sold_wei: U256::ZERO,
            account_balance_wei: None,
            refreshed_at,
        }
    }

    pub fn from_reads(
        cycle: u64,
        identity: Identity,
        params: SaleParams,
        account_balance_wei: U256,
        refreshed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            cycle,
            identity,
            price_wei: params.price_wei,
            max_tokens_wei: params.max_tokens_wei,
            tokens_sold_wei: params.tokens_sold_wei,
            account_balance_wei: Some(account_balance_wei),
            refreshed_at,
        }
    }

    pub fn params(&self) -> SaleParams {
        SaleParams {
            price_wei: self.price_wei,
            max_tokens_wei: self.max_tokens_wei,
            tokens_sold_wei: self.tokens_sold_wei,
        }
    }

    /// Share of the cap already sold, in percent with two decimals of precision.
    /// A zero cap reports 0; an oversold sale reports more than 100.
    pub fn progress_percent(&self) -> f64 {
        if self.max_tokens_wei.is_zero() {
            return 0.0;
        }
        let basis_points = self
            .tokens_sold_wei
            .saturating_mul(U256::from(10_000u64))
            / self.max_tokens_wei;
        let basis_points = u64::try_from(basis_points).unwrap_or(u64::MAX);
        basis_points as f64 / 100.0
    }

    pub fn is_oversold(&self) -> bool {
        self.tokens_sold_wei > self.max_tokens_wei
    }
}

/// A validated purchase, created per submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseRequest {
    pub token_amount: String,
    pub token_amount_wei: U256,
    pub derived_eth_value_wei: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PurchaseOutcome {
    Confirmed(TxHash),
    Rejected(String),
    Reverted(String),
}

impl PurchaseOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Self::Confirmed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Disconnected,
    Connecting,
    Ready,
    Refreshing,
    Error,
}

/// `0x1234...abcd` rendering of an account for compact labels.
pub fn short_address(address: &Address) -> String {
    let full = address.to_string();
    format!("{}...{}", &full[..6], &full[full.len() - 4..])
}
