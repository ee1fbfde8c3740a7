use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use alloy_primitives::{Address, U256};
use shared::{
    domain::{PurchaseOutcome, PurchaseRequest},
    units::{parse_units, pow10, ETHER_DECIMALS},
};
use tracing::{info, warn};

use crate::{
    chain_link::{ChainLink, Signer},
    error::SaleError,
    gateway::{ContractGateway, SaleHandle},
    store::SaleStateStore,
};

/// Validates `amount` and derives the wei values for a purchase at `price_wei`
/// (wei per whole token). The value is truncated to whole wei.
pub fn prepare_purchase(amount: &str, price_wei: U256) -> Result<PurchaseRequest, SaleError> {
    let token_amount_wei = parse_units(amount, ETHER_DECIMALS)?;
    if token_amount_wei.is_zero() {
        return Err(SaleError::InvalidAmount(
            "amount must be greater than zero".into(),
        ));
    }
    let derived_eth_value_wei = token_amount_wei
        .checked_mul(price_wei)
        .ok_or_else(|| SaleError::InvalidAmount("amount is too large".into()))?
        / pow10(ETHER_DECIMALS);

    Ok(PurchaseRequest {
        token_amount: amount.trim().to_string(),
        token_amount_wei,
        derived_eth_value_wei,
    })
}

/// Runs purchases one at a time per account.
pub struct PurchaseOrchestrator {
    chain: Arc<ChainLink>,
    gateway: Arc<ContractGateway>,
    store: Arc<SaleStateStore>,
    confirmation_timeout: Duration,
    in_flight: Mutex<HashSet<Address>>,
}

impl PurchaseOrchestrator {
    pub fn new(
        chain: Arc<ChainLink>,
        gateway: Arc<ContractGateway>,
        store: Arc<SaleStateStore>,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            gateway,
            store,
            confirmation_timeout,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.lock_in_flight().is_empty()
    }

    /// Validates, submits and confirms one purchase, then refreshes the sale
    /// state whatever the outcome. The submission itself is never retried.
    pub async fn buy(
        &self,
        amount: &str,
        current_price_wei: U256,
    ) -> Result<PurchaseOutcome, SaleError> {
        let request = prepare_purchase(amount, current_price_wei)?;

        let identity = self.chain.current_identity().await;
        let (Some(signer), Some(network_id)) = (self.chain.signer().await, identity.network_id)
        else {
            return Err(SaleError::NotConnected);
        };
        let _claim = self.claim(signer.account())?;
        let sale = self.gateway.resolve(network_id)?;

        let result = self.submit(&sale, &signer, &request).await;
        match &result {
            Ok(outcome) => info!(account = %signer.account(), ?outcome, "sale: purchase finished"),
            Err(err) => warn!(account = %signer.account(), "sale: purchase failed: {err}"),
        }

        let identity = self.chain.current_identity().await;
        if let Err(err) = self.store.refresh(&identity).await {
            warn!("sale: refresh after purchase failed: {err}");
        }

        result
    }

    async fn submit(
        &self,
        sale: &SaleHandle<'_>,
        signer: &Signer,
        request: &PurchaseRequest,
    ) -> Result<PurchaseOutcome, SaleError> {
        let pending = match sale
            .buy_tokens(
                signer,
                request.token_amount_wei,
                request.derived_eth_value_wei,
            )
            .await
        {
            Ok(pending) => pending,
            Err(SaleError::SubmissionRejected(reason)) => {
                return Ok(PurchaseOutcome::Rejected(reason))
            }
            Err(SaleError::TransactionReverted(reason)) => {
                return Ok(PurchaseOutcome::Reverted(reason))
            }
            Err(err) => return Err(err),
        };

        match pending.wait(self.confirmation_timeout).await {
            Ok(hash) => Ok(PurchaseOutcome::Confirmed(hash)),
            Err(SaleError::TransactionReverted(reason)) => Ok(PurchaseOutcome::Reverted(reason)),
            Err(err) => Err(err),
        }
    }

    fn claim(&self, account: Address) -> Result<InFlightClaim<'_>, SaleError> {
        if !self.lock_in_flight().insert(account) {
            return Err(SaleError::PurchaseInProgress(account));
        }
        Ok(InFlightClaim {
            in_flight: &self.in_flight,
            account,
        })
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<Address>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the per-account slot when the purchase future finishes or is dropped.
struct InFlightClaim<'a> {
    in_flight: &'a Mutex<HashSet<Address>>,
    account: Address,
}

impl Drop for InFlightClaim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.account);
    }
}

#[cfg(test)]
#[path = "tests/purchase_tests.rs"]
mod tests;
