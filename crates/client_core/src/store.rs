use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::Utc;
use shared::domain::{Identity, SaleState};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{error::SaleError, gateway::ContractGateway};

/// Holds the published sale snapshot and runs refresh cycles.
///
/// Each cycle takes a sequence number when it starts. A finished cycle is
/// published only if its number is higher than the published snapshot's,
/// so a slow older cycle can never overwrite a newer one.
pub struct SaleStateStore {
    gateway: Arc<ContractGateway>,
    next_cycle: AtomicU64,
    published: watch::Sender<SaleState>,
}

impl SaleStateStore {
    pub fn new(gateway: Arc<ContractGateway>) -> Self {
        let (published, _) = watch::channel(SaleState::empty(0, Identity::default(), Utc::now()));
        Self {
            gateway,
            next_cycle: AtomicU64::new(0),
            published,
        }
    }

    pub fn snapshot(&self) -> SaleState {
        self.published.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SaleState> {
        self.published.subscribe()
    }

    /// Runs one refresh cycle for `identity`. Returns the snapshot published
    /// after the cycle, which is a newer one if this cycle was superseded.
    /// On failure the previous snapshot stays published.
    pub async fn refresh(&self, identity: &Identity) -> Result<SaleState, SaleError> {
        let cycle = self.begin_cycle();
        match self.read_cycle(cycle, identity).await {
            Ok(state) => Ok(self.publish(state)),
            Err(err) => {
                warn!(cycle, "sale: refresh failed, keeping previous snapshot: {err}");
                Err(match err {
                    SaleError::Refresh(_) => err,
                    other => SaleError::Refresh(other.to_string()),
                })
            }
        }
    }

    /// Publishes the zero state under a fresh cycle number; anything still
    /// in flight is discarded when it completes.
    pub fn reset(&self) {
        let cycle = self.begin_cycle();
        self.publish(SaleState::empty(cycle, Identity::default(), Utc::now()));
    }

    fn begin_cycle(&self) -> u64 {
        self.next_cycle.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn read_cycle(&self, cycle: u64, identity: &Identity) -> Result<SaleState, SaleError> {
        let (Some(account), Some(network_id)) = (identity.account, identity.network_id) else {
            debug!(cycle, "sale: no connected account, publishing empty state");
            return Ok(SaleState::empty(cycle, *identity, Utc::now()));
        };
        let Ok(sale) = self.gateway.resolve(network_id) else {
            debug!(cycle, network_id = network_id.0, "sale: network has no deployment");
            return Ok(SaleState::empty(cycle, *identity, Utc::now()));
        };

        let (balance, params) =
            futures::try_join!(sale.read_balance(account), sale.read_sale_params())?;
        Ok(SaleState::from_reads(
            cycle,
            *identity,
            params,
            balance,
            Utc::now(),
        ))
    }

    fn publish(&self, state: SaleState) -> SaleState {
        let cycle = state.cycle;
        let published = self.published.send_if_modified(|current| {
            if cycle <= current.cycle {
                return false;
            }
            *current = state;
            true
        });

        if published {
            info!(cycle, "sale: snapshot published");
        } else {
            debug!(cycle, "sale: discarding superseded refresh result");
        }
        self.snapshot()
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
