use std::sync::Arc;

use alloy_primitives::{Address, TxHash};
use shared::{domain::Identity, protocol::CallRequest};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{SaleError, WalletError},
    WalletEvent, WalletProvider,
};

/// Active account plus the wallet's signing capability.
#[derive(Clone)]
pub struct Signer {
    wallet: Arc<dyn WalletProvider>,
    account: Address,
}

impl Signer {
    pub fn account(&self) -> Address {
        self.account
    }

    pub async fn send_transaction(
        &self,
        mut transaction: CallRequest,
    ) -> Result<TxHash, WalletError> {
        transaction.from = Some(self.account);
        self.wallet.send_transaction(transaction).await
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

/// Owns the observed wallet identity and re-emits wallet events as
/// normalized identity changes, one per actual change.
pub struct ChainLink {
    wallet: Arc<dyn WalletProvider>,
    identity: RwLock<Identity>,
    changes: broadcast::Sender<Identity>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChainLink {
    pub fn new(wallet: Arc<dyn WalletProvider>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(64);
        Arc::new(Self {
            wallet,
            identity: RwLock::new(Identity::default()),
            changes,
            event_task: Mutex::new(None),
        })
    }

    pub async fn connect(self: &Arc<Self>) -> Result<Identity, SaleError> {
        // Events sent while the user is still approving are applied once the
        // identity is set.
        let events = self.wallet.subscribe_events();
        let accounts = self
            .wallet
            .request_accounts()
            .await
            .map_err(connect_error)?;
        let Some(account) = accounts.first().copied() else {
            warn!("wallet: connect returned no accounts");
            return Err(SaleError::NotConnected);
        };
        let network_id = self.wallet.chain_id().await.map_err(connect_error)?;

        let identity = Identity::new(Some(account), Some(network_id));
        self.update(|_| identity).await;
        self.spawn_event_task(events).await;
        info!(%account, network_id = network_id.0, "wallet: connected");
        Ok(identity)
    }

    pub async fn disconnect(&self) {
        if let Some(task) = self.event_task.lock().await.take() {
            task.abort();
        }
        if let Err(err) = self.wallet.disconnect().await {
            warn!("wallet: provider disconnect failed: {err}");
        }
        self.update(|_| Identity::default()).await;
        info!("wallet: disconnected");
    }

    pub async fn current_identity(&self) -> Identity {
        *self.identity.read().await
    }

    /// Registers a listener; it receives every identity change made after
    /// this call.
    pub fn subscribe_identity(&self) -> broadcast::Receiver<Identity> {
        self.changes.subscribe()
    }

    pub async fn signer(&self) -> Option<Signer> {
        let account = self.identity.read().await.account?;
        Some(Signer {
            wallet: Arc::clone(&self.wallet),
            account,
        })
    }

    async fn update(&self, next: impl FnOnce(Identity) -> Identity) -> bool {
        let mut guard = self.identity.write().await;
        let updated = next(*guard);
        if updated == *guard {
            return false;
        }
        *guard = updated;
        let _ = self.changes.send(updated);
        debug!(
            account = ?updated.account,
            network_id = ?updated.network_id,
            "wallet: identity changed"
        );
        true
    }

    async fn apply_wallet_event(&self, event: WalletEvent) {
        match event {
            WalletEvent::AccountsChanged(accounts) => {
                let account = accounts.first().copied();
                self.update(|current| match account {
                    Some(account) => Identity::new(Some(account), current.network_id),
                    None => Identity::default(),
                })
                .await;
            }
            WalletEvent::ChainChanged(network_id) => {
                self.update(|current| {
                    if current.is_connected() {
                        Identity::new(current.account, Some(network_id))
                    } else {
                        current
                    }
                })
                .await;
            }
            WalletEvent::Disconnected => {
                self.update(|_| Identity::default()).await;
            }
        }
    }

    async fn spawn_event_task(self: &Arc<Self>, mut events: broadcast::Receiver<WalletEvent>) {
        let link = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => link.apply_wallet_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "wallet: event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.event_task.lock().await.replace(task) {
            previous.abort();
        }
    }
}

fn connect_error(err: WalletError) -> SaleError {
    match err {
        WalletError::UserRejected => SaleError::UserRejected,
        WalletError::Reverted(message) | WalletError::Unavailable(message) => {
            SaleError::Rpc(message)
        }
    }
}

#[cfg(test)]
#[path = "tests/chain_link_tests.rs"]
mod tests;
