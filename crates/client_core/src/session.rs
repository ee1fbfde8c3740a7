use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError,
    },
    time::Duration,
};

use serde::Serialize;
use shared::{
    domain::{Identity, PurchaseOutcome, SaleState, SessionPhase},
    error::{ErrorCode, SessionError},
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    chain_link::ChainLink, error::SaleError, gateway::ContractGateway,
    purchase::PurchaseOrchestrator, store::SaleStateStore,
};

const DEFAULT_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub confirmation_timeout: Duration,
    /// Background refresh while connected; `None` refreshes only on demand
    /// and on identity changes.
    pub refresh_interval: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            confirmation_timeout: DEFAULT_CONFIRMATION_TIMEOUT,
            refresh_interval: None,
        }
    }
}

/// Everything the presentation layer renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionView {
    pub phase: SessionPhase,
    pub identity: Identity,
    /// Last known snapshot; kept while an error is shown.
    pub sale: Option<SaleState>,
    pub error: Option<SessionError>,
    pub purchase_pending: bool,
}

/// Top-level coordinator: drives connect/refresh/disconnect as an explicit
/// state machine and publishes one consistent [`SessionView`].
pub struct SessionController {
    chain: Arc<ChainLink>,
    gateway: Arc<ContractGateway>,
    store: Arc<SaleStateStore>,
    purchases: PurchaseOrchestrator,
    view: watch::Sender<SessionView>,
    /// Changes only on connect and disconnect, always under the view lock.
    /// Work started in an older epoch never touches the view.
    epoch: AtomicU64,
    /// Orders refreshes within one epoch; only the newest one is applied.
    generation: AtomicU64,
    refresh_interval: Option<Duration>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    identity_refresh: std::sync::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectStart {
    Begin(u64),
    InProgress,
    Connected,
}

impl SessionController {
    pub fn new(
        chain: Arc<ChainLink>,
        gateway: Arc<ContractGateway>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let store = Arc::new(SaleStateStore::new(Arc::clone(&gateway)));
        let purchases = PurchaseOrchestrator::new(
            Arc::clone(&chain),
            Arc::clone(&gateway),
            Arc::clone(&store),
            options.confirmation_timeout,
        );
        let (view, _) = watch::channel(SessionView::default());
        Arc::new(Self {
            chain,
            gateway,
            store,
            purchases,
            view,
            epoch: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            refresh_interval: options.refresh_interval,
            tasks: Mutex::new(Vec::new()),
            identity_refresh: std::sync::Mutex::new(None),
        })
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.subscribe()
    }

    pub fn store(&self) -> &Arc<SaleStateStore> {
        &self.store
    }

    /// Connects the wallet and runs the first refresh. A call made while
    /// another connect is in flight waits for that attempt and reports its
    /// result.
    pub async fn connect(self: &Arc<Self>) -> Result<(), SaleError> {
        let mut start = ConnectStart::InProgress;
        self.view.send_if_modified(|view| {
            if view.phase == SessionPhase::Connecting {
                return false;
            }
            if view.phase != SessionPhase::Disconnected && view.identity.is_connected() {
                start = ConnectStart::Connected;
                return false;
            }
            start = ConnectStart::Begin(self.epoch.fetch_add(1, Ordering::SeqCst) + 1);
            view.phase = SessionPhase::Connecting;
            view.error = None;
            true
        });

        let epoch = match start {
            ConnectStart::Begin(epoch) => epoch,
            ConnectStart::Connected => {
                debug!("session: already connected");
                return Ok(());
            }
            ConnectStart::InProgress => {
                debug!("session: joining connect in progress");
                return self.join_connect().await;
            }
        };

        // Identity changes published while connecting are folded into the
        // first refresh; later ones reach the listener.
        let mut changes = self.chain.subscribe_identity();
        let identity = match self.chain.connect().await {
            Ok(identity) => identity,
            Err(err) => {
                warn!("session: connect failed: {err}");
                self.view.send_if_modified(|view| {
                    if !self.is_current(epoch, view) || view.phase != SessionPhase::Connecting {
                        return false;
                    }
                    view.phase = SessionPhase::Error;
                    view.error = Some(err.to_session_error());
                    true
                });
                return Err(err);
            }
        };
        let identity = latest_identity(&mut changes).unwrap_or(identity);

        if self.epoch.load(Ordering::SeqCst) != epoch {
            info!("session: disconnected while connecting");
            self.chain.disconnect().await;
            return Err(SaleError::NotConnected);
        }

        self.spawn_background_tasks(epoch, changes).await;
        self.refresh_latest(identity, epoch).await
    }

    /// Returns to `Disconnected` immediately; any refresh still in flight is
    /// discarded when it completes.
    pub async fn disconnect(&self) {
        self.end_session();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(task) = self.lock_identity_refresh().take() {
            task.abort();
        }
        self.chain.disconnect().await;
        self.store.reset();
        info!("session: disconnected");
    }

    pub async fn refresh(&self) -> Result<(), SaleError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let phase = self.view.borrow().phase;
        if matches!(phase, SessionPhase::Disconnected | SessionPhase::Connecting) {
            return Err(SaleError::NotConnected);
        }
        let identity = self.chain.current_identity().await;
        if !identity.is_connected() {
            return Err(SaleError::NotConnected);
        }
        self.refresh_latest(identity, epoch).await
    }

    /// Buys `amount` tokens at the price currently on display.
    pub async fn buy(&self, amount: &str) -> Result<PurchaseOutcome, SaleError> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let price_wei = {
            let view = self.view.borrow();
            match (&view.sale, view.phase) {
                (_, SessionPhase::Disconnected | SessionPhase::Connecting) | (None, _) => {
                    return Err(SaleError::NotConnected)
                }
                (Some(sale), _) => sale.price_wei,
            }
        };

        self.view.send_modify(|view| view.purchase_pending = true);
        let result = self.purchases.buy(amount, price_wei).await;
        let snapshot = self.store.snapshot();
        let purchase_pending = self.purchases.has_pending();

        self.view.send_modify(|view| {
            view.purchase_pending = purchase_pending;
            if !self.is_current(epoch, view) {
                return;
            }
            let newer = view
                .sale
                .as_ref()
                .map_or(true, |shown| snapshot.cycle > shown.cycle);
            if newer && snapshot.identity == view.identity {
                view.sale = Some(snapshot);
            }
            match &result {
                Ok(PurchaseOutcome::Confirmed(_)) => view.error = None,
                Ok(PurchaseOutcome::Rejected(reason)) => {
                    view.error = Some(SessionError::new(ErrorCode::SubmissionRejected, reason));
                }
                Ok(PurchaseOutcome::Reverted(reason)) => {
                    view.error = Some(SessionError::new(ErrorCode::TransactionReverted, reason));
                }
                Err(SaleError::PurchaseInProgress(_)) => {}
                Err(err @ SaleError::ConfirmationTimeout(_)) => {
                    view.phase = SessionPhase::Error;
                    view.error = Some(err.to_session_error());
                }
                Err(err) => view.error = Some(err.to_session_error()),
            }
        });

        result
    }

    /// Refreshes for `identity`, and again for as long as the wallet moved on
    /// meanwhile, so a stale identity never has the last word.
    async fn refresh_latest(&self, mut identity: Identity, epoch: u64) -> Result<(), SaleError> {
        loop {
            let result = self.run_refresh(identity, epoch).await;
            let current = self.chain.current_identity().await;
            if current == identity
                || !current.is_connected()
                || self.epoch.load(Ordering::SeqCst) != epoch
            {
                return result;
            }
            debug!(account = ?current.account, "session: identity moved during refresh");
            identity = current;
        }
    }

    async fn run_refresh(&self, identity: Identity, epoch: u64) -> Result<(), SaleError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let started = self.view.send_if_modified(|view| {
            if !self.is_current(epoch, view) {
                return false;
            }
            view.identity = identity;
            if view.phase != SessionPhase::Connecting {
                view.phase = SessionPhase::Refreshing;
            }
            true
        });
        if !started {
            debug!(epoch, "session: refresh skipped, session ended");
            return Err(SaleError::NotConnected);
        }

        let result = self.store.refresh(&identity).await;
        let unsupported = identity
            .network_id
            .filter(|network_id| !self.gateway.directory().supports(*network_id))
            .map(SaleError::UnsupportedNetwork);

        let mut ended = false;
        let applied = self.view.send_if_modified(|view| {
            if !self.is_current(epoch, view) {
                ended = true;
                return false;
            }
            if self.generation.load(Ordering::SeqCst) != generation {
                return false;
            }
            match (&result, &unsupported) {
                (Ok(state), Some(err)) => {
                    view.sale = Some(state.clone());
                    view.phase = SessionPhase::Error;
                    view.error = Some(err.to_session_error());
                }
                (Ok(state), None) => {
                    view.sale = Some(state.clone());
                    view.phase = SessionPhase::Ready;
                    view.error = None;
                }
                (Err(err), _) => {
                    view.phase = SessionPhase::Error;
                    view.error = Some(err.to_session_error());
                }
            }
            true
        });

        if ended {
            debug!(epoch, "session: discarding refresh from an ended session");
            return Err(SaleError::NotConnected);
        }
        if !applied {
            debug!(generation, "session: discarding superseded refresh");
        }
        match (result, unsupported) {
            (Err(err), _) | (Ok(_), Some(err)) => Err(err),
            (Ok(_), None) => Ok(()),
        }
    }

    fn is_current(&self, epoch: u64, view: &SessionView) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch && view.phase != SessionPhase::Disconnected
    }

    async fn join_connect(&self) -> Result<(), SaleError> {
        let mut updates = self.view.subscribe();
        let view = updates
            .wait_for(|view| view.phase != SessionPhase::Connecting)
            .await
            .map(|view| view.clone())
            .map_err(|_| SaleError::NotConnected)?;
        connect_outcome(&view)
    }

    /// Starts the refresh for an identity change without waiting for it, so
    /// a hung read for an older identity never holds back a newer one.
    fn schedule_identity_refresh(self: &Arc<Self>, identity: Identity, epoch: u64) {
        let session = Arc::clone(self);
        let task = tokio::spawn(async move { session.on_identity_change(identity, epoch).await });
        if let Some(previous) = self.lock_identity_refresh().replace(task) {
            previous.abort();
        }
    }

    async fn on_identity_change(&self, identity: Identity, epoch: u64) {
        if !self.is_current(epoch, &self.view.borrow()) {
            return;
        }
        if !identity.is_connected() {
            info!("session: wallet reported no account, disconnecting");
            self.end_session();
            self.store.reset();
            return;
        }
        if let Err(err) = self.refresh_latest(identity, epoch).await {
            warn!("session: refresh after identity change failed: {err}");
        }
    }

    /// Bumps the epoch and clears the view in one step.
    fn end_session(&self) {
        self.view.send_modify(|view| {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            *view = SessionView::default();
        });
    }

    fn lock_identity_refresh(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.identity_refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn spawn_background_tasks(
        self: &Arc<Self>,
        epoch: u64,
        mut changes: broadcast::Receiver<Identity>,
    ) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }

        let session = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(identity) => session.schedule_identity_refresh(identity, epoch),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "session: identity changes lagged");
                        let identity = session.chain.current_identity().await;
                        session.schedule_identity_refresh(identity, epoch);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        if let Some(interval) = self.refresh_interval {
            let session = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let phase = session.view.borrow().phase;
                    if !matches!(phase, SessionPhase::Ready | SessionPhase::Error) {
                        continue;
                    }
                    if let Err(err) = session.refresh().await {
                        debug!("session: background refresh failed: {err}");
                    }
                }
            }));
        }
    }
}

/// Drains changes already queued and returns the newest one.
fn latest_identity(changes: &mut broadcast::Receiver<Identity>) -> Option<Identity> {
    let mut latest = None;
    loop {
        match changes.try_recv() {
            Ok(identity) => latest = Some(identity),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return latest,
        }
    }
}

/// What a joined connect call reports once the attempt it waited on settles.
fn connect_outcome(view: &SessionView) -> Result<(), SaleError> {
    match (view.phase, &view.error) {
        (SessionPhase::Ready | SessionPhase::Refreshing, _) => Ok(()),
        (SessionPhase::Error, Some(error)) => Err(match error.code {
            ErrorCode::UserRejected => SaleError::UserRejected,
            ErrorCode::RefreshFailed => SaleError::Refresh(error.message.clone()),
            ErrorCode::UnsupportedNetwork => view
                .identity
                .network_id
                .map_or(SaleError::NotConnected, SaleError::UnsupportedNetwork),
            _ => SaleError::NotConnected,
        }),
        _ => Err(SaleError::NotConnected),
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
