//! In-process wallet and ledger fakes shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use alloy_primitives::{address, Address, Bytes, TxHash, B256, U256, U64};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    domain::{Identity, NetworkId},
    protocol::{CallRequest, TransactionReceipt},
    units::pow10,
};
use tokio::sync::{broadcast, Semaphore};

use crate::{
    abi::{self, BALANCE_OF, BUY_TOKENS, MAX_TOKENS, PRICE, TOKENS_SOLD},
    error::WalletError,
    gateway::{ContractDirectory, ContractGateway, SaleContracts},
    LedgerTransport, WalletEvent, WalletProvider,
};

pub const LOCAL: NetworkId = NetworkId(31337);
pub const UNKNOWN_NETWORK: NetworkId = NetworkId(999);
pub const ALICE: Address = address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
pub const BOB: Address = address!("0x70997970C51812dc3A010C7d01b50e0d17dc79C8");
pub const TOKEN: Address = address!("0x5FbDB2315678afecb367f032d93F642f64180aa3");
pub const SALE: Address = address!("0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512");

pub fn ether(amount: u64) -> U256 {
    U256::from(amount) * pow10(18)
}

pub fn directory() -> ContractDirectory {
    ContractDirectory::new().with_network(
        LOCAL,
        SaleContracts {
            token: TOKEN,
            sale: SALE,
        },
    )
}

pub fn gateway(ledger: &Arc<FakeLedger>) -> Arc<ContractGateway> {
    Arc::new(
        ContractGateway::new(directory(), Arc::clone(ledger) as Arc<dyn LedgerTransport>)
            .with_receipt_poll_interval(Duration::from_millis(5)),
    )
}

pub fn alice_identity() -> Identity {
    Identity::new(Some(ALICE), Some(LOCAL))
}

/// Polls `condition` until it holds, failing the test after about two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Blocks callers until released. Releasing closes the semaphore, which
/// wakes every waiter at once.
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    fn new() -> Self {
        Self(Arc::new(Semaphore::new(0)))
    }

    async fn pass(&self) {
        let _ = self.0.acquire().await;
    }

    pub fn release(&self) {
        self.0.close();
    }
}

#[derive(Debug, Clone)]
struct LedgerValues {
    price: U256,
    max_tokens: U256,
    tokens_sold: U256,
    balances: HashMap<Address, U256>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptMode {
    Success,
    Revert,
    Never,
}

pub struct FakeLedger {
    values: Mutex<LedgerValues>,
    receipts: Mutex<HashMap<TxHash, TransactionReceipt>>,
    hold: Mutex<Option<Gate>>,
    fail_reads: AtomicBool,
    calls: AtomicUsize,
    held_calls: AtomicUsize,
}

impl FakeLedger {
    pub fn new(price: U256, max_tokens: U256, tokens_sold: U256) -> Arc<Self> {
        Arc::new(Self {
            values: Mutex::new(LedgerValues {
                price,
                max_tokens,
                tokens_sold,
                balances: HashMap::new(),
            }),
            receipts: Mutex::new(HashMap::new()),
            hold: Mutex::new(None),
            fail_reads: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            held_calls: AtomicUsize::new(0),
        })
    }

    /// 0.001 ETH per token, 1,000,000 token cap, nothing sold.
    pub fn standard() -> Arc<Self> {
        Self::new(pow10(15), ether(1_000_000), U256::ZERO)
    }

    pub fn set_sale_params(&self, price: U256, max_tokens: U256, tokens_sold: U256) {
        let mut values = self.values.lock().expect("values");
        values.price = price;
        values.max_tokens = max_tokens;
        values.tokens_sold = tokens_sold;
    }

    pub fn set_balance(&self, account: Address, balance: U256) {
        self.values
            .lock()
            .expect("values")
            .balances
            .insert(account, balance);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Later reads compute their value immediately but do not return until
    /// the gate is released.
    pub fn hold_reads(&self) -> Gate {
        let gate = Gate::new();
        *self.hold.lock().expect("hold") = Some(gate.clone());
        gate
    }

    pub fn stop_holding(&self) {
        *self.hold.lock().expect("hold") = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn held_calls(&self) -> usize {
        self.held_calls.load(Ordering::SeqCst)
    }

    /// Includes a purchase in a block.
    pub fn mine(&self, hash: TxHash, transaction: &CallRequest, mode: ReceiptMode) {
        if mode == ReceiptMode::Never {
            return;
        }
        let success = mode == ReceiptMode::Success;
        if success {
            let amount = abi::decode_uint(&transaction.data[4..]).expect("buy amount");
            let mut values = self.values.lock().expect("values");
            values.tokens_sold += amount;
            if let Some(from) = transaction.from {
                *values.balances.entry(from).or_insert(U256::ZERO) += amount;
            }
        }
        self.receipts.lock().expect("receipts").insert(
            hash,
            TransactionReceipt {
                transaction_hash: hash,
                block_number: Some(U64::from(1u64)),
                status: Some(U64::from(u64::from(success))),
            },
        );
    }

    fn answer(&self, request: &CallRequest) -> Result<U256> {
        let values = self.values.lock().expect("values");
        let data = request.data.as_ref();
        let selector = data.get(..4).ok_or_else(|| anyhow!("empty calldata"))?;
        if request.to == TOKEN && selector == abi::selector(BALANCE_OF) {
            let account = Address::from_slice(&data[16..36]);
            return Ok(values.balances.get(&account).copied().unwrap_or_default());
        }
        if request.to == SALE && selector == abi::selector(PRICE) {
            return Ok(values.price);
        }
        if request.to == SALE && selector == abi::selector(MAX_TOKENS) {
            return Ok(values.max_tokens);
        }
        if request.to == SALE && selector == abi::selector(TOKENS_SOLD) {
            return Ok(values.tokens_sold);
        }
        Err(anyhow!("execution reverted: unknown call"))
    }
}

#[async_trait]
impl LedgerTransport for FakeLedger {
    async fn call(&self, request: CallRequest) -> Result<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        let value = self.answer(&request)?;

        let gate = self.hold.lock().expect("hold").clone();
        if let Some(gate) = gate {
            self.held_calls.fetch_add(1, Ordering::SeqCst);
            gate.pass().await;
            self.held_calls.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(Bytes::from(abi::uint_word(value).to_vec()))
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TransactionReceipt>> {
        Ok(self.receipts.lock().expect("receipts").get(&hash).cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendMode {
    Mine(ReceiptMode),
    Reject,
    RevertOnSubmit(String),
    Unavailable,
}

pub struct FakeWallet {
    accounts: Mutex<Vec<Address>>,
    chain_id: Mutex<NetworkId>,
    reject_connect: AtomicBool,
    connect_hold: Mutex<Option<Gate>>,
    connect_event: Mutex<Option<WalletEvent>>,
    send_mode: Mutex<SendMode>,
    send_hold: Mutex<Option<Gate>>,
    sent: Mutex<Vec<CallRequest>>,
    pending_sends: AtomicUsize,
    disconnects: AtomicUsize,
    ledger: Arc<FakeLedger>,
    events: broadcast::Sender<WalletEvent>,
}

impl FakeWallet {
    pub fn new(ledger: &Arc<FakeLedger>) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            accounts: Mutex::new(vec![ALICE]),
            chain_id: Mutex::new(LOCAL),
            reject_connect: AtomicBool::new(false),
            connect_hold: Mutex::new(None),
            connect_event: Mutex::new(None),
            send_mode: Mutex::new(SendMode::Mine(ReceiptMode::Success)),
            send_hold: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            pending_sends: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            ledger: Arc::clone(ledger),
            events,
        })
    }

    pub fn set_chain_id(&self, chain_id: NetworkId) {
        *self.chain_id.lock().expect("chain") = chain_id;
    }

    pub fn set_reject_connect(&self, reject: bool) {
        self.reject_connect.store(reject, Ordering::SeqCst);
    }

    /// Later account requests wait for the gate before answering.
    pub fn hold_connects(&self) -> Gate {
        let gate = Gate::new();
        *self.connect_hold.lock().expect("hold") = Some(gate.clone());
        gate
    }

    /// Emits `event` while the next account request is being answered.
    pub fn emit_during_connect(&self, event: WalletEvent) {
        *self.connect_event.lock().expect("event") = Some(event);
    }

    pub fn set_send_mode(&self, mode: SendMode) {
        *self.send_mode.lock().expect("mode") = mode;
    }

    pub fn hold_sends(&self) -> Gate {
        let gate = Gate::new();
        *self.send_hold.lock().expect("hold") = Some(gate.clone());
        gate
    }

    pub fn sent(&self) -> Vec<CallRequest> {
        self.sent.lock().expect("sent").clone()
    }

    pub fn pending_sends(&self) -> usize {
        self.pending_sends.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: WalletEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl WalletProvider for FakeWallet {
    async fn request_accounts(&self) -> std::result::Result<Vec<Address>, WalletError> {
        let gate = self.connect_hold.lock().expect("hold").clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if let Some(event) = self.connect_event.lock().expect("event").take() {
            let _ = self.events.send(event);
        }
        if self.reject_connect.load(Ordering::SeqCst) {
            return Err(WalletError::UserRejected);
        }
        Ok(self.accounts.lock().expect("accounts").clone())
    }

    async fn chain_id(&self) -> std::result::Result<NetworkId, WalletError> {
        Ok(*self.chain_id.lock().expect("chain"))
    }

    async fn send_transaction(
        &self,
        transaction: CallRequest,
    ) -> std::result::Result<TxHash, WalletError> {
        let gate = self.send_hold.lock().expect("hold").clone();
        if let Some(gate) = gate {
            self.pending_sends.fetch_add(1, Ordering::SeqCst);
            gate.pass().await;
            self.pending_sends.fetch_sub(1, Ordering::SeqCst);
        }

        let mode = self.send_mode.lock().expect("mode").clone();
        let hash = {
            let mut sent = self.sent.lock().expect("sent");
            sent.push(transaction.clone());
            B256::left_padding_from(&(sent.len() as u64).to_be_bytes())
        };
        match mode {
            SendMode::Mine(receipt) => {
                self.ledger.mine(hash, &transaction, receipt);
                Ok(hash)
            }
            SendMode::Reject => Err(WalletError::UserRejected),
            SendMode::RevertOnSubmit(reason) => Err(WalletError::Reverted(reason)),
            SendMode::Unavailable => Err(WalletError::Unavailable("wallet locked".into())),
        }
    }

    async fn disconnect(&self) -> std::result::Result<(), WalletError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<WalletEvent> {
        self.events.subscribe()
    }
}
