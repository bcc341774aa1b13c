//! Test harness: an in-memory message broker with unordered per-peer queues
//! and a mock chain that records transactions and emits deposit events.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use runnel::chain::{ChainEvent, ChainService, ChainTransaction, DepositedEvent, TransactionKind};
use runnel::engine::{Engine, ObjectiveResponse, PolicyMaker};
use runnel::messages::{Message, MessageService};
use runnel::outcome::Exit;
use runnel::protocols::{directfund, virtualfund, Objective};
use runnel::sig::Signer;
use runnel::store::{MemStore, Store};
use runnel::types::{Address, Destination, U256};

/// Captures a node's outbound envelopes for the pump to deliver.
#[derive(Clone, Default)]
pub struct Outbox {
    queue: Arc<Mutex<VecDeque<Message>>>,
}

impl Outbox {
    pub fn new() -> Outbox {
        Outbox::default()
    }

    pub fn pop(&self) -> Option<Message> {
        self.queue.lock().pop_front()
    }
}

impl MessageService for Outbox {
    fn send(&self, message: Message) {
        self.queue.lock().push_back(message);
    }
}

/// A single shared chain: applies deposits to per-channel holdings and
/// queues one `Deposited` event per transaction for broadcast.
#[derive(Clone, Default)]
pub struct MockChain {
    transactions: Arc<Mutex<Vec<ChainTransaction>>>,
    holdings: Arc<Mutex<BTreeMap<(Destination, Address), U256>>>,
    events: Arc<Mutex<VecDeque<ChainEvent>>>,
    block_num: Arc<Mutex<u64>>,
}

impl MockChain {
    pub fn new() -> MockChain {
        MockChain::default()
    }

    pub fn transactions(&self) -> Vec<ChainTransaction> {
        self.transactions.lock().clone()
    }

    pub fn drain_events(&self) -> Vec<ChainEvent> {
        self.events.lock().drain(..).collect()
    }
}

impl ChainService for MockChain {
    fn send_transaction(&self, tx: ChainTransaction) {
        self.transactions.lock().push(tx);
        if tx.kind == TransactionKind::Deposit {
            let now_held = {
                let mut holdings = self.holdings.lock();
                let held = holdings.entry((tx.channel_id, tx.asset)).or_default();
                *held = *held + tx.amount;
                *held
            };
            let block_num = {
                let mut block = self.block_num.lock();
                *block += 1;
                *block
            };
            self.events.lock().push_back(ChainEvent::Deposited(DepositedEvent {
                channel_id: tx.channel_id,
                block_num,
                asset: tx.asset,
                amount: tx.amount,
                now_held,
            }));
        }
    }
}

pub struct TestPolicy {
    pub approve: bool,
}

impl PolicyMaker for TestPolicy {
    fn should_approve(&self, _objective: &Objective) -> bool {
        self.approve
    }
}

pub struct Node {
    pub engine: Engine<MemStore, MockChain, Outbox, TestPolicy>,
    pub outbox: Outbox,
    pub address: Address,
}

impl Node {
    pub fn new(signer: &Signer, chain: &MockChain, approve: bool) -> Node {
        let outbox = Outbox::new();
        let engine = Engine::new(
            MemStore::new(signer.secret_key()),
            chain.clone(),
            outbox.clone(),
            TestPolicy { approve },
        );
        Node {
            engine,
            outbox,
            address: signer.address(),
        }
    }

    pub fn objective(&self, id: &str) -> Option<Objective> {
        self.engine.store().get_objective_by_id(id)
    }
}

/// Deliver queued envelopes and chain events until the network goes quiet.
pub fn pump(nodes: &[&Node], chain: &MockChain) {
    loop {
        let mut progressed = false;
        for node in nodes {
            while let Some(message) = node.outbox.pop() {
                progressed = true;
                if let Some(target) = nodes.iter().find(|n| n.address == message.to) {
                    target.engine.handle_message(message).unwrap();
                }
            }
        }
        for event in chain.drain_events() {
            progressed = true;
            for node in nodes {
                node.engine.handle_chain_event(event).unwrap();
            }
        }
        if !progressed {
            break;
        }
    }
}

/// Deliver envelopes only, leaving chain events for the test to inject.
pub fn pump_messages(nodes: &[&Node]) {
    loop {
        let mut progressed = false;
        for node in nodes {
            while let Some(message) = node.outbox.pop() {
                progressed = true;
                if let Some(target) = nodes.iter().find(|n| n.address == message.to) {
                    target.engine.handle_message(message).unwrap();
                }
            }
        }
        if !progressed {
            break;
        }
    }
}

pub const ASSET: Address = Address([0; 20]);

pub fn two_party_outcome(left: Address, right: Address, amount: u64) -> Exit {
    Exit::simple(
        ASSET,
        vec![
            (Destination::from_address(left), U256::from(amount)),
            (Destination::from_address(right), U256::from(amount)),
        ],
    )
}

pub fn direct_fund_request(counterparty: Address, amount: u64, nonce: u64, me: Address) -> directfund::Request {
    directfund::Request {
        counterparty,
        chain_id: U256::zero(),
        challenge_duration: 60,
        outcome: two_party_outcome(me, counterparty, amount),
        app_definition: Address::default(),
        app_data: Vec::new(),
        nonce,
    }
}

/// Directly fund a ledger channel between `initiator` and `counterparty`
/// and run the network to completion.
pub fn direct_fund(
    initiator: &Node,
    counterparty: Address,
    amount: u64,
    nonce: u64,
    nodes: &[&Node],
    chain: &MockChain,
) -> ObjectiveResponse {
    let request = direct_fund_request(counterparty, amount, nonce, initiator.address);
    let response = initiator.engine.create_ledger_channel(request);
    pump(nodes, chain);
    response
}

pub fn virtual_fund_request(
    intermediary: Address,
    counterparty: Address,
    amount: u64,
    nonce: u64,
    me: Address,
) -> virtualfund::Request {
    virtualfund::Request {
        intermediary,
        counterparty,
        chain_id: U256::zero(),
        challenge_duration: 60,
        outcome: two_party_outcome(me, counterparty, amount),
        app_definition: Address::default(),
        app_data: Vec::new(),
        nonce,
    }
}
