//! The chain adapter contract: events the core consumes and transactions it
//! emits. Events are keyed by channel id so the engine can route them
//! without parsing contract data.

use serde::{Deserialize, Serialize};

use crate::types::{Address, Destination, U256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositedEvent {
    pub channel_id: Destination,
    pub block_num: u64,
    pub asset: Address,
    pub amount: U256,
    /// Total held for the channel in this asset after the deposit.
    pub now_held: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationUpdatedEvent {
    pub channel_id: Destination,
    pub block_num: u64,
    pub asset: Address,
    pub amount: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcludedEvent {
    pub channel_id: Destination,
    pub block_num: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEvent {
    Deposited(DepositedEvent),
    AllocationUpdated(AllocationUpdatedEvent),
    Concluded(ConcludedEvent),
}

impl ChainEvent {
    pub fn channel_id(&self) -> Destination {
        match self {
            ChainEvent::Deposited(e) => e.channel_id,
            ChainEvent::AllocationUpdated(e) => e.channel_id,
            ChainEvent::Concluded(e) => e.channel_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    Conclude,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub channel_id: Destination,
    pub asset: Address,
    pub amount: U256,
    pub kind: TransactionKind,
}

impl ChainTransaction {
    pub fn deposit(channel_id: Destination, asset: Address, amount: U256) -> Self {
        ChainTransaction {
            channel_id,
            asset,
            amount,
            kind: TransactionKind::Deposit,
        }
    }
}

/// Outbound half of the chain adapter.
pub trait ChainService {
    fn send_transaction(&self, tx: ChainTransaction);
}
