//! Off-chain coordination core for state-channel networks.
//!
//! A state channel is a fixed group of participants advancing a joint state
//! by exchanging mutually signed updates, with on-chain finality as the
//! fallback. This crate implements the node core that drives such channels:
//! the state and outcome model, per-channel bookkeeping, the leader/follower
//! consensus ledger, the direct-fund and virtual-fund objectives, and the
//! engine that multiplexes them under per-channel locks.
//!
//! The chain adapter, peer transport, persistent store and approval policy
//! are external collaborators expressed as traits ([chain::ChainService],
//! [messages::MessageService], [store::Store], [engine::PolicyMaker]); an
//! in-memory store ships for tests and single-process nodes.

pub mod chain;
pub mod channel;
pub mod consensus;
pub mod engine;
pub mod messages;
pub mod outcome;
pub mod protocols;
pub mod sig;
pub mod state;
pub mod store;
pub mod types;

pub use engine::{Engine, ObjectiveResponse, PermissivePolicy};
pub use store::MemStore;
pub use types::{Address, Destination, Funds, Hash, Signature, U256};
