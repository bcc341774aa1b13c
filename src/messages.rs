//! The peer message envelope and the outbound transport contract.
//!
//! Delivery is unordered, lossy and may duplicate; everything in an envelope
//! is idempotent on replay. Each envelope carries signed states for exactly
//! one objective.

use serde::{Deserialize, Serialize};

use crate::protocols::ObjectiveId;
use crate::state::SignedState;
use crate::types::Address;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub to: Address,
    pub from: Address,
    pub objective_id: ObjectiveId,
    pub signed_states: Vec<SignedState>,
}

impl Message {
    /// Serialize for the byte-oriented transport.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("encoding of in-memory values is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Outbound half of the peer transport. Implementations deliver envelopes
/// with at-least-once semantics; the engine tolerates loss, duplication and
/// reordering on the inbound path.
pub trait MessageService {
    fn send(&self, message: Message);
}
