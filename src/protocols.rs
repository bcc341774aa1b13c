//! The objective interface: long-running, persistable protocol instances
//! that are cranked forward whenever new information arrives.
//!
//! A crank is pure with respect to the store: it consumes a working copy and
//! returns the updated objective, the side effects to dispatch, and a
//! coarse waiting-for label. The engine owns persistence and locking, which
//! keeps replay deterministic.

pub mod directfund;
pub mod virtualfund;

use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::{ChainEvent, ChainTransaction};
use crate::channel::ChannelError;
use crate::consensus::ConsensusError;
use crate::messages::Message;
use crate::outcome::OutcomeError;
use crate::state::{SignedState, StateError};
use crate::types::{Address, Destination};

/// Protocol prefix plus channel id; the on-wire discriminator for the
/// objective kind.
pub type ObjectiveId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectiveStatus {
    Unapproved,
    Approved,
    Rejected,
    Completed,
}

/// What external input an objective is blocked on, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitingFor {
    CompletePrefund,
    CompleteFunding,
    CompletePostFund,
    Nothing,
}

/// Everything a crank wants the engine to emit on its behalf.
#[derive(Debug, Clone, Default)]
pub struct SideEffects {
    pub messages: Vec<Message>,
    pub transactions: Vec<ChainTransaction>,
}

impl SideEffects {
    pub fn merge(&mut self, other: SideEffects) {
        self.messages.extend(other.messages);
        self.transactions.extend(other.transactions);
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.transactions.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("objective not approved")]
    NotApproved,
    #[error("event targets objective {got}, expected {want}")]
    WrongObjective { want: ObjectiveId, got: ObjectiveId },
    #[error("channel {0:?} out of scope of objective")]
    UnknownChannel(Destination),
    #[error("local address {0:?} is not a channel participant")]
    NotParticipant(Address),
    #[error("no ledger channel found between {left:?} and {right:?}")]
    MissingLedger { left: Address, right: Address },
    #[error("unexpected outcome shape: {0}")]
    InvalidOutcomeShape(&'static str),
    #[error("unexpected state at turn {0}")]
    UnexpectedTurn(u64),
    #[error("malformed message: {0}")]
    MalformedMessage(&'static str),
    #[error("participant 0 never constructs objectives from peer messages")]
    InitiatorFromMessage,
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
    #[error(transparent)]
    Outcome(#[from] OutcomeError),
}

/// A batch of signed states addressed to one objective.
#[derive(Debug, Clone)]
pub struct ObjectiveEvent {
    pub objective_id: ObjectiveId,
    pub signed_states: Vec<SignedState>,
}

impl ObjectiveEvent {
    pub fn from_message(message: &Message) -> Self {
        ObjectiveEvent {
            objective_id: message.objective_id.clone(),
            signed_states: message.signed_states.clone(),
        }
    }
}

/// The objectives this node can run, dispatched by tag rather than by
/// reflection. The id prefix stays the on-wire discriminator.
#[derive(Debug, Clone)]
pub enum Objective {
    DirectFund(directfund::Objective),
    VirtualFund(virtualfund::Objective),
}

impl Objective {
    pub fn id(&self) -> ObjectiveId {
        match self {
            Objective::DirectFund(o) => o.id(),
            Objective::VirtualFund(o) => o.id(),
        }
    }

    pub fn status(&self) -> ObjectiveStatus {
        match self {
            Objective::DirectFund(o) => o.status(),
            Objective::VirtualFund(o) => o.status(),
        }
    }

    pub fn approve(&self) -> Objective {
        match self {
            Objective::DirectFund(o) => Objective::DirectFund(o.approve()),
            Objective::VirtualFund(o) => Objective::VirtualFund(o.approve()),
        }
    }

    pub fn reject(&self) -> Objective {
        match self {
            Objective::DirectFund(o) => Objective::DirectFund(o.reject()),
            Objective::VirtualFund(o) => Objective::VirtualFund(o.reject()),
        }
    }

    pub fn mark_completed(&self) -> Objective {
        match self {
            Objective::DirectFund(o) => Objective::DirectFund(o.mark_completed()),
            Objective::VirtualFund(o) => Objective::VirtualFund(o.mark_completed()),
        }
    }

    /// Fold new signed states into the objective's extended state.
    pub fn update(&self, event: &ObjectiveEvent) -> Result<Objective, ProtocolError> {
        match self {
            Objective::DirectFund(o) => o.update(event).map(Objective::DirectFund),
            Objective::VirtualFund(o) => o.update(event).map(Objective::VirtualFund),
        }
    }

    /// Fold a chain event into the extended state.
    pub fn update_with_chain_event(&self, event: &ChainEvent) -> Result<Objective, ProtocolError> {
        match self {
            Objective::DirectFund(o) => {
                o.update_with_chain_event(event).map(Objective::DirectFund)
            }
            Objective::VirtualFund(o) => {
                o.update_with_chain_event(event).map(Objective::VirtualFund)
            }
        }
    }

    /// Advance as far as the collected information allows.
    pub fn crank(
        &self,
        sk: &SecretKey,
    ) -> Result<(Objective, SideEffects, WaitingFor), ProtocolError> {
        match self {
            Objective::DirectFund(o) => o
                .crank(sk)
                .map(|(o, effects, waiting)| (Objective::DirectFund(o), effects, waiting)),
            Objective::VirtualFund(o) => o
                .crank(sk)
                .map(|(o, effects, waiting)| (Objective::VirtualFund(o), effects, waiting)),
        }
    }

    /// Every channel id the objective may read or write during a crank; the
    /// engine locks these, in ascending order, around update/crank/persist.
    pub fn channels(&self) -> Vec<Destination> {
        match self {
            Objective::DirectFund(o) => o.channels(),
            Objective::VirtualFund(o) => o.channels(),
        }
    }
}

/// One envelope per counterparty, each carrying exactly this signed state.
pub fn create_signed_state_messages(
    objective_id: &ObjectiveId,
    ss: &SignedState,
    my_index: usize,
) -> Vec<Message> {
    let participants = &ss.state().participants;
    let from = participants[my_index];
    participants
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != my_index)
        .map(|(_, to)| Message {
            to: *to,
            from,
            objective_id: objective_id.clone(),
            signed_states: vec![ss.clone()],
        })
        .collect()
}
