//! The engine: routes inbound events to objectives, cranks them under
//! per-channel locks, persists the results and fans out side effects.
//!
//! One logical worker drives an engine; cranks over disjoint channel sets
//! may run concurrently because every read-modify-write of a channel happens
//! under that channel's lock, and locks are always taken in ascending
//! channel-id order.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::chain::{ChainEvent, ChainService};
use crate::messages::{Message, MessageService};
use crate::protocols::{
    directfund, virtualfund, Objective, ObjectiveEvent, ObjectiveId, ObjectiveStatus,
    ProtocolError, SideEffects, WaitingFor,
};
use crate::store::{Store, StoreError};
use crate::types::{Address, Destination};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unrecognized objective kind: {0}")]
    UnknownObjectiveKind(ObjectiveId),
}

/// Returned by the initiation API. Initiation never fails; poll the store by
/// id for subsequent status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectiveResponse {
    pub id: ObjectiveId,
    pub channel_id: Destination,
}

/// Consulted exactly once per newly-seen objective, before it is persisted.
pub trait PolicyMaker {
    fn should_approve(&self, objective: &Objective) -> bool;
}

/// Approves everything.
pub struct PermissivePolicy;

impl PolicyMaker for PermissivePolicy {
    fn should_approve(&self, _objective: &Objective) -> bool {
        true
    }
}

/// Per-channel mutex table. Locks are acquired in ascending channel-id
/// order, which gives a total order and rules out deadlock between
/// objectives sharing channels; they are released in reverse.
pub struct ChannelLocker {
    locks: Mutex<BTreeMap<Destination, Arc<Mutex<()>>>>,
}

/// Held guards, released in reverse acquisition order on drop.
pub struct ChannelGuards {
    guards: Vec<ArcMutexGuard<RawMutex, ()>>,
}

impl Drop for ChannelGuards {
    fn drop(&mut self) {
        while self.guards.pop().is_some() {}
    }
}

impl ChannelLocker {
    pub fn new() -> ChannelLocker {
        ChannelLocker {
            locks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn lock(&self, channel_ids: &[Destination]) -> ChannelGuards {
        let mut sorted = channel_ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            let lock = {
                let mut table = self.locks.lock();
                table
                    .entry(id)
                    .or_insert_with(|| Arc::new(Mutex::new(())))
                    .clone()
            };
            guards.push(lock.lock_arc());
        }
        ChannelGuards { guards }
    }
}

impl Default for ChannelLocker {
    fn default() -> Self {
        ChannelLocker::new()
    }
}

/// The coordination core. Generic over its four collaborators so tests can
/// wire in in-memory doubles.
pub struct Engine<S, C, M, P> {
    store: S,
    chain: C,
    messenger: M,
    policy: P,
    locker: ChannelLocker,
}

impl<S, C, M, P> Engine<S, C, M, P>
where
    S: Store,
    C: ChainService,
    M: MessageService,
    P: PolicyMaker,
{
    pub fn new(store: S, chain: C, messenger: M, policy: P) -> Engine<S, C, M, P> {
        Engine {
            store,
            chain,
            messenger,
            policy,
            locker: ChannelLocker::new(),
        }
    }

    pub fn address(&self) -> Address {
        self.store.get_address()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Open a directly funded ledger channel with a counterparty. The local
    /// node takes participant index 0 and pre-approves its own objective.
    pub fn create_ledger_channel(&self, request: directfund::Request) -> ObjectiveResponse {
        let my_address = self.store.get_address();
        let response = ObjectiveResponse {
            id: request.id(my_address),
            channel_id: request.channel_id(my_address),
        };

        match directfund::Objective::new(&request, my_address) {
            Ok(objective) => {
                info!(objective = %response.id, "initiating direct fund");
                if let Err(err) = self.progress(Objective::DirectFund(objective)) {
                    warn!(objective = %response.id, %err, "direct fund initiation stalled");
                }
            }
            Err(err) => warn!(objective = %response.id, %err, "could not construct objective"),
        }
        response
    }

    /// Open a virtual channel to `counterparty` through `intermediary`,
    /// funded from the ledger channel shared with the intermediary.
    pub fn create_virtual_channel(&self, request: virtualfund::Request) -> ObjectiveResponse {
        let my_address = self.store.get_address();
        let response = ObjectiveResponse {
            id: request.id(my_address),
            channel_id: request.channel_id(my_address),
        };

        let Some(ledger) = self.store.get_consensus_channel(request.intermediary) else {
            warn!(
                objective = %response.id,
                intermediary = ?request.intermediary,
                "no ledger channel with intermediary"
            );
            return response;
        };
        match virtualfund::Objective::new(&request, my_address, ledger) {
            Ok(objective) => {
                info!(objective = %response.id, "initiating virtual fund");
                if let Err(err) = self.progress(Objective::VirtualFund(objective)) {
                    warn!(objective = %response.id, %err, "virtual fund initiation stalled");
                }
            }
            Err(err) => warn!(objective = %response.id, %err, "could not construct objective"),
        }
        response
    }

    /// Route one inbound peer envelope. Validation and protocol-progress
    /// failures are logged and swallowed; only store failures surface.
    pub fn handle_message(&self, message: Message) -> Result<(), EngineError> {
        match self.store.get_objective_by_id(&message.objective_id) {
            Some(objective) => {
                if objective.status() == ObjectiveStatus::Rejected {
                    debug!(objective = %objective.id(), "ignoring message for rejected objective");
                    return Ok(());
                }
                let event = ObjectiveEvent::from_message(&message);
                self.progress_with(objective, |o| o.update(&event))
            }
            None => {
                let constructed = match self.construct_objective(&message) {
                    Ok(objective) => objective,
                    Err(err) => {
                        warn!(objective = %message.objective_id, %err, "dropping message");
                        return Ok(());
                    }
                };
                let decided = if self.policy.should_approve(&constructed) {
                    constructed.approve()
                } else {
                    constructed.reject()
                };
                if decided.status() == ObjectiveStatus::Rejected {
                    info!(objective = %decided.id(), "policy rejected objective");
                    self.store.set_objective(&decided)?;
                    return Ok(());
                }
                self.progress(decided)
            }
        }
    }

    /// Route one chain event to the objective interested in its channel.
    pub fn handle_chain_event(&self, event: ChainEvent) -> Result<(), EngineError> {
        let channel_id = event.channel_id();
        let Some(objective) = self.store.get_objective_by_channel_id(&channel_id) else {
            warn!(channel = ?channel_id, "no objective for chain event");
            return Ok(());
        };
        if objective.status() == ObjectiveStatus::Rejected {
            return Ok(());
        }
        self.progress_with(objective, |o| o.update_with_chain_event(&event))
    }

    fn construct_objective(&self, message: &Message) -> Result<Objective, EngineError> {
        let my_address = self.store.get_address();
        if directfund::is_direct_fund_objective(&message.objective_id) {
            let objective = directfund::Objective::construct_from_message(message, my_address)?;
            Ok(Objective::DirectFund(objective))
        } else if virtualfund::is_virtual_fund_objective(&message.objective_id) {
            let store = &self.store;
            let objective =
                virtualfund::Objective::construct_from_message(message, my_address, |left, right| {
                    let counterparty = if left == my_address { right } else { left };
                    store.get_consensus_channel(counterparty)
                })?;
            Ok(Objective::VirtualFund(objective))
        } else {
            Err(EngineError::UnknownObjectiveKind(message.objective_id.clone()))
        }
    }

    fn progress(&self, objective: Objective) -> Result<(), EngineError> {
        self.progress_with(objective, |o| Ok(o.clone()))
    }

    fn progress_with<F>(&self, objective: Objective, update: F) -> Result<(), EngineError>
    where
        F: FnOnce(&Objective) -> Result<Objective, ProtocolError>,
    {
        self.progress_inner(objective, update, true)
    }

    /// The per-event pipeline: lock the objective's channels, fold in the
    /// event, crank, persist, then dispatch side effects outside the locks.
    /// `crank_siblings` lets the top-level call wake objectives sharing a
    /// channel (a second virtual fund waiting for a ledger's proposal slot)
    /// without recursing further.
    fn progress_inner<F>(
        &self,
        objective: Objective,
        update: F,
        crank_siblings: bool,
    ) -> Result<(), EngineError>
    where
        F: FnOnce(&Objective) -> Result<Objective, ProtocolError>,
    {
        let channel_ids = objective.channels();
        let guards = self.locker.lock(&channel_ids);

        let updated = match update(&objective) {
            Ok(updated) => updated,
            Err(err) => {
                warn!(objective = %objective.id(), %err, "dropping event");
                return Ok(());
            }
        };
        if updated.status() == ObjectiveStatus::Completed {
            debug!(objective = %updated.id(), "objective already completed");
            return Ok(());
        }

        let sk = self.store.get_channel_secret_key();
        let (cranked, effects, waiting) = match updated.crank(&sk) {
            Ok(result) => result,
            Err(ProtocolError::NotApproved) => {
                // Keep whatever the event taught us; the crank waits for the
                // policy decision.
                self.persist(&updated)?;
                return Ok(());
            }
            Err(err) => {
                warn!(objective = %updated.id(), %err, "crank failed, leaving objective in place");
                return Ok(());
            }
        };
        debug!(objective = %cranked.id(), ?waiting, "cranked");

        if waiting == WaitingFor::Nothing && cranked.status() == ObjectiveStatus::Approved {
            self.complete(cranked)?;
        } else {
            self.persist(&cranked)?;
        }

        drop(guards);
        self.dispatch(effects);

        if crank_siblings {
            self.crank_siblings(&channel_ids, &objective.id())?;
        }
        Ok(())
    }

    /// Give every approved objective sharing one of `channel_ids` a chance
    /// to move: a crank here may have freed a ledger's proposal slot or
    /// satisfied a guarantee a sibling was waiting on.
    fn crank_siblings(
        &self,
        channel_ids: &[Destination],
        cranked_id: &ObjectiveId,
    ) -> Result<(), EngineError> {
        let mut seen = vec![cranked_id.clone()];
        for channel_id in channel_ids {
            for sibling in self.store.get_objectives_by_channel_id(channel_id) {
                if seen.contains(&sibling.id()) {
                    continue;
                }
                seen.push(sibling.id());
                if sibling.status() == ObjectiveStatus::Approved {
                    self.progress_inner(sibling, |o| Ok(o.clone()), false)?;
                }
            }
        }
        Ok(())
    }

    /// Mark an objective completed. Direct fund additionally swaps the plain
    /// channel for a consensus channel in the store.
    fn complete(&self, objective: Objective) -> Result<(), EngineError> {
        let completed = objective.mark_completed();
        info!(objective = %completed.id(), "objective completed");

        if let Objective::DirectFund(o) = &completed {
            let consensus = o.create_consensus_channel()?;
            self.store.set_consensus_channel(&consensus)?;
            self.store.destroy_channel(&o.channel().id);
            self.store.set_objective(&completed)?;
            return Ok(());
        }
        self.persist(&completed)
    }

    /// Write back the objective record and the channel working copies it
    /// holds.
    fn persist(&self, objective: &Objective) -> Result<(), EngineError> {
        match objective {
            Objective::DirectFund(o) => {
                self.store.set_channel(o.channel())?;
            }
            Objective::VirtualFund(o) => {
                if let Some(conn) = o.to_my_left() {
                    self.store.set_consensus_channel(&conn.ledger)?;
                }
                if let Some(conn) = o.to_my_right() {
                    self.store.set_consensus_channel(&conn.ledger)?;
                }
            }
        }
        self.store.set_objective(objective)?;
        Ok(())
    }

    /// Chain transactions go to the chain adapter; envelopes fan out to the
    /// peer transport, one per recipient per signed state.
    fn dispatch(&self, effects: SideEffects) {
        for tx in effects.transactions {
            debug!(channel = ?tx.channel_id, ?tx.kind, "submitting transaction");
            self.chain.send_transaction(tx);
        }
        for message in effects.messages {
            self.messenger.send(message);
        }
    }
}
