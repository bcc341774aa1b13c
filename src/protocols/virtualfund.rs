//! Virtual funding: open a channel through an intermediary without touching
//! the chain.
//!
//! A single-hop virtual channel V has three participants: Alice (role 0),
//! the intermediary (role 1) and Bob (role 2). V is funded by retargeting
//! funds already locked in the two adjacent ledger channels as guarantees
//! for V. Three rounds: sign V's pre-fund, land a guarantee in each adjacent
//! ledger, sign V's post-fund.

use std::collections::BTreeMap;

use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chain::ChainEvent;
use crate::consensus::{ConsensusChannel, LedgerUpdate, FOLLOWER_INDEX, LEADER_INDEX};
use crate::outcome::{Allocation, Exit};
use crate::protocols::{
    create_signed_state_messages, ObjectiveEvent, ObjectiveId, ObjectiveStatus, ProtocolError,
    SideEffects, WaitingFor,
};
use crate::state::{FixedPart, SignedState, State};
use crate::types::{Address, Destination, Funds, Signature, U256};

pub const OBJECTIVE_PREFIX: &str = "VirtualFund-";

pub fn is_virtual_fund_objective(id: &str) -> bool {
    id.starts_with(OBJECTIVE_PREFIX)
}

/// How a guarantee for the virtual channel is carved out of one adjacent
/// ledger: which two destinations fund it, by how much each, and for whom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuaranteeInfo {
    pub left: Destination,
    pub right: Destination,
    pub left_amount: Funds,
    pub right_amount: Funds,
    pub target: Destination,
}

/// This node's relationship with one adjacent ledger channel.
#[derive(Debug, Clone)]
pub struct Connection {
    pub ledger: ConsensusChannel,
    /// The exact guarantee allocation this objective wants to see inside the
    /// ledger's outcome, per asset.
    pub expected_guarantees: BTreeMap<Address, Allocation>,
    pub guarantee_info: GuaranteeInfo,
}

impl Connection {
    fn new(
        ledger: ConsensusChannel,
        a0: &Funds,
        b0: &Funds,
        target: Destination,
        left: Destination,
        right: Destination,
    ) -> Connection {
        let channel_funds = a0.add(b0);
        let mut expected_guarantees = BTreeMap::new();
        for (asset, amount) in &channel_funds.0 {
            expected_guarantees.insert(*asset, Allocation::guarantee(*amount, left, right, target));
        }
        Connection {
            ledger,
            expected_guarantees,
            guarantee_info: GuaranteeInfo {
                left,
                right,
                left_amount: a0.clone(),
                right_amount: b0.clone(),
                target,
            },
        }
    }

    /// Whether the ledger's consensus outcome affords the expected
    /// guarantee, given the funds actually held on chain.
    fn supported_affords(&self) -> bool {
        self.ledger
            .supported_affords(&self.expected_guarantees, &self.ledger.on_chain_funding)
    }

    fn pending_affords(&self) -> bool {
        self.ledger
            .pending_affords(&self.expected_guarantees, &self.ledger.on_chain_funding)
    }

    fn to_record(&self) -> ConnectionRecord {
        ConnectionRecord {
            ledger: self.ledger.id,
            expected_guarantees: self.expected_guarantees.clone(),
            guarantee_info: self.guarantee_info.clone(),
        }
    }

    fn from_record(record: ConnectionRecord, ledger: ConsensusChannel) -> Connection {
        Connection {
            ledger,
            expected_guarantees: record.expected_guarantees,
            guarantee_info: record.guarantee_info,
        }
    }
}

/// Serialization form of a [Connection]: the ledger handle is replaced by
/// its id and re-linked on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub ledger: Destination,
    pub expected_guarantees: BTreeMap<Address, Allocation>,
    pub guarantee_info: GuaranteeInfo,
}

/// Serialization form of the objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub status: ObjectiveStatus,
    pub starting_state: SignedState,
    pub post_fund_sigs: BTreeMap<usize, Signature>,
    pub target_id: Destination,
    pub left: Option<ConnectionRecord>,
    pub right: Option<ConnectionRecord>,
    pub n: usize,
    pub my_role: usize,
    pub a0: Funds,
    pub b0: Funds,
}

/// A request to open a virtual channel to `counterparty` through
/// `intermediary`. The requester takes role 0 (Alice).
#[derive(Debug, Clone)]
pub struct Request {
    pub intermediary: Address,
    pub counterparty: Address,
    pub chain_id: U256,
    pub challenge_duration: u64,
    pub outcome: Exit,
    pub app_definition: Address,
    pub app_data: Vec<u8>,
    pub nonce: u64,
}

impl Request {
    fn fixed_part(&self, my_address: Address) -> FixedPart {
        FixedPart {
            chain_id: self.chain_id,
            participants: vec![my_address, self.intermediary, self.counterparty],
            channel_nonce: self.nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
        }
    }

    pub fn channel_id(&self, my_address: Address) -> Destination {
        self.fixed_part(my_address).channel_id()
    }

    pub fn id(&self, my_address: Address) -> ObjectiveId {
        format!("{}{:?}", OBJECTIVE_PREFIX, self.channel_id(my_address))
    }

    fn initial_state(&self, my_address: Address) -> State {
        State {
            chain_id: self.chain_id,
            participants: vec![my_address, self.intermediary, self.counterparty],
            channel_nonce: self.nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
            app_data: self.app_data.clone(),
            outcome: self.outcome.clone(),
            turn_num: 0,
            is_final: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Objective {
    status: ObjectiveStatus,
    /// V's pre-fund state and the signatures collected on it.
    starting_state: SignedState,
    /// Signatures collected on V's post-fund state, by participant index.
    post_fund_sigs: BTreeMap<usize, Signature>,
    target_id: Destination,
    to_my_left: Option<Connection>,
    to_my_right: Option<Connection>,
    /// Number of intermediaries.
    n: usize,
    my_role: usize,
    /// Initial balances of Alice and Bob in V, per asset.
    a0: Funds,
    b0: Funds,
}

impl Objective {
    /// Build a locally initiated objective: the caller is Alice and funds V
    /// through the ledger it shares with the intermediary.
    pub fn new(
        request: &Request,
        my_address: Address,
        right_ledger: ConsensusChannel,
    ) -> Result<Objective, ProtocolError> {
        Self::construct_from_state(
            true,
            request.initial_state(my_address),
            my_address,
            None,
            Some(right_ledger),
        )
    }

    pub fn construct_from_state(
        pre_approve: bool,
        initial_state: State,
        my_address: Address,
        left_ledger: Option<ConsensusChannel>,
        right_ledger: Option<ConsensusChannel>,
    ) -> Result<Objective, ProtocolError> {
        validate_initial_state(&initial_state)?;

        let my_role = initial_state
            .participant_index(my_address)
            .ok_or(ProtocolError::NotParticipant(my_address))?;
        let participants = initial_state.participants.clone();
        let n = participants.len() - 2;
        let target_id = initial_state.channel_id();

        // Alice's and Bob's opening balances, read off allocations 0 and 1.
        let mut a0 = Funds::new();
        let mut b0 = Funds::new();
        for sae in &initial_state.outcome.0 {
            a0.insert(sae.asset, a0.get(&sae.asset) + sae.allocations[0].amount);
            b0.insert(sae.asset, b0.get(&sae.asset) + sae.allocations[1].amount);
        }

        let is_alice = my_role == 0;
        let is_bob = my_role == n + 1;
        let me = Destination::from_address(participants[my_role]);

        let to_my_left = if is_alice {
            None
        } else {
            let left_of_me = participants[my_role - 1];
            let ledger = left_ledger.ok_or(ProtocolError::MissingLedger {
                left: left_of_me,
                right: participants[my_role],
            })?;
            Some(Connection::new(
                ledger,
                &a0,
                &b0,
                target_id,
                Destination::from_address(left_of_me),
                me,
            ))
        };

        let to_my_right = if is_bob {
            None
        } else {
            let right_of_me = participants[my_role + 1];
            let ledger = right_ledger.ok_or(ProtocolError::MissingLedger {
                left: participants[my_role],
                right: right_of_me,
            })?;
            Some(Connection::new(
                ledger,
                &a0,
                &b0,
                target_id,
                me,
                Destination::from_address(right_of_me),
            ))
        };

        Ok(Objective {
            status: if pre_approve {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            starting_state: SignedState::new(initial_state),
            post_fund_sigs: BTreeMap::new(),
            target_id,
            to_my_left,
            to_my_right,
            n,
            my_role,
            a0,
            b0,
        })
    }

    /// Build an objective from a peer's opening message. Only the
    /// intermediary and Bob do this; Alice initiates and never constructs
    /// from peer input.
    pub fn construct_from_message<F>(
        message: &crate::messages::Message,
        my_address: Address,
        get_ledger: F,
    ) -> Result<Objective, ProtocolError>
    where
        F: Fn(Address, Address) -> Option<ConsensusChannel>,
    {
        let [ss] = message.signed_states.as_slice() else {
            return Err(ProtocolError::MalformedMessage(
                "expected exactly one signed state",
            ));
        };
        let initial_state = ss.state().clone();
        validate_initial_state(&initial_state)?;

        let alice = initial_state.participants[0];
        let intermediary = initial_state.participants[1];
        let bob = initial_state.participants[2];

        let (left, right) = if my_address == alice {
            return Err(ProtocolError::InitiatorFromMessage);
        } else if my_address == intermediary {
            let left = get_ledger(alice, intermediary).ok_or(ProtocolError::MissingLedger {
                left: alice,
                right: intermediary,
            })?;
            let right = get_ledger(intermediary, bob).ok_or(ProtocolError::MissingLedger {
                left: intermediary,
                right: bob,
            })?;
            (Some(left), Some(right))
        } else if my_address == bob {
            let left = get_ledger(intermediary, bob).ok_or(ProtocolError::MissingLedger {
                left: intermediary,
                right: bob,
            })?;
            (Some(left), None)
        } else {
            return Err(ProtocolError::NotParticipant(my_address));
        };

        let mut objective =
            Self::construct_from_state(false, initial_state, my_address, left, right)?;
        objective.starting_state.merge(ss)?;
        Ok(objective)
    }

    pub fn id(&self) -> ObjectiveId {
        format!("{}{:?}", OBJECTIVE_PREFIX, self.target_id)
    }

    pub fn status(&self) -> ObjectiveStatus {
        self.status
    }

    pub fn target_id(&self) -> Destination {
        self.target_id
    }

    pub fn to_my_left(&self) -> Option<&Connection> {
        self.to_my_left.as_ref()
    }

    pub fn to_my_right(&self) -> Option<&Connection> {
        self.to_my_right.as_ref()
    }

    fn is_alice(&self) -> bool {
        self.my_role == 0
    }

    fn is_bob(&self) -> bool {
        self.my_role == self.n + 1
    }

    pub fn channels(&self) -> Vec<Destination> {
        let mut ids = vec![self.target_id];
        if let Some(conn) = &self.to_my_left {
            ids.push(conn.ledger.id);
        }
        if let Some(conn) = &self.to_my_right {
            ids.push(conn.ledger.id);
        }
        ids
    }

    pub fn approve(&self) -> Objective {
        let mut updated = self.clone();
        if updated.status != ObjectiveStatus::Rejected {
            updated.status = ObjectiveStatus::Approved;
        }
        updated
    }

    pub fn reject(&self) -> Objective {
        let mut updated = self.clone();
        updated.status = ObjectiveStatus::Rejected;
        updated
    }

    pub fn mark_completed(&self) -> Objective {
        let mut updated = self.clone();
        updated.status = ObjectiveStatus::Completed;
        updated
    }

    /// V's post-fund state with the signatures collected so far.
    pub fn post_fund_setup(&self) -> SignedState {
        SignedState::with_signatures(
            self.starting_state.state().clone_as_turn(1),
            self.post_fund_sigs.clone(),
        )
    }

    pub fn update(&self, event: &ObjectiveEvent) -> Result<Objective, ProtocolError> {
        if event.objective_id != self.id() {
            return Err(ProtocolError::WrongObjective {
                want: self.id(),
                got: event.objective_id.clone(),
            });
        }
        let mut updated = self.clone();
        for ss in &event.signed_states {
            let channel_id = ss.channel_id();
            if channel_id.is_zero() {
                return Err(ProtocolError::UnknownChannel(channel_id));
            }
            if channel_id == updated.target_id {
                match ss.state().turn_num {
                    0 => updated.starting_state.merge(ss)?,
                    1 => {
                        let mut post_fund = updated.post_fund_setup();
                        post_fund.merge(ss)?;
                        updated.post_fund_sigs = post_fund.signatures().clone();
                    }
                    turn => return Err(ProtocolError::UnexpectedTurn(turn)),
                }
            } else if let Some(conn) = updated.ledger_mut(channel_id) {
                // Stale or conflicting ledger states are dropped; the
                // transport may replay and reorder.
                if let Err(err) = conn.ledger.receive(ss) {
                    warn!(ledger = ?channel_id, %err, "ignoring ledger state");
                }
            } else {
                return Err(ProtocolError::UnknownChannel(channel_id));
            }
        }
        Ok(updated)
    }

    pub fn update_with_chain_event(&self, event: &ChainEvent) -> Result<Objective, ProtocolError> {
        let channel_id = event.channel_id();
        let mut updated = self.clone();
        let Some(conn) = updated.ledger_mut(channel_id) else {
            return Err(ProtocolError::UnknownChannel(channel_id));
        };
        match event {
            ChainEvent::Deposited(e) => {
                conn.ledger.on_chain_funding.insert(e.asset, e.now_held);
            }
            ChainEvent::AllocationUpdated(_) | ChainEvent::Concluded(_) => {
                debug!(ledger = ?channel_id, ?event, "no action for chain event");
            }
        }
        Ok(updated)
    }

    fn ledger_mut(&mut self, channel_id: Destination) -> Option<&mut Connection> {
        let matches = |conn: &Option<Connection>| {
            conn.as_ref().map(|c| c.ledger.id == channel_id).unwrap_or(false)
        };
        if matches(&self.to_my_left) {
            return self.to_my_left.as_mut();
        }
        if matches(&self.to_my_right) {
            return self.to_my_right.as_mut();
        }
        None
    }

    pub fn crank(
        &self,
        sk: &SecretKey,
    ) -> Result<(Objective, SideEffects, WaitingFor), ProtocolError> {
        if self.status == ObjectiveStatus::Completed {
            return Ok((self.clone(), SideEffects::default(), WaitingFor::Nothing));
        }
        if self.status != ObjectiveStatus::Approved {
            return Err(ProtocolError::NotApproved);
        }

        let mut updated = self.clone();
        let mut effects = SideEffects::default();
        let objective_id = self.id();

        // Round 1: everyone signs V's pre-fund state.
        if !updated.starting_state.has_signature_for(updated.my_role) {
            updated.starting_state.sign(sk)?;
            effects.messages.extend(create_signed_state_messages(
                &objective_id,
                &updated.starting_state,
                updated.my_role,
            ));
        }
        if !updated.starting_state.has_all_signatures() {
            return Ok((updated, effects, WaitingFor::CompletePrefund));
        }

        // Round 2: land the guarantee in each adjacent ledger this role is
        // responsible for.
        if let Some(mut conn) = updated.to_my_left.take() {
            if !conn.supported_affords() {
                effects.merge(crank_ledger(&mut conn, &objective_id, sk)?);
            }
            updated.to_my_left = Some(conn);
        }
        if let Some(mut conn) = updated.to_my_right.take() {
            if !conn.supported_affords() {
                effects.merge(crank_ledger(&mut conn, &objective_id, sk)?);
            }
            updated.to_my_right = Some(conn);
        }
        if !updated.funding_complete() {
            return Ok((updated, effects, WaitingFor::CompleteFunding));
        }

        // Round 3: everyone signs V's post-fund state.
        if !updated.post_fund_sigs.contains_key(&updated.my_role) {
            let mut post_fund = updated.post_fund_setup();
            post_fund.sign(sk)?;
            updated.post_fund_sigs = post_fund.signatures().clone();
            effects.messages.extend(create_signed_state_messages(
                &objective_id,
                &post_fund,
                updated.my_role,
            ));
        }
        if !updated.post_fund_setup().has_all_signatures() {
            return Ok((updated, effects, WaitingFor::CompletePostFund));
        }

        Ok((updated, effects, WaitingFor::Nothing))
    }

    /// Funding is done when every adjacent ledger's consensus affords the
    /// expected guarantee.
    fn funding_complete(&self) -> bool {
        let left_ok = self
            .to_my_left
            .as_ref()
            .map(Connection::supported_affords)
            .unwrap_or(true);
        let right_ok = self
            .to_my_right
            .as_ref()
            .map(Connection::supported_affords)
            .unwrap_or(true);
        left_ok && right_ok
    }

    pub fn to_record(&self) -> Record {
        Record {
            status: self.status,
            starting_state: self.starting_state.clone(),
            post_fund_sigs: self.post_fund_sigs.clone(),
            target_id: self.target_id,
            left: self.to_my_left.as_ref().map(Connection::to_record),
            right: self.to_my_right.as_ref().map(Connection::to_record),
            n: self.n,
            my_role: self.my_role,
            a0: self.a0.clone(),
            b0: self.b0.clone(),
        }
    }

    pub fn from_record(
        record: Record,
        left_ledger: Option<ConsensusChannel>,
        right_ledger: Option<ConsensusChannel>,
    ) -> Objective {
        Objective {
            status: record.status,
            starting_state: record.starting_state,
            post_fund_sigs: record.post_fund_sigs,
            target_id: record.target_id,
            to_my_left: record
                .left
                .zip(left_ledger)
                .map(|(rec, ledger)| Connection::from_record(rec, ledger)),
            to_my_right: record
                .right
                .zip(right_ledger)
                .map(|(rec, ledger)| Connection::from_record(rec, ledger)),
            n: record.n,
            my_role: record.my_role,
            a0: record.a0,
            b0: record.b0,
        }
    }
}

/// One funding step on a single ledger: the leader proposes the guarantee,
/// the follower accepts a pending proposal that checks out.
fn crank_ledger(
    conn: &mut Connection,
    objective_id: &ObjectiveId,
    sk: &SecretKey,
) -> Result<SideEffects, ProtocolError> {
    let mut effects = SideEffects::default();

    if conn.ledger.is_leader() {
        // Nothing to do while an equivalent proposal is in flight.
        if conn.pending_affords() {
            return Ok(effects);
        }
        // The single proposal slot is taken by another objective; wait for
        // it to resolve rather than displacing it.
        if conn.ledger.pending_proposal().is_some() {
            debug!(ledger = ?conn.ledger.id, "proposal slot occupied, waiting");
            return Ok(effects);
        }
        let info = &conn.guarantee_info;
        let ss = conn.ledger.propose(
            LedgerUpdate::DivertToGuarantee {
                left: info.left,
                right: info.right,
                left_amount: info.left_amount.clone(),
                right_amount: info.right_amount.clone(),
                target: info.target,
            },
            sk,
        )?;
        effects
            .messages
            .extend(create_signed_state_messages(objective_id, &ss, LEADER_INDEX));
        return Ok(effects);
    }

    if conn.ledger.pending_proposal().is_none() {
        return Ok(effects);
    }

    // Follower-side acceptance checks: the proposal must deduct exactly our
    // own deposit from us, and its outcome must afford the guarantee with
    // the funds actually held on chain.
    let proposed = conn
        .ledger
        .proposed_vars()
        .expect("pending proposal checked above");
    let our_destination = conn.ledger.my_destination();
    let our_deposit = if conn.ledger.my_index == LEADER_INDEX {
        conn.guarantee_info.left_amount.clone()
    } else {
        conn.guarantee_info.right_amount.clone()
    };

    let previous_total = conn
        .ledger
        .consensus_vars()
        .outcome
        .total_allocated_for(our_destination);
    let new_total = proposed.outcome.total_allocated_for(our_destination);
    let maintains_our_funds = new_total.add(&our_deposit) == previous_total;

    if maintains_our_funds && conn.pending_affords() {
        let ss = conn.ledger.accept_pending(sk)?;
        effects
            .messages
            .extend(create_signed_state_messages(objective_id, &ss, FOLLOWER_INDEX));
    } else {
        debug!(
            ledger = ?conn.ledger.id,
            maintains_our_funds,
            "leaving ledger proposal pending"
        );
    }
    Ok(effects)
}

/// A single-hop virtual channel: three participants, and an initial outcome
/// holding exactly the two end balances per asset.
fn validate_initial_state(state: &State) -> Result<(), ProtocolError> {
    if state.turn_num != 0 {
        return Err(ProtocolError::UnexpectedTurn(state.turn_num));
    }
    if state.participants.len() != 3 {
        return Err(ProtocolError::InvalidOutcomeShape(
            "a single-hop virtual channel has exactly three participants",
        ));
    }
    for sae in &state.outcome.0 {
        if sae.allocations.len() != 2 {
            return Err(ProtocolError::InvalidOutcomeShape(
                "a virtual channel's initial outcome has exactly two allocations per asset",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::outcome::GuaranteeMetadata;
    use crate::sig::Signer;

    /// A directly funded, consensus-promoted ledger between two signers with
    /// 5 + 5 of the default asset.
    fn ledger(left: &Signer, right: &Signer, my_index: usize, nonce: u64) -> ConsensusChannel {
        let state = State {
            chain_id: U256::zero(),
            participants: vec![left.address(), right.address()],
            channel_nonce: nonce,
            app_definition: Address::default(),
            challenge_duration: 60,
            app_data: Vec::new(),
            outcome: Exit::simple(
                Address::default(),
                vec![
                    (Destination::from_address(left.address()), U256::from(5)),
                    (Destination::from_address(right.address()), U256::from(5)),
                ],
            ),
            turn_num: 0,
            is_final: false,
        };
        let mut channel = Channel::new(state.clone(), my_index).unwrap();
        for turn in [0u64, 1] {
            let turn_state = state.clone_as_turn(turn);
            for signer in [left, right] {
                channel.add_signed_state(&turn_state, turn_state.sign(&signer.secret_key()));
            }
        }
        channel.on_chain_funding = Funds::single(Address::default(), U256::from(10));
        ConsensusChannel::from_channel(&channel).unwrap()
    }

    struct Setup {
        alice: Signer,
        irene: Signer,
        bob: Signer,
        a: Objective,
        i: Objective,
        b: Objective,
    }

    fn setup() -> Setup {
        let mut rng = rand::thread_rng();
        let alice = Signer::random(&mut rng);
        let irene = Signer::random(&mut rng);
        let bob = Signer::random(&mut rng);

        let request = Request {
            intermediary: irene.address(),
            counterparty: bob.address(),
            chain_id: U256::zero(),
            challenge_duration: 60,
            outcome: Exit::simple(
                Address::default(),
                vec![
                    (Destination::from_address(alice.address()), U256::from(5)),
                    (Destination::from_address(bob.address()), U256::from(5)),
                ],
            ),
            app_definition: Address::default(),
            app_data: Vec::new(),
            nonce: 77,
        };

        let a = Objective::new(&request, alice.address(), ledger(&alice, &irene, 0, 1)).unwrap();

        // Alice cranks once to produce the opening message.
        let (a, effects, _) = a.crank(&alice.secret_key()).unwrap();
        let to_irene = effects.messages.iter().find(|m| m.to == irene.address()).unwrap();
        let to_bob = effects.messages.iter().find(|m| m.to == bob.address()).unwrap();

        let i = Objective::construct_from_message(to_irene, irene.address(), |l, r| {
            if (l, r) == (alice.address(), irene.address()) {
                Some(ledger(&alice, &irene, 1, 1))
            } else if (l, r) == (irene.address(), bob.address()) {
                Some(ledger(&irene, &bob, 0, 2))
            } else {
                None
            }
        })
        .unwrap()
        .approve();

        let b = Objective::construct_from_message(to_bob, bob.address(), |l, r| {
            if (l, r) == (irene.address(), bob.address()) {
                Some(ledger(&irene, &bob, 1, 2))
            } else {
                None
            }
        })
        .unwrap()
        .approve();

        Setup { alice, irene, bob, a, i, b }
    }

    fn deliver(from_effects: &SideEffects, to: Address, target: &Objective) -> Objective {
        let mut updated = target.clone();
        for message in from_effects.messages.iter().filter(|m| m.to == to) {
            updated = updated.update(&ObjectiveEvent::from_message(message)).unwrap();
        }
        updated
    }

    #[test]
    fn roles_are_inferred_from_the_participant_list() {
        let s = setup();
        assert!(s.a.is_alice());
        assert!(!s.a.is_bob());
        assert!(s.a.to_my_left().is_none());
        assert!(s.a.to_my_right().is_some());

        assert!(!s.i.is_alice());
        assert!(!s.i.is_bob());
        assert!(s.i.to_my_left().is_some());
        assert!(s.i.to_my_right().is_some());

        assert!(s.b.is_bob());
        assert!(s.b.to_my_left().is_some());
        assert!(s.b.to_my_right().is_none());
    }

    #[test]
    fn alice_never_constructs_from_peer_messages() {
        let s = setup();
        let (_, effects, _) = s.b.crank(&s.bob.secret_key()).unwrap();
        let to_alice = effects
            .messages
            .iter()
            .find(|m| m.to == s.alice.address())
            .unwrap();
        assert!(matches!(
            Objective::construct_from_message(to_alice, s.alice.address(), |_, _| None),
            Err(ProtocolError::InitiatorFromMessage)
        ));
    }

    #[test]
    fn full_three_party_flow() {
        let s = setup();
        let (mut a, mut i, mut b) = (s.a.clone(), s.i.clone(), s.b.clone());

        // Irene and Bob sign the pre-fund; everyone converges on 3 sigs.
        let (i2, i_fx, waiting) = i.crank(&s.irene.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::CompletePrefund);
        i = i2;
        let (b2, b_fx, _) = b.crank(&s.bob.secret_key()).unwrap();
        b = b2;

        a = deliver(&i_fx, s.alice.address(), &a);
        a = deliver(&b_fx, s.alice.address(), &a);
        b = deliver(&i_fx, s.bob.address(), &b);
        i = deliver(&b_fx, s.irene.address(), &i);

        // Alice now proposes the guarantee in A<->I.
        let (a2, a_fx, waiting) = a.crank(&s.alice.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::CompleteFunding);
        assert_eq!(a_fx.messages.len(), 1, "one proposal to Irene");
        a = a2;

        // Irene accepts it and proposes in I<->B.
        i = deliver(&a_fx, s.irene.address(), &i);
        let (i2, i_fx, waiting) = i.crank(&s.irene.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::CompleteFunding);
        i = i2;

        // Irene's effects: counter-signature to Alice, proposal to Bob.
        a = deliver(&i_fx, s.alice.address(), &a);
        b = deliver(&i_fx, s.bob.address(), &b);

        // Bob accepts; his ledger funding is complete, so he also signs the
        // post-fund in the same crank.
        let (b2, b_fx, waiting) = b.crank(&s.bob.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::CompletePostFund);
        b = b2;
        i = deliver(&b_fx, s.irene.address(), &i);

        // Alice's right ledger reached consensus with the counter-signature.
        let (a2, a_fx, waiting) = a.crank(&s.alice.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::CompletePostFund);
        a = a2;
        i = deliver(&a_fx, s.irene.address(), &i);
        b = deliver(&a_fx, s.bob.address(), &b);

        // Irene already holds Alice's and Bob's post-fund signatures, so her
        // own signature completes the set.
        let (i2, i_fx, waiting) = i.crank(&s.irene.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::Nothing);
        i = i2;
        a = deliver(&i_fx, s.alice.address(), &a);
        b = deliver(&i_fx, s.bob.address(), &b);

        let (b2, _, waiting) = b.crank(&s.bob.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::Nothing);
        b = b2;

        let (a, _, waiting) = a.crank(&s.alice.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::Nothing);

        // Conservation in each ledger: 5 and 5 moved into a trailing
        // guarantee of 10 for V.
        for conn in [a.to_my_right().unwrap(), i.to_my_left().unwrap()] {
            let outcome = &conn.ledger.consensus_vars().outcome;
            let allocations = &outcome.0[0].allocations;
            assert_eq!(allocations.len(), 3);
            assert_eq!(allocations[0].amount, U256::zero());
            assert_eq!(allocations[1].amount, U256::zero());
            assert_eq!(allocations[2].amount, U256::from(10));
            let meta = GuaranteeMetadata::decode(&allocations[2].metadata).unwrap();
            assert_eq!(meta.target, a.target_id());
            assert_eq!(meta.left, Destination::from_address(s.alice.address()));
            assert_eq!(meta.right, Destination::from_address(s.irene.address()));
        }
        let right_of_b = b.to_my_left().unwrap();
        let meta = GuaranteeMetadata::decode(
            &right_of_b.ledger.consensus_vars().outcome.0[0].allocations[2].metadata,
        )
        .unwrap();
        assert_eq!(meta.left, Destination::from_address(s.irene.address()));
        assert_eq!(meta.right, Destination::from_address(s.bob.address()));
    }

    #[test]
    fn follower_ignores_proposal_with_wrong_deduction() {
        let s = setup();
        let (mut a, mut i) = (s.a.clone(), s.i.clone());

        // Complete the pre-fund round between the three.
        let (i2, i_fx, _) = i.crank(&s.irene.secret_key()).unwrap();
        i = i2;
        let (b2, b_fx, _) = s.b.crank(&s.bob.secret_key()).unwrap();
        a = deliver(&i_fx, s.alice.address(), &a);
        a = deliver(&b_fx, s.alice.address(), &a);
        i = deliver(&b_fx, s.irene.address(), &i);
        drop(b2);

        // Alice proposes a malformed guarantee that deducts only 4 from
        // Irene, not her full deposit of 5.
        let mut greedy = a.clone();
        greedy.to_my_right.as_mut().unwrap().guarantee_info.right_amount =
            Funds::single(Address::default(), U256::from(4));
        let (_, greedy_fx, _) = greedy.crank(&s.alice.secret_key()).unwrap();

        i = deliver(&greedy_fx, s.irene.address(), &i);
        let (i, i_fx, waiting) = i.crank(&s.irene.secret_key()).unwrap();
        // Irene leaves the proposal pending for her left ledger: no
        // counter-signature goes back to Alice, only her own I<->B proposal
        // to Bob.
        assert_eq!(waiting, WaitingFor::CompleteFunding);
        assert!(i_fx.messages.iter().all(|m| m.to == s.bob.address()));
        assert!(i.to_my_left().unwrap().ledger.pending_proposal().is_some());
        assert!(!i.to_my_left().unwrap().supported_affords());
    }

    #[test]
    fn records_relink_against_stored_ledgers() {
        let s = setup();
        let record = s.i.to_record();
        let left = s.i.to_my_left().unwrap().ledger.clone();
        let right = s.i.to_my_right().unwrap().ledger.clone();

        let bytes = bincode::serialize(&record).unwrap();
        let decoded: Record = bincode::deserialize(&bytes).unwrap();
        let restored = Objective::from_record(decoded, Some(left), Some(right));

        assert_eq!(restored.id(), s.i.id());
        assert_eq!(restored.status(), s.i.status());
        assert_eq!(restored.my_role, s.i.my_role);
        assert_eq!(restored.a0, s.i.a0);
        assert_eq!(
            restored.to_my_left().unwrap().expected_guarantees,
            s.i.to_my_left().unwrap().expected_guarantees
        );
    }
}
