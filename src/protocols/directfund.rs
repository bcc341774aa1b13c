//! Direct funding: set up an on-chain-backed ledger channel.
//!
//! Three ordered gates on one extended state: collect every signature on the
//! pre-fund state, deposit on chain in participant order, collect every
//! signature on the post-fund state. A crank is idempotent once a gate has
//! been passed, so a recovered objective re-cranks harmlessly.

use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chain::{ChainEvent, ChainTransaction};
use crate::channel::{Channel, POST_FUND_TURN, PRE_FUND_TURN};
use crate::consensus::ConsensusChannel;
use crate::outcome::Exit;
use crate::protocols::{
    create_signed_state_messages, ObjectiveEvent, ObjectiveId, ObjectiveStatus, ProtocolError,
    SideEffects, WaitingFor,
};
use crate::state::{FixedPart, State};
use crate::types::{Address, Destination, Funds, U256};

pub const OBJECTIVE_PREFIX: &str = "DirectFund-";

pub fn is_direct_fund_objective(id: &str) -> bool {
    id.starts_with(OBJECTIVE_PREFIX)
}

/// A request to open a directly funded ledger channel with one counterparty.
/// The requester takes participant index 0 and leads the resulting ledger.
#[derive(Debug, Clone)]
pub struct Request {
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
            participants: vec![my_address, self.counterparty],
            channel_nonce: self.nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
        }
    }

    pub fn channel_id(&self, my_address: Address) -> Destination {
        self.fixed_part(my_address).channel_id()
    }

    /// The objective id this request will resolve to, computable before the
    /// objective exists.
    pub fn id(&self, my_address: Address) -> ObjectiveId {
        format!("{}{:?}", OBJECTIVE_PREFIX, self.channel_id(my_address))
    }

    fn initial_state(&self, my_address: Address) -> State {
        State {
            chain_id: self.chain_id,
            participants: vec![my_address, self.counterparty],
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

/// Serialization form: the channel handle is replaced by its id and
/// re-linked on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub status: ObjectiveStatus,
    pub channel: Destination,
    pub my_deposit_safety_threshold: Funds,
    pub my_deposit_amount: Funds,
    pub fully_funded_threshold: Funds,
}

#[derive(Debug, Clone)]
pub struct Objective {
    status: ObjectiveStatus,
    channel: Channel,
    /// What must already be on chain before it is safe for us to deposit:
    /// the sum of every earlier-indexed participant's share, per asset.
    my_deposit_safety_threshold: Funds,
    my_deposit_amount: Funds,
    fully_funded_threshold: Funds,
}

impl Objective {
    /// Build a locally initiated (and therefore pre-approved) objective.
    pub fn new(request: &Request, my_address: Address) -> Result<Objective, ProtocolError> {
        Self::construct_from_state(true, request.initial_state(my_address), my_address)
    }

    fn construct_from_state(
        pre_approve: bool,
        initial_state: State,
        my_address: Address,
    ) -> Result<Objective, ProtocolError> {
        let my_index = initial_state
            .participant_index(my_address)
            .ok_or(ProtocolError::NotParticipant(my_address))?;
        let my_destination = Destination::from_address(my_address);

        // Deposit arithmetic, per asset: everything allocated before our own
        // allocation must land on chain before we deposit.
        let mut safety = Funds::new();
        let mut mine = Funds::new();
        let mut total = Funds::new();
        for sae in &initial_state.outcome.0 {
            let mut preceding = U256::zero();
            let mut my_amount = None;
            for allocation in &sae.allocations {
                if my_amount.is_none() {
                    if allocation.destination == my_destination {
                        my_amount = Some(allocation.amount);
                    } else {
                        preceding = preceding + allocation.amount;
                    }
                }
            }
            let my_amount =
                my_amount.ok_or(ProtocolError::InvalidOutcomeShape("missing own allocation"))?;
            safety.insert(sae.asset, preceding);
            mine.insert(sae.asset, my_amount);
            total.insert(sae.asset, sae.total());
        }

        Ok(Objective {
            status: if pre_approve {
                ObjectiveStatus::Approved
            } else {
                ObjectiveStatus::Unapproved
            },
            channel: Channel::new(initial_state, my_index)?,
            my_deposit_safety_threshold: safety,
            my_deposit_amount: mine,
            fully_funded_threshold: total,
        })
    }

    /// Build an objective from a peer's opening message. Starts unapproved;
    /// the policy layer decides its fate before the first crank.
    pub fn construct_from_message(
        message: &crate::messages::Message,
        my_address: Address,
    ) -> Result<Objective, ProtocolError> {
        let [ss] = message.signed_states.as_slice() else {
            return Err(ProtocolError::MalformedMessage(
                "expected exactly one signed state",
            ));
        };
        if ss.state().turn_num != PRE_FUND_TURN {
            return Err(ProtocolError::UnexpectedTurn(ss.state().turn_num));
        }

        let mut objective = Self::construct_from_state(false, ss.state().clone(), my_address)?;
        objective.channel.add_signed_states(ss);
        Ok(objective)
    }

    pub fn id(&self) -> ObjectiveId {
        format!("{}{:?}", OBJECTIVE_PREFIX, self.channel.id)
    }

    pub fn status(&self) -> ObjectiveStatus {
        self.status
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn channels(&self) -> Vec<Destination> {
        vec![self.channel.id]
    }

    pub fn approve(&self) -> Objective {
        let mut updated = self.clone();
        // Rejection is terminal.
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

    pub fn update(&self, event: &ObjectiveEvent) -> Result<Objective, ProtocolError> {
        if event.objective_id != self.id() {
            return Err(ProtocolError::WrongObjective {
                want: self.id(),
                got: event.objective_id.clone(),
            });
        }
        let mut updated = self.clone();
        for ss in &event.signed_states {
            if ss.channel_id() != updated.channel.id {
                return Err(ProtocolError::UnknownChannel(ss.channel_id()));
            }
            // Individual invalid signatures are dropped inside, not raised.
            updated.channel.add_signed_states(ss);
        }
        Ok(updated)
    }

    pub fn update_with_chain_event(&self, event: &ChainEvent) -> Result<Objective, ProtocolError> {
        if event.channel_id() != self.channel.id {
            return Err(ProtocolError::UnknownChannel(event.channel_id()));
        }
        let mut updated = self.clone();
        match event {
            ChainEvent::Deposited(e) => {
                updated.channel.on_chain_funding.insert(e.asset, e.now_held);
            }
            ChainEvent::AllocationUpdated(_) | ChainEvent::Concluded(_) => {
                debug!(channel = ?self.channel.id, ?event, "no action for chain event");
            }
        }
        Ok(updated)
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

        // Pre-fund.
        if !updated.channel.pre_fund_signed_by_me() {
            let ss = updated.channel.sign_turn(PRE_FUND_TURN, sk)?;
            effects
                .messages
                .extend(create_signed_state_messages(&self.id(), &ss, updated.channel.my_index));
        }
        if !updated.channel.pre_fund_complete() {
            return Ok((updated, effects, WaitingFor::CompletePrefund));
        }

        // Funding. Deposits go in on participant order: we only move once
        // everything allocated before us is already on chain, which bounds
        // what a griefing counterparty can cost us.
        if !updated.fully_funded() {
            if updated.safe_to_deposit() && !updated.my_deposit_made() {
                effects.transactions.extend(updated.deposit_transactions());
            }
            return Ok((updated, effects, WaitingFor::CompleteFunding));
        }

        // Post-fund.
        if !updated.channel.post_fund_signed_by_me() {
            let ss = updated.channel.sign_turn(POST_FUND_TURN, sk)?;
            effects
                .messages
                .extend(create_signed_state_messages(&self.id(), &ss, updated.channel.my_index));
        }
        if !updated.channel.post_fund_complete() {
            return Ok((updated, effects, WaitingFor::CompletePostFund));
        }

        Ok((updated, effects, WaitingFor::Nothing))
    }

    fn fully_funded(&self) -> bool {
        self.channel
            .on_chain_funding
            .covers(&self.fully_funded_threshold)
    }

    fn safe_to_deposit(&self) -> bool {
        self.channel
            .on_chain_funding
            .covers(&self.my_deposit_safety_threshold)
    }

    fn my_deposit_made(&self) -> bool {
        self.channel
            .on_chain_funding
            .covers(&self.my_deposit_target())
    }

    fn my_deposit_target(&self) -> Funds {
        self.my_deposit_safety_threshold.add(&self.my_deposit_amount)
    }

    /// One deposit per asset still missing our share, for exactly the
    /// missing amount.
    fn deposit_transactions(&self) -> Vec<ChainTransaction> {
        let target = self.my_deposit_target();
        let mut transactions = Vec::new();
        for (asset, want) in &target.0 {
            let held = self.channel.on_chain_funding.get(asset);
            if held < *want {
                transactions.push(ChainTransaction::deposit(
                    self.channel.id,
                    *asset,
                    *want - held,
                ));
            }
        }
        transactions
    }

    /// The consensus channel this objective leaves behind on completion.
    pub fn create_consensus_channel(&self) -> Result<ConsensusChannel, ProtocolError> {
        Ok(ConsensusChannel::from_channel(&self.channel)?)
    }

    pub fn to_record(&self) -> Record {
        Record {
            status: self.status,
            channel: self.channel.id,
            my_deposit_safety_threshold: self.my_deposit_safety_threshold.clone(),
            my_deposit_amount: self.my_deposit_amount.clone(),
            fully_funded_threshold: self.fully_funded_threshold.clone(),
        }
    }

    pub fn from_record(record: Record, channel: Channel) -> Objective {
        Objective {
            status: record.status,
            channel,
            my_deposit_safety_threshold: record.my_deposit_safety_threshold,
            my_deposit_amount: record.my_deposit_amount,
            fully_funded_threshold: record.fully_funded_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::DepositedEvent;
    use crate::protocols::ObjectiveEvent;
    use crate::sig::Signer;
    use crate::types::Destination;

    fn setup() -> (Signer, Signer, Objective, Objective) {
        let mut rng = rand::thread_rng();
        let alice = Signer::random(&mut rng);
        let bob = Signer::random(&mut rng);
        let request = Request {
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
            nonce: 21,
        };
        let a = Objective::new(&request, alice.address()).unwrap();

        // Bob sees Alice's signed pre-fund state.
        let (cranked, effects, _) = a.crank(&alice.secret_key()).unwrap();
        let to_bob = effects
            .messages
            .iter()
            .find(|m| m.to == bob.address())
            .unwrap();
        let b = Objective::construct_from_message(to_bob, bob.address())
            .unwrap()
            .approve();
        (alice, bob, cranked, b)
    }

    fn deposited(channel: Destination, now_held: u64) -> ChainEvent {
        ChainEvent::Deposited(DepositedEvent {
            channel_id: channel,
            block_num: 1,
            asset: Address::default(),
            amount: U256::from(now_held),
            now_held: U256::from(now_held),
        })
    }

    #[test]
    fn unapproved_objective_does_not_crank() {
        let mut rng = rand::thread_rng();
        let alice = Signer::random(&mut rng);
        let (_, _, a, _) = setup();
        let unapproved = Objective {
            status: ObjectiveStatus::Unapproved,
            ..a
        };
        assert!(matches!(
            unapproved.crank(&alice.secret_key()),
            Err(ProtocolError::NotApproved)
        ));
    }

    #[test]
    fn initiator_waits_for_prefund_then_deposits_first() {
        let (alice, _, a, _) = setup();

        // Without Bob's signature the objective stays at the pre-fund gate
        // and emits nothing new.
        let (a2, effects, waiting) = a.crank(&alice.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::CompletePrefund);
        assert!(effects.is_empty());
        drop(a2);
        drop(a);
    }

    #[test]
    fn full_two_party_flow() {
        let (alice, bob, a, b) = setup();
        let channel_id = a.channel().id;

        // Bob signs the pre-fund and the signature reaches Alice.
        let (b, b_effects, waiting) = b.crank(&bob.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::CompleteFunding);
        let to_alice = b_effects
            .messages
            .iter()
            .find(|m| m.to == alice.address())
            .unwrap();
        let a = a.update(&ObjectiveEvent::from_message(to_alice)).unwrap();

        // Alice deposits first (participant 0), Bob holds off.
        let (a, effects, waiting) = a.crank(&alice.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::CompleteFunding);
        assert_eq!(effects.transactions.len(), 1);
        assert_eq!(effects.transactions[0].amount, U256::from(5));

        let (b, effects, _) = b.crank(&bob.secret_key()).unwrap();
        assert!(effects.transactions.is_empty(), "b must wait for a's deposit");

        // Alice's deposit lands; Bob tops up his share.
        let b = b.update_with_chain_event(&deposited(channel_id, 5)).unwrap();
        let (b, effects, waiting) = b.crank(&bob.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::CompleteFunding);
        assert_eq!(effects.transactions.len(), 1);
        assert_eq!(effects.transactions[0].amount, U256::from(5));

        // Everyone sees the fully funded channel and swaps post-fund sigs.
        let a = a.update_with_chain_event(&deposited(channel_id, 10)).unwrap();
        let b = b.update_with_chain_event(&deposited(channel_id, 10)).unwrap();

        let (a, a_effects, waiting) = a.crank(&alice.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::CompletePostFund);
        let (b, b_effects, _) = b.crank(&bob.secret_key()).unwrap();

        let a = a
            .update(&ObjectiveEvent::from_message(
                b_effects.messages.iter().find(|m| m.to == alice.address()).unwrap(),
            ))
            .unwrap();
        let b = b
            .update(&ObjectiveEvent::from_message(
                a_effects.messages.iter().find(|m| m.to == bob.address()).unwrap(),
            ))
            .unwrap();

        let (a, _, waiting) = a.crank(&alice.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::Nothing);
        let (b, _, waiting) = b.crank(&bob.secret_key()).unwrap();
        assert_eq!(waiting, WaitingFor::Nothing);

        // Both sides can promote the channel to a consensus ledger.
        let ca = a.create_consensus_channel().unwrap();
        let cb = b.create_consensus_channel().unwrap();
        assert_eq!(ca.consensus_vars().turn_num, 1);
        assert_eq!(ca.leader(), alice.address());
        assert_eq!(cb.leader(), alice.address());
    }

    #[test]
    fn recrank_after_gate_emits_nothing_new() {
        let (alice, bob, a, b) = setup();
        let (b, b_effects, _) = b.crank(&bob.secret_key()).unwrap();
        drop(b);
        let to_alice = b_effects
            .messages
            .iter()
            .find(|m| m.to == alice.address())
            .unwrap();

        let a = a.update(&ObjectiveEvent::from_message(to_alice)).unwrap();
        // Duplicate delivery of the same signed state.
        let a = a.update(&ObjectiveEvent::from_message(to_alice)).unwrap();

        let (a, effects, _) = a.crank(&alice.secret_key()).unwrap();
        assert!(effects.messages.is_empty(), "prefund messages already sent");
        // Only the deposit remains, and it is emitted exactly once per crank.
        assert_eq!(effects.transactions.len(), 1);
        drop(a);
    }
}
