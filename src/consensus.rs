//! The two-party consensus channel: a ledger with one supported outcome and
//! at most one proposal in flight.
//!
//! Participant 0 is the leader and proposes updates; participant 1 is the
//! follower and accepts or ignores them. Proposals travel as ordinary signed
//! states (turn `n+1`, leader-signed); the follower's counter-signature on
//! the same state promotes it to the new consensus. A proposal at the same
//! turn from the leader replaces the previous one, so there is never more
//! than one pending.

use std::collections::BTreeMap;

use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::{Channel, ChannelError};
use crate::outcome::{Allocation, Exit, OutcomeError};
use crate::sig::SigError;
use crate::state::{FixedPart, SignedState, State, StateError, VariablePart};
use crate::types::{Address, Destination, Funds, Signature};

pub const LEADER_INDEX: usize = 0;
pub const FOLLOWER_INDEX: usize = 1;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("a consensus channel has exactly two participants, got {0}")]
    TwoParticipantsRequired(usize),
    #[error("only the leader may propose")]
    NotLeader,
    #[error("only the follower may accept")]
    NotFollower,
    #[error("no proposal is pending")]
    NoPendingProposal,
    #[error("state belongs to channel {got:?}, not {want:?}")]
    WrongChannel { want: Destination, got: Destination },
    #[error("turn {got} is stale, consensus is at {supported}")]
    StaleTurn { got: u64, supported: u64 },
    #[error("turn {got} skips ahead of consensus at {supported}")]
    TurnGap { got: u64, supported: u64 },
    #[error("state conflicts with the one recorded for its turn")]
    ConflictingState,
    #[error("proposal does not carry the leader's signature")]
    NotSignedByLeader,
    #[error("proposal drops or mutates a previously agreed guarantee")]
    GuaranteeDropped,
    #[error("ledger states carry no app data and are never final")]
    NotLedgerState,
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Outcome(#[from] OutcomeError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Sig(#[from] SigError),
}

/// The consensus variables: everything that changes when a proposal lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vars {
    pub turn_num: u64,
    pub outcome: Exit,
}

/// An outcome transformation the leader may propose.
#[derive(Debug, Clone)]
pub enum LedgerUpdate {
    /// Redirect funds from two existing allocations into a trailing
    /// guarantee for a target channel.
    DivertToGuarantee {
        left: Destination,
        right: Destination,
        left_amount: Funds,
        right_amount: Funds,
        target: Destination,
    },
    /// Append a simple allocation to one asset exit.
    IncludeAllocation { asset: Address, allocation: Allocation },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusChannel {
    pub id: Destination,
    pub my_index: usize,
    pub on_chain_funding: Funds,
    fixed_part: FixedPart,
    supported: Vars,
    supported_sigs: BTreeMap<usize, Signature>,
    pending: Option<SignedState>,
}

impl ConsensusChannel {
    /// Promote a fully set-up channel into a consensus channel. The
    /// channel's latest supported state becomes the initial consensus.
    pub fn from_channel(channel: &Channel) -> Result<ConsensusChannel, ConsensusError> {
        let participants = channel.participants().len();
        if participants != 2 {
            return Err(ConsensusError::TwoParticipantsRequired(participants));
        }

        let state = channel.latest_supported_state()?.clone();
        if !state.app_data.is_empty() || state.is_final {
            return Err(ConsensusError::NotLedgerState);
        }
        let signed = channel
            .signed_state_for_turn(state.turn_num)
            .ok_or(ChannelError::NoSupportedState)?;

        Ok(ConsensusChannel {
            id: channel.id,
            my_index: channel.my_index,
            on_chain_funding: channel.on_chain_funding.clone(),
            fixed_part: channel.fixed_part().clone(),
            supported: Vars {
                turn_num: state.turn_num,
                outcome: state.outcome,
            },
            supported_sigs: signed.signatures().clone(),
            pending: None,
        })
    }

    pub fn leader(&self) -> Address {
        self.fixed_part.participants[LEADER_INDEX]
    }

    pub fn follower(&self) -> Address {
        self.fixed_part.participants[FOLLOWER_INDEX]
    }

    pub fn is_leader(&self) -> bool {
        self.my_index == LEADER_INDEX
    }

    pub fn my_address(&self) -> Address {
        self.fixed_part.participants[self.my_index]
    }

    pub fn my_destination(&self) -> Destination {
        Destination::from_address(self.my_address())
    }

    pub fn my_counterparty(&self) -> Address {
        self.fixed_part.participants[1 - self.my_index]
    }

    pub fn participants(&self) -> &[Address] {
        &self.fixed_part.participants
    }

    pub fn consensus_vars(&self) -> &Vars {
        &self.supported
    }

    pub fn supported_signatures(&self) -> &BTreeMap<usize, Signature> {
        &self.supported_sigs
    }

    /// The fully-signed state the consensus variables correspond to.
    pub fn latest_supported_state(&self) -> State {
        self.state_for_vars(&self.supported)
    }

    pub fn pending_proposal(&self) -> Option<&SignedState> {
        self.pending.as_ref()
    }

    pub fn proposed_vars(&self) -> Option<Vars> {
        self.pending.as_ref().map(|ss| Vars {
            turn_num: ss.state().turn_num,
            outcome: ss.state().outcome.clone(),
        })
    }

    /// Whether the supported outcome covers the required allocations given
    /// `funding`.
    pub fn supported_affords(
        &self,
        required: &BTreeMap<Address, Allocation>,
        funding: &Funds,
    ) -> bool {
        self.supported.outcome.affords(required, funding)
    }

    /// Whether the pending proposal's outcome covers the required
    /// allocations given `funding`. `false` when nothing is pending.
    pub fn pending_affords(
        &self,
        required: &BTreeMap<Address, Allocation>,
        funding: &Funds,
    ) -> bool {
        self.pending
            .as_ref()
            .map(|ss| ss.state().outcome.affords(required, funding))
            .unwrap_or(false)
    }

    /// Leader half of the update protocol: apply `update` on top of the
    /// current consensus, sign the resulting state and stage it as pending.
    /// Returns the signed state for sending to the follower.
    pub fn propose(
        &mut self,
        update: LedgerUpdate,
        sk: &SecretKey,
    ) -> Result<SignedState, ConsensusError> {
        if !self.is_leader() {
            return Err(ConsensusError::NotLeader);
        }

        let outcome = self.apply_update(update)?;
        let vars = Vars {
            turn_num: self.supported.turn_num + 1,
            outcome,
        };
        let mut ss = SignedState::new(self.state_for_vars(&vars));
        ss.sign(sk)?;

        // Replaces any previous proposal at this turn; only one is ever
        // pending.
        self.pending = Some(ss.clone());
        Ok(ss)
    }

    /// Follower half: counter-sign the pending proposal and promote it to
    /// the new consensus. Returns the fully-signed state for sending back.
    ///
    /// Protocol-specific acceptance checks (what the proposal may change)
    /// are the caller's responsibility; this enforces only the structural
    /// rules checked in [ConsensusChannel::receive].
    pub fn accept_pending(&mut self, sk: &SecretKey) -> Result<SignedState, ConsensusError> {
        if self.is_leader() {
            return Err(ConsensusError::NotFollower);
        }
        let mut ss = self
            .pending
            .take()
            .ok_or(ConsensusError::NoPendingProposal)?;
        ss.sign(sk)?;
        self.promote(ss.clone());
        Ok(ss)
    }

    /// Fold an incoming signed state into the channel: a replayed consensus
    /// state, a fresh proposal from the leader, or a counter-signature on
    /// the pending one.
    pub fn receive(&mut self, ss: &SignedState) -> Result<(), ConsensusError> {
        if ss.channel_id() != self.id {
            return Err(ConsensusError::WrongChannel {
                want: self.id,
                got: ss.channel_id(),
            });
        }
        verify_claimed_signers(ss)?;

        let turn_num = ss.state().turn_num;
        let supported = self.supported.turn_num;

        if turn_num == supported {
            // Replay of the consensus state: absorb any signatures.
            if ss.state().hash() != self.latest_supported_state().hash() {
                return Err(ConsensusError::ConflictingState);
            }
            for (&index, &signature) in ss.signatures() {
                self.supported_sigs.insert(index, signature);
            }
            return Ok(());
        }
        if turn_num < supported {
            return Err(ConsensusError::StaleTurn {
                got: turn_num,
                supported,
            });
        }
        if turn_num > supported + 1 {
            return Err(ConsensusError::TurnGap {
                got: turn_num,
                supported,
            });
        }

        // A next-turn state: either the leader's proposal or a
        // counter-signed copy of the one we already staged.
        if !preserves_guarantees(&self.supported.outcome, &ss.state().outcome) {
            return Err(ConsensusError::GuaranteeDropped);
        }

        match &mut self.pending {
            Some(pending) if pending.state().hash() == ss.state().hash() => {
                pending.merge(ss)?;
            }
            _ => {
                if !ss.has_signature_for(LEADER_INDEX) {
                    return Err(ConsensusError::NotSignedByLeader);
                }
                // First sight of this proposal, or the leader replacing an
                // earlier one at the same turn.
                self.pending = Some(ss.clone());
            }
        }

        if self
            .pending
            .as_ref()
            .is_some_and(SignedState::has_all_signatures)
        {
            let accepted = self.pending.take().expect("checked above");
            self.promote(accepted);
        }
        Ok(())
    }

    fn promote(&mut self, ss: SignedState) {
        self.supported = Vars {
            turn_num: ss.state().turn_num,
            outcome: ss.state().outcome.clone(),
        };
        self.supported_sigs = ss.signatures().clone();
        self.pending = None;
    }

    fn apply_update(&self, update: LedgerUpdate) -> Result<Exit, ConsensusError> {
        match update {
            LedgerUpdate::DivertToGuarantee {
                left,
                right,
                left_amount,
                right_amount,
                target,
            } => Ok(self.supported.outcome.divert_to_guarantee(
                left,
                right,
                &left_amount,
                &right_amount,
                target,
            )?),
            LedgerUpdate::IncludeAllocation { asset, allocation } => {
                let mut outcome = self.supported.outcome.clone();
                match outcome.0.iter_mut().find(|sae| sae.asset == asset) {
                    Some(sae) => sae.allocations.push(allocation),
                    None => outcome.0.push(crate::outcome::SingleAssetExit {
                        asset,
                        allocations: vec![allocation],
                    }),
                }
                Ok(outcome)
            }
        }
    }

    /// A [Channel]-shaped view of the consensus, carrying the supported
    /// state and its signatures. Lets stores re-link records that referenced
    /// the channel before its promotion.
    pub fn to_channel(&self) -> Channel {
        let supported = self.latest_supported_state();
        let turn_num = supported.turn_num;
        let mut signed_states = BTreeMap::new();
        signed_states.insert(
            turn_num,
            SignedState::with_signatures(supported, self.supported_sigs.clone()),
        );
        Channel::restore(
            self.id,
            self.my_index,
            self.on_chain_funding.clone(),
            self.fixed_part.clone(),
            signed_states,
            Some(turn_num),
        )
    }

    fn state_for_vars(&self, vars: &Vars) -> State {
        State::from_parts(
            self.fixed_part.clone(),
            VariablePart {
                app_data: Vec::new(),
                outcome: vars.outcome.clone(),
                turn_num: vars.turn_num,
                is_final: false,
            },
        )
    }
}

/// Check that every signature in a signed state verifies to the participant
/// at its claimed index.
fn verify_claimed_signers(ss: &SignedState) -> Result<(), ConsensusError> {
    for (&index, signature) in ss.signatures() {
        let signer = ss.state().recover_signer(signature)?;
        if ss.state().participants.get(index) != Some(&signer) {
            return Err(ConsensusError::State(StateError::WrongSignerIndex(index)));
        }
    }
    Ok(())
}

/// Every guarantee present in `before` must appear unchanged in `after`.
fn preserves_guarantees(before: &Exit, after: &Exit) -> bool {
    for sae in &before.0 {
        let Some(after_sae) = after.asset_exit(&sae.asset) else {
            return false;
        };
        for guarantee in sae.allocations.iter().filter(|a| a.is_guarantee()) {
            if !after_sae.allocations.contains(guarantee) {
                return false;
            }
        }
    }
    true
}
