//! A participant's view of a channel: the signed states collected per turn,
//! the on-chain funding observed so far, and the latest fully-signed state.

use std::collections::BTreeMap;

use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::outcome::Allocation;
use crate::state::{SignedState, State, StateError};
use crate::types::{Address, Destination, Funds, Signature};

pub const PRE_FUND_TURN: u64 = 0;
pub const POST_FUND_TURN: u64 = 1;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channels must be constructed from a turn-0 state")]
    NotPreFundState,
    #[error("participant index {index} out of range for {participants} participants")]
    IndexOutOfRange { index: usize, participants: usize },
    #[error("channel has no fully-signed state yet")]
    NoSupportedState,
    #[error("channel has no state recorded at turn {0}")]
    MissingTurn(u64),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Per-channel bookkeeping. Holds up to one signed state per turn number.
///
/// The channel id is fixed at construction; every incoming state must carry
/// it. `latest_supported_turn_num` names the highest turn signed by every
/// participant and only ever moves forward. Older states are retained; the
/// supported one is never dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: Destination,
    pub my_index: usize,
    pub on_chain_funding: Funds,
    fixed_part: crate::state::FixedPart,
    signed_states: BTreeMap<u64, SignedState>,
    latest_supported_turn_num: Option<u64>,
}

impl Channel {
    /// Construct a channel from its pre-fund state. Seeds the turn-0 and
    /// turn-1 entries so setup signatures merge into place from either side.
    pub fn new(state: State, my_index: usize) -> Result<Channel, ChannelError> {
        if state.turn_num != PRE_FUND_TURN {
            return Err(ChannelError::NotPreFundState);
        }
        if my_index >= state.participants.len() {
            return Err(ChannelError::IndexOutOfRange {
                index: my_index,
                participants: state.participants.len(),
            });
        }

        let id = state.channel_id();
        let fixed_part = state.fixed_part();
        let post_fund = state.clone_as_turn(POST_FUND_TURN);

        let mut signed_states = BTreeMap::new();
        signed_states.insert(PRE_FUND_TURN, SignedState::new(state));
        signed_states.insert(POST_FUND_TURN, SignedState::new(post_fund));

        Ok(Channel {
            id,
            my_index,
            on_chain_funding: Funds::new(),
            fixed_part,
            signed_states,
            latest_supported_turn_num: None,
        })
    }

    /// Rehydrate a channel view from previously agreed parts. Used when a
    /// store re-links a record whose plain channel has been promoted to a
    /// consensus channel.
    pub(crate) fn restore(
        id: Destination,
        my_index: usize,
        on_chain_funding: Funds,
        fixed_part: crate::state::FixedPart,
        signed_states: BTreeMap<u64, SignedState>,
        latest_supported_turn_num: Option<u64>,
    ) -> Channel {
        Channel {
            id,
            my_index,
            on_chain_funding,
            fixed_part,
            signed_states,
            latest_supported_turn_num,
        }
    }

    pub fn fixed_part(&self) -> &crate::state::FixedPart {
        &self.fixed_part
    }

    pub fn participants(&self) -> &[Address] {
        &self.fixed_part.participants
    }

    pub fn my_address(&self) -> Address {
        self.fixed_part.participants[self.my_index]
    }

    pub fn my_destination(&self) -> Destination {
        Destination::from_address(self.my_address())
    }

    /// Merge a single signature on `state` into the channel.
    ///
    /// Returns `false` without mutating on any validation failure: an
    /// unverifiable signature, a non-participant signer, a foreign channel
    /// id, a stale turn number, or a same-turn state that conflicts with the
    /// one already recorded. These are expected under adversarial input and
    /// are logged, not raised.
    pub fn add_signed_state(&mut self, state: &State, signature: Signature) -> bool {
        let signer = match state.recover_signer(&signature) {
            Ok(signer) => signer,
            Err(err) => {
                warn!(channel = ?self.id, %err, "dropping unverifiable signature");
                return false;
            }
        };
        if state.participant_index(signer).is_none() {
            warn!(channel = ?self.id, signer = ?signer, "dropping signature by non-participant");
            return false;
        }
        if state.channel_id() != self.id {
            warn!(channel = ?self.id, got = ?state.channel_id(), "dropping state for other channel");
            return false;
        }

        let turn_num = state.turn_num;
        if let Some(latest) = self.latest_supported_turn_num {
            if turn_num < latest {
                warn!(channel = ?self.id, turn_num, latest, "dropping stale state");
                return false;
            }
        }

        let entry = self
            .signed_states
            .entry(turn_num)
            .or_insert_with(|| SignedState::new(state.clone()));
        if entry.state().hash() != state.hash() {
            warn!(channel = ?self.id, turn_num, "dropping conflicting state for known turn");
            return false;
        }
        if entry.add_signature(signature).is_err() {
            return false;
        }

        if entry.has_all_signatures() {
            // Monotone by the stale check above.
            self.latest_supported_turn_num = Some(turn_num);
        }
        true
    }

    /// Merge every signature carried by a signed state. Returns `true` if all
    /// of them were accepted.
    pub fn add_signed_states(&mut self, ss: &SignedState) -> bool {
        ss.signatures()
            .values()
            .map(|signature| self.add_signed_state(ss.state(), *signature))
            .fold(true, |acc, ok| acc && ok)
    }

    /// Sign the state recorded at `turn_num` with the local key and return
    /// the signed state (carrying every signature known for that turn).
    pub fn sign_turn(&mut self, turn_num: u64, sk: &SecretKey) -> Result<SignedState, ChannelError> {
        let entry = self
            .signed_states
            .get_mut(&turn_num)
            .ok_or(ChannelError::MissingTurn(turn_num))?;
        entry.sign(sk)?;
        if entry.has_all_signatures() {
            self.latest_supported_turn_num = Some(turn_num);
        }
        Ok(entry.clone())
    }

    pub fn latest_supported_turn_num(&self) -> Option<u64> {
        self.latest_supported_turn_num
    }

    /// The latest state signed by every participant.
    pub fn latest_supported_state(&self) -> Result<&State, ChannelError> {
        let turn = self
            .latest_supported_turn_num
            .ok_or(ChannelError::NoSupportedState)?;
        self.signed_states
            .get(&turn)
            .map(SignedState::state)
            .ok_or(ChannelError::MissingTurn(turn))
    }

    /// The signed state recorded at `turn_num`, if any.
    pub fn signed_state_for_turn(&self, turn_num: u64) -> Option<&SignedState> {
        self.signed_states.get(&turn_num)
    }

    pub fn pre_fund_state(&self) -> Option<&State> {
        self.signed_states.get(&PRE_FUND_TURN).map(SignedState::state)
    }

    pub fn post_fund_state(&self) -> Option<&State> {
        self.signed_states.get(&POST_FUND_TURN).map(SignedState::state)
    }

    pub fn pre_fund_signed_by_me(&self) -> bool {
        self.signed_states
            .get(&PRE_FUND_TURN)
            .is_some_and(|ss| ss.has_signature_for(self.my_index))
    }

    pub fn post_fund_signed_by_me(&self) -> bool {
        self.signed_states
            .get(&POST_FUND_TURN)
            .is_some_and(|ss| ss.has_signature_for(self.my_index))
    }

    pub fn pre_fund_complete(&self) -> bool {
        self.signed_states
            .get(&PRE_FUND_TURN)
            .is_some_and(SignedState::has_all_signatures)
    }

    pub fn post_fund_complete(&self) -> bool {
        self.signed_states
            .get(&POST_FUND_TURN)
            .is_some_and(SignedState::has_all_signatures)
    }

    /// Sum of the latest supported outcome, per asset.
    pub fn total(&self) -> Funds {
        self.latest_supported_state()
            .map(|s| s.outcome.total())
            .unwrap_or_default()
    }

    /// Whether the latest supported outcome covers each required allocation
    /// given the supplied funding. See [crate::outcome::Exit::affords].
    pub fn affords(
        &self,
        required: &BTreeMap<Address, Allocation>,
        funding: &Funds,
    ) -> bool {
        self.latest_supported_state()
            .map(|s| s.outcome.affords(required, funding))
            .unwrap_or(false)
    }
}
