//! Channel states and their signatures.
//!
//! A [State] is the immutable [FixedPart] (which names the channel) together
//! with the evolving [VariablePart]. States are content-addressed: the
//! channel id is the hash of the fixed part, the state hash covers both
//! parts. A [SignedState] pairs a state with the signatures collected so far,
//! keyed by participant index.

use std::collections::BTreeMap;

use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::outcome::Exit;
use crate::sig::{self, SigError};
use crate::types::{to_hash, Address, Destination, Hash, Signature, U256};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("signer {0:?} is not a channel participant")]
    NonParticipantSigner(Address),
    #[error("signature claimed for index {0} was made by another participant")]
    WrongSignerIndex(usize),
    #[error("states do not hash to the same value")]
    StateMismatch,
    #[error(transparent)]
    Sig(#[from] SigError),
}

/// The immutable parameters fixed at channel creation. Their hash is the
/// channel id, so equal fixed parts imply the same channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPart {
    pub chain_id: U256,
    pub participants: Vec<Address>,
    pub channel_nonce: u64,
    pub app_definition: Address,
    pub challenge_duration: u64,
}

impl FixedPart {
    pub fn channel_id(&self) -> Destination {
        Destination(to_hash(self).0)
    }
}

/// The part of a state that changes turn to turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariablePart {
    pub app_data: Vec<u8>,
    pub outcome: Exit,
    pub turn_num: u64,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub chain_id: U256,
    pub participants: Vec<Address>,
    pub channel_nonce: u64,
    pub app_definition: Address,
    pub challenge_duration: u64,
    pub app_data: Vec<u8>,
    pub outcome: Exit,
    pub turn_num: u64,
    pub is_final: bool,
}

impl State {
    pub fn from_parts(fixed: FixedPart, variable: VariablePart) -> Self {
        State {
            chain_id: fixed.chain_id,
            participants: fixed.participants,
            channel_nonce: fixed.channel_nonce,
            app_definition: fixed.app_definition,
            challenge_duration: fixed.challenge_duration,
            app_data: variable.app_data,
            outcome: variable.outcome,
            turn_num: variable.turn_num,
            is_final: variable.is_final,
        }
    }

    pub fn fixed_part(&self) -> FixedPart {
        FixedPart {
            chain_id: self.chain_id,
            participants: self.participants.clone(),
            channel_nonce: self.channel_nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
        }
    }

    pub fn variable_part(&self) -> VariablePart {
        VariablePart {
            app_data: self.app_data.clone(),
            outcome: self.outcome.clone(),
            turn_num: self.turn_num,
            is_final: self.is_final,
        }
    }

    pub fn channel_id(&self) -> Destination {
        self.fixed_part().channel_id()
    }

    pub fn hash(&self) -> Hash {
        to_hash(self)
    }

    /// The same state at a different turn number.
    pub fn clone_as_turn(&self, turn_num: u64) -> State {
        let mut next = self.clone();
        next.turn_num = turn_num;
        next
    }

    pub fn sign(&self, sk: &SecretKey) -> Signature {
        sig::sign(self.hash(), sk)
    }

    pub fn recover_signer(&self, signature: &Signature) -> Result<Address, SigError> {
        sig::recover_signer(self.hash(), signature)
    }

    /// The index of `addr` in the participant list, if present.
    pub fn participant_index(&self, addr: Address) -> Option<usize> {
        self.participants.iter().position(|p| *p == addr)
    }
}

/// A state plus the signatures collected on it, keyed by participant index.
///
/// Every stored signature verifies against the state hash under the
/// participant at its index; [SignedState::merge] and
/// [SignedState::add_signature] enforce this on the way in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedState {
    state: State,
    signatures: BTreeMap<usize, Signature>,
}

impl SignedState {
    pub fn new(state: State) -> Self {
        SignedState {
            state,
            signatures: BTreeMap::new(),
        }
    }

    pub fn with_signatures(state: State, signatures: BTreeMap<usize, Signature>) -> Self {
        SignedState { state, signatures }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn channel_id(&self) -> Destination {
        self.state.channel_id()
    }

    pub fn signatures(&self) -> &BTreeMap<usize, Signature> {
        &self.signatures
    }

    /// Sign with the local key and record the signature at the signer's own
    /// participant index. Signing twice is a no-op returning the stored
    /// signature.
    pub fn sign(&mut self, sk: &SecretKey) -> Result<Signature, StateError> {
        let addr = sig::address_from_secret_key(sk);
        let index = self
            .state
            .participant_index(addr)
            .ok_or(StateError::NonParticipantSigner(addr))?;
        if let Some(existing) = self.signatures.get(&index) {
            return Ok(*existing);
        }
        let signature = self.state.sign(sk);
        self.signatures.insert(index, signature);
        Ok(signature)
    }

    /// Verify a signature against the state and record it at the recovered
    /// participant's index.
    pub fn add_signature(&mut self, signature: Signature) -> Result<usize, StateError> {
        let signer = self.state.recover_signer(&signature)?;
        let index = self
            .state
            .participant_index(signer)
            .ok_or(StateError::NonParticipantSigner(signer))?;
        self.signatures.insert(index, signature);
        Ok(index)
    }

    /// Fold another signed state's signatures into this one. The two must
    /// hash identically; each incoming signature is re-verified against its
    /// claimed index.
    pub fn merge(&mut self, other: &SignedState) -> Result<(), StateError> {
        if other.state.hash() != self.state.hash() {
            return Err(StateError::StateMismatch);
        }
        for (&index, signature) in &other.signatures {
            let signer = self.state.recover_signer(signature)?;
            if self.state.participants.get(index) != Some(&signer) {
                return Err(StateError::WrongSignerIndex(index));
            }
            self.signatures.insert(index, *signature);
        }
        Ok(())
    }

    pub fn has_signature_for(&self, index: usize) -> bool {
        self.signatures.contains_key(&index)
    }

    pub fn has_all_signatures(&self) -> bool {
        self.signatures.len() == self.state.participants.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sig::Signer;

    fn participants(n: usize) -> Vec<Signer> {
        let mut rng = rand::thread_rng();
        (0..n).map(|_| Signer::random(&mut rng)).collect()
    }

    fn test_state(signers: &[Signer]) -> State {
        let addrs: Vec<Address> = signers.iter().map(|s| s.address()).collect();
        State {
            chain_id: U256::zero(),
            participants: addrs.clone(),
            channel_nonce: 7,
            app_definition: Address::default(),
            challenge_duration: 60,
            app_data: Vec::new(),
            outcome: Exit::simple(
                Address::default(),
                addrs
                    .iter()
                    .map(|a| (Destination::from_address(*a), U256::from(5)))
                    .collect(),
            ),
            turn_num: 0,
            is_final: false,
        }
    }

    #[test]
    fn channel_id_depends_only_on_fixed_part() {
        let signers = participants(2);
        let state = test_state(&signers);
        let mut advanced = state.clone_as_turn(3);
        advanced.app_data = vec![1, 2, 3];

        assert_eq!(state.channel_id(), advanced.channel_id());
        assert_ne!(state.hash(), advanced.hash());

        let mut other = state.clone();
        other.channel_nonce += 1;
        assert_ne!(state.channel_id(), other.channel_id());
    }

    #[test]
    fn sign_is_idempotent_and_indexed_by_signer() {
        let signers = participants(2);
        let mut ss = SignedState::new(test_state(&signers));

        let first = ss.sign(&signers[1].secret_key()).unwrap();
        let second = ss.sign(&signers[1].secret_key()).unwrap();
        assert_eq!(first, second);
        assert_eq!(ss.signatures().len(), 1);
        assert!(ss.has_signature_for(1));
        assert!(!ss.has_all_signatures());

        ss.sign(&signers[0].secret_key()).unwrap();
        assert!(ss.has_all_signatures());
    }

    #[test]
    fn non_participant_cannot_sign() {
        let signers = participants(2);
        let outsider = participants(1).remove(0);
        let mut ss = SignedState::new(test_state(&signers));
        assert!(matches!(
            ss.sign(&outsider.secret_key()),
            Err(StateError::NonParticipantSigner(_))
        ));
    }

    #[test]
    fn merge_verifies_claimed_indices() {
        let signers = participants(2);
        let state = test_state(&signers);

        let mut ours = SignedState::new(state.clone());
        ours.sign(&signers[0].secret_key()).unwrap();

        let mut theirs = SignedState::new(state.clone());
        theirs.sign(&signers[1].secret_key()).unwrap();
        ours.merge(&theirs).unwrap();
        assert!(ours.has_all_signatures());

        // A signature filed under the wrong index is rejected.
        let mut forged = BTreeMap::new();
        forged.insert(0usize, state.sign(&signers[1].secret_key()));
        let forged = SignedState::with_signatures(state.clone(), forged);
        assert!(matches!(
            ours.merge(&forged),
            Err(StateError::WrongSignerIndex(0))
        ));
    }

    #[test]
    fn merge_rejects_conflicting_state() {
        let signers = participants(2);
        let state = test_state(&signers);
        let mut ours = SignedState::new(state.clone());

        let mut conflicting = state.clone();
        conflicting.outcome = Exit::simple(Address::default(), Vec::new());
        assert!(matches!(
            ours.merge(&SignedState::new(conflicting)),
            Err(StateError::StateMismatch)
        ));
    }
}
