//! The persistence contract and an in-memory implementation.
//!
//! Objectives are persisted as tagged records in which channel handles are
//! replaced by channel ids; channels and consensus channels live in their
//! own tables and are re-linked when an objective is loaded. The store is
//! internally synchronized; serial consistency per objective comes from the
//! engine's channel locks.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use secp256k1::SecretKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::channel::Channel;
use crate::consensus::ConsensusChannel;
use crate::protocols::{directfund, virtualfund, Objective, ObjectiveId, ObjectiveStatus};
use crate::sig;
use crate::types::{Address, Destination};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to decode persisted record: {0}")]
    Corrupt(String),
}

/// The persistence surface the engine depends on. The store exclusively owns
/// persisted objectives between cranks; the engine writes back working
/// copies only after a successful crank.
pub trait Store {
    fn get_objective_by_id(&self, id: &str) -> Option<Objective>;
    fn get_objective_by_channel_id(&self, channel_id: &Destination) -> Option<Objective>;
    /// Every objective whose channel set contains `channel_id`. Used by the
    /// engine to re-crank siblings sharing a ledger.
    fn get_objectives_by_channel_id(&self, channel_id: &Destination) -> Vec<Objective>;
    fn set_objective(&self, objective: &Objective) -> Result<(), StoreError>;

    fn get_channel_by_id(&self, id: &Destination) -> Option<Channel>;
    fn set_channel(&self, channel: &Channel) -> Result<(), StoreError>;
    fn destroy_channel(&self, id: &Destination);

    fn get_consensus_channel(&self, counterparty: Address) -> Option<ConsensusChannel>;
    fn set_consensus_channel(&self, channel: &ConsensusChannel) -> Result<(), StoreError>;

    fn get_channel_secret_key(&self) -> SecretKey;
    fn get_address(&self) -> Address;
}

/// The on-disk shape of an objective: a kind tag plus the protocol fields,
/// with channels referenced by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum ObjectiveRecord {
    DirectFund(directfund::Record),
    VirtualFund(virtualfund::Record),
}

impl ObjectiveRecord {
    fn of(objective: &Objective) -> ObjectiveRecord {
        match objective {
            Objective::DirectFund(o) => ObjectiveRecord::DirectFund(o.to_record()),
            Objective::VirtualFund(o) => ObjectiveRecord::VirtualFund(o.to_record()),
        }
    }

    fn status(&self) -> ObjectiveStatus {
        match self {
            ObjectiveRecord::DirectFund(rec) => rec.status,
            ObjectiveRecord::VirtualFund(rec) => rec.status,
        }
    }

    fn channel_ids(&self) -> Vec<Destination> {
        match self {
            ObjectiveRecord::DirectFund(rec) => vec![rec.channel],
            ObjectiveRecord::VirtualFund(rec) => {
                let mut ids = vec![rec.target_id];
                if let Some(left) = &rec.left {
                    ids.push(left.ledger);
                }
                if let Some(right) = &rec.right {
                    ids.push(right.ledger);
                }
                ids
            }
        }
    }
}

/// An in-memory store, suitable for tests and single-process nodes.
/// Completed objectives are retained indefinitely; compaction is an
/// out-of-band concern.
pub struct MemStore {
    sk: SecretKey,
    address: Address,
    objectives: RwLock<BTreeMap<ObjectiveId, Vec<u8>>>,
    channels: RwLock<BTreeMap<Destination, Channel>>,
    consensus_channels: RwLock<BTreeMap<Destination, ConsensusChannel>>,
}

impl MemStore {
    pub fn new(sk: SecretKey) -> MemStore {
        MemStore {
            sk,
            address: sig::address_from_secret_key(&sk),
            objectives: RwLock::new(BTreeMap::new()),
            channels: RwLock::new(BTreeMap::new()),
            consensus_channels: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn consensus_channel_by_id(&self, id: &Destination) -> Option<ConsensusChannel> {
        self.consensus_channels.read().get(id).cloned()
    }

    fn decode(&self, id: &str, bytes: &[u8]) -> Option<ObjectiveRecord> {
        match bincode::deserialize(bytes) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(objective = id, %err, "skipping corrupt objective record");
                None
            }
        }
    }

    fn relink(&self, record: ObjectiveRecord) -> Option<Objective> {
        match record {
            ObjectiveRecord::DirectFund(rec) => {
                // After completion the plain channel is destroyed and only
                // the consensus channel remains; fall back to its view.
                let channel = self
                    .get_channel_by_id(&rec.channel)
                    .or_else(|| self.consensus_channel_by_id(&rec.channel).map(|c| c.to_channel()))?;
                Some(Objective::DirectFund(directfund::Objective::from_record(
                    rec, channel,
                )))
            }
            ObjectiveRecord::VirtualFund(rec) => {
                let left = match &rec.left {
                    Some(conn) => Some(self.consensus_channel_by_id(&conn.ledger)?),
                    None => None,
                };
                let right = match &rec.right {
                    Some(conn) => Some(self.consensus_channel_by_id(&conn.ledger)?),
                    None => None,
                };
                Some(Objective::VirtualFund(virtualfund::Objective::from_record(
                    rec, left, right,
                )))
            }
        }
    }
}

impl Store for MemStore {
    fn get_objective_by_id(&self, id: &str) -> Option<Objective> {
        let bytes = self.objectives.read().get(id).cloned()?;
        let record = self.decode(id, &bytes)?;
        self.relink(record)
    }

    /// Scan for an objective whose channel set contains `channel_id`,
    /// preferring one that can still make progress.
    fn get_objective_by_channel_id(&self, channel_id: &Destination) -> Option<Objective> {
        let mut active: Option<ObjectiveRecord> = None;
        let mut fallback: Option<ObjectiveRecord> = None;
        {
            let objectives = self.objectives.read();
            for (id, bytes) in objectives.iter() {
                let Some(record) = self.decode(id, bytes) else {
                    continue;
                };
                if !record.channel_ids().contains(channel_id) {
                    continue;
                }
                match record.status() {
                    ObjectiveStatus::Unapproved | ObjectiveStatus::Approved => {
                        active = Some(record);
                        break;
                    }
                    _ => {
                        if fallback.is_none() {
                            fallback = Some(record);
                        }
                    }
                }
            }
        }
        active.or(fallback).and_then(|record| self.relink(record))
    }

    fn get_objectives_by_channel_id(&self, channel_id: &Destination) -> Vec<Objective> {
        let records: Vec<ObjectiveRecord> = {
            let objectives = self.objectives.read();
            objectives
                .iter()
                .filter_map(|(id, bytes)| self.decode(id, bytes))
                .filter(|record| record.channel_ids().contains(channel_id))
                .collect()
        };
        records
            .into_iter()
            .filter_map(|record| self.relink(record))
            .collect()
    }

    fn set_objective(&self, objective: &Objective) -> Result<(), StoreError> {
        let record = ObjectiveRecord::of(objective);
        let bytes =
            bincode::serialize(&record).expect("encoding of in-memory values is infallible");
        self.objectives.write().insert(objective.id(), bytes);
        Ok(())
    }

    fn get_channel_by_id(&self, id: &Destination) -> Option<Channel> {
        self.channels.read().get(id).cloned()
    }

    fn set_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        self.channels.write().insert(channel.id, channel.clone());
        Ok(())
    }

    fn destroy_channel(&self, id: &Destination) {
        self.channels.write().remove(id);
    }

    fn get_consensus_channel(&self, counterparty: Address) -> Option<ConsensusChannel> {
        self.consensus_channels
            .read()
            .values()
            .find(|c| c.my_counterparty() == counterparty)
            .cloned()
    }

    fn set_consensus_channel(&self, channel: &ConsensusChannel) -> Result<(), StoreError> {
        self.consensus_channels
            .write()
            .insert(channel.id, channel.clone());
        Ok(())
    }

    fn get_channel_secret_key(&self) -> SecretKey {
        self.sk
    }

    fn get_address(&self) -> Address {
        self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::Exit;
    use crate::protocols::directfund::Request;
    use crate::sig::Signer;
    use crate::types::{Funds, U256};

    fn direct_fund_objective(alice: &Signer, bob: &Signer) -> directfund::Objective {
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
            nonce: 1,
        };
        directfund::Objective::new(&request, alice.address()).unwrap()
    }

    #[test]
    fn objectives_roundtrip_as_records() {
        let mut rng = rand::thread_rng();
        let alice = Signer::random(&mut rng);
        let bob = Signer::random(&mut rng);
        let store = MemStore::new(alice.secret_key());

        let objective = direct_fund_objective(&alice, &bob);
        store.set_channel(objective.channel()).unwrap();
        store
            .set_objective(&Objective::DirectFund(objective.clone()))
            .unwrap();

        let loaded = store.get_objective_by_id(&objective.id()).unwrap();
        assert_eq!(loaded.id(), objective.id());
        assert_eq!(loaded.status(), objective.status());
        assert_eq!(loaded.channels(), vec![objective.channel().id]);

        let by_channel = store
            .get_objective_by_channel_id(&objective.channel().id)
            .unwrap();
        assert_eq!(by_channel.id(), objective.id());
    }

    #[test]
    fn missing_channel_means_no_objective() {
        let mut rng = rand::thread_rng();
        let alice = Signer::random(&mut rng);
        let bob = Signer::random(&mut rng);
        let store = MemStore::new(alice.secret_key());

        let objective = direct_fund_objective(&alice, &bob);
        // Objective stored without its channel: relink fails cleanly.
        store
            .set_objective(&Objective::DirectFund(objective.clone()))
            .unwrap();
        assert!(store.get_objective_by_id(&objective.id()).is_none());
    }

    #[test]
    fn consensus_channels_are_found_by_counterparty() {
        let mut rng = rand::thread_rng();
        let alice = Signer::random(&mut rng);
        let bob = Signer::random(&mut rng);
        let store = MemStore::new(alice.secret_key());

        let objective = direct_fund_objective(&alice, &bob);
        let mut channel = objective.channel().clone();
        let prefund = channel.pre_fund_state().unwrap().clone();
        let postfund = channel.post_fund_state().unwrap().clone();
        for state in [prefund, postfund] {
            for signer in [&alice, &bob] {
                channel.add_signed_state(&state, state.sign(&signer.secret_key()));
            }
        }
        channel.on_chain_funding = Funds::single(Address::default(), U256::from(10));
        let consensus = ConsensusChannel::from_channel(&channel).unwrap();

        store.set_consensus_channel(&consensus).unwrap();
        let found = store.get_consensus_channel(bob.address()).unwrap();
        assert_eq!(found.id, consensus.id);
        assert!(store.get_consensus_channel(alice.address()).is_none());
    }

    #[test]
    fn secret_key_and_address_belong_together() {
        let mut rng = rand::thread_rng();
        let signer = Signer::random(&mut rng);
        let store = MemStore::new(signer.secret_key());
        assert_eq!(store.get_address(), signer.address());
        assert_eq!(
            sig::address_from_secret_key(&store.get_channel_secret_key()),
            signer.address()
        );
    }
}
