//! The outcome model: how a channel's funds are distributed on conclusion.
//!
//! An [Exit] is an ordered list of per-asset exits, each holding an ordered
//! list of allocations. Order matters: on-chain payout walks each asset exit
//! front to back, so an allocation is only covered once everything before it
//! is covered. [Exit::affords] and [Exit::divert_to_guarantee] encode the two
//! operations the funding protocols need.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Address, Destination, Funds, U256};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutcomeError {
    #[error("destination {0:?} has no allocation in the asset exit")]
    DestinationMissing(Destination),
    #[error("allocation for {0:?} cannot cover the requested deduction")]
    Underflow(Destination),
    #[error("malformed guarantee metadata")]
    BadMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationType {
    Simple,
    Guarantee,
}

/// The payload of a guarantee allocation: these funds back `target` on
/// behalf of `left` and `right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuaranteeMetadata {
    pub left: Destination,
    pub right: Destination,
    pub target: Destination,
}

impl GuaranteeMetadata {
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("encoding of in-memory values is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OutcomeError> {
        bincode::deserialize(bytes).map_err(|_| OutcomeError::BadMetadata)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub destination: Destination,
    pub amount: U256,
    pub allocation_type: AllocationType,
    pub metadata: Vec<u8>,
}

impl Allocation {
    pub fn simple(destination: Destination, amount: U256) -> Self {
        Allocation {
            destination,
            amount,
            allocation_type: AllocationType::Simple,
            metadata: Vec::new(),
        }
    }

    pub fn guarantee(
        amount: U256,
        left: Destination,
        right: Destination,
        target: Destination,
    ) -> Self {
        Allocation {
            destination: target,
            amount,
            allocation_type: AllocationType::Guarantee,
            metadata: GuaranteeMetadata { left, right, target }.encode(),
        }
    }

    pub fn is_guarantee(&self) -> bool {
        self.allocation_type == AllocationType::Guarantee
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleAssetExit {
    pub asset: Address,
    pub allocations: Vec<Allocation>,
}

impl SingleAssetExit {
    pub fn total(&self) -> U256 {
        self.allocations
            .iter()
            .fold(U256::zero(), |acc, a| acc + a.amount)
    }

    pub fn total_allocated_for(&self, destination: Destination) -> U256 {
        self.allocations
            .iter()
            .filter(|a| a.destination == destination)
            .fold(U256::zero(), |acc, a| acc + a.amount)
    }
}

/// An ordered collection of asset exits. The outcome of a state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exit(pub Vec<SingleAssetExit>);

impl Exit {
    /// A single-asset outcome allocating `amounts` in order.
    pub fn simple(asset: Address, amounts: Vec<(Destination, U256)>) -> Self {
        Exit(vec![SingleAssetExit {
            asset,
            allocations: amounts
                .into_iter()
                .map(|(dest, amount)| Allocation::simple(dest, amount))
                .collect(),
        }])
    }

    pub fn asset_exit(&self, asset: &Address) -> Option<&SingleAssetExit> {
        self.0.iter().find(|sae| sae.asset == *asset)
    }

    /// Sum of all allocations, per asset.
    pub fn total(&self) -> Funds {
        let mut funds = Funds::new();
        for sae in &self.0 {
            let held = funds.get(&sae.asset);
            funds.insert(sae.asset, held + sae.total());
        }
        funds
    }

    /// Sum of allocations destined for `destination`, per asset.
    pub fn total_allocated_for(&self, destination: Destination) -> Funds {
        let mut funds = Funds::new();
        for sae in &self.0 {
            let held = funds.get(&sae.asset);
            funds.insert(sae.asset, held + sae.total_allocated_for(destination));
        }
        funds
    }

    /// True if every required allocation is present and covered by `funding`.
    ///
    /// An allocation is covered when the sum of all allocations preceding it
    /// in its asset exit, plus its own amount, does not exceed the funding
    /// held for that asset. The required allocation must match the stored one
    /// exactly; a same-destination allocation with a different amount, type
    /// or metadata does not count.
    pub fn affords(&self, required: &BTreeMap<Address, Allocation>, funding: &Funds) -> bool {
        for (asset, want) in required {
            let Some(sae) = self.asset_exit(asset) else {
                return false;
            };
            let held = funding.get(asset);

            let mut preceding = U256::zero();
            let mut covered = false;
            for allocation in &sae.allocations {
                if allocation == want {
                    covered = preceding + want.amount <= held;
                    break;
                }
                preceding = preceding + allocation.amount;
            }
            if !covered {
                return false;
            }
        }
        true
    }

    /// Redirect funds into a guarantee for `target`: per asset, deduct the
    /// left amount from `left`'s allocation and the right amount from
    /// `right`'s, then append a guarantee for the sum at the end of the exit.
    pub fn divert_to_guarantee(
        &self,
        left: Destination,
        right: Destination,
        left_amount: &Funds,
        right_amount: &Funds,
        target: Destination,
    ) -> Result<Exit, OutcomeError> {
        let mut diverted = self.clone();
        for sae in &mut diverted.0 {
            let la = left_amount.get(&sae.asset);
            let ra = right_amount.get(&sae.asset);

            deduct(&mut sae.allocations, left, la)?;
            deduct(&mut sae.allocations, right, ra)?;

            sae.allocations
                .push(Allocation::guarantee(la + ra, left, right, target));
        }
        Ok(diverted)
    }
}

fn deduct(
    allocations: &mut [Allocation],
    destination: Destination,
    amount: U256,
) -> Result<(), OutcomeError> {
    let allocation = allocations
        .iter_mut()
        .find(|a| a.destination == destination && !a.is_guarantee())
        .ok_or(OutcomeError::DestinationMissing(destination))?;
    allocation.amount = allocation
        .amount
        .checked_sub(amount)
        .ok_or(OutcomeError::Underflow(destination))?;
    Ok(())
}
