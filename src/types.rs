//! Byte-level domain types shared across the crate.
//!
//! Everything that crosses a hash, a signature, or the wire is defined here:
//! fixed-width byte newtypes, 256-bit amounts, and the per-asset [Funds] map.
//! All of these serialize to raw bytes so the `bincode` encoding of any
//! composite value is canonical; [to_hash] relies on that to content-address
//! states and channel identities.

use core::fmt::Debug;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use uint::construct_uint;

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }
    };
}

macro_rules! bytes_newtype {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_bytes(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct BytesVisitor;

                impl<'de> serde::de::Visitor<'de> for BytesVisitor {
                    type Value = $T;

                    fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                        f.write_fmt(format_args!("{} bytes", $N))
                    }

                    fn visit_bytes<E>(self, v: &[u8]) -> Result<$T, E>
                    where
                        E: serde::de::Error,
                    {
                        let arr: [u8; $N] = v
                            .try_into()
                            .map_err(|_| E::invalid_length(v.len(), &self))?;
                        Ok($T(arr))
                    }

                    fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<$T, E>
                    where
                        E: serde::de::Error,
                    {
                        self.visit_bytes(&v)
                    }
                }

                deserializer.deserialize_byte_buf(BytesVisitor)
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl_hex_debug!($T);
    };
}

bytes_newtype!(Address, 20);
bytes_newtype!(Destination, 32);
bytes_newtype!(Hash, 32);
bytes_newtype!(Signature, 65);

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

impl Destination {
    /// An address embedded in a 32-byte destination, left-padded with zeros.
    pub fn from_address(addr: Address) -> Self {
        let mut d = Destination([0; 32]);
        d.0[32 - 20..].copy_from_slice(&addr.0);
        d
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 32]
    }
}

impl From<Address> for Destination {
    fn from(addr: Address) -> Self {
        Destination::from_address(addr)
    }
}

construct_uint! {
    pub struct U256(4);
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        serializer.serialize_bytes(&bytes)
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct U256Visitor;

        impl<'de> serde::de::Visitor<'de> for U256Visitor {
            type Value = U256;

            fn expecting(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
                f.write_str("32 big-endian bytes")
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<U256, E>
            where
                E: serde::de::Error,
            {
                if v.len() != 32 {
                    return Err(E::invalid_length(v.len(), &self));
                }
                Ok(U256::from_big_endian(v))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<U256, E>
            where
                E: serde::de::Error,
            {
                self.visit_bytes(&v)
            }
        }

        deserializer.deserialize_byte_buf(U256Visitor)
    }
}

/// Per-asset amounts, keyed by the asset's contract address.
///
/// The native asset is keyed by the zero address. A missing key reads as
/// zero, so `Funds::default()` is the empty holding.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Funds(pub BTreeMap<Address, U256>);

impl Funds {
    pub fn new() -> Self {
        Funds(BTreeMap::new())
    }

    /// A holding of a single asset.
    pub fn single(asset: Address, amount: U256) -> Self {
        let mut f = Funds::new();
        f.0.insert(asset, amount);
        f
    }

    pub fn get(&self, asset: &Address) -> U256 {
        self.0.get(asset).copied().unwrap_or_default()
    }

    pub fn insert(&mut self, asset: Address, amount: U256) {
        self.0.insert(asset, amount);
    }

    pub fn add(&self, other: &Funds) -> Funds {
        let mut sum = self.clone();
        for (asset, amount) in &other.0 {
            let held = sum.get(asset);
            sum.0.insert(*asset, held + *amount);
        }
        sum
    }

    /// True if, for every asset in `other`, this holding is at least as large.
    pub fn covers(&self, other: &Funds) -> bool {
        other.0.iter().all(|(asset, amount)| self.get(asset) >= *amount)
    }

    pub fn is_non_zero(&self) -> bool {
        self.0.values().any(|amount| !amount.is_zero())
    }
}

impl Debug for Funds {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

/// Keccak256 over the canonical `bincode` encoding of `value`.
pub fn to_hash<T>(value: &T) -> Hash
where
    T: Serialize,
{
    let bytes = bincode::serialize(value).expect("encoding of in-memory values is infallible");
    Hash(Keccak256::digest(&bytes).into())
}
