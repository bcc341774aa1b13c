//! Creation and verification of Ethereum-style recoverable signatures.
//!
//! States are signed over the `"\x19Ethereum Signed Message:\n32"` prefix so
//! an on-chain adjudicator can recover the signer with `ecrecover`. The
//! recovery byte is stored with the 27 offset used by Ethereum.

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::types::{Address, Hash, Signature};

#[derive(Debug, Error)]
pub enum SigError {
    #[error("signature recovery failed: {0}")]
    Recovery(#[from] secp256k1::Error),
    #[error("recovery id {0} out of range")]
    RecoveryId(u8),
}

/// Apply the Ethereum signed-message prefix to a 32-byte hash.
fn eth_signed_msg_hash(hash: Hash) -> [u8; 32] {
    // Packed encoding, so this bypasses the serializer.
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    hasher.finalize().into()
}

fn address_from_public_key(pk: &PublicKey) -> Address {
    // The first byte of the uncompressed encoding is a format tag, not part
    // of the key.
    let digest: [u8; 32] = Keccak256::digest(&pk.serialize_uncompressed()[1..]).into();
    let mut addr = Address([0; 20]);
    addr.0.copy_from_slice(&digest[32 - 20..]);
    addr
}

/// The participant address belonging to a secret key.
pub fn address_from_secret_key(sk: &SecretKey) -> Address {
    let secp = Secp256k1::new();
    address_from_public_key(&PublicKey::from_secret_key(&secp, sk))
}

/// Sign a hash, producing a 65-byte recoverable signature.
pub fn sign(hash: Hash, sk: &SecretKey) -> Signature {
    let secp = Secp256k1::new();
    let msg = Message::from_slice(&eth_signed_msg_hash(hash))
        .expect("a 32-byte digest is always a valid message");
    let recoverable = secp.sign_ecdsa_recoverable(&msg, sk);
    let (v, rs) = recoverable.serialize_compact();
    Signature::new(&rs, 27 + v.to_i32() as u8)
}

/// Recover the participant address that signed `hash`.
pub fn recover_signer(hash: Hash, sig: &Signature) -> Result<Address, SigError> {
    let secp = Secp256k1::new();
    let msg = Message::from_slice(&eth_signed_msg_hash(hash))
        .expect("a 32-byte digest is always a valid message");

    let v = sig.0[64];
    if v < 27 {
        return Err(SigError::RecoveryId(v));
    }
    let recid = RecoveryId::from_i32((v - 27).into())?;
    let recoverable = RecoverableSignature::from_compact(&sig.0[..64], recid)?;
    let pk = secp.recover_ecdsa(&msg, &recoverable)?;
    Ok(address_from_public_key(&pk))
}

/// A signing identity: the secret key plus its derived address and a reusable
/// secp256k1 context.
pub struct Signer {
    secp: Secp256k1<All>,
    sk: SecretKey,
    addr: Address,
}

impl Signer {
    pub fn new(sk: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let addr = address_from_public_key(&PublicKey::from_secret_key(&secp, &sk));
        Signer { secp, sk, addr }
    }

    /// Generate a fresh identity. Rejection-samples until the bytes form a
    /// valid scalar.
    pub fn random<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        loop {
            let bytes: [u8; 32] = rng.gen();
            if let Ok(sk) = SecretKey::from_slice(&bytes) {
                return Signer::new(sk);
            }
        }
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn secret_key(&self) -> SecretKey {
        self.sk
    }

    pub fn sign(&self, hash: Hash) -> Signature {
        let msg = Message::from_slice(&eth_signed_msg_hash(hash))
            .expect("a 32-byte digest is always a valid message");
        let recoverable = self.secp.sign_ecdsa_recoverable(&msg, &self.sk);
        let (v, rs) = recoverable.serialize_compact();
        Signature::new(&rs, 27 + v.to_i32() as u8)
    }
}

impl core::fmt::Debug for Signer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signer").field("addr", &self.addr).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::to_hash;

    #[test]
    fn sign_then_recover_yields_signer_address() {
        let mut rng = rand::thread_rng();
        let signer = Signer::random(&mut rng);
        let hash = to_hash(&42u64);

        let sig = signer.sign(hash);
        let recovered = recover_signer(hash, &sig).unwrap();
        assert_eq!(recovered, signer.address());
    }

    #[test]
    fn free_sign_matches_signer() {
        let mut rng = rand::thread_rng();
        let signer = Signer::random(&mut rng);
        let hash = to_hash(&b"payload".to_vec());
        assert_eq!(sign(hash, &signer.secret_key()), signer.sign(hash));
        assert_eq!(address_from_secret_key(&signer.secret_key()), signer.address());
    }

    #[test]
    fn recovery_rejects_mangled_v() {
        let mut rng = rand::thread_rng();
        let signer = Signer::random(&mut rng);
        let hash = to_hash(&1u8);
        let mut sig = signer.sign(hash);
        sig.0[64] = 5;
        assert!(recover_signer(hash, &sig).is_err());
    }

    #[test]
    fn tampered_hash_recovers_different_address() {
        let mut rng = rand::thread_rng();
        let signer = Signer::random(&mut rng);
        let sig = signer.sign(to_hash(&1u64));
        let recovered = recover_signer(to_hash(&2u64), &sig);
        // Recovery either fails or yields an address that is not the signer.
        if let Ok(addr) = recovered {
            assert_ne!(addr, signer.address());
        }
    }
}
