// Copyright 2022-2023 Agora Devs
//
// This library is free software; you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public
// License as published by the Free Software Foundation; either
// version 3 of the License, or (at your option) any later version.
//
// This library is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this library; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301, USA

//! Signature schemes gating the web of trust. Arbitrator attestations carry a
//! base64 EC message signature over the hex-encoded account hash, verified
//! against the externally supplied arbitrator allow-list. Peer attestations
//! carry a raw Ed25519 signature over the raw hash bytes; any peer may sign.
//!
//! Verification never escalates: malformed keys, malformed signatures, and
//! untrusted arbitrator keys all collapse to a boolean `false`, logged with
//! the witness context for forensics.

use std::collections::HashSet;
use std::error;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use ed25519_dalek::{Signer, Verifier};
use log::warn;
use thiserror::Error;

use crate::witness::{SignedWitness, VerificationMethod};

/// List of cryptographic errors that can be encountered when validating or
/// producing witness signatures.
#[derive(Error, Debug)]
pub enum Error {
    /// The public key bytes cannot be parsed for the selected scheme.
    #[error("The public key bytes cannot be parsed for the selected scheme")]
    MalformedKey,
    /// The signature bytes cannot be parsed for the selected scheme.
    #[error("The signature bytes cannot be parsed for the selected scheme")]
    MalformedSignature,
    /// The signature does not pass the validation tests.
    #[error("The signature does not pass the validation")]
    InvalidSignature,
    /// The signing key is not present in the arbitrator allow-list.
    #[error("The signing key is not present in the arbitrator allow-list")]
    UntrustedArbitrator,
    /// Any cryptographic error not part of this list.
    #[error("Cryptographic error: {0}")]
    Other(Box<dyn error::Error + Send + Sync>),
}

impl Error {
    /// Creates a new cryptographic error of type [`Self::Other`] with an
    /// arbitrary payload.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::Other(error.into())
    }
}

/// The externally supplied allow-list of arbitrator EC public keys, stored as
/// lowercase hex of the serialized keys. Only keys registered here may issue
/// arbitrator attestations.
#[derive(Debug, Clone, Default)]
pub struct ArbitratorRegistry {
    keys: HashSet<String>,
}

impl ArbitratorRegistry {
    /// Create an empty registry: every arbitrator attestation is rejected.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a registry from a list of arbitrator public keys.
    pub fn with_keys<I>(keys: I) -> Self
    where
        I: IntoIterator<Item = PublicKey>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(|k| hex::encode(k.serialize()))
                .collect(),
        }
    }

    /// Register an additional arbitrator key.
    pub fn register(&mut self, key: PublicKey) {
        self.keys.insert(hex::encode(key.serialize()));
    }

    /// Whether the key is a registered arbitrator key.
    pub fn is_registered(&self, key: &PublicKey) -> bool {
        self.keys.contains(&hex::encode(key.serialize()))
    }
}

/// The message an arbitrator signs when vouching for an account: the sha256d
/// digest of the lowercase hex encoding of the account age witness hash.
fn arbitrator_message(account_age_witness_hash: &[u8; 32]) -> Message {
    let digest = sha256d::Hash::hash(hex::encode(account_age_witness_hash).as_bytes());
    Message::from_slice(&digest[..]).expect("sha256d digest is a valid message")
}

/// Produce the arbitrator attestation signature over the given account hash:
/// a compact ECDSA signature, base64 encoded, returned as its UTF-8 bytes as
/// carried in the witness record.
pub fn arbitrator_sign(key: &SecretKey, account_age_witness_hash: &[u8; 32]) -> Vec<u8> {
    let secp = Secp256k1::new();
    let sig = secp.sign_ecdsa(&arbitrator_message(account_age_witness_hash), key);
    BASE64.encode(sig.serialize_compact()).into_bytes()
}

/// Produce the peer attestation signature: a raw Ed25519 signature over the
/// raw account hash bytes.
pub fn trader_sign(key: &ed25519_dalek::SigningKey, account_age_witness_hash: &[u8; 32]) -> Vec<u8> {
    key.sign(account_age_witness_hash).to_bytes().to_vec()
}

/// Verifier for witness signatures, selecting the scheme from the record's
/// verification method.
#[derive(Debug, Clone, Default)]
pub struct SignatureVerifier {
    registry: ArbitratorRegistry,
}

impl SignatureVerifier {
    /// Create a verifier trusting the given arbitrator allow-list.
    pub fn new(registry: ArbitratorRegistry) -> Self {
        Self { registry }
    }

    /// The arbitrator allow-list consulted for arbitrator attestations.
    pub fn registry(&self) -> &ArbitratorRegistry {
        &self.registry
    }

    /// Validate the witness signature. Failures are logged and reported as
    /// `false`, never raised: the caller decides policy.
    pub fn verify(&self, witness: &SignedWitness) -> bool {
        let checked = match witness.method() {
            VerificationMethod::Arbitrator => self.verify_arbitrator(witness),
            VerificationMethod::Trade => self.verify_trader(witness),
        };
        match checked {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "signature verification failed for witness {:x}: {}",
                    witness.fingerprint(),
                    e
                );
                false
            }
        }
    }

    fn verify_arbitrator(&self, witness: &SignedWitness) -> Result<(), Error> {
        let key = PublicKey::from_slice(witness.signer_pub_key()).map_err(|_| Error::MalformedKey)?;
        if !self.registry.is_registered(&key) {
            return Err(Error::UntrustedArbitrator);
        }
        let base64 =
            std::str::from_utf8(witness.signature()).map_err(|_| Error::MalformedSignature)?;
        let raw = BASE64.decode(base64).map_err(|_| Error::MalformedSignature)?;
        let sig = Signature::from_compact(&raw).map_err(|_| Error::MalformedSignature)?;
        let secp = Secp256k1::verification_only();
        let message = arbitrator_message(&witness.account_age_witness_hash());
        secp.verify_ecdsa(&message, &sig, &key)
            .map_err(|_| Error::InvalidSignature)
    }

    fn verify_trader(&self, witness: &SignedWitness) -> Result<(), Error> {
        let key_bytes: [u8; 32] = witness
            .signer_pub_key()
            .try_into()
            .map_err(|_| Error::MalformedKey)?;
        let key =
            ed25519_dalek::VerifyingKey::from_bytes(&key_bytes).map_err(|_| Error::MalformedKey)?;
        let sig = ed25519_dalek::Signature::from_slice(witness.signature())
            .map_err(|_| Error::MalformedSignature)?;
        key.verify(&witness.account_age_witness_hash(), &sig)
            .map_err(|_| Error::InvalidSignature)
    }
}
