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

//! Web-of-trust witness records. A [`SignedWitness`] is an immutable
//! attestation that an account age witness (the hash committing to a payment
//! account identity) has been vouched for, either by an arbitrator or by a
//! trading peer after a qualifying trade.
//!
//! The record is deduplicated network wide by its [`WitnessFingerprint`],
//! which deliberately excludes the signing date and the trade amount: repeated
//! trades between the same peer pair collapse to a single stored record, so
//! only the total number of signed accounts is observable, not how often two
//! peers traded.

use std::io;

use bitcoin::hashes::{hash160, Hash, HashEngine};
use bitcoin::Amount;

use crate::consensus::{self, Decodable, Encodable};

pub mod chain;
pub mod service;

/// Age a signer's own attestation must have reached before the signer is
/// allowed to vouch for another account, in milliseconds (30 days). Prevents
/// instantly bootstrapped attestation chains.
pub const SIGNER_AGE_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// Minimum trade amount for a peer-signed attestation, in satoshi
/// (0.0025 BTC). A minimum-stake gate making Sybil vouching expensive.
pub const MIN_SIGNING_TRADE_AMOUNT_SAT: u64 = 250_000;

/// How a witness record was signed. The method selects the signature scheme
/// used by [`crate::crypto::SignatureVerifier`].
#[derive(Display, Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[display(Debug)]
pub enum VerificationMethod {
    /// Signed by an arbitrator with an EC message signature; trusted as a
    /// chain root without further ancestry.
    Arbitrator,
    /// Signed by a trading peer with its Ed25519 trade key after a qualifying
    /// trade.
    Trade,
}

impl Encodable for VerificationMethod {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            VerificationMethod::Arbitrator => 0x01u8.consensus_encode(writer),
            VerificationMethod::Trade => 0x02u8.consensus_encode(writer),
        }
    }
}

impl Decodable for VerificationMethod {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(VerificationMethod::Arbitrator),
            0x02u8 => Ok(VerificationMethod::Trade),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

impl_strict_encoding!(VerificationMethod);

fixed_hash::construct_fixed_hash!(
    /// Content-derived key deduplicating witness records, internally the
    /// RIPEMD160(SHA256(..)) digest of the vouched account hash, the signature
    /// and the signer public key. Date and trade amount are excluded on
    /// purpose.
    pub struct WitnessFingerprint(20);
);

/// Commitment to a payment account's identity and age. The core treats it as
/// an opaque lookup key into the witness book; creation and validation of the
/// underlying payment account data live outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountAgeWitness {
    hash: [u8; 32],
    date: i64,
}

impl AccountAgeWitness {
    /// Create a new account age witness from its identity hash and its
    /// creation date in milliseconds.
    pub fn new(hash: [u8; 32], date: i64) -> Self {
        Self { hash, date }
    }

    /// The 32-byte digest committing to the payment account identity.
    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }

    /// Creation date of the account witness, in milliseconds since epoch.
    pub fn date(&self) -> i64 {
        self.date
    }
}

/// An immutable attestation that an account age witness has been vouched for.
/// Built once at signing time by an arbitrator or a trading peer, then
/// published, deduplicated by fingerprint, and persisted indefinitely.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct SignedWitness {
    method: VerificationMethod,
    account_age_witness_hash: [u8; 32],
    signature: Vec<u8>,
    signer_pub_key: Vec<u8>,
    witness_owner_pub_key: Vec<u8>,
    date: i64,
    trade_amount: Amount,
    // derived at construction, never carried on the wire nor trusted from
    // disk
    fingerprint: WitnessFingerprint,
}

impl SignedWitness {
    /// Build a new witness record and derive its fingerprint.
    pub fn new(
        method: VerificationMethod,
        account_age_witness_hash: [u8; 32],
        signature: Vec<u8>,
        signer_pub_key: Vec<u8>,
        witness_owner_pub_key: Vec<u8>,
        date: i64,
        trade_amount: Amount,
    ) -> Self {
        let fingerprint =
            Self::compute_fingerprint(&account_age_witness_hash, &signature, &signer_pub_key);
        Self {
            method,
            account_age_witness_hash,
            signature,
            signer_pub_key,
            witness_owner_pub_key,
            date,
            trade_amount,
            fingerprint,
        }
    }

    fn compute_fingerprint(
        account_age_witness_hash: &[u8; 32],
        signature: &[u8],
        signer_pub_key: &[u8],
    ) -> WitnessFingerprint {
        let mut engine = hash160::Hash::engine();
        engine.input(account_age_witness_hash);
        engine.input(signature);
        engine.input(signer_pub_key);
        WitnessFingerprint(hash160::Hash::from_engine(engine).into_inner())
    }

    /// The dedup key of this record.
    pub fn fingerprint(&self) -> WitnessFingerprint {
        self.fingerprint
    }

    /// The signing method selecting the signature scheme.
    pub fn method(&self) -> VerificationMethod {
        self.method
    }

    /// Whether the record was signed by an arbitrator and is therefore a
    /// chain-of-trust root.
    pub fn is_signed_by_arbitrator(&self) -> bool {
        self.method == VerificationMethod::Arbitrator
    }

    /// The hash of the vouched account age witness.
    pub fn account_age_witness_hash(&self) -> [u8; 32] {
        self.account_age_witness_hash
    }

    /// The signature bytes. For arbitrator records these are the UTF-8 bytes
    /// of the base64 EC message signature, for trade records the raw Ed25519
    /// signature.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Raw public key bytes of the signer.
    pub fn signer_pub_key(&self) -> &[u8] {
        &self.signer_pub_key
    }

    /// Raw public key bytes of the account owner being vouched for.
    pub fn witness_owner_pub_key(&self) -> &[u8] {
        &self.witness_owner_pub_key
    }

    /// Signing timestamp in milliseconds since epoch.
    pub fn date(&self) -> i64 {
        self.date
    }

    /// Amount of the trade that justified the signing.
    pub fn trade_amount(&self) -> Amount {
        self.trade_amount
    }
}

impl Encodable for SignedWitness {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.method.consensus_encode(s)?;
        len += self.account_age_witness_hash.consensus_encode(s)?;
        len += self.signature.consensus_encode(s)?;
        len += self.signer_pub_key.consensus_encode(s)?;
        len += self.witness_owner_pub_key.consensus_encode(s)?;
        len += self.date.consensus_encode(s)?;
        Ok(len + self.trade_amount.consensus_encode(s)?)
    }
}

impl Decodable for SignedWitness {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(SignedWitness::new(
            Decodable::consensus_decode(d)?,
            Decodable::consensus_decode(d)?,
            Decodable::consensus_decode(d)?,
            Decodable::consensus_decode(d)?,
            Decodable::consensus_decode(d)?,
            Decodable::consensus_decode(d)?,
            Decodable::consensus_decode(d)?,
        ))
    }
}

impl_strict_encoding!(SignedWitness);
