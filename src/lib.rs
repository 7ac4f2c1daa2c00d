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

//! Agora Core library
//!
//! Core building blocks of the Agora peer-to-peer Bitcoin trading network. The
//! library covers the two subsystems that gate the movement of escrowed funds
//! and the trustworthiness of trading identities:
//!
//! - the **web-of-trust** witness subsystem: signed attestations
//!   ([`witness::SignedWitness`]) that a trading account has been vouched for,
//!   the bounded chain-of-trust verifier walking the attestation graph back to
//!   an arbitrator root, and the service publishing and querying attestations;
//! - the **dispute-settlement** subsystem: the per-trade state machine that
//!   applies an arbitrator ruling, decides which party publishes the payout
//!   transaction from the multisig escrow, broadcasts it exactly once, and
//!   reconciles duplicate or out-of-order settlement messages.
//!
//! Network transport, durable storage, and the wallet are external
//! collaborators reached through the traits in [`transport`], [`store`], and
//! [`escrow`].

#![cfg_attr(docsrs, feature(doc_cfg))]
// Coding conventions
#![forbid(unsafe_code)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(unused_mut)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate serde;

use std::fmt;
use std::io;

use thiserror::Error;

#[macro_use]
pub mod consensus;

pub mod crypto;
pub mod dispute;
pub mod escrow;
pub mod messages;
pub mod role;
pub mod store;
pub mod transport;
pub mod witness;

/// A list of possible errors when manipulating the core primitives, composed
/// of the errors from every module.
#[derive(Error, Debug)]
pub enum Error {
    /// Consensus encoding or decoding error.
    #[error("Consensus: {0}")]
    Consensus(#[from] consensus::Error),
    /// Cryptographic error.
    #[error("Crypto: {0}")]
    Crypto(#[from] crypto::Error),
    /// Witness repository error.
    #[error("Store: {0}")]
    Store(#[from] store::Error),
    /// Escrow transaction error.
    #[error("Escrow: {0}")]
    Escrow(#[from] escrow::Error),
    /// Dispute settlement error.
    #[error("Settlement: {0}")]
    Settlement(#[from] dispute::settle::Error),
    /// Message delivery error.
    #[error("Transport: {0}")]
    Transport(#[from] transport::DeliveryError),
}

/// Wrapper around [`uuid::Uuid`] used to identify trades and network messages
/// and to carry the consensus encoding of the identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uuid(uuid::Uuid);

impl Uuid {
    /// Generate a new random (version 4) identifier.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Return the wrapped identifier.
    pub fn into_inner(self) -> uuid::Uuid {
        self.0
    }
}

impl From<uuid::Uuid> for Uuid {
    fn from(u: uuid::Uuid) -> Self {
        Uuid(u)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl consensus::Encodable for Uuid {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.into_bytes().consensus_encode(writer)
    }
}

impl consensus::Decodable for Uuid {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        let bytes: [u8; 16] = consensus::Decodable::consensus_decode(d)?;
        Ok(Uuid(uuid::Uuid::from_bytes(bytes)))
    }
}

impl_strict_encoding!(Uuid);
