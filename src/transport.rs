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

//! External transport collaborators. The peer-to-peer layer delivers opaque
//! signed messages with mailbox-style asynchronous delivery; the core only
//! sees the typed outcome of a send. Delivery callbacks and timers re-enter
//! the single dispatch context driving the services, so none of the core
//! state needs locking.

use std::error;
use std::fmt;
use std::io;

use thiserror::Error;

use crate::consensus::{self, Decodable, Encodable};
use crate::messages::DisputeMessage;
use crate::witness::SignedWitness;

/// Network identity of a peer, its raw public key bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(Vec<u8>);

impl PeerId {
    /// Create a peer identity from its raw public key bytes.
    pub fn new(pub_key: Vec<u8>) -> Self {
        Self(pub_key)
    }

    /// The raw public key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for PeerId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl Encodable for PeerId {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(writer)
    }
}

impl Decodable for PeerId {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Self(Decodable::consensus_decode(d)?))
    }
}

impl_strict_encoding!(PeerId);

/// Where a sent message ended up.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
#[display(Debug)]
pub enum DeliveryOutcome {
    /// The peer was online and acknowledged reception.
    Arrived,
    /// The peer was offline, the message was stored in its mailbox for
    /// asynchronous delivery.
    Mailboxed,
}

/// Delivery faults reported by the transport.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The peer has not negotiated the capability for this message type.
    /// Sending anyway would make the peer disconnect on an unknown type.
    #[error("The peer does not support the message's capability")]
    MissingCapability,
    /// Any fault reported by the underlying transport.
    #[error("Delivery fault: {0}")]
    Fault(Box<dyn error::Error + Send + Sync>),
}

impl DeliveryError {
    /// Creates a new delivery error of type [`Self::Fault`] with an arbitrary
    /// payload.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::Fault(error.into())
    }
}

/// Direct and mailbox delivery of dispute messages to a single peer.
/// Implementations must preserve the order of one local sender's outgoing
/// stream but no ordering is guaranteed across independent peers; the core
/// never relies on cross-peer ordering.
pub trait MessageTransport {
    /// Send a message to the peer, waiting for the delivery outcome.
    fn send(&mut self, to: &PeerId, message: DisputeMessage)
        -> Result<DeliveryOutcome, DeliveryError>;
}

/// Network-wide flooding of witness records. Implementations must skip peers
/// that have not negotiated the signed-witness capability.
pub trait WitnessBroadcaster {
    /// Broadcast the record to all capable peers.
    fn broadcast_witness(&mut self, witness: &SignedWitness) -> Result<(), DeliveryError>;
}
