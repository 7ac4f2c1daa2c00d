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

//! Dispute data layer: the per-trade dispute record, the escrow contract
//! snapshot shared by both parties, and the arbitrator's ruling. The dispute
//! is owned by the settlement engine and mutated only by incoming settlement
//! messages; the ruling is immutable once issued.

use std::io;

use bitcoin::secp256k1::PublicKey;
use bitcoin::util::address::Address;
use bitcoin::{Amount, Txid};

use crate::consensus::{self, CanonicalBytes, Decodable, Encodable};
use crate::role::TradeParty;
use crate::transport::PeerId;
use crate::Uuid;

pub mod settle;

/// The identifier of a trade, one dispute at most exists per identifier on a
/// node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(pub Uuid);

impl From<Uuid> for TradeId {
    fn from(u: Uuid) -> Self {
        TradeId(u)
    }
}

impl From<uuid::Uuid> for TradeId {
    fn from(u: uuid::Uuid) -> Self {
        TradeId(u.into())
    }
}

impl std::fmt::Display for TradeId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl Encodable for TradeId {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(writer)
    }
}

impl Decodable for TradeId {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(TradeId(Decodable::consensus_decode(d)?))
    }
}

impl_strict_encoding!(TradeId);

/// A chat message attached to a dispute. The ruling embeds the arbitrator's
/// closing message; recording is idempotent by full equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Unique identifier of the message.
    pub uid: Uuid,
    /// The trade the message belongs to.
    pub trade_id: TradeId,
    /// Network identity of the author.
    pub sender: PeerId,
    /// The message text.
    pub body: String,
    /// Authoring timestamp in milliseconds since epoch.
    pub date: i64,
}

impl Encodable for ChatMessage {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.uid.consensus_encode(s)?;
        len += self.trade_id.consensus_encode(s)?;
        len += self.sender.consensus_encode(s)?;
        len += self.body.consensus_encode(s)?;
        Ok(len + self.date.consensus_encode(s)?)
    }
}

impl Decodable for ChatMessage {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(ChatMessage {
            uid: Decodable::consensus_decode(d)?,
            trade_id: Decodable::consensus_decode(d)?,
            sender: Decodable::consensus_decode(d)?,
            body: Decodable::consensus_decode(d)?,
            date: Decodable::consensus_decode(d)?,
        })
    }
}

impl_strict_encoding!(ChatMessage);

/// Lifecycle of a dispute on the local node. `Closed` is terminal.
#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[display(Debug)]
pub enum DisputeState {
    /// The counterparty opened the dispute.
    StartedByPeer,
    /// The local party opened the dispute.
    StartedLocally,
    /// The arbitrator's ruling was received and applied.
    ResultReceived,
    /// The local party published the payout transaction.
    PayoutPublished,
    /// The counterparty published the payout transaction.
    PayoutReceivedFromPeer,
    /// Settlement finished, no further action expected.
    Closed,
}

impl Encodable for DisputeState {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            DisputeState::StartedByPeer => 0x01u8.consensus_encode(writer),
            DisputeState::StartedLocally => 0x02u8.consensus_encode(writer),
            DisputeState::ResultReceived => 0x03u8.consensus_encode(writer),
            DisputeState::PayoutPublished => 0x04u8.consensus_encode(writer),
            DisputeState::PayoutReceivedFromPeer => 0x05u8.consensus_encode(writer),
            DisputeState::Closed => 0x06u8.consensus_encode(writer),
        }
    }
}

impl Decodable for DisputeState {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(DisputeState::StartedByPeer),
            0x02u8 => Ok(DisputeState::StartedLocally),
            0x03u8 => Ok(DisputeState::ResultReceived),
            0x04u8 => Ok(DisputeState::PayoutPublished),
            0x05u8 => Ok(DisputeState::PayoutReceivedFromPeer),
            0x06u8 => Ok(DisputeState::Closed),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

impl_strict_encoding!(DisputeState);

/// Snapshot of the escrow contract shared by both trading parties: network
/// identities, payout addresses, and the three multisig keys locking the
/// deposit. The local role is derived from pubkey-ring equality, never
/// carried as a flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contract {
    /// The trade this contract belongs to.
    pub trade_id: TradeId,
    /// Network identity of the buyer.
    pub buyer_node: PeerId,
    /// Network identity of the seller.
    pub seller_node: PeerId,
    /// Address receiving the buyer's share of the payout.
    pub buyer_payout_address: Address,
    /// Address receiving the seller's share of the payout.
    pub seller_payout_address: Address,
    /// The buyer's escrow multisig key.
    pub buyer_multisig_pub_key: PublicKey,
    /// The seller's escrow multisig key.
    pub seller_multisig_pub_key: PublicKey,
    /// The arbitrator's escrow multisig key.
    pub arbitrator_multisig_pub_key: PublicKey,
}

impl Contract {
    /// Derive the trading role owning the given multisig key, if any.
    pub fn party_of(&self, multisig_pub_key: &PublicKey) -> Option<TradeParty> {
        if &self.buyer_multisig_pub_key == multisig_pub_key {
            Some(TradeParty::Buyer)
        } else if &self.seller_multisig_pub_key == multisig_pub_key {
            Some(TradeParty::Seller)
        } else {
            None
        }
    }

    /// The network identity of the given party.
    pub fn peer_of(&self, party: TradeParty) -> &PeerId {
        match party {
            TradeParty::Buyer => &self.buyer_node,
            TradeParty::Seller => &self.seller_node,
        }
    }

    /// The payout address of the given party.
    pub fn payout_address_of(&self, party: TradeParty) -> &Address {
        match party {
            TradeParty::Buyer => &self.buyer_payout_address,
            TradeParty::Seller => &self.seller_payout_address,
        }
    }
}

impl Encodable for Contract {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.trade_id.consensus_encode(s)?;
        len += self.buyer_node.consensus_encode(s)?;
        len += self.seller_node.consensus_encode(s)?;
        len += self
            .buyer_payout_address
            .as_canonical_bytes()
            .consensus_encode(s)?;
        len += self
            .seller_payout_address
            .as_canonical_bytes()
            .consensus_encode(s)?;
        len += self
            .buyer_multisig_pub_key
            .as_canonical_bytes()
            .consensus_encode(s)?;
        len += self
            .seller_multisig_pub_key
            .as_canonical_bytes()
            .consensus_encode(s)?;
        Ok(len
            + self
                .arbitrator_multisig_pub_key
                .as_canonical_bytes()
                .consensus_encode(s)?)
    }
}

impl Decodable for Contract {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Contract {
            trade_id: Decodable::consensus_decode(d)?,
            buyer_node: Decodable::consensus_decode(d)?,
            seller_node: Decodable::consensus_decode(d)?,
            buyer_payout_address: Address::from_canonical_bytes(unwrap_vec_ref!(d).as_ref())?,
            seller_payout_address: Address::from_canonical_bytes(unwrap_vec_ref!(d).as_ref())?,
            buyer_multisig_pub_key: PublicKey::from_canonical_bytes(unwrap_vec_ref!(d).as_ref())?,
            seller_multisig_pub_key: PublicKey::from_canonical_bytes(unwrap_vec_ref!(d).as_ref())?,
            arbitrator_multisig_pub_key: PublicKey::from_canonical_bytes(
                unwrap_vec_ref!(d).as_ref(),
            )?,
        })
    }
}

impl_strict_encoding!(Contract);

/// The arbitrator's ruling on a dispute: the winner, the payout split, the
/// arbitrator's multisig signature for the payout transaction, and which
/// party is responsible for publishing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisputeResult {
    /// The disputed trade.
    pub trade_id: TradeId,
    /// The party the arbitrator ruled in favour of.
    pub winner: TradeParty,
    /// When set, the losing party publishes the payout instead of the
    /// winner. Chosen at ruling time so settlement stays live when the winner
    /// is permanently offline.
    pub is_loser_publisher: bool,
    /// The buyer's share of the escrow.
    pub buyer_payout_amount: Amount,
    /// The seller's share of the escrow.
    pub seller_payout_amount: Amount,
    /// Compact ECDSA signature of the arbitrator over the canonical payout
    /// transaction sighash.
    pub arbitrator_signature: Vec<u8>,
    /// The arbitrator key that signed the payout.
    pub arbitrator_pub_key: PublicKey,
    /// The arbitrator's closing chat message.
    pub chat_message: ChatMessage,
}

impl DisputeResult {
    /// The party responsible for publishing the payout transaction: the
    /// winner, inverted when the ruling designates the loser.
    pub fn publisher(&self) -> TradeParty {
        if self.is_loser_publisher {
            self.winner.other()
        } else {
            self.winner
        }
    }
}

impl Encodable for DisputeResult {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.trade_id.consensus_encode(s)?;
        len += self.winner.consensus_encode(s)?;
        len += self.is_loser_publisher.consensus_encode(s)?;
        len += self.buyer_payout_amount.consensus_encode(s)?;
        len += self.seller_payout_amount.consensus_encode(s)?;
        len += self.arbitrator_signature.consensus_encode(s)?;
        len += self
            .arbitrator_pub_key
            .as_canonical_bytes()
            .consensus_encode(s)?;
        Ok(len + self.chat_message.consensus_encode(s)?)
    }
}

impl Decodable for DisputeResult {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(DisputeResult {
            trade_id: Decodable::consensus_decode(d)?,
            winner: Decodable::consensus_decode(d)?,
            is_loser_publisher: Decodable::consensus_decode(d)?,
            buyer_payout_amount: Decodable::consensus_decode(d)?,
            seller_payout_amount: Decodable::consensus_decode(d)?,
            arbitrator_signature: Decodable::consensus_decode(d)?,
            arbitrator_pub_key: PublicKey::from_canonical_bytes(unwrap_vec_ref!(d).as_ref())?,
            chat_message: Decodable::consensus_decode(d)?,
        })
    }
}

impl_strict_encoding!(DisputeResult);

/// The per-trade dispute record. Created when either party opens a dispute,
/// mutated by incoming settlement messages, closed once a payout outcome is
/// finalized, never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispute {
    /// The disputed trade.
    pub trade_id: TradeId,
    /// Snapshot of the escrow contract.
    pub contract: Contract,
    /// Chat history of the dispute.
    pub chat_messages: Vec<ChatMessage>,
    /// The ruling, absent until the arbitrator decides.
    pub dispute_result: Option<DisputeResult>,
    /// Where the dispute stands in its lifecycle.
    pub state: DisputeState,
    /// The serialized deposit transaction funding the escrow.
    pub deposit_tx_serialized: Option<Vec<u8>>,
    /// Identifier of the payout transaction once known.
    pub payout_tx_id: Option<Txid>,
    /// The serialized payout transaction, kept for idempotent resends.
    pub payout_tx_serialized: Option<Vec<u8>>,
}

impl Dispute {
    /// Create a dispute for a trade in the given opening state.
    pub fn new(trade_id: TradeId, contract: Contract, state: DisputeState) -> Self {
        Self {
            trade_id,
            contract,
            chat_messages: vec![],
            dispute_result: None,
            state,
            deposit_tx_serialized: None,
            payout_tx_id: None,
            payout_tx_serialized: None,
        }
    }

    /// Whether the dispute reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state == DisputeState::Closed
    }

    /// Record a chat message unless an equal one is already present.
    pub fn add_chat_message(&mut self, message: ChatMessage) {
        if !self.chat_messages.contains(&message) {
            self.chat_messages.push(message);
        }
    }
}

impl Encodable for Dispute {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.trade_id.consensus_encode(s)?;
        len += self.contract.consensus_encode(s)?;
        len += self.chat_messages.consensus_encode(s)?;
        len += self.dispute_result.consensus_encode(s)?;
        len += self.state.consensus_encode(s)?;
        len += self.deposit_tx_serialized.consensus_encode(s)?;
        len += self.payout_tx_id.consensus_encode(s)?;
        Ok(len + self.payout_tx_serialized.consensus_encode(s)?)
    }
}

impl Decodable for Dispute {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Dispute {
            trade_id: Decodable::consensus_decode(d)?,
            contract: Decodable::consensus_decode(d)?,
            chat_messages: Decodable::consensus_decode(d)?,
            dispute_result: Decodable::consensus_decode(d)?,
            state: Decodable::consensus_decode(d)?,
            deposit_tx_serialized: Decodable::consensus_decode(d)?,
            payout_tx_id: Decodable::consensus_decode(d)?,
            payout_tx_serialized: Decodable::consensus_decode(d)?,
        })
    }
}

impl_strict_encoding!(Dispute);

#[cfg(test)]
mod tests {
    use super::*;

    fn result(winner: TradeParty, is_loser_publisher: bool) -> DisputeResult {
        let trade_id = TradeId::from(uuid::Uuid::from_bytes([1u8; 16]));
        DisputeResult {
            trade_id,
            winner,
            is_loser_publisher,
            buyer_payout_amount: Amount::from_sat(1),
            seller_payout_amount: Amount::from_sat(2),
            arbitrator_signature: vec![],
            arbitrator_pub_key: "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5"
                .parse()
                .unwrap(),
            chat_message: ChatMessage {
                uid: uuid::Uuid::from_bytes([2u8; 16]).into(),
                trade_id,
                sender: PeerId::new(vec![0x01]),
                body: "ruled".into(),
                date: 0,
            },
        }
    }

    #[test]
    fn publisher_follows_winner() {
        assert_eq!(result(TradeParty::Buyer, false).publisher(), TradeParty::Buyer);
        assert_eq!(result(TradeParty::Seller, false).publisher(), TradeParty::Seller);
    }

    #[test]
    fn loser_publisher_inverts() {
        assert_eq!(result(TradeParty::Buyer, true).publisher(), TradeParty::Seller);
        assert_eq!(result(TradeParty::Seller, true).publisher(), TradeParty::Buyer);
    }

    #[test]
    fn chat_recording_is_idempotent() {
        let r = result(TradeParty::Buyer, false);
        let contract = crate::escrow::tests::contract();
        let mut dispute = Dispute::new(r.trade_id, contract, DisputeState::StartedLocally);
        dispute.add_chat_message(r.chat_message.clone());
        dispute.add_chat_message(r.chat_message.clone());
        assert_eq!(dispute.chat_messages.len(), 1);
    }
}
