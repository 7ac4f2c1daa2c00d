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

//! Dispute messages exchanged between trading peers and arbitrators. Every
//! message carries the trade identifier, its own unique identifier used by
//! the delayed-retry bookkeeping, and the sender's network identity for the
//! acknowledgement path. No ordering is guaranteed across independent
//! senders.

use std::io;

use crate::consensus::{self, Decodable, Encodable};
use crate::dispute::{Dispute, DisputeResult, TradeId};
use crate::transport::PeerId;
use crate::Uuid;

/// Ask the arbitrator to open a dispute for a trade, carrying the local
/// dispute snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenDispute {
    /// The disputed trade.
    pub trade_id: TradeId,
    /// Unique identifier of this message.
    pub uid: Uuid,
    /// Network identity of the opener.
    pub sender: PeerId,
    /// Snapshot of the opener's dispute record.
    pub dispute: Dispute,
}

/// Inform the counterparty that a dispute was opened against its trade,
/// carrying the opener's dispute snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerOpenedDispute {
    /// The disputed trade.
    pub trade_id: TradeId,
    /// Unique identifier of this message.
    pub uid: Uuid,
    /// Network identity of the opener.
    pub sender: PeerId,
    /// Snapshot of the opener's dispute record.
    pub dispute: Dispute,
}

/// Deliver the arbitrator's ruling to a trading party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisputeRuled {
    /// The disputed trade.
    pub trade_id: TradeId,
    /// Unique identifier of this message.
    pub uid: Uuid,
    /// Network identity of the arbitrator.
    pub sender: PeerId,
    /// The ruling.
    pub result: DisputeResult,
}

/// Inform the counterparty that the payout transaction was published,
/// carrying the raw transaction so the receiver can commit it to its wallet
/// view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutPublished {
    /// The disputed trade.
    pub trade_id: TradeId,
    /// Unique identifier of this message.
    pub uid: Uuid,
    /// Network identity of the publisher.
    pub sender: PeerId,
    /// The serialized payout transaction.
    pub payout_tx: Vec<u8>,
}

/// Acknowledge the processing of a settlement message back to its
/// originator, reporting success or failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementAck {
    /// The disputed trade.
    pub trade_id: TradeId,
    /// Unique identifier of this message.
    pub uid: Uuid,
    /// Identifier of the acknowledged message.
    pub source_uid: Uuid,
    /// Network identity of the acknowledging party.
    pub sender: PeerId,
    /// Whether the acknowledged message was applied successfully.
    pub success: bool,
    /// Failure description when `success` is false.
    pub error: Option<String>,
}

/// Envelope for all dispute messages, tagged on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisputeMessage {
    /// Dispute opening request sent to the arbitrator.
    OpenDispute(OpenDispute),
    /// Dispute opening notification sent to the counterparty.
    PeerOpenedDispute(PeerOpenedDispute),
    /// The arbitrator's ruling.
    DisputeRuled(DisputeRuled),
    /// Payout publication notification.
    PayoutPublished(PayoutPublished),
    /// Processing acknowledgement.
    SettlementAck(SettlementAck),
}

impl DisputeMessage {
    /// The trade the message belongs to.
    pub fn trade_id(&self) -> TradeId {
        match self {
            DisputeMessage::OpenDispute(m) => m.trade_id,
            DisputeMessage::PeerOpenedDispute(m) => m.trade_id,
            DisputeMessage::DisputeRuled(m) => m.trade_id,
            DisputeMessage::PayoutPublished(m) => m.trade_id,
            DisputeMessage::SettlementAck(m) => m.trade_id,
        }
    }

    /// The unique identifier of the message.
    pub fn uid(&self) -> Uuid {
        match self {
            DisputeMessage::OpenDispute(m) => m.uid,
            DisputeMessage::PeerOpenedDispute(m) => m.uid,
            DisputeMessage::DisputeRuled(m) => m.uid,
            DisputeMessage::PayoutPublished(m) => m.uid,
            DisputeMessage::SettlementAck(m) => m.uid,
        }
    }
}

impl Encodable for OpenDispute {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.trade_id.consensus_encode(s)?;
        len += self.uid.consensus_encode(s)?;
        len += self.sender.consensus_encode(s)?;
        Ok(len + self.dispute.consensus_encode(s)?)
    }
}

impl Decodable for OpenDispute {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(OpenDispute {
            trade_id: Decodable::consensus_decode(d)?,
            uid: Decodable::consensus_decode(d)?,
            sender: Decodable::consensus_decode(d)?,
            dispute: Decodable::consensus_decode(d)?,
        })
    }
}

impl_strict_encoding!(OpenDispute);

impl Encodable for PeerOpenedDispute {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.trade_id.consensus_encode(s)?;
        len += self.uid.consensus_encode(s)?;
        len += self.sender.consensus_encode(s)?;
        Ok(len + self.dispute.consensus_encode(s)?)
    }
}

impl Decodable for PeerOpenedDispute {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(PeerOpenedDispute {
            trade_id: Decodable::consensus_decode(d)?,
            uid: Decodable::consensus_decode(d)?,
            sender: Decodable::consensus_decode(d)?,
            dispute: Decodable::consensus_decode(d)?,
        })
    }
}

impl_strict_encoding!(PeerOpenedDispute);

impl Encodable for DisputeRuled {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.trade_id.consensus_encode(s)?;
        len += self.uid.consensus_encode(s)?;
        len += self.sender.consensus_encode(s)?;
        Ok(len + self.result.consensus_encode(s)?)
    }
}

impl Decodable for DisputeRuled {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(DisputeRuled {
            trade_id: Decodable::consensus_decode(d)?,
            uid: Decodable::consensus_decode(d)?,
            sender: Decodable::consensus_decode(d)?,
            result: Decodable::consensus_decode(d)?,
        })
    }
}

impl_strict_encoding!(DisputeRuled);

impl Encodable for PayoutPublished {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.trade_id.consensus_encode(s)?;
        len += self.uid.consensus_encode(s)?;
        len += self.sender.consensus_encode(s)?;
        Ok(len + self.payout_tx.consensus_encode(s)?)
    }
}

impl Decodable for PayoutPublished {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(PayoutPublished {
            trade_id: Decodable::consensus_decode(d)?,
            uid: Decodable::consensus_decode(d)?,
            sender: Decodable::consensus_decode(d)?,
            payout_tx: Decodable::consensus_decode(d)?,
        })
    }
}

impl_strict_encoding!(PayoutPublished);

impl Encodable for SettlementAck {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        let mut len = self.trade_id.consensus_encode(s)?;
        len += self.uid.consensus_encode(s)?;
        len += self.source_uid.consensus_encode(s)?;
        len += self.sender.consensus_encode(s)?;
        len += self.success.consensus_encode(s)?;
        Ok(len + self.error.consensus_encode(s)?)
    }
}

impl Decodable for SettlementAck {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(SettlementAck {
            trade_id: Decodable::consensus_decode(d)?,
            uid: Decodable::consensus_decode(d)?,
            source_uid: Decodable::consensus_decode(d)?,
            sender: Decodable::consensus_decode(d)?,
            success: Decodable::consensus_decode(d)?,
            error: Decodable::consensus_decode(d)?,
        })
    }
}

impl_strict_encoding!(SettlementAck);

impl Encodable for DisputeMessage {
    fn consensus_encode<W: io::Write>(&self, s: &mut W) -> Result<usize, io::Error> {
        match self {
            DisputeMessage::OpenDispute(m) => {
                let len = 0x01u16.consensus_encode(s)?;
                Ok(len + m.consensus_encode(s)?)
            }
            DisputeMessage::PeerOpenedDispute(m) => {
                let len = 0x02u16.consensus_encode(s)?;
                Ok(len + m.consensus_encode(s)?)
            }
            DisputeMessage::DisputeRuled(m) => {
                let len = 0x03u16.consensus_encode(s)?;
                Ok(len + m.consensus_encode(s)?)
            }
            DisputeMessage::PayoutPublished(m) => {
                let len = 0x04u16.consensus_encode(s)?;
                Ok(len + m.consensus_encode(s)?)
            }
            DisputeMessage::SettlementAck(m) => {
                let len = 0x05u16.consensus_encode(s)?;
                Ok(len + m.consensus_encode(s)?)
            }
        }
    }
}

impl Decodable for DisputeMessage {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u16 => Ok(DisputeMessage::OpenDispute(Decodable::consensus_decode(d)?)),
            0x02u16 => Ok(DisputeMessage::PeerOpenedDispute(
                Decodable::consensus_decode(d)?,
            )),
            0x03u16 => Ok(DisputeMessage::DisputeRuled(Decodable::consensus_decode(
                d,
            )?)),
            0x04u16 => Ok(DisputeMessage::PayoutPublished(
                Decodable::consensus_decode(d)?,
            )),
            0x05u16 => Ok(DisputeMessage::SettlementAck(Decodable::consensus_decode(
                d,
            )?)),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

impl_strict_encoding!(DisputeMessage);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{deserialize, serialize};

    #[test]
    fn payout_published_round_trip() {
        let msg = DisputeMessage::PayoutPublished(PayoutPublished {
            trade_id: TradeId::from(uuid::Uuid::from_bytes([3u8; 16])),
            uid: uuid::Uuid::from_bytes([4u8; 16]).into(),
            sender: PeerId::new(vec![0xaa, 0xbb]),
            payout_tx: vec![0x02, 0x00, 0x00, 0x00],
        });
        let decoded: DisputeMessage = deserialize(&serialize(&msg)).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn ack_round_trip() {
        let msg = SettlementAck {
            trade_id: TradeId::from(uuid::Uuid::from_bytes([3u8; 16])),
            uid: uuid::Uuid::from_bytes([5u8; 16]).into(),
            source_uid: uuid::Uuid::from_bytes([4u8; 16]).into(),
            sender: PeerId::new(vec![0xcc]),
            success: false,
            error: Some("no deposit transaction".into()),
        };
        let decoded: SettlementAck = deserialize(&serialize(&msg)).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn unknown_message_tag_is_rejected() {
        assert!(deserialize::<DisputeMessage>(&[0xff, 0x00]).is_err());
    }
}
