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

//! Roles distinguishing the two trading parties of an escrowed trade. The
//! arbitrator ruling designates one of them as the winner and one of them as
//! the payout publisher.

use std::io;
use std::str::FromStr;

use crate::consensus::{self, Decodable, Encodable};

/// The two parties of an escrowed trade. The same roles identify the winner
/// of a dispute and the party responsible for publishing the payout
/// transaction.
#[derive(Display, Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[display(Debug)]
pub enum TradeParty {
    /// The party buying the bitcoin held in escrow.
    Buyer,
    /// The party selling the bitcoin held in escrow.
    Seller,
}

impl TradeParty {
    /// Return the counterparty role.
    pub fn other(&self) -> Self {
        match self {
            Self::Buyer => Self::Seller,
            Self::Seller => Self::Buyer,
        }
    }
}

impl Encodable for TradeParty {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        match self {
            TradeParty::Buyer => 0x01u8.consensus_encode(writer),
            TradeParty::Seller => 0x02u8.consensus_encode(writer),
        }
    }
}

impl Decodable for TradeParty {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(TradeParty::Buyer),
            0x02u8 => Ok(TradeParty::Seller),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

impl_strict_encoding!(TradeParty);

impl FromStr for TradeParty {
    type Err = consensus::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Buyer" | "buyer" => Ok(TradeParty::Buyer),
            "Seller" | "seller" => Ok(TradeParty::Seller),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_string() {
        assert!(TradeParty::from_str("Buyer").is_ok());
        assert!(TradeParty::from_str("seller").is_ok());
        assert!(TradeParty::from_str("arbitrator").is_err());
    }

    #[test]
    fn other_party() {
        assert_eq!(TradeParty::Buyer.other(), TradeParty::Seller);
        assert_eq!(TradeParty::Seller.other(), TradeParty::Buyer);
    }
}
