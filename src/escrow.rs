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

//! Escrow transactions on Bitcoin. The deposit locks the traded funds in a
//! 2-of-3 P2WSH multisig over the arbitrator, buyer, and seller keys; after a
//! ruling, the payout transaction spends it with the arbitrator's signature
//! plus the publishing party's signature.
//!
//! The payout is built in a canonical form so the arbitrator (at ruling time)
//! and the publisher (at settlement time) derive the exact same sighash:
//! version 2, lock time 0, the single escrow input with final sequence, and
//! the buyer then seller outputs with zero-amount outputs omitted. The
//! difference between the escrowed value and the ruled payouts is the miner
//! fee.

use std::error;

use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::{Builder, Script};
use bitcoin::blockdata::transaction::{EcdsaSighashType, OutPoint, Transaction, TxIn, TxOut};
use bitcoin::blockdata::witness::Witness;
use bitcoin::hashes::sha256d::Hash as Sha256dHash;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::util::address::Address;
use bitcoin::util::sighash::SighashCache;
use bitcoin::{Amount, Txid};

use thiserror::Error;

use crate::consensus::{self, CanonicalBytes, Decodable, Encodable};
use crate::dispute::Contract;

use std::io;
use std::str::FromStr;

/// A list specifying general categories of escrow transaction error.
#[derive(Error, Debug)]
pub enum Error {
    /// The deposit transaction has no output paying the escrow script.
    #[error("The deposit transaction has no output paying the escrow script")]
    MissingEscrowOutput,
    /// The ruled payout amounts exceed the escrowed value.
    #[error("The ruled payout amounts exceed the escrowed value")]
    PayoutExceedsEscrow,
    /// The ruling pays out to neither party.
    #[error("The ruling pays out to neither party")]
    EmptyPayout,
    /// Bitcoin transaction encoding error.
    #[error("Transaction encoding error: {0}")]
    Encoding(#[from] bitcoin::consensus::encode::Error),
    /// Secp256k1 key or signature error.
    #[error("Secp256k1 error: {0}")]
    Secp(#[from] bitcoin::secp256k1::Error),
}

/// Faults reported when handing a transaction to the network.
#[derive(Error, Debug)]
pub enum BroadcastError {
    /// The network rejected the transaction.
    #[error("The transaction was rejected by the network: {0}")]
    Rejected(String),
    /// Any fault reported by the underlying wallet or node connection.
    #[error("Broadcast fault: {0}")]
    Fault(Box<dyn error::Error + Send + Sync>),
}

impl BroadcastError {
    /// Creates a new broadcast error of type [`Self::Fault`] with an
    /// arbitrary payload.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::Fault(error.into())
    }
}

/// The wallet collaborator of the settlement engine. Broadcast is
/// asynchronous under the hood; the engine only sees the typed outcome and
/// never blocks the dispatch context on it.
pub trait EscrowWallet {
    /// Hand the fully signed transaction to the network, returning its
    /// identifier on success.
    fn broadcast(&mut self, tx: &Transaction) -> Result<Txid, BroadcastError>;

    /// Record a transaction published by the counterparty into the local
    /// wallet view.
    fn commit(&mut self, tx: &Transaction);
}

/// The escrow locking script: a 2-of-3 multisig over the arbitrator, buyer,
/// and seller keys, in that order. Spending signatures must appear in the
/// same key order.
pub fn escrow_script(arbitrator: &PublicKey, buyer: &PublicKey, seller: &PublicKey) -> Script {
    Builder::new()
        .push_opcode(opcodes::all::OP_PUSHNUM_2)
        .push_key(&bitcoin::util::key::PublicKey::new(*arbitrator))
        .push_key(&bitcoin::util::key::PublicKey::new(*buyer))
        .push_key(&bitcoin::util::key::PublicKey::new(*seller))
        .push_opcode(opcodes::all::OP_PUSHNUM_3)
        .push_opcode(opcodes::all::OP_CHECKMULTISIG)
        .into_script()
}

/// The canonical payout transaction spending the escrow output of a deposit
/// transaction according to a ruling.
#[derive(Debug, Clone)]
pub struct PayoutTx {
    tx: Transaction,
    witness_script: Script,
    input_value: u64,
}

impl PayoutTx {
    /// Build the canonical payout for the contract's escrow. Fails when the
    /// deposit carries no escrow output, when the ruled amounts exceed the
    /// escrowed value, or when both payouts are zero.
    pub fn build(
        contract: &Contract,
        deposit: &Transaction,
        buyer_amount: Amount,
        seller_amount: Amount,
    ) -> Result<Self, Error> {
        let witness_script = escrow_script(
            &contract.arbitrator_multisig_pub_key,
            &contract.buyer_multisig_pub_key,
            &contract.seller_multisig_pub_key,
        );
        let escrow_spk = witness_script.to_v0_p2wsh();
        let (vout, input_value) = deposit
            .output
            .iter()
            .enumerate()
            .find(|(_, out)| out.script_pubkey == escrow_spk)
            .map(|(i, out)| (i as u32, out.value))
            .ok_or(Error::MissingEscrowOutput)?;

        let total = buyer_amount
            .as_sat()
            .checked_add(seller_amount.as_sat())
            .ok_or(Error::PayoutExceedsEscrow)?;
        if total > input_value {
            return Err(Error::PayoutExceedsEscrow);
        }

        let mut output = Vec::with_capacity(2);
        if buyer_amount.as_sat() > 0 {
            output.push(TxOut {
                value: buyer_amount.as_sat(),
                script_pubkey: contract.buyer_payout_address.script_pubkey(),
            });
        }
        if seller_amount.as_sat() > 0 {
            output.push(TxOut {
                value: seller_amount.as_sat(),
                script_pubkey: contract.seller_payout_address.script_pubkey(),
            });
        }
        if output.is_empty() {
            return Err(Error::EmptyPayout);
        }

        let tx = Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint::new(deposit.txid(), vout),
                script_sig: Script::new(),
                sequence: u32::MAX,
                witness: Witness::default(),
            }],
            output,
        };

        Ok(Self {
            tx,
            witness_script,
            input_value,
        })
    }

    /// Computes the [`BIP-143`][bip-143] compliant sighash for the
    /// `SIGHASH_ALL` signatures of the escrow input.
    ///
    /// [bip-143]: https://github.com/bitcoin/bips/blob/master/bip-0143.mediawiki
    pub fn signature_hash(&self) -> Sha256dHash {
        SighashCache::new(&self.tx)
            .segwit_signature_hash(
                0,
                &self.witness_script,
                self.input_value,
                EcdsaSighashType::All,
            )
            .expect("encoding works")
            .as_hash()
    }

    /// Sign the escrow input with the given multisig secret key.
    pub fn sign(&self, secret_key: &SecretKey) -> Result<Signature, Error> {
        let msg = Message::from_slice(&self.signature_hash()[..])?;
        let secp = Secp256k1::new();
        let mut sig = secp.sign_ecdsa(&msg, secret_key);
        sig.normalize_s();
        Ok(sig)
    }

    /// Validate a signature over the escrow input against the given multisig
    /// public key.
    pub fn verify_signature(&self, pub_key: &PublicKey, sig: &Signature) -> Result<(), Error> {
        let msg = Message::from_slice(&self.signature_hash()[..])?;
        Secp256k1::verification_only()
            .verify_ecdsa(&msg, sig, pub_key)
            .map_err(Error::from)
    }

    /// Identifier of the payout transaction. Witness data does not change it,
    /// so the identifier is final before signing.
    pub fn txid(&self) -> Txid {
        self.tx.txid()
    }

    /// Assemble the final witness from the arbitrator's signature and the
    /// publishing party's signature and extract the broadcastable
    /// transaction.
    pub fn finalize(self, arbitrator_sig: &Signature, party_sig: &Signature) -> Transaction {
        let sighash_suffix = EcdsaSighashType::All.to_u32() as u8;
        let mut arbitrator = arbitrator_sig.serialize_der().to_vec();
        arbitrator.push(sighash_suffix);
        let mut party = party_sig.serialize_der().to_vec();
        party.push(sighash_suffix);

        let mut tx = self.tx;
        // leading empty element consumed by the CHECKMULTISIG off-by-one
        tx.input[0].witness = Witness::from_vec(vec![
            vec![],
            arbitrator,
            party,
            self.witness_script.to_bytes(),
        ]);
        tx
    }
}

impl CanonicalBytes for PublicKey {
    fn as_canonical_bytes(&self) -> Vec<u8> {
        self.serialize().as_ref().into()
    }

    fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, consensus::Error>
    where
        Self: Sized,
    {
        PublicKey::from_slice(bytes).map_err(consensus::Error::new)
    }
}

impl CanonicalBytes for Address {
    fn as_canonical_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    fn from_canonical_bytes(bytes: &[u8]) -> Result<Self, consensus::Error>
    where
        Self: Sized,
    {
        Address::from_str(std::str::from_utf8(bytes).map_err(consensus::Error::new)?)
            .map_err(consensus::Error::new)
    }
}

impl Encodable for Amount {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_sat().consensus_encode(writer)
    }
}

impl Decodable for Amount {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Amount::from_sat(Decodable::consensus_decode(d)?))
    }
}

impl Encodable for Txid {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.into_inner().consensus_encode(writer)
    }
}

impl Decodable for Txid {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        let bytes: [u8; 32] = Decodable::consensus_decode(d)?;
        Ok(Txid::from_inner(bytes))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dispute::TradeId;
    use crate::transport::PeerId;
    use bitcoin::network::constants::Network;

    pub(crate) fn keys(byte: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        (sk, pk)
    }

    pub(crate) fn contract() -> Contract {
        let (_, arbitrator) = keys(0xa1);
        let (_, buyer) = keys(0xb1);
        let (_, seller) = keys(0xc1);
        Contract {
            trade_id: TradeId::from(uuid::Uuid::from_bytes([9u8; 16])),
            buyer_node: PeerId::new(vec![0xb0; 4]),
            seller_node: PeerId::new(vec![0xc0; 4]),
            buyer_payout_address: Address::p2wpkh(
                &bitcoin::util::key::PublicKey::new(buyer),
                Network::Regtest,
            )
            .unwrap(),
            seller_payout_address: Address::p2wpkh(
                &bitcoin::util::key::PublicKey::new(seller),
                Network::Regtest,
            )
            .unwrap(),
            buyer_multisig_pub_key: buyer,
            seller_multisig_pub_key: seller,
            arbitrator_multisig_pub_key: arbitrator,
        }
    }

    pub(crate) fn deposit_tx(contract: &Contract, value: u64) -> Transaction {
        let script = escrow_script(
            &contract.arbitrator_multisig_pub_key,
            &contract.buyer_multisig_pub_key,
            &contract.seller_multisig_pub_key,
        );
        Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_inner([0xde; 32]), 0),
                script_sig: Script::new(),
                sequence: u32::MAX,
                witness: Witness::default(),
            }],
            output: vec![TxOut {
                value,
                script_pubkey: script.to_v0_p2wsh(),
            }],
        }
    }

    #[test]
    fn payout_splits_escrow_and_leaves_fee() {
        let contract = contract();
        let deposit = deposit_tx(&contract, 1_000_000);
        let payout = PayoutTx::build(
            &contract,
            &deposit,
            Amount::from_sat(700_000),
            Amount::from_sat(290_000),
        )
        .unwrap();
        assert_eq!(payout.tx.output.len(), 2);
        assert_eq!(payout.tx.output[0].value, 700_000);
        assert_eq!(payout.tx.output[1].value, 290_000);
        // 10_000 sat of implied fee
        assert_eq!(payout.input_value, 1_000_000);
    }

    #[test]
    fn zero_amount_output_is_omitted() {
        let contract = contract();
        let deposit = deposit_tx(&contract, 1_000_000);
        let payout = PayoutTx::build(
            &contract,
            &deposit,
            Amount::from_sat(0),
            Amount::from_sat(990_000),
        )
        .unwrap();
        assert_eq!(payout.tx.output.len(), 1);
        assert_eq!(
            payout.tx.output[0].script_pubkey,
            contract.seller_payout_address.script_pubkey()
        );
    }

    #[test]
    fn overspending_ruling_is_rejected() {
        let contract = contract();
        let deposit = deposit_tx(&contract, 1_000_000);
        let res = PayoutTx::build(
            &contract,
            &deposit,
            Amount::from_sat(900_000),
            Amount::from_sat(200_000),
        );
        assert!(matches!(res, Err(Error::PayoutExceedsEscrow)));
    }

    #[test]
    fn deposit_without_escrow_output_is_rejected() {
        let contract = contract();
        let mut deposit = deposit_tx(&contract, 1_000_000);
        deposit.output[0].script_pubkey = Script::new();
        let res = PayoutTx::build(
            &contract,
            &deposit,
            Amount::from_sat(500_000),
            Amount::from_sat(400_000),
        );
        assert!(matches!(res, Err(Error::MissingEscrowOutput)));
    }

    #[test]
    fn signatures_verify_and_finalize() {
        let contract = contract();
        let deposit = deposit_tx(&contract, 1_000_000);
        let payout = PayoutTx::build(
            &contract,
            &deposit,
            Amount::from_sat(600_000),
            Amount::from_sat(390_000),
        )
        .unwrap();

        let (arbitrator_sk, arbitrator_pk) = keys(0xa1);
        let (buyer_sk, buyer_pk) = keys(0xb1);
        let arbitrator_sig = payout.sign(&arbitrator_sk).unwrap();
        let buyer_sig = payout.sign(&buyer_sk).unwrap();
        payout.verify_signature(&arbitrator_pk, &arbitrator_sig).unwrap();
        payout.verify_signature(&buyer_pk, &buyer_sig).unwrap();
        assert!(payout.verify_signature(&buyer_pk, &arbitrator_sig).is_err());

        let txid = payout.txid();
        let tx = payout.finalize(&arbitrator_sig, &buyer_sig);
        assert_eq!(tx.txid(), txid);
        assert_eq!(tx.input[0].witness.len(), 4);
    }
}
