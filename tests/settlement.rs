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

use std::cell::RefCell;
use std::rc::Rc;

use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{OutPoint, Transaction, TxIn, TxOut};
use bitcoin::blockdata::witness::Witness;
use bitcoin::consensus::encode as btc_encode;
use bitcoin::hashes::Hash;
use bitcoin::network::constants::Network;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::util::address::Address;
use bitcoin::{Amount, Txid};

use agora_core::dispute::settle::{Error, SettlementEngine, RESULT_RETRY_DELAY_MS};
use agora_core::dispute::{
    ChatMessage, Contract, Dispute, DisputeResult, DisputeState, TradeId,
};
use agora_core::escrow::{escrow_script, BroadcastError, EscrowWallet, PayoutTx};
use agora_core::messages::{DisputeMessage, DisputeRuled, PayoutPublished, PeerOpenedDispute};
use agora_core::role::TradeParty;
use agora_core::transport::{DeliveryError, DeliveryOutcome, MessageTransport, PeerId};
use agora_core::Uuid;

#[derive(Clone, Default)]
struct MockTransport {
    sent: Rc<RefCell<Vec<(PeerId, DisputeMessage)>>>,
}

impl MessageTransport for MockTransport {
    fn send(
        &mut self,
        to: &PeerId,
        message: DisputeMessage,
    ) -> Result<DeliveryOutcome, DeliveryError> {
        self.sent.borrow_mut().push((to.clone(), message));
        Ok(DeliveryOutcome::Arrived)
    }
}

#[derive(Clone, Default)]
struct MockWallet {
    broadcasts: Rc<RefCell<Vec<Transaction>>>,
    committed: Rc<RefCell<Vec<Txid>>>,
    fail_broadcast: Rc<RefCell<bool>>,
}

impl EscrowWallet for MockWallet {
    fn broadcast(&mut self, tx: &Transaction) -> Result<Txid, BroadcastError> {
        if *self.fail_broadcast.borrow() {
            return Err(BroadcastError::Rejected("mempool unavailable".into()));
        }
        self.broadcasts.borrow_mut().push(tx.clone());
        Ok(tx.txid())
    }

    fn commit(&mut self, tx: &Transaction) {
        self.committed.borrow_mut().push(tx.txid());
    }
}

fn keys(byte: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
    let pk = PublicKey::from_secret_key(&secp, &sk);
    (sk, pk)
}

fn trade_id(byte: u8) -> TradeId {
    TradeId::from(uuid::Uuid::from_bytes([byte; 16]))
}

fn contract(id: TradeId) -> Contract {
    let (_, arbitrator) = keys(0xa1);
    let (_, buyer) = keys(0xb1);
    let (_, seller) = keys(0xc1);
    Contract {
        trade_id: id,
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

fn deposit_tx(contract: &Contract, value: u64) -> Transaction {
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

fn arbitrator_peer() -> PeerId {
    PeerId::new(vec![0xa0; 4])
}

/// A ruling with a valid arbitrator multisig signature over the canonical
/// payout of the given deposit.
fn ruling(
    id: TradeId,
    contract: &Contract,
    deposit: &Transaction,
    winner: TradeParty,
    is_loser_publisher: bool,
    buyer_amount: u64,
    seller_amount: u64,
) -> DisputeResult {
    let (arbitrator_sk, arbitrator_pk) = keys(0xa1);
    let payout = PayoutTx::build(
        contract,
        deposit,
        Amount::from_sat(buyer_amount),
        Amount::from_sat(seller_amount),
    )
    .unwrap();
    let signature = payout.sign(&arbitrator_sk).unwrap();
    DisputeResult {
        trade_id: id,
        winner,
        is_loser_publisher,
        buyer_payout_amount: Amount::from_sat(buyer_amount),
        seller_payout_amount: Amount::from_sat(seller_amount),
        arbitrator_signature: signature.serialize_compact().to_vec(),
        arbitrator_pub_key: arbitrator_pk,
        chat_message: ChatMessage {
            uid: Uuid::random(),
            trade_id: id,
            sender: arbitrator_peer(),
            body: "ruling applied".into(),
            date: 50_000,
        },
    }
}

fn ruled_message(id: TradeId, result: DisputeResult) -> DisputeRuled {
    DisputeRuled {
        trade_id: id,
        uid: Uuid::random(),
        sender: arbitrator_peer(),
        result,
    }
}

fn buyer_engine(
    transport: MockTransport,
    wallet: MockWallet,
) -> SettlementEngine<MockTransport, MockWallet> {
    let (buyer_sk, _) = keys(0xb1);
    SettlementEngine::new(transport, wallet, PeerId::new(vec![0xb0; 4]), buyer_sk, None)
}

fn seller_engine(
    transport: MockTransport,
    wallet: MockWallet,
) -> SettlementEngine<MockTransport, MockWallet> {
    let (seller_sk, _) = keys(0xc1);
    SettlementEngine::new(transport, wallet, PeerId::new(vec![0xc0; 4]), seller_sk, None)
}

fn open_dispute_with_deposit(
    engine: &mut SettlementEngine<MockTransport, MockWallet>,
    id: TradeId,
    deposit: Option<&Transaction>,
) {
    let mut dispute = Dispute::new(id, contract(id), DisputeState::StartedLocally);
    dispute.deposit_tx_serialized = deposit.map(btc_encode::serialize);
    engine.open_dispute(dispute, &arbitrator_peer());
}

fn acks_of(sent: &[(PeerId, DisputeMessage)]) -> Vec<bool> {
    sent.iter()
        .filter_map(|(_, m)| match m {
            DisputeMessage::SettlementAck(a) => Some(a.success),
            _ => None,
        })
        .collect()
}

#[test]
fn winning_publisher_signs_broadcasts_and_notifies() {
    let transport = MockTransport::default();
    let wallet = MockWallet::default();
    let sent = transport.sent.clone();
    let broadcasts = wallet.broadcasts.clone();
    let mut engine = buyer_engine(transport, wallet);

    let id = trade_id(0x01);
    let deposit = deposit_tx(&contract(id), 1_000_000);
    open_dispute_with_deposit(&mut engine, id, Some(&deposit));

    let result = ruling(id, &contract(id), &deposit, TradeParty::Buyer, false, 700_000, 290_000);
    engine
        .on_dispute_ruled(ruled_message(id, result), 100_000)
        .unwrap();

    assert_eq!(broadcasts.borrow().len(), 1);
    let dispute = engine.dispute(&id).unwrap();
    assert!(dispute.is_closed());
    assert_eq!(dispute.payout_tx_id, Some(broadcasts.borrow()[0].txid()));
    assert!(dispute.dispute_result.is_some());
    assert_eq!(dispute.chat_messages.len(), 1);

    // the counterparty was notified with the raw transaction and the
    // arbitrator acknowledged with success
    let messages = sent.borrow();
    let payout_notes: Vec<_> = messages
        .iter()
        .filter(|(to, m)| {
            matches!(m, DisputeMessage::PayoutPublished(_)) && to == &contract(id).seller_node
        })
        .collect();
    assert_eq!(payout_notes.len(), 1);
    assert_eq!(acks_of(&messages), vec![true]);
}

#[test]
fn loser_publisher_flag_moves_the_broadcast_to_the_seller() {
    let id = trade_id(0x02);
    let deposit = deposit_tx(&contract(id), 1_000_000);
    let result = ruling(id, &contract(id), &deposit, TradeParty::Buyer, true, 700_000, 290_000);

    // the seller lost but publishes
    let transport = MockTransport::default();
    let wallet = MockWallet::default();
    let broadcasts = wallet.broadcasts.clone();
    let mut engine = seller_engine(transport, wallet);
    open_dispute_with_deposit(&mut engine, id, Some(&deposit));
    engine
        .on_dispute_ruled(ruled_message(id, result.clone()), 100_000)
        .unwrap();
    assert_eq!(broadcasts.borrow().len(), 1);

    // while the winning buyer does not broadcast
    let transport = MockTransport::default();
    let wallet = MockWallet::default();
    let broadcasts = wallet.broadcasts.clone();
    let mut engine = buyer_engine(transport, wallet);
    open_dispute_with_deposit(&mut engine, id, Some(&deposit));
    engine
        .on_dispute_ruled(ruled_message(id, result), 100_000)
        .unwrap();
    assert_eq!(broadcasts.borrow().len(), 0);
    assert!(engine.dispute(&id).unwrap().is_closed());
}

#[test]
fn existing_payout_is_reused_not_rebroadcast() {
    let transport = MockTransport::default();
    let wallet = MockWallet::default();
    let sent = transport.sent.clone();
    let broadcasts = wallet.broadcasts.clone();
    let mut engine = buyer_engine(transport, wallet);

    let id = trade_id(0x03);
    let deposit = deposit_tx(&contract(id), 1_000_000);
    let existing = deposit_tx(&contract(id), 999_000);
    let mut dispute = Dispute::new(id, contract(id), DisputeState::StartedLocally);
    dispute.deposit_tx_serialized = Some(btc_encode::serialize(&deposit));
    dispute.payout_tx_id = Some(existing.txid());
    dispute.payout_tx_serialized = Some(btc_encode::serialize(&existing));
    engine.open_dispute(dispute, &arbitrator_peer());

    let result = ruling(id, &contract(id), &deposit, TradeParty::Buyer, false, 700_000, 290_000);
    engine
        .on_dispute_ruled(ruled_message(id, result), 100_000)
        .unwrap();

    // no second broadcast, the recorded id is kept, the peer is notified
    assert_eq!(broadcasts.borrow().len(), 0);
    let dispute = engine.dispute(&id).unwrap();
    assert!(dispute.is_closed());
    assert_eq!(dispute.payout_tx_id, Some(existing.txid()));
    let messages = sent.borrow();
    let notes: Vec<_> = messages
        .iter()
        .filter_map(|(_, m)| match m {
            DisputeMessage::PayoutPublished(n) => Some(n.payout_tx.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(notes, vec![btc_encode::serialize(&existing)]);
}

#[test]
fn missing_deposit_reports_failure_and_force_closes() {
    let transport = MockTransport::default();
    let wallet = MockWallet::default();
    let sent = transport.sent.clone();
    let broadcasts = wallet.broadcasts.clone();
    let mut engine = seller_engine(transport, wallet);

    let id = trade_id(0x04);
    let deposit = deposit_tx(&contract(id), 1_000_000);
    open_dispute_with_deposit(&mut engine, id, None);

    // the seller wins and publishes, but no deposit is on record
    let result = ruling(id, &contract(id), &deposit, TradeParty::Seller, false, 0, 990_000);
    let outcome = engine.on_dispute_ruled(ruled_message(id, result), 100_000);
    assert!(matches!(outcome, Err(Error::MissingDepositTx(_))));
    assert_eq!(broadcasts.borrow().len(), 0);
    assert!(engine.dispute(&id).unwrap().is_closed());
    assert_eq!(acks_of(&sent.borrow()), vec![false]);
}

#[test]
fn broadcast_failure_leaves_the_dispute_open_for_a_replay() {
    let transport = MockTransport::default();
    let wallet = MockWallet::default();
    let sent = transport.sent.clone();
    let broadcasts = wallet.broadcasts.clone();
    let fail = wallet.fail_broadcast.clone();
    let mut engine = buyer_engine(transport, wallet);

    let id = trade_id(0x05);
    let deposit = deposit_tx(&contract(id), 1_000_000);
    open_dispute_with_deposit(&mut engine, id, Some(&deposit));

    *fail.borrow_mut() = true;
    let result = ruling(id, &contract(id), &deposit, TradeParty::Buyer, false, 700_000, 290_000);
    let outcome = engine.on_dispute_ruled(ruled_message(id, result.clone()), 100_000);
    assert!(matches!(outcome, Err(Error::Broadcast(_))));
    assert!(!engine.dispute(&id).unwrap().is_closed());
    assert_eq!(acks_of(&sent.borrow()), vec![false]);

    // no automatic retry is scheduled; a replay of the ruling re-triggers
    // resolution once the wallet recovers
    *fail.borrow_mut() = false;
    engine
        .on_dispute_ruled(ruled_message(id, result), 200_000)
        .unwrap();
    assert_eq!(broadcasts.borrow().len(), 1);
    assert!(engine.dispute(&id).unwrap().is_closed());
}

#[test]
fn ruling_ahead_of_the_dispute_gets_exactly_one_retry() {
    let transport = MockTransport::default();
    let wallet = MockWallet::default();
    let broadcasts = wallet.broadcasts.clone();
    let mut engine = buyer_engine(transport, wallet);

    let id = trade_id(0x06);
    let deposit = deposit_tx(&contract(id), 1_000_000);
    let result = ruling(id, &contract(id), &deposit, TradeParty::Buyer, false, 700_000, 290_000);
    let msg = ruled_message(id, result);
    let uid = msg.uid;

    // the ruling races ahead of the dispute opening
    engine.on_dispute_ruled(msg.clone(), 0).unwrap();
    assert!(engine.has_pending_retry(&uid));
    assert!(engine.dispute(&id).is_none());

    // the opening arrives before the retry fires
    let mut dispute = Dispute::new(id, contract(id), DisputeState::StartedByPeer);
    dispute.deposit_tx_serialized = Some(btc_encode::serialize(&deposit));
    engine.on_peer_opened_dispute(PeerOpenedDispute {
        trade_id: id,
        uid: Uuid::random(),
        sender: PeerId::new(vec![0xc0; 4]),
        dispute,
    });

    engine.poll(RESULT_RETRY_DELAY_MS - 1);
    assert_eq!(broadcasts.borrow().len(), 0);
    engine.poll(RESULT_RETRY_DELAY_MS);
    assert_eq!(broadcasts.borrow().len(), 1);
    assert!(engine.dispute(&id).unwrap().is_closed());
    assert!(!engine.has_pending_retry(&uid));
}

#[test]
fn spent_retry_uid_is_dropped_as_an_anomaly() {
    let transport = MockTransport::default();
    let wallet = MockWallet::default();
    let mut engine = buyer_engine(transport, wallet);

    let id = trade_id(0x07);
    let deposit = deposit_tx(&contract(id), 1_000_000);
    let result = ruling(id, &contract(id), &deposit, TradeParty::Buyer, false, 700_000, 290_000);
    let msg = ruled_message(id, result);
    let uid = msg.uid;

    engine.on_dispute_ruled(msg.clone(), 0).unwrap();
    assert!(engine.has_pending_retry(&uid));
    // a duplicate delivery while the retry is pending does not schedule
    // another one
    engine.on_dispute_ruled(msg.clone(), 500).unwrap();
    assert!(engine.has_pending_retry(&uid));

    // the retry fires into the void
    engine.poll(RESULT_RETRY_DELAY_MS);
    assert!(!engine.has_pending_retry(&uid));
    assert!(engine.dispute(&id).is_none());

    // and a replay after the spent retry is dropped
    engine.on_dispute_ruled(msg, 10_000).unwrap();
    assert!(!engine.has_pending_retry(&uid));
    assert!(engine.dispute(&id).is_none());
}

#[test]
fn arbitrator_rejects_its_own_ruling() {
    let (_, arbitrator_pk) = keys(0xa1);
    let transport = MockTransport::default();
    let wallet = MockWallet::default();
    let (buyer_sk, _) = keys(0xb1);
    let mut engine = SettlementEngine::new(
        transport,
        wallet,
        PeerId::new(vec![0xb0; 4]),
        buyer_sk,
        Some(arbitrator_pk),
    );

    let id = trade_id(0x08);
    let deposit = deposit_tx(&contract(id), 1_000_000);
    open_dispute_with_deposit(&mut engine, id, Some(&deposit));
    let result = ruling(id, &contract(id), &deposit, TradeParty::Buyer, false, 700_000, 290_000);
    let outcome = engine.on_dispute_ruled(ruled_message(id, result), 100_000);
    assert!(matches!(outcome, Err(Error::OwnRuling)));
    // the dispute was not touched
    assert!(engine.dispute(&id).unwrap().dispute_result.is_none());
}

#[test]
fn peer_payout_is_committed_and_acknowledged() {
    let transport = MockTransport::default();
    let wallet = MockWallet::default();
    let sent = transport.sent.clone();
    let committed = wallet.committed.clone();
    let mut engine = seller_engine(transport, wallet);

    let id = trade_id(0x09);
    let deposit = deposit_tx(&contract(id), 1_000_000);
    open_dispute_with_deposit(&mut engine, id, Some(&deposit));

    let payout = deposit_tx(&contract(id), 990_000);
    engine
        .on_payout_published(
            PayoutPublished {
                trade_id: id,
                uid: Uuid::random(),
                sender: PeerId::new(vec![0xb0; 4]),
                payout_tx: btc_encode::serialize(&payout),
            },
            100_000,
        )
        .unwrap();

    assert_eq!(committed.borrow().as_slice(), &[payout.txid()]);
    let dispute = engine.dispute(&id).unwrap();
    assert!(dispute.is_closed());
    assert_eq!(dispute.payout_tx_id, Some(payout.txid()));
    assert_eq!(acks_of(&sent.borrow()), vec![true]);
}

#[test]
fn malformed_peer_payout_fails_the_settlement_attempt() {
    let transport = MockTransport::default();
    let wallet = MockWallet::default();
    let sent = transport.sent.clone();
    let mut engine = seller_engine(transport, wallet);

    let id = trade_id(0x0a);
    let deposit = deposit_tx(&contract(id), 1_000_000);
    open_dispute_with_deposit(&mut engine, id, Some(&deposit));

    let outcome = engine.on_payout_published(
        PayoutPublished {
            trade_id: id,
            uid: Uuid::random(),
            sender: PeerId::new(vec![0xb0; 4]),
            payout_tx: vec![0x00, 0x01, 0x02],
        },
        100_000,
    );
    assert!(matches!(outcome, Err(Error::Escrow(_))));
    assert!(engine.dispute(&id).unwrap().is_closed());
    assert_eq!(acks_of(&sent.borrow()), vec![false]);
}
