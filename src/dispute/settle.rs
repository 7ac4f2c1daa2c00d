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

//! Dispute settlement engine: a message-driven state machine per trade that
//! applies the arbitrator's ruling, decides which party publishes the payout
//! transaction, signs and broadcasts it exactly once, and reconciles the
//! counterparty's outcome through acknowledgements.
//!
//! All transitions run on one logical dispatch context. Settlement messages
//! may arrive before the dispute they reference exists locally, because no
//! ordering holds across independent senders: such messages get exactly one
//! delayed retry, keyed by message uid, driven cooperatively through
//! [`SettlementEngine::poll`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use bitcoin::blockdata::transaction::Transaction;
use bitcoin::consensus::encode as btc_encode;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::Txid;
use log::{debug, error, warn};
use thiserror::Error;

use crate::dispute::{Contract, Dispute, DisputeResult, DisputeState, TradeId};
use crate::escrow::{self, EscrowWallet, PayoutTx};
use crate::messages::{
    DisputeMessage, DisputeRuled, OpenDispute, PayoutPublished, PeerOpenedDispute, SettlementAck,
};
use crate::transport::{MessageTransport, PeerId};
use crate::Uuid;

/// Delay before retrying a ruling that referenced a dispute not yet known
/// locally, in milliseconds. Absorbs the race where a ruling overtakes the
/// dispute opening message.
pub const RESULT_RETRY_DELAY_MS: i64 = 2_000;

/// Delay before retrying a payout notification that referenced a dispute not
/// yet known locally, in milliseconds.
pub const PAYOUT_RETRY_DELAY_MS: i64 = 3_000;

/// Errors encountered while settling a dispute.
#[derive(Error, Debug)]
pub enum Error {
    /// An arbitrator must never receive its own ruling back.
    #[error("The ruling was issued by the local arbitrator key")]
    OwnRuling,
    /// The local multisig key is not part of the contract's pubkey ring.
    #[error("The local multisig key is not part of the contract")]
    ForeignContract,
    /// The dispute has no deposit transaction to settle from.
    #[error("No deposit transaction recorded for trade {0}")]
    MissingDepositTx(TradeId),
    /// Building or validating the payout transaction failed.
    #[error("Escrow error: {0}")]
    Escrow(#[from] escrow::Error),
    /// The network refused the payout transaction.
    #[error("Broadcast error: {0}")]
    Broadcast(#[from] escrow::BroadcastError),
}

/// A settlement message parked until its dispute exists locally.
#[derive(Debug, Clone)]
enum PendingMessage {
    Ruled(DisputeRuled),
    Payout(PayoutPublished),
}

/// At most one scheduled retry per message uid. Once `spent`, a recurrence of
/// the uid is an anomaly and is dropped.
#[derive(Debug, Clone)]
struct RetryTicket {
    due_ms: i64,
    spent: bool,
    message: PendingMessage,
}

/// The settlement engine owning the dispute list of the local node.
pub struct SettlementEngine<T: MessageTransport, W: EscrowWallet> {
    transport: T,
    wallet: W,
    local_peer: PeerId,
    multisig_sk: SecretKey,
    multisig_pk: PublicKey,
    /// Set when the local node is an arbitrator, to detect rulings bounced
    /// back to their issuer.
    arbitrator_pub_key: Option<PublicKey>,
    disputes: HashMap<TradeId, Dispute>,
    retries: HashMap<Uuid, RetryTicket>,
}

impl<T: MessageTransport, W: EscrowWallet> SettlementEngine<T, W> {
    /// Create an engine for the local party identified by its network
    /// identity and its escrow multisig key.
    pub fn new(
        transport: T,
        wallet: W,
        local_peer: PeerId,
        multisig_sk: SecretKey,
        arbitrator_pub_key: Option<PublicKey>,
    ) -> Self {
        let multisig_pk = PublicKey::from_secret_key(&Secp256k1::new(), &multisig_sk);
        Self {
            transport,
            wallet,
            local_peer,
            multisig_sk,
            multisig_pk,
            arbitrator_pub_key,
            disputes: HashMap::new(),
            retries: HashMap::new(),
        }
    }

    /// The dispute for a trade, if any.
    pub fn dispute(&self, trade_id: &TradeId) -> Option<&Dispute> {
        self.disputes.get(trade_id)
    }

    /// Iterate over every dispute known to the engine.
    pub fn disputes(&self) -> impl Iterator<Item = &Dispute> {
        self.disputes.values()
    }

    /// Whether a retry is scheduled and not yet fired for the message uid.
    pub fn has_pending_retry(&self, uid: &Uuid) -> bool {
        self.retries.get(uid).map(|t| !t.spent).unwrap_or(false)
    }

    /// Open a dispute locally and notify the arbitrator with a snapshot of
    /// the record. Opening twice for the same trade is an idempotent no-op.
    pub fn open_dispute(&mut self, mut dispute: Dispute, arbitrator: &PeerId) {
        let trade_id = dispute.trade_id;
        if self.disputes.contains_key(&trade_id) {
            warn!("dispute for trade {} already exists; ignoring duplicate open", trade_id);
            return;
        }
        dispute.state = DisputeState::StartedLocally;
        let message = DisputeMessage::OpenDispute(OpenDispute {
            trade_id,
            uid: Uuid::random(),
            sender: self.local_peer.clone(),
            dispute: dispute.clone(),
        });
        self.disputes.insert(trade_id, dispute);
        match self.transport.send(arbitrator, message) {
            Ok(outcome) => debug!("dispute opening for trade {} delivered: {}", trade_id, outcome),
            Err(e) => warn!("failed to deliver dispute opening for trade {}: {}", trade_id, e),
        }
    }

    /// Record a dispute opened by the counterparty. A duplicate opening is
    /// absorbed; the message is acknowledged either way.
    pub fn on_peer_opened_dispute(&mut self, msg: PeerOpenedDispute) {
        if self.disputes.contains_key(&msg.trade_id) {
            warn!(
                "dispute for trade {} already exists; ignoring peer opening",
                msg.trade_id
            );
        } else {
            let mut dispute = msg.dispute.clone();
            dispute.state = DisputeState::StartedByPeer;
            self.disputes.insert(msg.trade_id, dispute);
            debug!("dispute opened by peer for trade {}", msg.trade_id);
        }
        Self::send_ack(
            &mut self.transport,
            &self.local_peer,
            &msg.sender,
            msg.trade_id,
            msg.uid,
            Ok(()),
        );
    }

    /// Apply an arbitrator ruling: record it, compute the publishing party,
    /// and when the local party is the publisher, sign and broadcast the
    /// payout transaction. The originator is acknowledged with the outcome in
    /// every branch.
    pub fn on_dispute_ruled(&mut self, msg: DisputeRuled, now_ms: i64) -> Result<(), Error> {
        if let Some(own) = &self.arbitrator_pub_key {
            if own == &msg.result.arbitrator_pub_key {
                error!(
                    "arbitrator received its own ruling back for trade {}; dropping",
                    msg.trade_id
                );
                return Err(Error::OwnRuling);
            }
        }
        if !self.disputes.contains_key(&msg.trade_id) {
            let uid = msg.uid;
            return self.defer(uid, PendingMessage::Ruled(msg), now_ms);
        }
        self.retries.remove(&msg.uid);

        let multisig_sk = self.multisig_sk;
        let trade_id = msg.trade_id;
        let dispute = match self.disputes.get_mut(&trade_id) {
            Some(d) => d,
            None => return Ok(()),
        };

        dispute.add_chat_message(msg.result.chat_message.clone());
        dispute.dispute_result = Some(msg.result.clone());
        dispute.state = DisputeState::ResultReceived;

        let publisher = msg.result.publisher();
        let local_party = match dispute.contract.party_of(&self.multisig_pk) {
            Some(party) => party,
            None => {
                error!(
                    "the local multisig key is not part of the contract for trade {}",
                    trade_id
                );
                Self::send_ack(
                    &mut self.transport,
                    &self.local_peer,
                    &msg.sender,
                    trade_id,
                    msg.uid,
                    Err("the contract does not reference the local party".into()),
                );
                return Err(Error::ForeignContract);
            }
        };

        let mut close_after_ack = true;
        let outcome: Result<(), Error> = if local_party == publisher {
            if let Some(bytes) = dispute.payout_tx_serialized.clone() {
                // the counterparty raced us to publication: reuse, notify,
                // do not sign again
                debug!(
                    "payout already recorded for trade {}; resending notification",
                    trade_id
                );
                let note = DisputeMessage::PayoutPublished(PayoutPublished {
                    trade_id,
                    uid: Uuid::random(),
                    sender: self.local_peer.clone(),
                    payout_tx: bytes,
                });
                let counterparty = dispute.contract.peer_of(local_party.other());
                if let Err(e) = self.transport.send(counterparty, note) {
                    warn!(
                        "failed to notify the peer of the payout for trade {}: {}",
                        trade_id, e
                    );
                }
                Ok(())
            } else if let Some(raw) = dispute.deposit_tx_serialized.clone() {
                match build_signed_payout(&dispute.contract, &raw, &msg.result, &multisig_sk) {
                    Err(e) => {
                        error!(
                            "payout construction failed for trade {}: {}; force-closing dispute",
                            trade_id, e
                        );
                        dispute.state = DisputeState::Closed;
                        close_after_ack = false;
                        Err(e)
                    }
                    Ok((tx, txid)) => match self.wallet.broadcast(&tx) {
                        Ok(_) => {
                            dispute.payout_tx_id = Some(txid);
                            dispute.payout_tx_serialized = Some(btc_encode::serialize(&tx));
                            dispute.state = DisputeState::PayoutPublished;
                            debug!("payout {} broadcast for trade {}", txid, trade_id);
                            let note = DisputeMessage::PayoutPublished(PayoutPublished {
                                trade_id,
                                uid: Uuid::random(),
                                sender: self.local_peer.clone(),
                                payout_tx: btc_encode::serialize(&tx),
                            });
                            let counterparty = dispute.contract.peer_of(local_party.other());
                            if let Err(e) = self.transport.send(counterparty, note) {
                                warn!(
                                    "failed to notify the peer of the payout for trade {}: {}",
                                    trade_id, e
                                );
                            }
                            Ok(())
                        }
                        Err(e) => {
                            // the dispute stays open; a replay of the ruling
                            // re-triggers resolution, no retry is scheduled
                            warn!(
                                "payout broadcast failed for trade {}: {}; dispute stays open",
                                trade_id, e
                            );
                            close_after_ack = false;
                            Err(Error::Broadcast(e))
                        }
                    },
                }
            } else {
                error!(
                    "no deposit transaction recorded for trade {}; force-closing dispute",
                    trade_id
                );
                dispute.state = DisputeState::Closed;
                close_after_ack = false;
                Err(Error::MissingDepositTx(trade_id))
            }
        } else {
            // the counterparty publishes; nothing to broadcast here, stale
            // trade bookkeeping is reconciled by the caller on closing
            debug!(
                "the {} publishes the payout for trade {}; awaiting its notification",
                publisher, trade_id
            );
            Ok(())
        };

        Self::send_ack(
            &mut self.transport,
            &self.local_peer,
            &msg.sender,
            trade_id,
            msg.uid,
            match &outcome {
                Ok(()) => Ok(()),
                Err(e) => Err(e.to_string()),
            },
        );
        if close_after_ack {
            if let Some(d) = self.disputes.get_mut(&trade_id) {
                d.state = DisputeState::Closed;
            }
        }
        outcome
    }

    /// Record the payout transaction published by the counterparty: commit
    /// it to the wallet view, store its identifier, close the dispute and
    /// acknowledge.
    pub fn on_payout_published(&mut self, msg: PayoutPublished, now_ms: i64) -> Result<(), Error> {
        if !self.disputes.contains_key(&msg.trade_id) {
            let uid = msg.uid;
            return self.defer(uid, PendingMessage::Payout(msg), now_ms);
        }
        self.retries.remove(&msg.uid);

        let trade_id = msg.trade_id;
        let dispute = match self.disputes.get_mut(&trade_id) {
            Some(d) => d,
            None => return Ok(()),
        };

        let outcome: Result<(), Error> = match btc_encode::deserialize::<Transaction>(&msg.payout_tx)
        {
            Ok(tx) => {
                self.wallet.commit(&tx);
                dispute.payout_tx_id = Some(tx.txid());
                dispute.payout_tx_serialized = Some(msg.payout_tx.clone());
                dispute.state = DisputeState::PayoutReceivedFromPeer;
                debug!("recorded peer payout {} for trade {}", tx.txid(), trade_id);
                Ok(())
            }
            Err(e) => {
                error!(
                    "malformed payout transaction for trade {}: {}; force-closing dispute",
                    trade_id, e
                );
                dispute.state = DisputeState::Closed;
                Err(Error::Escrow(escrow::Error::Encoding(e)))
            }
        };

        Self::send_ack(
            &mut self.transport,
            &self.local_peer,
            &msg.sender,
            trade_id,
            msg.uid,
            match &outcome {
                Ok(()) => Ok(()),
                Err(e) => Err(e.to_string()),
            },
        );
        if outcome.is_ok() {
            if let Some(d) = self.disputes.get_mut(&trade_id) {
                d.state = DisputeState::Closed;
            }
        }
        outcome
    }

    /// Drive the cooperative retry timer. Due tickets are spent and their
    /// message re-enters the matching handler; a message that still finds no
    /// dispute is dropped there as an anomaly.
    pub fn poll(&mut self, now_ms: i64) {
        let due: Vec<Uuid> = self
            .retries
            .iter()
            .filter(|(_, t)| !t.spent && t.due_ms <= now_ms)
            .map(|(uid, _)| *uid)
            .collect();
        for uid in due {
            let message = match self.retries.get_mut(&uid) {
                Some(ticket) => {
                    ticket.spent = true;
                    ticket.message.clone()
                }
                None => continue,
            };
            debug!("retrying deferred settlement message {}", uid);
            let _ = match message {
                PendingMessage::Ruled(m) => self.on_dispute_ruled(m, now_ms),
                PendingMessage::Payout(m) => self.on_payout_published(m, now_ms),
            };
        }
    }

    /// Park a message whose dispute is unknown. The first occurrence of a uid
    /// schedules exactly one retry; any further occurrence is dropped.
    fn defer(&mut self, uid: Uuid, message: PendingMessage, now_ms: i64) -> Result<(), Error> {
        let delay_ms = match &message {
            PendingMessage::Ruled(_) => RESULT_RETRY_DELAY_MS,
            PendingMessage::Payout(_) => PAYOUT_RETRY_DELAY_MS,
        };
        match self.retries.entry(uid) {
            Entry::Vacant(e) => {
                debug!("no dispute yet for message {}; retrying in {} ms", uid, delay_ms);
                e.insert(RetryTicket {
                    due_ms: now_ms + delay_ms,
                    spent: false,
                    message,
                });
            }
            Entry::Occupied(e) => {
                if e.get().spent {
                    warn!(
                        "message {} still references an unknown dispute after its retry; dropping",
                        uid
                    );
                } else {
                    warn!("message {} already has a pending retry; dropping duplicate", uid);
                }
            }
        }
        Ok(())
    }

    fn send_ack(
        transport: &mut T,
        local_peer: &PeerId,
        to: &PeerId,
        trade_id: TradeId,
        source_uid: Uuid,
        outcome: Result<(), String>,
    ) {
        let ack = SettlementAck {
            trade_id,
            uid: Uuid::random(),
            source_uid,
            sender: local_peer.clone(),
            success: outcome.is_ok(),
            error: outcome.err(),
        };
        if let Err(e) = transport.send(to, DisputeMessage::SettlementAck(ack)) {
            warn!("failed to deliver settlement ack for trade {}: {}", trade_id, e);
        }
    }
}

/// Decode the deposit, rebuild the canonical payout, validate the
/// arbitrator's signature, add the local party's signature, and assemble the
/// broadcastable transaction.
fn build_signed_payout(
    contract: &Contract,
    deposit_raw: &[u8],
    result: &DisputeResult,
    multisig_sk: &SecretKey,
) -> Result<(Transaction, Txid), Error> {
    let deposit: Transaction =
        btc_encode::deserialize(deposit_raw).map_err(escrow::Error::from)?;
    let payout = PayoutTx::build(
        contract,
        &deposit,
        result.buyer_payout_amount,
        result.seller_payout_amount,
    )?;
    let arbitrator_sig =
        Signature::from_compact(&result.arbitrator_signature).map_err(escrow::Error::from)?;
    payout.verify_signature(&result.arbitrator_pub_key, &arbitrator_sig)?;
    let party_sig = payout.sign(multisig_sk)?;
    let txid = payout.txid();
    Ok((payout.finalize(&arbitrator_sig, &party_sig), txid))
}
