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

//! Witness service orchestrating the creation, publication, and querying of
//! signed witness records on top of the repository and the chain-of-trust
//! verifier.
//!
//! Double-signing attempts and replays are absorbed as idempotent no-ops with
//! a warning, never rejected with an error: the publish path must stay
//! replay-safe under message duplication.

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::Amount;
use log::{debug, info, warn};

use crate::crypto::{self, SignatureVerifier};
use crate::store::{self, WitnessBook, WitnessStore};
use crate::transport::WitnessBroadcaster;
use crate::witness::chain::ChainOfTrust;
use crate::witness::{
    AccountAgeWitness, SignedWitness, VerificationMethod, MIN_SIGNING_TRADE_AMOUNT_SAT,
};

/// Delay between bootstrap completion and the arbitrator's re-broadcast of
/// all held witnesses, in milliseconds. A liveness aid so new and returning
/// peers receive arbitrator attestations without waiting for the original
/// signer.
pub const REPUBLISH_DELAY_MS: i64 = 60_000;

/// Service publishing, deduplicating and querying signed witness records.
pub struct WitnessService<S: WitnessStore, B: WitnessBroadcaster> {
    book: WitnessBook<S>,
    verifier: SignatureVerifier,
    broadcaster: B,
    /// The local peer's Ed25519 trade signing key.
    trade_key: ed25519_dalek::SigningKey,
    /// Whether the local peer is a registered arbitrator.
    registered_arbitrator: bool,
    republish_due_ms: Option<i64>,
}

impl<S: WitnessStore, B: WitnessBroadcaster> WitnessService<S, B> {
    /// Create the service over an opened repository.
    pub fn new(
        book: WitnessBook<S>,
        verifier: SignatureVerifier,
        broadcaster: B,
        trade_key: ed25519_dalek::SigningKey,
        registered_arbitrator: bool,
    ) -> Self {
        Self {
            book,
            verifier,
            broadcaster,
            trade_key,
            registered_arbitrator,
            republish_due_ms: None,
        }
    }

    /// The witness repository.
    pub fn book(&self) -> &WitnessBook<S> {
        &self.book
    }

    /// A chain-of-trust verifier over the current repository state.
    pub fn chain(&self) -> ChainOfTrust<'_, S> {
        ChainOfTrust::new(&self.book, &self.verifier)
    }

    /// Vouch for an account as an arbitrator: sign the hex-encoded account
    /// hash with the arbitrator EC key and publish the record. A no-op with a
    /// warning when an attestation for that account already exists.
    pub fn sign_as_arbitrator(
        &mut self,
        trade_amount: Amount,
        account: &AccountAgeWitness,
        arbitrator_key: &SecretKey,
        peer_pub_key: &[u8],
        now_ms: i64,
    ) -> Result<(), store::Error> {
        if !self.book.for_account(&account.hash()).is_empty() {
            warn!(
                "account {} is already vouched for; skipping arbitrator signing",
                hex::encode(account.hash())
            );
            return Ok(());
        }
        let signer_pub_key = PublicKey::from_secret_key(&Secp256k1::new(), arbitrator_key)
            .serialize()
            .to_vec();
        let witness = SignedWitness::new(
            VerificationMethod::Arbitrator,
            account.hash(),
            crypto::arbitrator_sign(arbitrator_key, &account.hash()),
            signer_pub_key,
            peer_pub_key.to_vec(),
            now_ms,
            trade_amount,
        );
        self.publish(witness)
    }

    /// Vouch for a trade peer's account after a qualifying trade: sign the
    /// raw account hash with the local Ed25519 trade key and publish the
    /// record. A no-op with a warning when an attestation already exists or
    /// when the trade amount is below the minimum stake.
    pub fn sign_as_trader(
        &mut self,
        trade_amount: Amount,
        account: &AccountAgeWitness,
        peer_pub_key: &[u8],
        now_ms: i64,
    ) -> Result<(), store::Error> {
        if !self.book.for_account(&account.hash()).is_empty() {
            warn!(
                "account {} is already vouched for; skipping peer signing",
                hex::encode(account.hash())
            );
            return Ok(());
        }
        if trade_amount.as_sat() < MIN_SIGNING_TRADE_AMOUNT_SAT {
            warn!(
                "trade amount {} sat is below the {} sat signing minimum; not signing",
                trade_amount.as_sat(),
                MIN_SIGNING_TRADE_AMOUNT_SAT
            );
            return Ok(());
        }
        let witness = SignedWitness::new(
            VerificationMethod::Trade,
            account.hash(),
            crypto::trader_sign(&self.trade_key, &account.hash()),
            self.trade_key.verifying_key().to_bytes().to_vec(),
            peer_pub_key.to_vec(),
            now_ms,
            trade_amount,
        );
        self.publish(witness)
    }

    /// Store and broadcast a witness record. The record is only handed to the
    /// network when its fingerprint was not already known locally, avoiding
    /// redundant traffic for records the store would reject anyway.
    pub fn publish(&mut self, witness: SignedWitness) -> Result<(), store::Error> {
        let fingerprint = witness.fingerprint();
        if self.book.insert_if_absent(witness.clone())? {
            if let Err(e) = self.broadcaster.broadcast_witness(&witness) {
                warn!("failed to broadcast witness {:x}: {}", fingerprint, e);
            }
        } else {
            debug!("witness {:x} already known; not re-broadcasting", fingerprint);
        }
        Ok(())
    }

    /// Record a witness received from the network, deduplicated by
    /// fingerprint exactly like the durable store. Returns whether the record
    /// was new.
    pub fn add_from_network(&mut self, witness: SignedWitness) -> Result<bool, store::Error> {
        self.book.insert_if_absent(witness)
    }

    /// Signing dates of every witness for the account whose signature
    /// verifies, ascending.
    pub fn verified_witness_dates(&self, account: &AccountAgeWitness) -> Vec<i64> {
        let mut dates: Vec<i64> = self
            .book
            .for_account(&account.hash())
            .into_iter()
            .filter(|w| self.verifier.verify(w))
            .map(|w| w.date())
            .collect();
        dates.sort_unstable();
        dates
    }

    /// Signing dates of every witness for the account, unverified, ascending.
    /// Only for uses where self-deception has no security implication.
    pub fn unverified_witness_dates(&self, account: &AccountAgeWitness) -> Vec<i64> {
        let mut dates: Vec<i64> = self
            .book
            .for_account(&account.hash())
            .into_iter()
            .map(|w| w.date())
            .collect();
        dates.sort_unstable();
        dates
    }

    /// Whether the account carries an arbitrator attestation with a valid
    /// signature.
    pub fn is_signed_by_arbitrator(&self, account: &AccountAgeWitness) -> bool {
        self.book
            .for_account(&account.hash())
            .into_iter()
            .any(|w| w.is_signed_by_arbitrator() && self.verifier.verify(w))
    }

    /// Notify the service that the initial network bootstrap completed. A
    /// registered arbitrator schedules a re-broadcast of all held witnesses
    /// after a fixed delay.
    pub fn on_bootstrap_complete(&mut self, now_ms: i64) {
        if self.registered_arbitrator {
            debug!(
                "arbitrator node bootstrapped; re-broadcasting witnesses in {} ms",
                REPUBLISH_DELAY_MS
            );
            self.republish_due_ms = Some(now_ms + REPUBLISH_DELAY_MS);
        }
    }

    /// Drive the cooperative timer. Called from the dispatch context; fires
    /// the pending re-broadcast when due.
    pub fn poll(&mut self, now_ms: i64) {
        let due = match self.republish_due_ms {
            Some(due) if due <= now_ms => due,
            _ => return,
        };
        self.republish_due_ms = None;
        let mut sent = 0usize;
        for witness in self.book.iter() {
            match self.broadcaster.broadcast_witness(witness) {
                Ok(()) => sent += 1,
                Err(e) => warn!(
                    "failed to re-broadcast witness {:x}: {}",
                    witness.fingerprint(),
                    e
                ),
            }
        }
        info!("re-broadcast {} witnesses (due at {} ms)", sent, due);
    }
}
