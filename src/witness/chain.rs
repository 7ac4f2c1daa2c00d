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

//! Chain-of-trust walker over the witness attestation graph. Nodes are public
//! keys, a peer-signed witness is an edge from the vouched account to its
//! signer, and arbitrator-signed witnesses are the trust roots.
//!
//! The walk is a depth-first search with an explicit work stack, bounded
//! against cycles and adversarial graphs by an exclusion set with stack
//! discipline: the keys of a witness are excluded while the path through it is
//! explored and released on backtrack, so a key can still appear on a
//! different independent path. When the exclusion set reaches
//! [`EXCLUDED_KEYS_CAP`] entries the walk fails closed.

use log::warn;

use crate::crypto::SignatureVerifier;
use crate::store::{WitnessBook, WitnessStore};
use crate::witness::{AccountAgeWitness, SignedWitness, SIGNER_AGE_MS};

/// Upper bound on the exclusion set during one walk. Reaching the cap is
/// answered with "no valid signer found", not an error.
pub const EXCLUDED_KEYS_CAP: usize = 2000;

/// Outcome of evaluating one witness on the current path.
enum Step<'a> {
    /// An arbitrator attestation: the chain reaches a trust root.
    Root,
    /// The witness cannot extend the chain.
    Dead,
    /// A peer attestation: descend into the signer's own attestations. Holds
    /// the date parents are checked against and the parents to try.
    Descend(i64, Vec<&'a SignedWitness>),
}

struct Frame<'a> {
    child_date: i64,
    parents: Vec<&'a SignedWitness>,
    next: usize,
}

/// Verifier deciding whether an account carries an attestation chained back
/// to an arbitrator root, and whether the account is old enough to vouch for
/// others.
pub struct ChainOfTrust<'a, S: WitnessStore> {
    book: &'a WitnessBook<S>,
    verifier: &'a SignatureVerifier,
}

impl<'a, S: WitnessStore> ChainOfTrust<'a, S> {
    /// Create a verifier over the given repository and signature verifier.
    pub fn new(book: &'a WitnessBook<S>, verifier: &'a SignatureVerifier) -> Self {
        Self { book, verifier }
    }

    /// Whether the account carries a valid attestation at `now_ms`. The
    /// attestation merely needs to have been issued by now, so the evaluation
    /// date is projected forward by the signer age.
    pub fn has_valid_attestation(&self, account: &AccountAgeWitness, now_ms: i64) -> bool {
        self.valid_attestation_at(account, now_ms + SIGNER_AGE_MS)
    }

    /// Whether the account is itself allowed to vouch for other accounts at
    /// `now_ms`: its own attestation must have matured for the full signer
    /// age.
    pub fn is_eligible_signer(&self, account: &AccountAgeWitness, now_ms: i64) -> bool {
        self.valid_attestation_at(account, now_ms)
    }

    /// Whether any witness vouching for `account` chains back to an
    /// arbitrator root when evaluated at `at_time`, short-circuiting on the
    /// first success.
    pub fn valid_attestation_at(&self, account: &AccountAgeWitness, at_time: i64) -> bool {
        self.book
            .for_account(&account.hash())
            .into_iter()
            .any(|witness| self.reaches_trust_root(witness, at_time))
    }

    /// Evaluate one witness against the date of the attestation it supports.
    /// On descend, the signer and owner keys are pushed onto the exclusion
    /// set; the caller releases them on backtrack.
    fn step<'w>(
        &self,
        witness: &'w SignedWitness,
        child_date: i64,
        excluded: &mut Vec<Vec<u8>>,
    ) -> Step<'w>
    where
        'a: 'w,
    {
        if !self.verifier.verify(witness) {
            return Step::Dead;
        }
        // the signer must have been vouched for at least SIGNER_AGE before
        // the date it signed; applies to arbitrator roots as well so that
        // freshly signed accounts mature before they can vouch
        if witness.date() > child_date - SIGNER_AGE_MS {
            return Step::Dead;
        }
        if witness.is_signed_by_arbitrator() {
            return Step::Root;
        }
        if excluded.len() >= EXCLUDED_KEYS_CAP {
            warn!(
                "exclusion set reached {} keys while walking witness {:x}; failing closed",
                EXCLUDED_KEYS_CAP,
                witness.fingerprint()
            );
            return Step::Dead;
        }
        excluded.push(witness.signer_pub_key().to_vec());
        excluded.push(witness.witness_owner_pub_key().to_vec());
        let parents = self
            .book
            .signed_over(witness.signer_pub_key())
            .into_iter()
            .filter(|p| !excluded.iter().any(|k| k.as_slice() == p.signer_pub_key()))
            .collect();
        Step::Descend(witness.date(), parents)
    }

    /// Iterative depth-first search from `start`, evaluated against
    /// `at_time`. Never recurses natively, so adversarial graph depth cannot
    /// exhaust the call stack.
    fn reaches_trust_root(&self, start: &SignedWitness, at_time: i64) -> bool {
        let mut excluded: Vec<Vec<u8>> = Vec::new();
        let mut stack: Vec<Frame> = Vec::new();

        match self.step(start, at_time, &mut excluded) {
            Step::Root => return true,
            Step::Dead => return false,
            Step::Descend(child_date, parents) => stack.push(Frame {
                child_date,
                parents,
                next: 0,
            }),
        }

        loop {
            let candidate = match stack.last_mut() {
                None => return false,
                Some(frame) if frame.next < frame.parents.len() => {
                    let c = frame.parents[frame.next];
                    frame.next += 1;
                    Some((c, frame.child_date))
                }
                Some(_) => None,
            };
            match candidate {
                None => {
                    // parents exhausted: release this node's two keys
                    stack.pop();
                    excluded.truncate(excluded.len() - 2);
                }
                Some((witness, child_date)) => match self.step(witness, child_date, &mut excluded)
                {
                    Step::Root => return true,
                    Step::Dead => {}
                    Step::Descend(date, parents) => stack.push(Frame {
                        child_date: date,
                        parents,
                        next: 0,
                    }),
                },
            }
        }
    }
}
