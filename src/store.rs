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

//! Witness persistence. The durable layer is an append-only, content-hash
//! keyed map owned by an external collaborator; [`WitnessBook`] wraps it
//! together with the in-memory index behind a single repository so the
//! first-write-wins rule is enforced in exactly one place and the index never
//! diverges from disk.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::error;

use thiserror::Error;

use crate::witness::{SignedWitness, WitnessFingerprint};

/// Errors reported by the durable witness store.
#[derive(Error, Debug)]
pub enum Error {
    /// The backing storage failed to load or append.
    #[error("Storage backend error: {0}")]
    Backend(Box<dyn error::Error + Send + Sync>),
}

impl Error {
    /// Creates a new store error with an arbitrary payload. Useful to carry
    /// backend-specific errors.
    pub fn new<E>(error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self::Backend(error.into())
    }
}

/// The append-only durable store collaborator. Keys are witness fingerprints,
/// values the witness records minus the derived fingerprint, which is
/// recomputed on load and never trusted from disk. The first writer of a key
/// wins; appends of an existing key return `false` without touching the
/// stored value.
pub trait WitnessStore {
    /// Load every persisted witness record, once, at startup.
    fn load(&mut self) -> Result<Vec<SignedWitness>, Error>;

    /// Persist the record under its fingerprint unless the key is already
    /// present. Returns whether the record was appended.
    fn append_if_absent(
        &mut self,
        key: WitnessFingerprint,
        witness: &SignedWitness,
    ) -> Result<bool, Error>;
}

/// Volatile implementation of [`WitnessStore`] with the same first-write-wins
/// semantics, used in tests and for nodes running without persistence.
#[derive(Debug, Clone, Default)]
pub struct MemoryWitnessStore {
    map: HashMap<WitnessFingerprint, SignedWitness>,
}

impl MemoryWitnessStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl WitnessStore for MemoryWitnessStore {
    fn load(&mut self) -> Result<Vec<SignedWitness>, Error> {
        Ok(self.map.values().cloned().collect())
    }

    fn append_if_absent(
        &mut self,
        key: WitnessFingerprint,
        witness: &SignedWitness,
    ) -> Result<bool, Error> {
        match self.map.entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(e) => {
                e.insert(witness.clone());
                Ok(true)
            }
        }
    }
}

/// The witness repository: the in-memory index mirroring the durable store.
/// All reads go through the index, all writes go through
/// [`WitnessBook::insert_if_absent`] which applies the dedup rule to both
/// sides at once.
#[derive(Debug)]
pub struct WitnessBook<S: WitnessStore> {
    index: HashMap<WitnessFingerprint, SignedWitness>,
    store: S,
}

impl<S: WitnessStore> WitnessBook<S> {
    /// Open the repository, loading the persisted records into the index.
    pub fn open(mut store: S) -> Result<Self, Error> {
        let mut index = HashMap::new();
        for witness in store.load()? {
            // recomputed fingerprint, first record wins on collision
            index.entry(witness.fingerprint()).or_insert(witness);
        }
        Ok(Self { index, store })
    }

    /// Insert the record into the index and the durable store unless its
    /// fingerprint is already present. Returns whether the record was
    /// inserted.
    pub fn insert_if_absent(&mut self, witness: SignedWitness) -> Result<bool, Error> {
        match self.index.entry(witness.fingerprint()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(e) => {
                self.store.append_if_absent(witness.fingerprint(), &witness)?;
                e.insert(witness);
                Ok(true)
            }
        }
    }

    /// Whether a record with this fingerprint is known.
    pub fn contains(&self, fingerprint: &WitnessFingerprint) -> bool {
        self.index.contains_key(fingerprint)
    }

    /// Look up a record by its fingerprint.
    pub fn get(&self, fingerprint: &WitnessFingerprint) -> Option<&SignedWitness> {
        self.index.get(fingerprint)
    }

    /// Iterate over every known record.
    pub fn iter(&self) -> impl Iterator<Item = &SignedWitness> {
        self.index.values()
    }

    /// All records vouching for the given account age witness hash.
    pub fn for_account(&self, account_age_witness_hash: &[u8; 32]) -> Vec<&SignedWitness> {
        self.index
            .values()
            .filter(|w| &w.account_age_witness_hash() == account_age_witness_hash)
            .collect()
    }

    /// All records whose vouched account is owned by the given public key,
    /// i.e. the attestations received by that key.
    pub fn signed_over(&self, owner_pub_key: &[u8]) -> Vec<&SignedWitness> {
        self.index
            .values()
            .filter(|w| w.witness_owner_pub_key() == owner_pub_key)
            .collect()
    }

    /// Number of known records.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the repository holds no record.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
