// Copyright 2021-2022 Farcaster Devs
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

//! Append-only witness map with a bounded lookup cache in front of it.
//!
//! The map may hold tens of thousands of witnesses while only the few backing open offers are
//! looked up repeatedly. Lookups go to the cache first, a hit in the map is promoted into the
//! cache. Map and cache share one lock so check-then-insert sequences are atomic.

use std::collections::{HashMap, VecDeque};

use parking_lot::{Mutex, MutexGuard};

use super::{AccountAgeWitness, WitnessHash};

#[derive(Debug)]
pub struct Witnesses {
    map: HashMap<WitnessHash, AccountAgeWitness>,
    cache: HashMap<WitnessHash, AccountAgeWitness>,
    // insertion order of the cache, oldest first
    order: VecDeque<WitnessHash>,
    capacity: usize,
}

impl Witnesses {
    pub fn get(&mut self, hash: &WitnessHash) -> Option<AccountAgeWitness> {
        if let Some(witness) = self.cache.get(hash) {
            return Some(*witness);
        }
        let witness = *self.map.get(hash)?;
        self.promote(witness);
        Some(witness)
    }

    pub fn is_cached(&self, hash: &WitnessHash) -> bool {
        self.cache.contains_key(hash)
    }

    pub fn contains(&self, hash: &WitnessHash) -> bool {
        self.cache.contains_key(hash) || self.map.contains_key(hash)
    }

    /// Insert unless a witness with the same hash exists. Returns `true` if inserted.
    pub fn insert(&mut self, witness: AccountAgeWitness) -> bool {
        if self.map.contains_key(&witness.hash) {
            return false;
        }
        self.map.insert(witness.hash, witness);
        true
    }

    /// Drop a witness from the map and the cache.
    pub fn remove(&mut self, hash: &WitnessHash) -> Option<AccountAgeWitness> {
        if self.cache.remove(hash).is_some() {
            self.order.retain(|h| h != hash);
        }
        self.map.remove(hash)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn all(&self) -> Vec<AccountAgeWitness> {
        self.map.values().copied().collect()
    }

    fn promote(&mut self, witness: AccountAgeWitness) {
        while self.cache.len() >= self.capacity {
            match self.order.pop_front() {
                Some(evicted) => {
                    self.cache.remove(&evicted);
                }
                None => break,
            }
        }
        self.cache.insert(witness.hash, witness);
        self.order.push_back(witness.hash);
    }
}

/// Thread safe witness store.
#[derive(Debug)]
pub struct WitnessStore {
    inner: Mutex<Witnesses>,
}

impl WitnessStore {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Witnesses {
                map: HashMap::new(),
                cache: HashMap::new(),
                order: VecDeque::new(),
                capacity: cache_capacity.max(1),
            }),
        }
    }

    pub fn get(&self, hash: &WitnessHash) -> Option<AccountAgeWitness> {
        self.inner.lock().get(hash)
    }

    pub fn contains(&self, hash: &WitnessHash) -> bool {
        self.inner.lock().contains(hash)
    }

    /// First writer wins: a witness already stored under the same hash is kept.
    pub fn put_if_absent(&self, witness: AccountAgeWitness) -> bool {
        self.inner.lock().insert(witness)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn all(&self) -> Vec<AccountAgeWitness> {
        self.inner.lock().all()
    }

    /// Hold the store lock across a compound operation.
    pub fn lock(&self) -> MutexGuard<'_, Witnesses> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn witness(byte: u8, date: i64) -> AccountAgeWitness {
        AccountAgeWitness::new(WitnessHash::from([byte; 20]), date)
    }

    #[test]
    fn first_writer_wins() {
        let store = WitnessStore::new(4);
        assert!(store.put_if_absent(witness(1, 100)));
        assert!(!store.put_if_absent(witness(1, 200)));
        assert_eq!(store.get(&WitnessHash::from([1; 20])).unwrap().date, 100);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn lookups_are_promoted_and_cache_is_bounded() {
        let store = WitnessStore::new(2);
        for i in 1..=3 {
            store.put_if_absent(witness(i, i as i64));
        }
        let mut inner = store.lock();
        assert!(!inner.is_cached(&WitnessHash::from([1; 20])));
        inner.get(&WitnessHash::from([1; 20]));
        inner.get(&WitnessHash::from([2; 20]));
        inner.get(&WitnessHash::from([3; 20]));
        assert!(!inner.is_cached(&WitnessHash::from([1; 20])));
        assert!(inner.is_cached(&WitnessHash::from([3; 20])));
        // evicted from the cache, still in the map
        assert!(inner.contains(&WitnessHash::from([1; 20])));
    }

    #[test]
    fn removed_witness_leaves_map_and_cache() {
        let store = WitnessStore::new(2);
        store.put_if_absent(witness(1, 100));
        let hash = WitnessHash::from([1; 20]);
        let mut inner = store.lock();
        inner.get(&hash);
        assert!(inner.is_cached(&hash));
        assert_eq!(inner.remove(&hash).map(|w| w.date), Some(100));
        assert!(!inner.contains(&hash));
        assert!(inner.remove(&hash).is_none());
        // the hash can be stored again
        assert!(inner.insert(witness(1, 200)));
    }

    #[test]
    fn unknown_hash() {
        let store = WitnessStore::new(2);
        assert!(store.get(&WitnessHash::zero()).is_none());
        assert!(store.is_empty());
    }
}
