// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Undo-logged maps.
//!
//! Every write records the previous value of the key. `commit` forgets the
//! log, `rollback` replays it backwards. This gives record processing
//! all-or-nothing semantics without copying the whole state.

use std::collections::BTreeMap;
use std::ops::RangeBounds;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone)]
pub struct TxMap<K: Ord + Clone, V: Clone> {
    map: BTreeMap<K, V>,
    undo: Vec<(K, Option<V>)>,
}

impl<K: Ord + Clone, V: Clone> Default for TxMap<K, V> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
            undo: Vec::new(),
        }
    }
}

impl<K: Ord + Clone, V: Clone> TxMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let previous = self.map.get(key)?.clone();
        self.undo.push((key.clone(), Some(previous)));
        self.map.get_mut(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let previous = self.map.insert(key.clone(), value);
        self.undo.push((key, previous.clone()));
        previous
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let previous = self.map.remove(key)?;
        self.undo.push((key.clone(), Some(previous.clone())));
        Some(previous)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.map.values()
    }

    pub fn range<R: RangeBounds<K>>(&self, range: R) -> impl Iterator<Item = (&K, &V)> {
        self.map.range(range)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn commit(&mut self) {
        self.undo.clear();
    }

    pub fn rollback(&mut self) {
        while let Some((key, previous)) = self.undo.pop() {
            match previous {
                Some(value) => {
                    self.map.insert(key, value);
                }
                None => {
                    self.map.remove(&key);
                }
            }
        }
    }
}

impl<K, V> Serialize for TxMap<K, V>
where
    K: Ord + Clone + Serialize,
    V: Clone + Serialize,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.map.serialize(serializer)
    }
}

impl<'de, K, V> Deserialize<'de> for TxMap<K, V>
where
    K: Ord + Clone + Deserialize<'de>,
    V: Clone + Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self {
            map: BTreeMap::deserialize(deserializer)?,
            undo: Vec::new(),
        })
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq> PartialEq for TxMap<K, V> {
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}

/// A journaled set.
pub type TxSet<K> = TxMap<K, ()>;

impl<K: Ord + Clone> TxMap<K, ()> {
    pub fn add(&mut self, key: K) {
        if !self.contains_key(&key) {
            self.insert(key, ());
        }
    }
}

/// A journaled scalar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxCell<T: Clone> {
    value: T,
    #[serde(skip)]
    saved: Option<T>,
}

impl<T: Clone> TxCell<T> {
    pub fn new(value: T) -> Self {
        Self { value, saved: None }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn set(&mut self, value: T) {
        if self.saved.is_none() {
            self.saved = Some(self.value.clone());
        }
        self.value = value;
    }

    pub fn commit(&mut self) {
        self.saved = None;
    }

    pub fn rollback(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.value = saved;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_restores_every_write() {
        let mut map: TxMap<i64, String> = TxMap::new();
        map.insert(1, "one".into());
        map.insert(2, "two".into());
        map.commit();

        map.insert(3, "three".into());
        map.remove(&1);
        if let Some(v) = map.get_mut(&2) {
            v.push_str("!!");
        }
        map.insert(2, "replaced".into());
        map.rollback();

        let entries: Vec<_> = map.iter().map(|(k, v)| (*k, v.clone())).collect();
        assert_eq!(entries, vec![(1, "one".to_string()), (2, "two".to_string())]);
    }

    #[test]
    fn test_commit_keeps_writes() {
        let mut map: TxSet<(i64, u32)> = TxMap::new();
        map.add((1, 2));
        map.add((1, 2));
        map.commit();
        map.rollback();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_cell() {
        let mut cell = TxCell::new(5i64);
        cell.set(6);
        cell.set(7);
        cell.rollback();
        assert_eq!(*cell.get(), 5);
        cell.set(8);
        cell.commit();
        cell.rollback();
        assert_eq!(*cell.get(), 8);
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let mut map: TxMap<i64, i64> = TxMap::new();
        map.insert(1, 10);
        let a = bincode::serde::encode_to_vec(&map, bincode::config::standard()).unwrap();
        let mut plain = BTreeMap::new();
        plain.insert(1i64, 10i64);
        let b = bincode::serde::encode_to_vec(&plain, bincode::config::standard()).unwrap();
        assert_eq!(a, b);
    }
}
