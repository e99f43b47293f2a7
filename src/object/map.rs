// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Open-addressed hash maps.
//!
//! Slot state is encoded in the entry itself rather than a separate tag:
//! `key == Undefined && value == Bool(false)` is an empty slot, `key ==
//! Undefined && value == Bool(true)` is a tombstone left behind by a
//! removal, anything else is a live entry. Probing is linear with the
//! table capacity always a power of two, masked rather than modulo'd.
//!
//! The table grows whenever `count + 1` would exceed 75% load and shrinks
//! back down (never below a capacity of 16, unless it empties out entirely)
//! once usage drops under half of that threshold, so a map that fills up
//! and drains again doesn't keep an oversized table alive forever.

use crate::hashing::{hash_value, validate_key, values_equal};
use crate::object::header::ObjHeader;
use crate::value::Value;

const MIN_CAPACITY: usize = 16;
const LOAD_FACTOR_PERCENT: usize = 75;

#[derive(Clone, Copy)]
struct Entry {
    key: Value,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Self {
            key: Value::Undefined,
            value: Value::Bool(false),
        }
    }

    fn tombstone() -> Self {
        Self {
            key: Value::Undefined,
            value: Value::Bool(true),
        }
    }

    fn is_empty(&self) -> bool {
        self.key.is_undefined() && matches!(self.value, Value::Bool(false))
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_undefined() && matches!(self.value, Value::Bool(true))
    }
}

#[repr(C)]
pub struct MapObj {
    pub header: ObjHeader,
    entries: Vec<Entry>,
    /// Live entries, not counting tombstones.
    count: usize,
}

/// A map key failed [`validate_key`]: a mutable container (list, map,
/// instance, ...) was used where an immutable key is required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidKey;

impl MapObj {
    #[must_use]
    pub fn new(header: ObjHeader) -> Self {
        Self {
            header,
            entries: Vec::new(),
            count: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[must_use]
    pub fn get(&self, key: &Value) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = self.find_slot(key)?;
        let entry = self.entries[index];
        if entry.is_empty() || entry.is_tombstone() {
            None
        } else {
            Some(entry.value)
        }
    }

    #[must_use]
    pub fn contains_key(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    /// Insert or overwrite `key`. Returns the previous value, if any.
    ///
    /// # Errors
    /// Returns [`InvalidKey`] if `key` is not one of the accepted immutable
    /// key types.
    pub fn insert(&mut self, key: Value, value: Value) -> Result<Option<Value>, InvalidKey> {
        if !validate_key(&key) {
            return Err(InvalidKey);
        }
        if (self.count + 1) * 100 > self.entries.len() * LOAD_FACTOR_PERCENT {
            self.grow();
        }
        let index = self
            .find_slot(&key)
            .expect("table just grown to have room");
        let existing = self.entries[index];
        let previous = if existing.is_empty() || existing.is_tombstone() {
            self.count += 1;
            None
        } else {
            Some(existing.value)
        };
        self.entries[index] = Entry { key, value };
        Ok(previous)
    }

    /// Remove `key`, returning its value if present.
    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        let index = self.find_slot(key)?;
        let entry = self.entries[index];
        if entry.is_empty() || entry.is_tombstone() {
            return None;
        }
        self.entries[index] = Entry::tombstone();
        self.count -= 1;
        self.maybe_shrink();
        Some(entry.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.count = 0;
    }

    /// Find the slot a live `key` occupies, or the first empty/tombstone
    /// slot on its probe sequence if absent. `None` only when the table has
    /// no backing storage at all.
    fn find_slot(&self, key: &Value) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = (hash_value(key) as usize) & mask;
        let mut first_tombstone = None;
        loop {
            let entry = &self.entries[index];
            if entry.is_empty() {
                return Some(first_tombstone.unwrap_or(index));
            } else if entry.is_tombstone() {
                if first_tombstone.is_none() {
                    first_tombstone = Some(index);
                }
            } else if values_equal(&entry.key, key) {
                return Some(index);
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = (self.entries.len() * 2).max(MIN_CAPACITY);
        self.rehash(new_capacity);
    }

    fn maybe_shrink(&mut self) {
        if self.count == 0 {
            self.entries = Vec::new();
            return;
        }
        let capacity = self.entries.len();
        if capacity <= MIN_CAPACITY {
            return;
        }
        if self.count * 100 * 2 < capacity * LOAD_FACTOR_PERCENT {
            self.rehash((capacity / 2).max(MIN_CAPACITY));
        }
    }

    fn rehash(&mut self, new_capacity: usize) {
        let old_entries = core::mem::replace(&mut self.entries, vec![Entry::empty(); new_capacity]);
        for entry in old_entries {
            if entry.is_empty() || entry.is_tombstone() {
                continue;
            }
            let mask = new_capacity - 1;
            let mut index = (hash_value(&entry.key) as usize) & mask;
            while !self.entries[index].is_empty() {
                index = (index + 1) & mask;
            }
            self.entries[index] = entry;
        }
    }

    /// Iterate live `(key, value)` pairs in slot order, matching the cursor
    /// semantics `Map.iterate`/`keyIteratorValue_` rely on: the cursor is
    /// simply the next slot index to examine.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries
            .iter()
            .filter(|e| !e.is_empty() && !e.is_tombstone())
            .map(|e| (e.key, e.value))
    }

    /// Advance an iteration cursor (as returned by a previous call, or `0`
    /// to start) to the next live slot, returning `None` once exhausted.
    #[must_use]
    pub fn next_cursor(&self, from: usize) -> Option<usize> {
        let mut index = from;
        while index < self.entries.len() {
            let entry = &self.entries[index];
            if !entry.is_empty() && !entry.is_tombstone() {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    #[must_use]
    pub fn entry_at(&self, cursor: usize) -> Option<(Value, Value)> {
        self.entries
            .get(cursor)
            .filter(|e| !e.is_empty() && !e.is_tombstone())
            .map(|e| (e.key, e.value))
    }
}
