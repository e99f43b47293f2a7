// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! First-class snapshots of a single map slot, produced by map iteration.
//!
//! `Map.iterate` hands back an opaque cursor (the slot index); reading the
//! current entry via `Map.keyIteratorValue_`/`valueIteratorValue_` allocates
//! one of these rather than exposing the slot index directly, so the pair
//! stays valid even if the caller stashes it past the next mutation.

use crate::object::header::ObjHeader;
use crate::value::Value;

#[repr(C)]
pub struct MapEntryObj {
    pub header: ObjHeader,
    pub key: Value,
    pub value: Value,
}

impl MapEntryObj {
    #[must_use]
    pub fn new(header: ObjHeader, key: Value, value: Value) -> Self {
        Self { header, key, value }
    }
}
