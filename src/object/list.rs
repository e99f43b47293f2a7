// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Growable lists.

use crate::object::header::ObjHeader;
use crate::value::Value;

#[repr(C)]
pub struct ListObj {
    pub header: ObjHeader,
    pub elements: Vec<Value>,
}

impl ListObj {
    #[must_use]
    pub fn new(header: ObjHeader) -> Self {
        Self {
            header,
            elements: Vec::new(),
        }
    }

    /// Normalize a possibly-negative index (Wren indices count from the end
    /// with negative values) to an in-bounds `usize`, or `None`.
    #[must_use]
    pub fn resolve_index(&self, index: f64) -> Option<usize> {
        resolve_index(index, self.elements.len())
    }
}

/// Shared index-normalization logic for lists and the string byte/codepoint
/// indexing primitives: negative indices count from the end.
#[must_use]
pub fn resolve_index(index: f64, len: usize) -> Option<usize> {
    if index.fract() != 0.0 {
        return None;
    }
    let i = index as i64;
    let resolved = if i < 0 { i + len as i64 } else { i };
    if resolved < 0 || resolved as usize >= len {
        None
    } else {
        Some(resolved as usize)
    }
}
