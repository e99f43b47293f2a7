// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Host-held handles: a value kept alive across calls into the VM without
//! requiring the host to hold a temporary-roots guard for the whole time.
//!
//! A call handle additionally carries the stub closure `makeCallHandle`
//! synthesizes: a tiny prototype closure whose single instruction is a
//! `CALLK` against the requested method symbol, so `callHandle` can run it
//! exactly like any other bytecode call.

use core::ptr::NonNull;

use crate::object::closure::ClosureObj;
use crate::value::Value;

/// A value pinned against collection for as long as the host holds onto
/// it. Released explicitly via [`crate::vm::Vm::release_handle`].
pub struct Handle {
    pub value: Value,
    /// Present only for handles created by `makeCallHandle`.
    pub call_closure: Option<NonNull<ClosureObj>>,
}

impl Handle {
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self {
            value,
            call_closure: None,
        }
    }

    #[must_use]
    pub fn call_handle(value: Value, call_closure: NonNull<ClosureObj>) -> Self {
        Self {
            value,
            call_closure: Some(call_closure),
        }
    }
}
