// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Upvalues: storage for a variable captured by one or more closures.

use core::ptr::NonNull;

use crate::object::header::ObjHeader;
use crate::value::Value;

/// Where an upvalue's value currently lives.
pub enum UpvalueState {
    /// Open: the upvalue aliases a live slot on its owning fiber's stack.
    Open(NonNull<Value>),
    /// Closed: the upvalue owns the value directly.
    Closed(Value),
}

/// An upvalue, open or closed.
///
/// Open upvalues are threaded through their owning fiber's `open_upvalues`
/// list in descending stack-address order, which gives O(1) lookup for the
/// common case of capturing the most recently pushed slot and O(k) in the
/// worst case of reusing an older slot.
#[repr(C)]
pub struct UpvalueObj {
    pub header: ObjHeader,
    pub state: UpvalueState,
    /// Intrusive link to the next-older open upvalue on the same fiber.
    pub next_open: Option<NonNull<UpvalueObj>>,
}

impl UpvalueObj {
    #[must_use]
    pub fn get(&self) -> Value {
        match &self.state {
            UpvalueState::Open(slot) => unsafe { *slot.as_ref() },
            UpvalueState::Closed(v) => *v,
        }
    }

    pub fn set(&mut self, value: Value) {
        match &mut self.state {
            UpvalueState::Open(slot) => unsafe { *slot.as_mut() = value },
            UpvalueState::Closed(v) => *v = value,
        }
    }

    /// The stack slot this upvalue currently aliases, if still open.
    #[must_use]
    pub fn open_slot(&self) -> Option<NonNull<Value>> {
        match self.state {
            UpvalueState::Open(slot) => Some(slot),
            UpvalueState::Closed(_) => None,
        }
    }

    /// Close the upvalue: copy the referent into inline storage and stop
    /// aliasing the stack.
    pub fn close(&mut self) {
        if let UpvalueState::Open(slot) = self.state {
            let value = unsafe { *slot.as_ref() };
            self.state = UpvalueState::Closed(value);
        }
    }
}
