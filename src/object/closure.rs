// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Closures: a function prototype plus captured state.
//!
//! Two flavors share this struct. A *prototype closure* is produced by the
//! (external) compiler and stored in a function's constant table; it
//! carries [`CompilerUpvalue`] descriptors describing how to capture each
//! upvalue. The `CLOSURE` opcode reads a prototype closure and, by walking
//! its descriptors, materializes a *runtime closure* that instead owns real
//! [`UpvalueObj`] pointers.

use core::ptr::NonNull;

use crate::object::header::ObjHeader;
use crate::object::function::FnObj;
use crate::object::upvalue::UpvalueObj;

/// Describes how `CLOSURE` should populate one upvalue slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompilerUpvalue {
    /// `true`: capture the enclosing frame's local register `index`.
    /// `false`: reuse the enclosing closure's upvalue `index`.
    pub is_local: bool,
    pub index: u16,
}

/// The captured state half of a closure.
pub enum Captures {
    /// A compiler-emitted template: recipe for building real captures.
    Prototype(Vec<CompilerUpvalue>),
    /// Real, resolved upvalues, in declaration order.
    Runtime(Vec<NonNull<UpvalueObj>>),
}

#[repr(C)]
pub struct ClosureObj {
    pub header: ObjHeader,
    pub function: NonNull<FnObj>,
    pub captures: Captures,
}

impl ClosureObj {
    #[must_use]
    pub fn num_upvalues(&self) -> usize {
        match &self.captures {
            Captures::Prototype(v) => v.len(),
            Captures::Runtime(v) => v.len(),
        }
    }

    #[must_use]
    pub fn upvalue(&self, index: usize) -> Option<NonNull<UpvalueObj>> {
        match &self.captures {
            Captures::Runtime(v) => v.get(index).copied(),
            Captures::Prototype(_) => None,
        }
    }
}
