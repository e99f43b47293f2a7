// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Classes and their method tables.

use core::ptr::NonNull;

use crate::object::closure::ClosureObj;
use crate::object::header::{ObjHeader, ObjType};
use crate::object::string_obj::StringObj;
use crate::value::Value;

/// A bound method, as stored in a class's method table.
///
/// Method symbols are dense and shared across every class in the VM, so a
/// subclass can copy its parent's table by sequential index and only needs
/// to overwrite the symbols it overrides.
pub enum Method {
    /// No method bound at this symbol.
    None,
    /// A method implemented directly by the engine.
    Primitive(PrimitiveFn),
    /// The `call(...)` family: arity-checks, then behaves like a primitive.
    FunctionCall,
    /// A method compiled to bytecode.
    Block(NonNull<ClosureObj>),
    /// A method implemented by the host.
    Foreign(ForeignFn),
}

impl Clone for Method {
    fn clone(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Primitive(f) => Self::Primitive(*f),
            Self::FunctionCall => Self::FunctionCall,
            Self::Block(c) => Self::Block(*c),
            Self::Foreign(f) => Self::Foreign(*f),
        }
    }
}

/// Outcome of a primitive method call.
///
/// Primitives either produce a result immediately, request that the
/// interpreter push a new frame (used by `FunctionCall` delegation and a
/// few collection primitives), switch fibers, or raise a runtime error.
pub enum PrimitiveOutcome {
    /// The call completed; the value is the result (already placed by the
    /// primitive into the receiver's register).
    Value(Value),
    /// The call raised a runtime error with this value.
    Error(Value),
    /// The call changed `vm.fiber` (a fiber-transfer primitive); the
    /// interpreter must reload its hot locals from the new fiber.
    FiberSwitch,
}

/// A primitive method implemented directly by the engine.
///
/// Arguments are `args[0]` (the receiver) through `args[argc]`.
pub type PrimitiveFn = fn(vm: &mut crate::vm::Vm, args: &mut [Value]) -> PrimitiveOutcome;

/// A foreign method implemented by the host.
pub type ForeignFn = fn(vm: &mut crate::vm::Vm, args: &mut [Value]);

/// Dense, symbol-indexed method table.
#[derive(Clone, Default)]
pub struct MethodTable(pub Vec<Method>);

impl MethodTable {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn get(&self, symbol: usize) -> Option<&Method> {
        self.0.get(symbol)
    }

    /// Bind `method` at `symbol`, growing the table with `Method::None` as needed.
    pub fn set(&mut self, symbol: usize, method: Method) {
        if symbol >= self.0.len() {
            self.0.resize_with(symbol + 1, || Method::None);
        }
        self.0[symbol] = method;
    }
}

/// A class: name, optional superclass, and a dense method table.
///
/// Every class is itself an instance of a metaclass (its `header.class_obj`),
/// and every metaclass inherits (directly or transitively) from the root
/// `Class` class, so `aClass.type` always resolves to a real class.
#[repr(C)]
pub struct ClassObj {
    pub header: ObjHeader,
    pub name: NonNull<StringObj>,
    pub superclass: Option<NonNull<ClassObj>>,
    /// Number of fields declared by instances of this class (including
    /// inherited fields). `-1` marks a foreign class.
    pub num_fields: i32,
    pub methods: MethodTable,
    pub attributes: Value,
    /// `true` for the synthesized metaclasses the VM creates alongside
    /// every user-visible class.
    pub is_metaclass: bool,
}

impl ClassObj {
    #[must_use]
    pub fn is_foreign(&self) -> bool {
        self.num_fields < 0
    }

    #[must_use]
    pub const fn obj_type() -> ObjType {
        ObjType::Class
    }
}
