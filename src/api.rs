// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The slot-based embedding API (§6): the only surface a host uses to
//! drive the VM. A host never touches a `Value` or an object pointer
//! directly; everything passes through a small, fixed set of numbered
//! slots, mirroring the C API this engine's embedding contract is styled
//! after.
//!
//! `Wren` owns both the [`Vm`] and the slot array. Slots are a flat `Vec`
//! the host grows with [`Wren::ensure_slots`]; nothing here runs a
//! compiler, so the only way to get a closure to [`Wren::call`] or
//! [`Wren::run`] is to hand one in already built (by an external front
//! end, or by [`Wren::make_call_handle`]).

use core::ptr::NonNull;

use crate::error::InterpretResult;
use crate::handle::Handle;
use crate::object::closure::{Captures, ClosureObj};
use crate::object::foreign::ForeignObj;
use crate::object::function::{FnDebug, FnObj};
use crate::object::header::{ObjHeader, ObjType};
use crate::object::list;
use crate::object::map::MapObj;
use crate::value::Value;
use crate::vm::{Config, Vm};

/// What kind of value `getType` reports for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    Bool,
    Num,
    Foreign,
    List,
    Map,
    Null,
    String,
    Unknown,
}

/// The host's view of a running VM: the interpreter plus its slot window.
pub struct Wren {
    vm: Box<Vm>,
    slots: Vec<Value>,
}

impl Wren {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            vm: Vm::new(config),
            slots: Vec::new(),
        }
    }

    #[must_use]
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Run an already-compiled closure to completion on a fresh root
    /// fiber, the same way `interpret` would once a front end has handed
    /// this engine a [`FnObj`].
    pub fn run(&mut self, closure: NonNull<ClosureObj>) -> InterpretResult {
        self.vm.run(closure)
    }

    // -- Slot window ------------------------------------------------------

    /// Guarantee at least `count` slots exist, newly created ones holding
    /// `null`.
    pub fn ensure_slots(&mut self, count: usize) {
        if self.slots.len() < count {
            self.slots.resize(count, Value::Null);
        }
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn slot_type(&self, slot: usize) -> SlotType {
        match self.slots[slot] {
            Value::Null => SlotType::Null,
            Value::Bool(_) => SlotType::Bool,
            Value::Num(_) => SlotType::Num,
            Value::Undefined => SlotType::Unknown,
            Value::Obj(header) => match unsafe { header.as_ref() }.obj_type {
                ObjType::String => SlotType::String,
                ObjType::List => SlotType::List,
                ObjType::Map => SlotType::Map,
                ObjType::Foreign => SlotType::Foreign,
                _ => SlotType::Unknown,
            },
        }
    }

    #[must_use]
    pub fn get_bool(&self, slot: usize) -> bool {
        self.slots[slot].as_bool().expect("slot is not a bool")
    }

    pub fn set_bool(&mut self, slot: usize, value: bool) {
        self.slots[slot] = Value::Bool(value);
    }

    #[must_use]
    pub fn get_double(&self, slot: usize) -> f64 {
        self.slots[slot].as_num().expect("slot is not a num")
    }

    pub fn set_double(&mut self, slot: usize, value: f64) {
        self.slots[slot] = Value::Num(value);
    }

    pub fn set_null(&mut self, slot: usize) {
        self.slots[slot] = Value::Null;
    }

    /// Decode a string slot's bytes lossily, for host-side display.
    ///
    /// # Panics
    /// Panics if the slot does not hold a string.
    #[must_use]
    pub fn get_string(&self, slot: usize) -> String {
        String::from_utf8_lossy(&self.get_bytes(slot)).into_owned()
    }

    /// The raw bytes backing a string slot.
    ///
    /// # Panics
    /// Panics if the slot does not hold a string.
    #[must_use]
    pub fn get_bytes(&self, slot: usize) -> Vec<u8> {
        let header = self.slots[slot].as_header().expect("slot is not a string");
        unsafe { header.cast::<crate::object::string_obj::StringObj>().as_ref() }
            .bytes
            .clone()
    }

    pub fn set_string(&mut self, slot: usize, value: &str) {
        self.set_bytes(slot, value.as_bytes());
    }

    pub fn set_bytes(&mut self, slot: usize, value: &[u8]) {
        let s = self.vm.alloc_string(value.to_vec());
        self.slots[slot] = Value::obj(s.cast());
    }

    pub fn set_new_list(&mut self, slot: usize) {
        let l = self.vm.alloc_list();
        self.slots[slot] = Value::obj(l.cast());
    }

    pub fn set_new_map(&mut self, slot: usize) {
        let m = self.vm.alloc_map();
        self.slots[slot] = Value::obj(m.cast());
    }

    /// Allocate a foreign object of `class_slot`'s class with `size` bytes
    /// of host-owned storage, placing it in `slot`.
    pub fn set_new_foreign(&mut self, slot: usize, class_slot: usize, size: usize) -> NonNull<ForeignObj> {
        let class = self.slots[class_slot]
            .as_header()
            .expect("slot is not a class")
            .cast();
        let foreign = self.vm.alloc_foreign(class, size);
        self.slots[slot] = Value::obj(foreign.cast());
        foreign
    }

    /// # Panics
    /// Panics if the slot does not hold a foreign object.
    #[must_use]
    pub fn get_foreign(&self, slot: usize) -> NonNull<ForeignObj> {
        self.slots[slot].as_header().expect("slot is not foreign").cast()
    }

    pub fn get_handle(&mut self, slot: usize) -> NonNull<Handle> {
        self.vm.make_handle(self.slots[slot])
    }

    pub fn set_handle(&mut self, slot: usize, handle: NonNull<Handle>) {
        self.slots[slot] = unsafe { handle.as_ref() }.value;
    }

    // -- Lists --------------------------------------------------------------

    /// # Panics
    /// Panics if the slot does not hold a list.
    #[must_use]
    pub fn get_list_count(&self, slot: usize) -> usize {
        unsafe { self.list_ref(slot).as_ref() }.elements.len()
    }

    pub fn get_list_element(&mut self, list_slot: usize, index: i32, element_slot: usize) {
        let list = unsafe { self.list_ref(list_slot).as_ref() };
        let idx = list::resolve_index(f64::from(index), list.elements.len())
            .expect("list index out of bounds");
        let value = list.elements[idx];
        self.slots[element_slot] = value;
    }

    pub fn set_list_element(&mut self, list_slot: usize, index: i32, element_slot: usize) {
        let value = self.slots[element_slot];
        let mut list_ptr = self.list_ref(list_slot);
        let list = unsafe { list_ptr.as_mut() };
        let idx = list::resolve_index(f64::from(index), list.elements.len())
            .expect("list index out of bounds");
        list.elements[idx] = value;
    }

    pub fn insert_in_list(&mut self, list_slot: usize, index: i32, element_slot: usize) {
        let value = self.slots[element_slot];
        let mut list_ptr = self.list_ref(list_slot);
        let list = unsafe { list_ptr.as_mut() };
        let len = list.elements.len() as i32;
        let idx = if index < 0 { index + len + 1 } else { index };
        list.elements.insert(idx as usize, value);
    }

    fn list_ref(&self, slot: usize) -> NonNull<list::ListObj> {
        self.slots[slot].as_header().expect("slot is not a list").cast()
    }

    // -- Maps -----------------------------------------------------------

    /// # Panics
    /// Panics if the slot does not hold a map.
    #[must_use]
    pub fn get_map_count(&self, slot: usize) -> usize {
        unsafe { self.map_ref(slot).as_ref() }.len()
    }

    #[must_use]
    pub fn get_map_contains(&self, map_slot: usize, key_slot: usize) -> bool {
        unsafe { self.map_ref(map_slot).as_ref() }.contains_key(&self.slots[key_slot])
    }

    pub fn get_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize) {
        let found = unsafe { self.map_ref(map_slot).as_ref() }.get(&self.slots[key_slot]);
        self.slots[value_slot] = found.unwrap_or(Value::Null);
    }

    /// # Errors
    /// Returns an error message if `key_slot` holds a type invalid as a
    /// map key (a mutable container).
    pub fn set_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize) -> Result<(), &'static str> {
        let key = self.slots[key_slot];
        let value = self.slots[value_slot];
        let mut map_ptr = self.map_ref(map_slot);
        unsafe { map_ptr.as_mut() }
            .insert(key, value)
            .map(|_| ())
            .map_err(|_| "key is not an immutable value")
    }

    pub fn remove_map_value(&mut self, map_slot: usize, key_slot: usize, removed_slot: usize) {
        let key = self.slots[key_slot];
        let mut map_ptr = self.map_ref(map_slot);
        let removed = unsafe { map_ptr.as_mut() }.remove(&key);
        self.slots[removed_slot] = removed.unwrap_or(Value::Null);
    }

    fn map_ref(&self, slot: usize) -> NonNull<MapObj> {
        self.slots[slot].as_header().expect("slot is not a map").cast()
    }

    // -- Modules and variables -------------------------------------------

    #[must_use]
    pub fn has_module(&self, module: &str) -> bool {
        self.vm.modules.contains_key(module)
    }

    #[must_use]
    pub fn has_variable(&self, module: &str, name: &str) -> bool {
        self.vm
            .modules
            .get(module)
            .is_some_and(|m| unsafe { m.as_ref() }.find_variable(name).is_some())
    }

    pub fn get_variable(&mut self, module: &str, name: &str, slot: usize) {
        let value = self
            .vm
            .modules
            .get(module)
            .and_then(|m| unsafe { m.as_ref() }.find_variable(name).and_then(|i| unsafe { m.as_ref() }.variable(i)))
            .unwrap_or(Value::Null);
        self.slots[slot] = value;
    }

    // -- Fiber control and GC rooting -------------------------------------

    /// Abort the currently running fiber with `slot`'s value as its error,
    /// the way a foreign method signals failure mid-call.
    pub fn abort_fiber(&mut self, slot: usize) {
        let error = self.slots[slot];
        if let Some(mut fiber) = self.vm.fiber {
            unsafe {
                fiber.as_mut().error = error;
            }
        }
    }

    pub fn push_root(&mut self, slot: usize) {
        self.vm.push_temp_root(self.slots[slot]);
    }

    pub fn pop_root(&mut self) {
        self.vm.pop_temp_root();
    }

    // -- Handles and calls -------------------------------------------------

    pub fn make_handle(&mut self, slot: usize) -> NonNull<Handle> {
        self.vm.make_handle(self.slots[slot])
    }

    pub fn release_handle(&mut self, handle: NonNull<Handle>) {
        self.vm.release_handle(handle);
    }

    /// Synthesize a stub closure for `signature` (e.g. `"call(_,_)"`): a
    /// single `CALLK` against that method's symbol, run against whatever
    /// receiver/argument values are sitting in slots 0..=arity when
    /// [`Wren::call`] is invoked on the resulting handle.
    pub fn make_call_handle(&mut self, signature: &str) -> NonNull<Handle> {
        let argc = signature_arity(signature);
        let symbol = self.vm.method_names.ensure(signature) as u16;
        let code = vec![
            crate::bytecode::encode_vbvc(crate::bytecode::op::CALLK, 0, argc as u8, symbol),
            crate::bytecode::encode_abc(crate::bytecode::op::RETURN, 0, 1, 0),
        ];
        let function = Box::new(FnObj {
            header: ObjHeader::new(ObjType::Fn, None),
            module: self.vm.core.core_module,
            max_slots: (argc + 1) as u16,
            arity: argc as u8,
            num_upvalues: 0,
            constants: Vec::new(),
            code,
            debug: FnDebug::default(),
        });
        let function = NonNull::new(Box::into_raw(function)).expect("box is never null");
        let closure = self.vm.alloc_closure(function, Captures::Runtime(Vec::new()));
        let value = Value::obj(closure.cast());
        let handle = Box::new(Handle::call_handle(value, closure));
        let ptr = NonNull::new(Box::into_raw(handle)).expect("box is never null");
        self.vm.handles.push(ptr);
        ptr
    }

    /// Run a call handle previously made by [`Wren::make_call_handle`]
    /// against the receiver/argument values already populated in slots
    /// 0..=arity, leaving the result in slot 0.
    pub fn call(&mut self, handle: NonNull<Handle>) -> InterpretResult {
        let call_closure = unsafe { handle.as_ref() }
            .call_closure
            .expect("handle was not created by make_call_handle");
        let argc = unsafe { call_closure.as_ref().function.as_ref().arity } as usize;
        self.ensure_slots(argc + 1);
        let (result, fiber) = self.vm.run_seeded(call_closure, &self.slots[..=argc]);
        if let Some(done) = unsafe { fiber.as_ref() }.stack.first().copied() {
            self.slots[0] = done;
        }
        result
    }
}

/// Count the argument placeholders (`_`) in a method signature such as
/// `"call(_,_)"` or an operator signature like `"+(_)"`.
fn signature_arity(signature: &str) -> usize {
    signature.matches('_').count()
}
