// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The register virtual machine: object allocation, the core-class
//! bootstrap, and the bytecode dispatch loop.

#[cfg(test)]
mod vm_test;

use core::ptr::NonNull;
use std::collections::HashMap;

use crate::bytecode::{
    decode_a, decode_b, decode_bx, decode_c, decode_opcode, decode_sbx, decode_sjx, decode_vb,
    decode_vc, op, patch_noop,
};
use crate::error::{format_error, InterpretResult};
use crate::gc;
use crate::handle::Handle;
use crate::hashing::values_equal;
use crate::object::class::{ClassObj, ForeignFn, Method, MethodTable, PrimitiveOutcome};
use crate::object::closure::{Captures, ClosureObj, CompilerUpvalue};
use crate::object::fiber::{CallFrame, FiberObj, FiberState};
use crate::object::foreign::ForeignObj;
use crate::object::function::FnObj;
use crate::object::header::{ObjHeader, ObjType};
use crate::object::instance::InstanceObj;
use crate::object::list::{self, ListObj};
use crate::object::map::MapObj;
use crate::object::map_entry::MapEntryObj;
use crate::object::module::ModuleObj;
use crate::object::range::RangeObj;
use crate::object::string_obj::StringObj;
use crate::object::upvalue::UpvalueObj;
use crate::primitives;
use crate::symbol::SymbolTable;
use crate::value::Value;

/// A foreign class's paired allocate/finalize hooks, as returned by
/// `Config::bind_foreign_class`.
pub struct ForeignClassMethods {
    pub allocate: ForeignFn,
    pub finalize: Option<ForeignFn>,
}

/// Host callbacks and heap-sizing knobs, mirroring the embedding
/// configuration struct of the slot API.
pub struct Config {
    pub write_fn: Option<Box<dyn FnMut(&str)>>,
    pub error_fn: Option<Box<dyn FnMut(ErrorKind, Option<&str>, i32, &str)>>,
    pub resolve_module_fn: Option<Box<dyn FnMut(&str, &str) -> Option<String>>>,
    pub load_module_fn: Option<Box<dyn FnMut(&str) -> Option<String>>>,
    pub bind_foreign_method_fn:
        Option<Box<dyn FnMut(&str, &str, bool, &str) -> Option<ForeignFn>>>,
    pub bind_foreign_class_fn: Option<Box<dyn FnMut(&str, &str) -> Option<ForeignClassMethods>>>,
    pub initial_heap_size: usize,
    pub min_heap_size: usize,
    pub heap_growth_percent: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            write_fn: None,
            error_fn: None,
            resolve_module_fn: None,
            load_module_fn: None,
            bind_foreign_method_fn: None,
            bind_foreign_class_fn: None,
            initial_heap_size: 1024 * 1024,
            min_heap_size: 1024 * 1024,
            heap_growth_percent: 50,
        }
    }
}

/// Category of a host-reported error, mirroring `errorFn(kind, ...)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Compile,
    Runtime,
    StackTrace,
}

/// GC bookkeeping, split out of [`Vm`] mostly so [`crate::gc`] reads like a
/// cohesive unit rather than a grab-bag of top-level `Vm` fields.
pub struct GcState {
    pub bytes_allocated: usize,
    pub next_gc: usize,
    pub min_heap_size: usize,
    pub heap_growth_percent: u32,
    pub gray_worklist: Vec<NonNull<ObjHeader>>,
    pub temp_roots: Vec<Value>,
    pub stress: bool,
}

/// Handles to the built-in classes, bootstrapped once at VM construction.
pub struct CoreClasses {
    pub class_class: NonNull<ClassObj>,
    pub object_class: NonNull<ClassObj>,
    pub null_class: NonNull<ClassObj>,
    pub bool_class: NonNull<ClassObj>,
    pub num_class: NonNull<ClassObj>,
    pub string_class: NonNull<ClassObj>,
    pub list_class: NonNull<ClassObj>,
    pub map_class: NonNull<ClassObj>,
    pub range_class: NonNull<ClassObj>,
    pub fn_class: NonNull<ClassObj>,
    pub fiber_class: NonNull<ClassObj>,
    pub system_class: NonNull<ClassObj>,
    pub core_module: NonNull<ModuleObj>,
}

/// The virtual machine: the sole owner of the heap, the current fiber, and
/// host configuration. Not `Send`/`Sync` — scheduling is single-threaded
/// and cooperative (see the concurrency model this engine implements).
pub struct Vm {
    pub objects: Option<NonNull<ObjHeader>>,
    pub gc: GcState,
    pub modules: HashMap<String, NonNull<ModuleObj>>,
    pub last_imported_module: Option<NonNull<ModuleObj>>,
    pub fiber: Option<NonNull<FiberObj>>,
    pub handles: Vec<NonNull<Handle>>,
    pub method_names: SymbolTable,
    pub config: Config,
    pub core: CoreClasses,
}

/// Canonical method symbols the operator-overload fast path checks.
pub mod overload_symbol {
    pub const ADD: &str = "+(_)";
    pub const SUB: &str = "-(_)";
    pub const MUL: &str = "*(_)";
    pub const DIV: &str = "/(_)";
    pub const EQ: &str = "==(_)";
    pub const NEQ: &str = "!=(_)";
    pub const LT: &str = "<(_)";
    pub const LTE: &str = "<=(_)";
    pub const GT: &str = ">(_)";
    pub const GTE: &str = ">=(_)";
    pub const NOT: &str = "!";
    pub const NEG: &str = "-";
    pub const SUBSCRIPT_GET: &str = "[_]";
    pub const SUBSCRIPT_SET: &str = "[_]=(_)";
    pub const ITERATE: &str = "iterate(_)";
    pub const ITERATOR_VALUE: &str = "iteratorValue(_)";
}

impl Vm {
    #[must_use]
    pub fn new(config: Config) -> Box<Self> {
        let gc = GcState {
            bytes_allocated: 0,
            next_gc: config.initial_heap_size,
            min_heap_size: config.min_heap_size,
            heap_growth_percent: config.heap_growth_percent,
            gray_worklist: Vec::new(),
            temp_roots: Vec::new(),
            stress: false,
        };
        // Bootstrapped below; placeholder pointers are replaced before any
        // caller can observe them.
        let mut vm = Box::new(Self {
            objects: None,
            gc,
            modules: HashMap::new(),
            last_imported_module: None,
            fiber: None,
            handles: Vec::new(),
            method_names: SymbolTable::new(),
            config,
            core: dangling_core_classes(),
        });
        vm.bootstrap_core();
        vm
    }

    /// Run a collection now, unconditionally.
    pub fn collect_garbage(&mut self) {
        gc::collect(self);
    }

    fn maybe_collect(&mut self) {
        if self.gc.stress || self.gc.bytes_allocated > self.gc.next_gc {
            gc::collect(self);
        }
    }

    pub fn push_temp_root(&mut self, value: Value) {
        self.gc.temp_roots.push(value);
    }

    pub fn pop_temp_root(&mut self) {
        self.gc.temp_roots.pop();
    }

    /// Debug aid: when enabled, every allocation runs a full collection
    /// instead of only once `bytes_allocated` crosses `next_gc`. Intended
    /// for catching missing roots (an object that's only reachable through
    /// a local the next allocation would otherwise never disturb).
    pub fn set_gc_stress(&mut self, stress: bool) {
        self.gc.stress = stress;
    }

    fn push_object(&mut self, mut header: NonNull<ObjHeader>, size: usize) {
        unsafe {
            header.as_mut().next = self.objects;
        }
        self.objects = Some(header);
        self.gc.bytes_allocated += size;
        self.maybe_collect();
    }

    // -- Allocators -----------------------------------------------------

    pub fn alloc_string(&mut self, bytes: Vec<u8>) -> NonNull<StringObj> {
        let size = core::mem::size_of::<StringObj>() + bytes.len();
        let header = ObjHeader::new(ObjType::String, Some(self.core.string_class.cast()));
        let obj = Box::into_raw(Box::new(StringObj::new(header, bytes)));
        let ptr = NonNull::new(obj).expect("box is never null");
        self.push_object(ptr.cast(), size);
        ptr
    }

    pub fn alloc_list(&mut self) -> NonNull<ListObj> {
        let header = ObjHeader::new(ObjType::List, Some(self.core.list_class.cast()));
        let obj = Box::into_raw(Box::new(ListObj::new(header)));
        let ptr = NonNull::new(obj).expect("box is never null");
        self.push_object(ptr.cast(), core::mem::size_of::<ListObj>());
        ptr
    }

    pub fn alloc_map(&mut self) -> NonNull<MapObj> {
        let header = ObjHeader::new(ObjType::Map, Some(self.core.map_class.cast()));
        let obj = Box::into_raw(Box::new(MapObj::new(header)));
        let ptr = NonNull::new(obj).expect("box is never null");
        self.push_object(ptr.cast(), core::mem::size_of::<MapObj>());
        ptr
    }

    pub fn alloc_range(&mut self, from: f64, to: f64, is_inclusive: bool) -> NonNull<RangeObj> {
        let header = ObjHeader::new(ObjType::Range, Some(self.core.range_class.cast()));
        let obj = Box::into_raw(Box::new(RangeObj::new(header, from, to, is_inclusive)));
        let ptr = NonNull::new(obj).expect("box is never null");
        self.push_object(ptr.cast(), core::mem::size_of::<RangeObj>());
        ptr
    }

    pub fn alloc_map_entry(&mut self, key: Value, value: Value) -> NonNull<MapEntryObj> {
        let header = ObjHeader::new(ObjType::MapEntry, None);
        let obj = Box::into_raw(Box::new(MapEntryObj::new(header, key, value)));
        let ptr = NonNull::new(obj).expect("box is never null");
        self.push_object(ptr.cast(), core::mem::size_of::<MapEntryObj>());
        ptr
    }

    pub fn alloc_instance(&mut self, class: NonNull<ClassObj>) -> NonNull<InstanceObj> {
        let num_fields = unsafe { class.as_ref() }.num_fields.max(0) as usize;
        let header = ObjHeader::new(ObjType::Instance, Some(class.cast()));
        let fields = vec![Value::Null; num_fields].into_boxed_slice();
        let size = core::mem::size_of::<InstanceObj>() + num_fields * core::mem::size_of::<Value>();
        let obj = Box::into_raw(Box::new(InstanceObj { header, fields }));
        let ptr = NonNull::new(obj).expect("box is never null");
        self.push_object(ptr.cast(), size);
        ptr
    }

    pub fn alloc_foreign(&mut self, class: NonNull<ClassObj>, size: usize) -> NonNull<ForeignObj> {
        let header = ObjHeader::new(ObjType::Foreign, Some(class.cast()));
        let obj = Box::into_raw(Box::new(ForeignObj::new(header, size)));
        let ptr = NonNull::new(obj).expect("box is never null");
        self.push_object(ptr.cast(), core::mem::size_of::<ForeignObj>() + size);
        ptr
    }

    pub fn alloc_upvalue(&mut self, slot: NonNull<Value>) -> NonNull<UpvalueObj> {
        let header = ObjHeader::new(ObjType::Upvalue, None);
        let obj = Box::into_raw(Box::new(UpvalueObj {
            header,
            state: crate::object::upvalue::UpvalueState::Open(slot),
            next_open: None,
        }));
        let ptr = NonNull::new(obj).expect("box is never null");
        self.push_object(ptr.cast(), core::mem::size_of::<UpvalueObj>());
        ptr
    }

    pub fn alloc_module(&mut self, name: Option<NonNull<StringObj>>) -> NonNull<ModuleObj> {
        let header = ObjHeader::new(ObjType::Module, None);
        let obj = Box::into_raw(Box::new(ModuleObj::new(header, name)));
        let ptr = NonNull::new(obj).expect("box is never null");
        self.push_object(ptr.cast(), core::mem::size_of::<ModuleObj>());
        ptr
    }

    pub fn alloc_closure(
        &mut self,
        function: NonNull<FnObj>,
        captures: Captures,
    ) -> NonNull<ClosureObj> {
        let header = ObjHeader::new(ObjType::Closure, Some(self.core.fn_class.cast()));
        let obj = Box::into_raw(Box::new(ClosureObj {
            header,
            function,
            captures,
        }));
        let ptr = NonNull::new(obj).expect("box is never null");
        self.push_object(ptr.cast(), core::mem::size_of::<ClosureObj>());
        ptr
    }

    pub fn alloc_fiber(&mut self, entry: Option<NonNull<ClosureObj>>) -> NonNull<FiberObj> {
        let header = ObjHeader::new(ObjType::Fiber, Some(self.core.fiber_class.cast()));
        let mut fiber = FiberObj::new(header, FiberState::Other);
        if let Some(closure) = entry {
            let max_slots = unsafe { closure.as_ref().function.as_ref().max_slots } as usize;
            let capacity = (max_slots + 1).next_power_of_two();
            fiber.stack.reserve(capacity);
            fiber.frames.push(CallFrame {
                closure,
                ip: 0,
                stack_start: 0,
            });
        }
        let obj = Box::into_raw(Box::new(fiber));
        let ptr = NonNull::new(obj).expect("box is never null");
        self.push_object(ptr.cast(), core::mem::size_of::<FiberObj>());
        ptr
    }

    /// Allocate a class with `num_fields` (pass `-1` for a foreign class)
    /// and a synthesized metaclass inheriting from `Class`.
    pub fn alloc_class(
        &mut self,
        name: NonNull<StringObj>,
        superclass: Option<NonNull<ClassObj>>,
        num_fields: i32,
    ) -> NonNull<ClassObj> {
        let methods = superclass
            .map(|sc| unsafe { sc.as_ref() }.methods.clone())
            .unwrap_or_default();
        let header = ObjHeader::new(ObjType::Class, Some(self.core.class_class.cast()));
        let obj = Box::into_raw(Box::new(ClassObj {
            header,
            name,
            superclass,
            num_fields,
            methods,
            attributes: Value::Null,
            is_metaclass: false,
        }));
        let ptr = NonNull::new(obj).expect("box is never null");
        self.push_object(ptr.cast(), core::mem::size_of::<ClassObj>());
        ptr
    }

    /// Create a user-visible class (via the `CLASS` opcode), synthesizing
    /// its metaclass the way the entity model in §3 describes: the
    /// metaclass inherits from the superclass's metaclass (or `Class`
    /// itself, for direct subclasses of `Object`) and is itself an
    /// instance of `Class`.
    pub fn create_user_class(
        &mut self,
        name: NonNull<StringObj>,
        superclass: NonNull<ClassObj>,
        num_fields: i32,
    ) -> NonNull<ClassObj> {
        let meta_superclass = unsafe { superclass.as_ref() }
            .header
            .class_obj
            .map(NonNull::cast)
            .unwrap_or(self.core.class_class);
        let meta_name_bytes = {
            let n = unsafe { name.as_ref() };
            let mut bytes = n.bytes.clone();
            bytes.extend_from_slice(b" metaclass");
            bytes
        };
        let meta_name = self.alloc_string(meta_name_bytes);
        // `meta_name` isn't reachable from anything a collection would trace
        // yet, so the metaclass allocation below (or anything it triggers)
        // must not be allowed to sweep it out from under us.
        self.push_temp_root(Value::obj(meta_name.cast()));
        let metaclass = self.alloc_class(meta_name, Some(meta_superclass), 0);
        self.pop_temp_root();
        unsafe {
            metaclass.as_ptr().as_mut().unwrap().is_metaclass = true;
            metaclass.as_ptr().as_mut().unwrap().header.class_obj = Some(self.core.class_class.cast());
        }
        self.push_temp_root(Value::obj(metaclass.cast()));
        let class = self.alloc_class(name, Some(superclass), num_fields);
        self.pop_temp_root();
        unsafe {
            class.as_ptr().as_mut().unwrap().header.class_obj = Some(metaclass.cast());
        }
        class
    }

    pub fn intern_string(&mut self, s: &str) -> NonNull<StringObj> {
        self.alloc_string(s.as_bytes().to_vec())
    }

    // -- Core bootstrap ---------------------------------------------------

    fn bootstrap_core(&mut self) {
        primitives::bootstrap(self);
    }

    // -- Handles ------------------------------------------------------------

    pub fn make_handle(&mut self, value: Value) -> NonNull<Handle> {
        let ptr = NonNull::new(Box::into_raw(Box::new(Handle::new(value)))).unwrap();
        self.handles.push(ptr);
        ptr
    }

    pub fn release_handle(&mut self, handle: NonNull<Handle>) {
        self.handles.retain(|h| *h != handle);
        unsafe {
            drop(Box::from_raw(handle.as_ptr()));
        }
    }

    // -- Errors -------------------------------------------------------------

    pub fn new_error(&mut self, message: &str) -> Value {
        let s = self.alloc_string(message.as_bytes().to_vec());
        Value::obj(s.cast())
    }

    pub fn format_runtime_error(&mut self, template: &str, args: &[&str]) -> Value {
        let msg = format_error(template, args);
        self.new_error(&msg)
    }

    fn runtime_error(&mut self, fiber: NonNull<FiberObj>, error: Value) {
        unsafe {
            let mut fiber = fiber;
            fiber.as_mut().error = error;
        }
        self.propagate_runtime_error(fiber);
    }

    /// Walk the `caller` chain delivering `error` to the nearest `Try`
    /// fiber, or abort interpretation if none catches it.
    fn propagate_runtime_error(&mut self, mut failing: NonNull<FiberObj>) {
        loop {
            let failing_ref = unsafe { failing.as_ref() };
            let error = failing_ref.error;
            let Some(mut caller) = failing_ref.caller else {
                self.report_uncaught(failing, error);
                self.fiber = None;
                return;
            };
            unsafe {
                failing.as_mut().caller = None;
            }
            if unsafe { caller.as_ref() }.state == FiberState::Try {
                unsafe {
                    let caller_ref = caller.as_mut();
                    if let Some(dest) = caller_ref
                        .last_call_reg
                        .or_else(|| caller_ref.frames.last().map(|f| f.stack_start))
                    {
                        if dest < caller_ref.stack.len() {
                            caller_ref.stack[dest] = error;
                        }
                    }
                }
                self.fiber = Some(caller);
                return;
            }
            failing = caller;
            unsafe {
                failing.as_mut().error = error;
            }
        }
    }

    fn report_uncaught(&mut self, fiber: NonNull<FiberObj>, error: Value) {
        let message = self.stringify(error);
        if let Some(cb) = self.config.error_fn.as_mut() {
            cb(ErrorKind::Runtime, None, 0, &message);
            let frames = unsafe { &fiber.as_ref().frames };
            for frame in frames.iter().rev() {
                let function = unsafe { frame.closure.as_ref().function };
                let name = unsafe { &function.as_ref().debug.name };
                let line = unsafe { function.as_ref().line_at(frame.ip) };
                cb(ErrorKind::StackTrace, None, line as i32, name);
            }
        }
    }

    /// Render a value for error/`toString` purposes. This is the engine's
    /// own fallback, not a script-level `toString` dispatch.
    #[must_use]
    pub fn stringify(&self, value: Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Undefined => "undefined".to_string(),
            Value::Num(n) => format!("{n}"),
            Value::Obj(header) => match value.obj_type() {
                Some(ObjType::String) => {
                    let s = unsafe { header.cast::<StringObj>().as_ref() };
                    s.as_str_lossy().into_owned()
                }
                Some(ObjType::Class) => {
                    let c = unsafe { header.cast::<ClassObj>().as_ref() };
                    let name = unsafe { c.name.as_ref() };
                    name.as_str_lossy().into_owned()
                }
                other => format!("instance of {}", other.map_or("Obj", |_| value.type_name())),
            },
        }
    }

    fn module_name(&self, module: NonNull<ModuleObj>) -> String {
        match unsafe { module.as_ref() }.name {
            Some(name) => unsafe { name.as_ref() }.as_str_lossy().into_owned(),
            None => "core".to_string(),
        }
    }

    /// The runtime class of any value, including immediates.
    #[must_use]
    pub fn class_of(&self, value: Value) -> NonNull<ClassObj> {
        match value {
            Value::Null => self.core.null_class,
            Value::Bool(_) => self.core.bool_class,
            Value::Undefined => self.core.object_class,
            Value::Num(_) => self.core.num_class,
            Value::Obj(header) => unsafe { header.as_ref() }
                .class_obj
                .map(NonNull::cast)
                .unwrap_or(self.core.object_class),
        }
    }

    // -- Interpretation entry points ------------------------------------

    /// Run `closure` (already compiled by an external collaborator) to
    /// completion on a fresh root fiber.
    pub fn run(&mut self, closure: NonNull<ClosureObj>) -> InterpretResult {
        self.run_seeded(closure, &[]).0
    }

    /// Like [`Vm::run`], but copies `initial_regs` into the entry frame's
    /// registers before dispatch starts — how `call(handle)` delivers a
    /// host-populated slot window to a call handle's stub closure. Returns
    /// the fiber the closure ran on alongside the outcome, so the caller
    /// can read the result `RETURN` left in the fiber's slot 0.
    pub fn run_seeded(
        &mut self,
        closure: NonNull<ClosureObj>,
        initial_regs: &[Value],
    ) -> (InterpretResult, NonNull<FiberObj>) {
        let fiber = self.alloc_fiber(Some(closure));
        unsafe {
            let f = fiber.as_ptr().as_mut().unwrap();
            f.state = FiberState::Root;
            let max_slots = closure.as_ref().function.as_ref().max_slots as usize;
            ensure_stack_len(f, max_slots.max(initial_regs.len()).max(1));
            f.stack[..initial_regs.len()].copy_from_slice(initial_regs);
        }
        self.fiber = Some(fiber);
        let result = self.execute();
        (result, fiber)
    }

    /// The dispatch loop. Runs until `self.fiber` becomes `None` (success
    /// or uncaught error) or a foreign/primitive call requests a fiber
    /// switch that this call is not prepared to resume transparently.
    fn execute(&mut self) -> InterpretResult {
        loop {
            let Some(fiber_ptr) = self.fiber else {
                return InterpretResult::Success;
            };
            match self.run_frame(fiber_ptr) {
                FrameOutcome::Continue => {}
                FrameOutcome::FiberDone => {
                    if self.fiber.is_none() {
                        return InterpretResult::Success;
                    }
                }
                FrameOutcome::Error => {
                    if self.fiber.is_none() {
                        return InterpretResult::RuntimeError;
                    }
                }
            }
        }
    }

    /// Execute instructions from the current fiber's top frame until it
    /// returns, a call changes fiber, or an error propagates out of it.
    fn run_frame(&mut self, mut fiber_ptr: NonNull<FiberObj>) -> FrameOutcome {
        loop {
            let (closure, mut ip, stack_start) = {
                let fiber = unsafe { fiber_ptr.as_ref() };
                let Some(frame) = fiber.frames.last() else {
                    return FrameOutcome::FiberDone;
                };
                (frame.closure, frame.ip, frame.stack_start)
            };
            let function = unsafe { closure.as_ref().function };
            let code_len = unsafe { function.as_ref().code.len() };
            if ip >= code_len {
                return FrameOutcome::FiberDone;
            }
            let instr = unsafe { function.as_ref().code[ip] };
            ip += 1;

            let outcome = self.dispatch(fiber_ptr, closure, function, stack_start, instr, &mut ip);

            // `RETURN` already popped this fiber's top frame (or emptied
            // it); writing `ip` back in that case would stomp the
            // resumed caller frame's own instruction pointer. A fiber
            // switch leaves this frame in place, still paused here, so it
            // does need its `ip` saved for when control returns to it.
            if matches!(outcome, DispatchOutcome::Continue | DispatchOutcome::FiberSwitched) {
                if let Some(frame) = unsafe { fiber_ptr.as_mut() }.frames.last_mut() {
                    frame.ip = ip;
                }
            }

            match outcome {
                DispatchOutcome::Continue => {}
                DispatchOutcome::Return(popped_to_empty) => {
                    if popped_to_empty {
                        return FrameOutcome::FiberDone;
                    }
                }
                DispatchOutcome::FiberSwitched => return FrameOutcome::Continue,
                DispatchOutcome::Error(error) => {
                    self.runtime_error(fiber_ptr, error);
                    return FrameOutcome::Error;
                }
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(
        &mut self,
        mut fiber_ptr: NonNull<FiberObj>,
        closure: NonNull<ClosureObj>,
        function: NonNull<FnObj>,
        stack_start: usize,
        instr: u32,
        ip: &mut usize,
    ) -> DispatchOutcome {
        let opcode = decode_opcode(instr);
        let a = decode_a(instr) as usize;

        macro_rules! reg {
            ($i:expr) => {{
                let fiber = unsafe { fiber_ptr.as_ref() };
                fiber.stack[stack_start + $i]
            }};
        }
        macro_rules! set_reg {
            ($i:expr, $v:expr) => {{
                let fiber = unsafe { fiber_ptr.as_mut() };
                fiber.stack[stack_start + $i] = $v;
            }};
        }

        match opcode {
            op::LOADK => {
                let bx = decode_bx(instr) as usize;
                let constant = unsafe { function.as_ref().constants[bx] };
                let value = self.clone_constant(constant);
                set_reg!(a, value);
            }
            op::LOADNULL => set_reg!(a, Value::Null),
            op::LOADBOOL => {
                let b = decode_b(instr) != 0;
                let c = decode_c(instr);
                set_reg!(a, Value::Bool(b));
                if c != 0 {
                    *ip += 1;
                }
            }
            op::MOVE => {
                let b = decode_b(instr) as usize;
                set_reg!(a, reg!(b));
            }
            op::GETGLOBAL => {
                let bx = decode_bx(instr) as usize;
                let module = unsafe { function.as_ref().module };
                let value = unsafe { module.as_ref() }.variable(bx).unwrap_or(Value::Null);
                set_reg!(a, value);
            }
            op::SETGLOBAL => {
                let bx = decode_bx(instr) as usize;
                let mut module = unsafe { function.as_ref().module };
                unsafe { module.as_mut() }.set_variable(bx, reg!(a));
            }
            op::GETUPVAL => {
                let bx = decode_bx(instr) as usize;
                let value = unsafe { closure.as_ref() }
                    .upvalue(bx)
                    .map(|u| unsafe { u.as_ref() }.get())
                    .unwrap_or(Value::Null);
                set_reg!(a, value);
            }
            op::SETUPVAL => {
                let bx = decode_bx(instr) as usize;
                if let Some(mut upvalue) = unsafe { closure.as_ref() }.upvalue(bx) {
                    unsafe { upvalue.as_mut() }.set(reg!(a));
                }
            }
            op::GETFIELD => {
                let b = decode_b(instr) as usize;
                let c = decode_c(instr) as usize;
                let receiver = reg!(b);
                let value = match receiver.obj_type() {
                    Some(ObjType::Instance) => unsafe {
                        receiver.as_header().unwrap().cast::<InstanceObj>().as_ref().field(c)
                    },
                    _ => Value::Null,
                };
                set_reg!(a, value);
            }
            op::SETFIELD => {
                let b = decode_b(instr) as usize;
                let c = decode_c(instr) as usize;
                let receiver = reg!(b);
                if let Some(mut header) = receiver.as_header() {
                    if receiver.is_obj_type(ObjType::Instance) {
                        unsafe {
                            header.cast::<InstanceObj>().as_mut().set_field(c, reg!(a));
                        }
                    }
                }
            }
            op::TEST => {
                let b = decode_b(instr) as usize;
                let c = decode_c(instr) != 0;
                if reg!(b).is_truthy() != c {
                    *ip += 1;
                }
            }
            op::JUMP => {
                let offset = decode_sjx(instr);
                *ip = (*ip as i64 + i64::from(offset)) as usize;
            }
            op::RETURN => {
                let b = decode_b(instr) != 0;
                let c = decode_c(instr);
                let result = if b { reg!(a) } else { Value::Null };
                if c != 0 {
                    unsafe {
                        self.last_imported_module = Some(function.as_ref().module);
                    }
                }
                return self.do_return(fiber_ptr, result);
            }
            op::CALLK => {
                let vb = decode_vb(instr) as usize;
                let vc = decode_vc(instr) as usize;
                return self.do_call(fiber_ptr, stack_start, a, vb, vc, None);
            }
            op::CALLSUPERK => {
                let vb = decode_vb(instr) as usize;
                let vc = decode_vc(instr) as usize;
                let super_value = reg!(a + vb + 1);
                let Some(super_header) = super_value.as_header() else {
                    return DispatchOutcome::Error(self.new_error("Superclass slot is not a class."));
                };
                return self.do_call(
                    fiber_ptr,
                    stack_start,
                    a,
                    vb,
                    vc,
                    Some(super_header.cast()),
                );
            }
            op::CLOSURE => {
                let bx = decode_bx(instr) as usize;
                let prototype_value = unsafe { function.as_ref().constants[bx] };
                let Some(prototype) = prototype_value.as_header() else {
                    return DispatchOutcome::Error(self.new_error("Bad closure constant."));
                };
                let prototype: NonNull<ClosureObj> = prototype.cast();
                let inner_function = unsafe { prototype.as_ref().function };
                let descriptors = match unsafe { &prototype.as_ref().captures } {
                    Captures::Prototype(d) => d.clone(),
                    Captures::Runtime(_) => Vec::new(),
                };
                let mut upvalues = Vec::with_capacity(descriptors.len());
                for descriptor in &descriptors {
                    upvalues.push(self.resolve_upvalue(fiber_ptr, closure, stack_start, *descriptor));
                }
                let new_closure = self.alloc_closure(inner_function, Captures::Runtime(upvalues));
                set_reg!(a, Value::obj(new_closure.cast()));
            }
            op::CLOSE => {
                let fiber = unsafe { fiber_ptr.as_mut() };
                let floor = NonNull::new(&mut fiber.stack[stack_start + a] as *mut Value).unwrap();
                fiber.close_upvalues_above(floor);
            }
            op::CLASS => {
                let sbx = decode_sbx(instr);
                let num_fields = sbx.unsigned_abs() as i32;
                let is_foreign = sbx < 0;
                let name_value = reg!(a - 1);
                let super_value = reg!(a);
                let Some(name_header) = name_value.as_header() else {
                    return DispatchOutcome::Error(self.new_error("Class name must be a string."));
                };
                let Some(super_header) = super_value.as_header() else {
                    return DispatchOutcome::Error(self.new_error("Superclass must be a class."));
                };
                let class = self.create_user_class(
                    name_header.cast(),
                    super_header.cast(),
                    if is_foreign { -1 } else { num_fields },
                );
                set_reg!(a, Value::obj(class.cast()));
            }
            op::ENDCLASS => {
                let attributes = reg!(a);
                let class_value = reg!(a + 1);
                if let Some(mut header) = class_value.as_header() {
                    unsafe {
                        header.cast::<ClassObj>().as_mut().attributes = attributes;
                    }
                }
            }
            op::METHOD => {
                let sbx = decode_sbx(instr);
                let symbol = sbx.unsigned_abs() as usize;
                let is_static = sbx < 0;
                let method_value = reg!(a - 1);
                let class_value = reg!(a);
                let Some(class_header) = class_value.as_header() else {
                    return DispatchOutcome::Error(self.new_error("Method target must be a class."));
                };
                let mut target_class: NonNull<ClassObj> = class_header.cast();
                if is_static {
                    if let Some(meta) = unsafe { target_class.as_ref() }.header.class_obj {
                        target_class = meta.cast();
                    }
                }
                let method = if method_value.is_obj_type(ObjType::Closure) {
                    Method::Block(method_value.as_header().unwrap().cast())
                } else if method_value.is_obj_type(ObjType::String) {
                    let signature = self.stringify(method_value);
                    let class_name = self.stringify(Value::obj(unsafe {
                        target_class.as_ref().name.cast()
                    }));
                    let module_name = self.module_name(unsafe { function.as_ref().module });
                    match self.config.bind_foreign_method_fn.as_mut() {
                        Some(cb) => cb(&module_name, &class_name, is_static, &signature)
                            .map_or(Method::None, Method::Foreign),
                        None => Method::None,
                    }
                } else {
                    Method::None
                };
                unsafe {
                    target_class.as_mut().methods.set(symbol, method);
                }
            }
            op::CONSTRUCT => {
                let bx = decode_bx(instr);
                let class_value = reg!(a);
                let Some(class_header) = class_value.as_header() else {
                    return DispatchOutcome::Error(self.new_error("Cannot construct a non-class."));
                };
                let class: NonNull<ClassObj> = class_header.cast();
                let instance = if bx != 0 {
                    let foreign = self.alloc_foreign(class, 0);
                    let mut args = [Value::obj(foreign.cast())];
                    let class_name =
                        self.stringify(Value::obj(unsafe { class.as_ref().name.cast() }));
                    let module_name = self.module_name(unsafe { function.as_ref().module });
                    if let Some(cb) = self.config.bind_foreign_class_fn.as_mut() {
                        if let Some(hooks) = cb(&module_name, &class_name) {
                            (hooks.allocate)(self, &mut args);
                        }
                    }
                    args[0]
                } else {
                    Value::obj(self.alloc_instance(class).cast())
                };
                set_reg!(a, instance);
            }
            op::IMPORTMODULE => {
                let bx = decode_bx(instr) as usize;
                let name_value = unsafe { function.as_ref().constants[bx] };
                let name = self.stringify(name_value);
                let value = self.import_module(&name);
                set_reg!(a, value);
            }
            op::IMPORTVAR => {
                let bx = decode_bx(instr) as usize;
                let name_value = unsafe { function.as_ref().constants[bx] };
                let name = self.stringify(name_value);
                let value = self
                    .last_imported_module
                    .and_then(|m| unsafe { m.as_ref() }.find_variable(&name))
                    .and_then(|sym| unsafe { self.last_imported_module.unwrap().as_ref() }.variable(sym))
                    .unwrap_or(Value::Null);
                set_reg!(a, value);
            }
            op::ADD | op::SUB | op::MUL | op::DIV => {
                let b = decode_b(instr) as usize;
                let c = decode_c(instr) as usize;
                match self.binary_op(opcode, reg!(b), reg!(c)) {
                    Ok(v) => set_reg!(a, v),
                    Err(e) => return DispatchOutcome::Error(e),
                }
            }
            op::ADDK | op::SUBK | op::MULK | op::DIVK => {
                let b = decode_b(instr);
                let c = decode_c(instr) as usize;
                let k_bit = b & 1 != 0;
                let reg_operand = reg!((b >> 1) as usize);
                let const_operand = unsafe { function.as_ref().constants[c] };
                let (lhs, rhs) = if k_bit {
                    (const_operand, reg_operand)
                } else {
                    (reg_operand, const_operand)
                };
                let base = match opcode {
                    op::ADDK => op::ADD,
                    op::SUBK => op::SUB,
                    op::MULK => op::MUL,
                    _ => op::DIV,
                };
                match self.binary_op(base, lhs, rhs) {
                    Ok(v) => set_reg!(a, v),
                    Err(e) => return DispatchOutcome::Error(e),
                }
            }
            op::NEG => {
                let b = decode_b(instr) as usize;
                match reg!(b) {
                    Value::Num(n) => set_reg!(a, Value::Num(-n)),
                    other => return DispatchOutcome::Error(
                        self.format_runtime_error("$ does not implement '-'.", &[other.type_name()]),
                    ),
                }
            }
            op::NOT => {
                let b = decode_b(instr) as usize;
                set_reg!(a, Value::Bool(!reg!(b).is_truthy()));
            }
            op::EQ | op::LT | op::LTE | op::EQK | op::LTK | op::LTEK => {
                let b = decode_b(instr) as usize;
                let lhs = reg!(b);
                let rhs = if matches!(opcode, op::EQK | op::LTK | op::LTEK) {
                    let c = decode_c(instr) as usize;
                    unsafe { function.as_ref().constants[c] }
                } else {
                    let c = decode_c(instr) as usize;
                    reg!(c)
                };
                let result = match opcode {
                    op::EQ | op::EQK => values_equal(&lhs, &rhs),
                    op::LT | op::LTK => self.numeric_cmp(lhs, rhs, |x, y| x < y),
                    _ => self.numeric_cmp(lhs, rhs, |x, y| x <= y),
                };
                if result != (a != 0) {
                    *ip += 1;
                }
            }
            op::ADDELEM | op::ADDELEMK => {
                let b = decode_b(instr) as usize;
                let c = decode_c(instr) as usize;
                let operand = if opcode == op::ADDELEMK {
                    unsafe { function.as_ref().constants[c] }
                } else {
                    reg!(c)
                };
                let list_value = reg!(b);
                if let Some(mut header) = list_value.as_header() {
                    if list_value.is_obj_type(ObjType::List) {
                        unsafe { header.cast::<ListObj>().as_mut() }.elements.push(operand);
                    }
                }
            }
            op::ITERATE => {
                let b = decode_b(instr) as usize;
                let c = decode_c(instr) as usize;
                match primitives::iterate(self, reg!(b), reg!(c)) {
                    Ok(v) => set_reg!(a, v),
                    Err(e) => return DispatchOutcome::Error(e),
                }
            }
            op::ITERATORVALUE => {
                let b = decode_b(instr) as usize;
                let c = decode_c(instr) as usize;
                match primitives::iterator_value(self, reg!(b), reg!(c)) {
                    Ok(v) => set_reg!(a, v),
                    Err(e) => return DispatchOutcome::Error(e),
                }
            }
            op::GETSUB => {
                let b = decode_b(instr) as usize;
                let c = decode_c(instr) as usize;
                match primitives::subscript_get(self, reg!(b), reg!(c)) {
                    Ok(v) => set_reg!(a, v),
                    Err(e) => return DispatchOutcome::Error(e),
                }
            }
            op::SETSUB => {
                let b = decode_b(instr) as usize;
                let c = decode_c(instr) as usize;
                if let Err(e) = primitives::subscript_set(self, reg!(b), reg!(c), reg!(a)) {
                    return DispatchOutcome::Error(e);
                }
            }
            op::RANGE => {
                // The inclusive flag rides in bit 0 of the `C` field; the
                // actual operand register is the remaining bits.
                let b = decode_b(instr) as usize;
                let c_raw = decode_c(instr);
                let inclusive = c_raw & 1 != 0;
                let c = (c_raw >> 1) as usize;
                let from = reg!(b).as_num().unwrap_or(0.0);
                let to = reg!(c).as_num().unwrap_or(0.0);
                let range = self.alloc_range(from, to, inclusive);
                set_reg!(a, Value::obj(range.cast()));
            }
            op::NOOP => {}
            _ => {
                return DispatchOutcome::Error(self.new_error("Unknown opcode."));
            }
        }
        DispatchOutcome::Continue
    }

    fn clone_constant(&mut self, constant: Value) -> Value {
        match constant.obj_type() {
            Some(ObjType::List) => {
                let src = unsafe { constant.as_header().unwrap().cast::<ListObj>().as_ref() };
                let elements = src.elements.clone();
                let copy = self.alloc_list();
                unsafe { copy.as_ptr().as_mut().unwrap() }.elements = elements;
                Value::obj(copy.cast())
            }
            Some(ObjType::Map) => {
                let src = unsafe { constant.as_header().unwrap().cast::<MapObj>().as_ref() };
                let pairs: Vec<(Value, Value)> = src.iter().collect();
                let copy = self.alloc_map();
                for (k, v) in pairs {
                    unsafe { copy.as_ptr().as_mut().unwrap() }.insert(k, v).ok();
                }
                Value::obj(copy.cast())
            }
            _ => constant,
        }
    }

    fn resolve_upvalue(
        &mut self,
        mut fiber_ptr: NonNull<FiberObj>,
        enclosing: NonNull<ClosureObj>,
        stack_start: usize,
        descriptor: CompilerUpvalue,
    ) -> NonNull<UpvalueObj> {
        if descriptor.is_local {
            let fiber = unsafe { fiber_ptr.as_mut() };
            let slot = NonNull::new(&mut fiber.stack[stack_start + descriptor.index as usize] as *mut Value)
                .unwrap();
            if let Some(existing) = fiber.find_open_upvalue(slot) {
                return existing;
            }
            let upvalue = self.alloc_upvalue(slot);
            unsafe { fiber_ptr.as_mut() }.insert_open_upvalue(upvalue);
            upvalue
        } else {
            unsafe { enclosing.as_ref() }
                .upvalue(descriptor.index as usize)
                .expect("enclosing closure must already have resolved this upvalue")
        }
    }

    pub(crate) fn numeric_cmp(&self, lhs: Value, rhs: Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
        match (lhs.as_num(), rhs.as_num()) {
            (Some(x), Some(y)) => cmp(x, y),
            _ => false,
        }
    }

    fn binary_op(&mut self, opcode: u8, lhs: Value, rhs: Value) -> Result<Value, Value> {
        if let (Value::Num(x), Value::Num(y)) = (lhs, rhs) {
            return Ok(Value::Num(match opcode {
                op::ADD => x + y,
                op::SUB => x - y,
                op::MUL => x * y,
                _ => x / y,
            }));
        }
        if opcode == op::ADD {
            if let (Some(a_str), Some(b_str)) = (self.as_string_bytes(lhs), self.as_string_bytes(rhs)) {
                let mut out = a_str;
                out.extend(b_str);
                return Ok(Value::obj(self.alloc_string(out).cast()));
            }
        }
        let symbol = match opcode {
            op::ADD => overload_symbol::ADD,
            op::SUB => overload_symbol::SUB,
            op::MUL => overload_symbol::MUL,
            _ => overload_symbol::DIV,
        };
        self.try_overload(lhs, rhs, symbol)
            .unwrap_or_else(|| Err(self.format_runtime_error("$ does not implement '$'.", &[lhs.type_name(), symbol])))
    }

    fn as_string_bytes(&self, value: Value) -> Option<Vec<u8>> {
        if value.is_obj_type(ObjType::String) {
            let s = unsafe { value.as_header().unwrap().cast::<StringObj>().as_ref() };
            Some(s.bytes.clone())
        } else {
            None
        }
    }

    /// If `lhs` is an instance/class defining `symbol`, call it with `rhs`
    /// and return its result. `None` if there is no such override, leaving
    /// the built-in fallback to the caller.
    pub(crate) fn try_overload(
        &mut self,
        lhs: Value,
        rhs: Value,
        symbol: &str,
    ) -> Option<Result<Value, Value>> {
        if !matches!(lhs.obj_type(), Some(ObjType::Instance | ObjType::Class)) {
            return None;
        }
        let class = self.class_of(lhs);
        let sym = self.method_names.find(symbol)?;
        let method = unsafe { class.as_ref() }.methods.get(sym)?.clone();
        match method {
            Method::None => None,
            Method::Primitive(f) => {
                let mut args = [lhs, rhs];
                match f(self, &mut args) {
                    PrimitiveOutcome::Value(v) => Some(Ok(v)),
                    PrimitiveOutcome::Error(e) => Some(Err(e)),
                    PrimitiveOutcome::FiberSwitch => Some(Ok(Value::Null)),
                }
            }
            _ => None,
        }
    }

    fn import_module(&mut self, name: &str) -> Value {
        if let Some(module) = self.modules.get(name).copied() {
            self.last_imported_module = Some(module);
            return Value::obj(module.cast());
        }
        // The compiler that would turn `loadModule`'s source into a fresh
        // module is outside this crate's scope; without it, an import that
        // misses the cache can only fail.
        self.new_error(&format!("Could not load module '{name}'."))
    }

    fn do_return(&mut self, fiber_ptr: NonNull<FiberObj>, result: Value) -> DispatchOutcome {
        let fiber = unsafe { &mut *fiber_ptr.as_ptr() };
        let frame = fiber.frames.pop().expect("return with no active frame");
        if !fiber.stack.is_empty() {
            let floor = NonNull::new(&mut fiber.stack[frame.stack_start] as *mut Value).unwrap();
            fiber.close_upvalues_above(floor);
        }
        fiber.stack.truncate(frame.stack_start);

        if fiber.frames.is_empty() {
            fiber.is_done = true;
            match fiber.caller {
                Some(mut caller) => {
                    let caller_ref = unsafe { caller.as_mut() };
                    if let Some(dest) = caller_ref
                        .last_call_reg
                        .or_else(|| caller_ref.frames.last().map(|f| f.stack_start))
                    {
                        if dest < caller_ref.stack.len() {
                            caller_ref.stack[dest] = result;
                        }
                    }
                    self.fiber = Some(caller);
                    DispatchOutcome::FiberSwitched
                }
                None => {
                    // No caller to deliver into: the result lands in the
                    // fiber's own slot 0, where a host driving it through
                    // a call handle reads it back out.
                    if fiber.stack.is_empty() {
                        fiber.stack.push(result);
                    } else {
                        fiber.stack[0] = result;
                    }
                    self.fiber = None;
                    DispatchOutcome::Return(true)
                }
            }
        } else {
            fiber.stack.push(result);
            DispatchOutcome::Return(false)
        }
    }

    /// Dispatch a `CALLK`/`CALLSUPERK` instruction.
    fn do_call(
        &mut self,
        mut fiber_ptr: NonNull<FiberObj>,
        stack_start: usize,
        a: usize,
        argc: usize,
        symbol: usize,
        super_override: Option<NonNull<ClassObj>>,
    ) -> DispatchOutcome {
        let receiver = unsafe { fiber_ptr.as_ref() }.stack[stack_start + a];
        let class = super_override.unwrap_or_else(|| self.class_of(receiver));
        let method = unsafe { class.as_ref() }.methods.get(symbol).cloned();

        let Some(method) = method.filter(|m| !matches!(m, Method::None)) else {
            let name = self.method_names.name(symbol).unwrap_or("?").to_string();
            return DispatchOutcome::Error(
                self.format_runtime_error("$ does not implement '@'.", &[receiver.type_name(), &name]),
            );
        };

        let window_start = stack_start + a;
        match method {
            Method::None => unreachable!("filtered above"),
            Method::Primitive(f) => {
                let fiber = unsafe { fiber_ptr.as_mut() };
                // Primitives are the only methods that can suspend this
                // fiber (fiber transfer primitives, §5); record where the
                // eventual resume/return/error value belongs before
                // running one, since that register is call-site-specific.
                fiber.last_call_reg = Some(window_start);
                let mut args: Vec<Value> = fiber.stack[window_start..=window_start + argc].to_vec();
                match f(self, &mut args) {
                    PrimitiveOutcome::Value(v) => {
                        unsafe { fiber_ptr.as_mut() }.stack[window_start] = v;
                        DispatchOutcome::Continue
                    }
                    PrimitiveOutcome::Error(e) => DispatchOutcome::Error(e),
                    PrimitiveOutcome::FiberSwitch => DispatchOutcome::FiberSwitched,
                }
            }
            Method::FunctionCall => {
                let receiver = unsafe { fiber_ptr.as_ref() }.stack[window_start];
                match primitives::resolve_fn_call(self, receiver, argc) {
                    Ok(callee) => {
                        let max_slots = unsafe { callee.as_ref().function.as_ref().max_slots } as usize;
                        let fiber = unsafe { fiber_ptr.as_mut() };
                        ensure_stack_len(fiber, window_start + max_slots.max(1));
                        fiber.frames.push(CallFrame {
                            closure: callee,
                            ip: 0,
                            stack_start: window_start,
                        });
                        DispatchOutcome::Continue
                    }
                    Err(e) => DispatchOutcome::Error(e),
                }
            }
            Method::Foreign(f) => {
                let fiber = unsafe { fiber_ptr.as_mut() };
                let mut args: Vec<Value> = fiber.stack[window_start..=window_start + argc].to_vec();
                f(self, &mut args);
                let fiber = unsafe { fiber_ptr.as_mut() };
                if let Some(result) = args.first() {
                    fiber.stack[window_start] = *result;
                }
                DispatchOutcome::Continue
            }
            Method::Block(callee) => {
                let max_slots = unsafe { callee.as_ref().function.as_ref().max_slots } as usize;
                let fiber = unsafe { fiber_ptr.as_mut() };
                ensure_stack_len(fiber, window_start + max_slots.max(1));
                fiber.frames.push(CallFrame {
                    closure: callee,
                    ip: 0,
                    stack_start: window_start,
                });
                DispatchOutcome::Continue
            }
        }
    }
}

/// Grow a fiber's register file to at least `len` slots, zero-filling the
/// new space. A frame's registers are addressed by direct indexing, so
/// this must run before any frame whose window could reach past the
/// current length starts executing.
fn ensure_stack_len(fiber: &mut FiberObj, len: usize) {
    if fiber.stack.len() < len {
        fiber.stack.resize(len, Value::Null);
    }
}

/// Placeholder, overwritten before `Vm::new` returns; exists only so the
/// `Vm` struct can be constructed before the core classes themselves are
/// allocated (the classes' own `header.class_obj` points back into this
/// same struct).
fn dangling_core_classes() -> CoreClasses {
    let dangling = NonNull::dangling();
    CoreClasses {
        class_class: dangling,
        object_class: dangling,
        null_class: dangling,
        bool_class: dangling,
        num_class: dangling,
        string_class: dangling,
        list_class: dangling,
        map_class: dangling,
        range_class: dangling,
        fn_class: dangling,
        fiber_class: dangling,
        system_class: dangling,
        core_module: NonNull::dangling(),
    }
}

enum FrameOutcome {
    Continue,
    FiberDone,
    Error,
}

enum DispatchOutcome {
    Continue,
    /// `true`: the whole interpretation finished (root fiber, no caller).
    Return(bool),
    FiberSwitched,
    Error(Value),
}
