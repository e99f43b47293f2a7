// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Hand-assembled bytecode programs exercising the dispatch loop end to
//! end, standing in for the external compiler this crate doesn't include.

use super::*;
use core::cell::RefCell;
use core::ptr::NonNull;
use std::rc::Rc;

use crate::bytecode::{encode_abc, encode_abx, encode_asbx, encode_sjx, encode_vbvc, op};
use crate::error::InterpretResult;
use crate::object::closure::Captures;
use crate::object::function::{FnDebug, FnObj};
use crate::object::header::{ObjHeader, ObjType};
use crate::object::module::ModuleObj;

fn build_fn(
    module: NonNull<ModuleObj>,
    code: Vec<u32>,
    constants: Vec<Value>,
    max_slots: u16,
    arity: u8,
) -> NonNull<FnObj> {
    let header = ObjHeader::new(ObjType::Fn, None);
    let obj = Box::new(FnObj {
        header,
        module,
        max_slots,
        arity,
        num_upvalues: 0,
        constants,
        code,
        debug: FnDebug::default(),
    });
    NonNull::new(Box::into_raw(obj)).expect("box is never null")
}

/// Redirect `System.write_` output into a buffer the test can inspect.
fn capture_output(vm: &mut Vm) -> Rc<RefCell<String>> {
    let buffer = Rc::new(RefCell::new(String::new()));
    let sink = buffer.clone();
    vm.config.write_fn = Some(Box::new(move |s: &str| sink.borrow_mut().push_str(s)));
    buffer
}

fn system_class_value(vm: &Vm) -> Value {
    Value::obj(vm.core.system_class.cast())
}

#[test]
fn evaluates_arithmetic_and_prints_result() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let module = vm.alloc_module(None);
    let constants = vec![Value::Num(3.0), Value::Num(4.0), system_class_value(&vm)];
    let code = vec![
        encode_abx(op::LOADK, 0, 0),               // r0 = 3
        encode_abx(op::LOADK, 1, 1),               // r1 = 4
        encode_abc(op::ADD, 2, 0, 1),               // r2 = r0 + r1
        encode_abx(op::LOADK, 3, 2),                 // r3 = System
        encode_abc(op::MOVE, 4, 2, 0),                // r4 = r2
        encode_vbvc(op::CALLK, 3, 1, write_symbol), // System.write_(r4)
        encode_abc(op::RETURN, 3, 1, 0),             // return r3
    ];
    let function = build_fn(module, code, constants, 5, 0);
    let closure = vm.alloc_closure(function, Captures::Runtime(vec![]));

    let result = vm.run(closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "7");
}

#[test]
fn branches_on_test_and_jump() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let module = vm.alloc_module(None);
    let constants = vec![Value::Num(20.0), Value::Num(10.0), system_class_value(&vm)];
    let code = vec![
        encode_abc(op::LOADBOOL, 0, 1, 0),      // r0 = true                     idx0
        encode_abc(op::TEST, 0, 0, 1),           // skip next unless truthy(r0)==true idx1
        encode_sjx(op::JUMP, 2),                  // taken: jump to the then-branch   idx2
        encode_abx(op::LOADK, 1, 0),               // else: r1 = 20                    idx3
        encode_sjx(op::JUMP, 1),                    // skip the then-branch             idx4
        encode_abx(op::LOADK, 1, 1),                 // then: r1 = 10                    idx5
        encode_abx(op::LOADK, 2, 2),                  // r2 = System                      idx6
        encode_abc(op::MOVE, 3, 1, 0),                 // r3 = r1                          idx7
        encode_vbvc(op::CALLK, 2, 1, write_symbol),     // System.write_(r3)               idx8
        encode_abc(op::RETURN, 2, 1, 0),                 // return r2                       idx9
    ];
    let function = build_fn(module, code, constants, 4, 0);
    let closure = vm.alloc_closure(function, Captures::Runtime(vec![]));

    let result = vm.run(closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "10");
}

#[test]
fn reads_and_writes_globals() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let mut module = vm.alloc_module(None);
    let slot = unsafe { module.as_mut() }.declare_variable("counter") as u32;

    let constants = vec![Value::Num(41.0), system_class_value(&vm)];
    let code = vec![
        encode_abx(op::LOADK, 0, 0),                // r0 = 41
        encode_abx(op::SETGLOBAL, 0, slot),          // counter = r0
        encode_abx(op::GETGLOBAL, 1, slot),           // r1 = counter
        encode_abx(op::LOADK, 2, 1),                   // r2 = System
        encode_abc(op::MOVE, 3, 1, 0),                  // r3 = r1
        encode_vbvc(op::CALLK, 2, 1, write_symbol),      // System.write_(r3)
        encode_abc(op::RETURN, 2, 1, 0),
    ];
    let function = build_fn(module, code, constants, 4, 0);
    let closure = vm.alloc_closure(function, Captures::Runtime(vec![]));

    let result = vm.run(closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "41");
}

#[test]
fn calls_list_methods_through_callk() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let add_symbol = vm.method_names.ensure("add(_)") as u16;
    let count_symbol = vm.method_names.ensure("count") as u16;
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let module = vm.alloc_module(None);
    let list = vm.alloc_list();
    let constants = vec![
        Value::obj(list.cast()),
        Value::Num(1.0),
        Value::Num(2.0),
        system_class_value(&vm),
    ];
    // r4 = list (stable), r5 = System (stable); r0/r1 are the call window.
    let code = vec![
        encode_abx(op::LOADK, 4, 0),                  // r4 = list
        encode_abx(op::LOADK, 5, 3),                   // r5 = System
        encode_abc(op::MOVE, 0, 4, 0),                   // r0 = list
        encode_abx(op::LOADK, 1, 1),                      // r1 = 1
        encode_vbvc(op::CALLK, 0, 1, add_symbol),          // list.add(1)
        encode_abc(op::MOVE, 0, 4, 0),                      // r0 = list
        encode_abx(op::LOADK, 1, 2),                         // r1 = 2
        encode_vbvc(op::CALLK, 0, 1, add_symbol),             // list.add(2)
        encode_abc(op::MOVE, 0, 4, 0),                         // r0 = list
        encode_vbvc(op::CALLK, 0, 0, count_symbol),             // r0 = list.count
        encode_abc(op::MOVE, 2, 5, 0),                           // r2 = System
        encode_abc(op::MOVE, 3, 0, 0),                            // r3 = count
        encode_vbvc(op::CALLK, 2, 1, write_symbol),                // System.write_(r3)
        encode_abc(op::RETURN, 2, 1, 0),
    ];
    let function = build_fn(module, code, constants, 6, 0);
    let closure = vm.alloc_closure(function, Captures::Runtime(vec![]));

    let result = vm.run(closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "2");
}

#[test]
fn errors_on_missing_method() {
    let mut vm = Vm::new(Config::default());
    let messages = Rc::new(RefCell::new(Vec::new()));
    let sink = messages.clone();
    vm.config.error_fn = Some(Box::new(move |_kind, _module, _line, message| {
        sink.borrow_mut().push(message.to_string());
    }));
    let bogus_symbol = vm.method_names.ensure("bogus()") as u16;

    let module = vm.alloc_module(None);
    let constants = vec![Value::Num(5.0)];
    let code = vec![
        encode_abx(op::LOADK, 0, 0),                // r0 = 5
        encode_vbvc(op::CALLK, 0, 0, bogus_symbol), // r0.bogus()
        encode_abc(op::RETURN, 0, 1, 0),
    ];
    let function = build_fn(module, code, constants, 1, 0);
    let closure = vm.alloc_closure(function, Captures::Runtime(vec![]));

    let result = vm.run(closure);
    assert_eq!(result, InterpretResult::RuntimeError);
    assert_eq!(messages.borrow().first().map(String::as_str), Some("Num does not implement 'bogus()'."));
}

/// Regression test for the fresh-fiber stack priming: a never-started
/// fiber's register file must be materialized before its entry closure can
/// read its call argument out of it.
#[test]
fn fiber_call_and_yield_round_trip() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let new_symbol = vm.method_names.ensure("new(_)") as u16;
    let call_symbol = vm.method_names.ensure("call(_)") as u16;
    let yield_symbol = vm.method_names.ensure("yield(_)") as u16;
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let fiber_class_value = Value::obj(vm.core.fiber_class.cast());
    let inner_module = vm.alloc_module(None);
    let inner_constants = vec![Value::Num(1.0), fiber_class_value, Value::Num(10.0)];
    // A fiber's entry frame keeps `stack_start == 0` for its whole life (it
    // never pushes further frames here), and both the first argument
    // delivery and every later resume/yield write into that fixed base —
    // the first one at slot 1 (slot 0 holds the entry closure's "this"),
    // every later one at slot 0 itself. So the call/yield that might
    // suspend this frame must always route through r0.
    let inner_code = vec![
        encode_abx(op::LOADK, 3, 0),                  // r3 = 1
        encode_abc(op::ADD, 4, 1, 3),                   // r4 = arg + 1
        encode_abx(op::LOADK, 0, 1),                     // r0 = Fiber
        encode_abc(op::MOVE, 1, 4, 0),                    // r1 = value to yield
        encode_vbvc(op::CALLK, 0, 1, yield_symbol),        // yield r1; resumes with r0 = value
        encode_abx(op::LOADK, 7, 2),                        // r7 = 10
        encode_abc(op::ADD, 8, 0, 7),                        // r8 = resumed value + 10
        encode_abc(op::RETURN, 8, 1, 0),
    ];
    let inner_fn = build_fn(inner_module, inner_code, inner_constants, 9, 1);
    let inner_closure = vm.alloc_closure(inner_fn, Captures::Runtime(vec![]));

    let root_module = vm.alloc_module(None);
    let root_constants = vec![
        fiber_class_value,
        Value::obj(inner_closure.cast()),
        Value::Num(5.0),
        Value::Num(7.0),
        system_class_value(&vm),
    ];
    // r8 = Fiber class, r9 = fiber instance, r10 = System; all stable.
    let root_code = vec![
        encode_abx(op::LOADK, 8, 0),                   // r8 = Fiber
        encode_abx(op::LOADK, 10, 4),                    // r10 = System
        encode_abx(op::LOADK, 1, 1),                      // r1 = inner closure
        encode_abc(op::MOVE, 0, 8, 0),                     // r0 = Fiber
        encode_vbvc(op::CALLK, 0, 1, new_symbol),           // r0 = Fiber.new(inner)
        encode_abc(op::MOVE, 9, 0, 0),                       // r9 = fiber instance
        encode_abc(op::MOVE, 0, 9, 0),                        // r0 = fiber
        encode_abx(op::LOADK, 1, 2),                           // r1 = 5
        encode_vbvc(op::CALLK, 0, 1, call_symbol),              // fiber.call(5); suspends at yield
        encode_abc(op::MOVE, 2, 10, 0),                          // r2 = System
        encode_abc(op::MOVE, 3, 0, 0),                            // r3 = yielded value (6)
        encode_vbvc(op::CALLK, 2, 1, write_symbol),                // System.write_(6)
        encode_abc(op::MOVE, 0, 9, 0),                              // r0 = fiber
        encode_abx(op::LOADK, 1, 3),                                 // r1 = 7
        encode_vbvc(op::CALLK, 0, 1, call_symbol),                    // resume with 7; fiber returns 17
        encode_abc(op::MOVE, 2, 10, 0),                                // r2 = System
        encode_abc(op::MOVE, 3, 0, 0),                                  // r3 = final value (17)
        encode_vbvc(op::CALLK, 2, 1, write_symbol),                      // System.write_(17)
        encode_abc(op::RETURN, 2, 1, 0),
    ];
    let root_fn = build_fn(root_module, root_code, root_constants, 11, 0);
    let root_closure = vm.alloc_closure(root_fn, Captures::Runtime(vec![]));

    let result = vm.run(root_closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "617");
}

/// Regression test: a suspending `CALLK` does not always sit at register 0
/// of either the suspending fiber's frame or its caller's frame. Resume and
/// completion values must land in the register the triggering `CALLK`
/// actually targeted (the fiber's `last_call_reg`), not unconditionally in
/// `frame.stack_start` — otherwise they clobber whatever local happens to
/// live in register 0 instead.
#[test]
fn fiber_resume_and_completion_deliver_to_nonzero_registers() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let new_symbol = vm.method_names.ensure("new(_)") as u16;
    let call_symbol = vm.method_names.ensure("call(_)") as u16;
    let yield_symbol = vm.method_names.ensure("yield(_)") as u16;
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let fiber_class_value = Value::obj(vm.core.fiber_class.cast());
    let inner_module = vm.alloc_module(None);
    let inner_constants = vec![Value::Num(77.0), fiber_class_value];
    // The yielding call sits at r5, well away from this frame's r0, which
    // holds a sentinel the resume delivery must not touch.
    let inner_code = vec![
        encode_abx(op::LOADK, 0, 0),                      // r0 = 77 (sentinel)
        encode_abx(op::LOADK, 5, 1),                       // r5 = Fiber
        encode_abc(op::MOVE, 6, 1, 0),                      // r6 = arg, value to yield
        encode_vbvc(op::CALLK, 5, 1, yield_symbol),          // yield r6; resumes with value in r5
        encode_abc(op::ADD, 7, 0, 5),                         // r7 = sentinel + resumed value
        encode_abc(op::RETURN, 7, 1, 0),
    ];
    let inner_fn = build_fn(inner_module, inner_code, inner_constants, 8, 1);
    let inner_closure = vm.alloc_closure(inner_fn, Captures::Runtime(vec![]));

    let root_module = vm.alloc_module(None);
    let root_constants = vec![
        fiber_class_value,
        Value::obj(inner_closure.cast()),
        Value::Num(5.0),
        Value::Num(9.0),
        system_class_value(&vm),
        Value::Num(42.0),
    ];
    // r0 = sentinel the suspending/completing calls must not clobber; both
    // the `call(_)` that suspends and the one that later completes the
    // fiber are dispatched at r6, away from r0 and from either frame's
    // `stack_start`.
    let root_code = vec![
        encode_abx(op::LOADK, 8, 0),                    // r8 = Fiber
        encode_abx(op::LOADK, 10, 4),                    // r10 = System
        encode_abx(op::LOADK, 1, 1),                      // r1 = inner closure
        encode_abc(op::MOVE, 2, 8, 0),                     // r2 = Fiber (receiver for new)
        encode_abc(op::MOVE, 3, 1, 0),                      // r3 = inner closure (arg)
        encode_vbvc(op::CALLK, 2, 1, new_symbol),            // r2 = Fiber.new(inner)
        encode_abc(op::MOVE, 9, 2, 0),                        // r9 = fiber instance
        encode_abx(op::LOADK, 0, 5),                           // r0 = 42 (sentinel)
        encode_abc(op::MOVE, 6, 9, 0),                          // r6 = fiber (receiver for call)
        encode_abx(op::LOADK, 7, 2),                             // r7 = 5 (arg)
        encode_vbvc(op::CALLK, 6, 1, call_symbol),                // fiber.call(5); suspends at yield
        encode_abc(op::MOVE, 11, 10, 0),                           // r11 = System
        encode_abc(op::MOVE, 12, 0, 0),                             // r12 = sentinel, must still be 42
        encode_vbvc(op::CALLK, 11, 1, write_symbol),                 // write "42"
        encode_abc(op::MOVE, 11, 10, 0),
        encode_abc(op::MOVE, 12, 6, 0),                               // r12 = yielded value, should be 5
        encode_vbvc(op::CALLK, 11, 1, write_symbol),                  // write "5"
        encode_abc(op::MOVE, 6, 9, 0),                                 // r6 = fiber again
        encode_abx(op::LOADK, 7, 3),                                    // r7 = 9 (resume arg)
        encode_vbvc(op::CALLK, 6, 1, call_symbol),                      // resumes; fiber completes, returns 86
        encode_abc(op::MOVE, 11, 10, 0),
        encode_abc(op::MOVE, 12, 0, 0),                                  // r12 = sentinel, still 42
        encode_vbvc(op::CALLK, 11, 1, write_symbol),                     // write "42"
        encode_abc(op::MOVE, 11, 10, 0),
        encode_abc(op::MOVE, 12, 6, 0),                                   // r12 = final value, should be 86
        encode_vbvc(op::CALLK, 11, 1, write_symbol),                      // write "86"
        encode_abc(op::RETURN, 12, 1, 0),
    ];
    let root_fn = build_fn(root_module, root_code, root_constants, 13, 0);
    let root_closure = vm.alloc_closure(root_fn, Captures::Runtime(vec![]));

    let result = vm.run(root_closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "4254286");
}

/// Regression test: a `Fiber.try()` caller's caught error must land in the
/// register that `try()`'s own `CALLK` targeted, even when that register
/// isn't 0 and isn't the caller frame's `stack_start`.
#[test]
fn fiber_try_delivers_error_to_nonzero_register() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let new_symbol = vm.method_names.ensure("new(_)") as u16;
    let try_symbol = vm.method_names.ensure("try()") as u16;
    let abort_symbol = vm.method_names.ensure("abort(_)") as u16;
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let fiber_class_value = Value::obj(vm.core.fiber_class.cast());
    let oops = vm.alloc_string(b"oops".to_vec());
    let inner_module = vm.alloc_module(None);
    let inner_constants = vec![fiber_class_value, Value::obj(oops.cast())];
    let inner_code = vec![
        encode_abx(op::LOADK, 5, 0),                   // r5 = Fiber (receiver for abort)
        encode_abx(op::LOADK, 6, 1),                     // r6 = "oops"
        encode_vbvc(op::CALLK, 5, 1, abort_symbol),       // Fiber.abort("oops")
    ];
    let inner_fn = build_fn(inner_module, inner_code, inner_constants, 7, 0);
    let inner_closure = vm.alloc_closure(inner_fn, Captures::Runtime(vec![]));

    let root_module = vm.alloc_module(None);
    let root_constants = vec![
        fiber_class_value,
        Value::obj(inner_closure.cast()),
        Value::Num(42.0),
        system_class_value(&vm),
    ];
    let root_code = vec![
        encode_abx(op::LOADK, 8, 0),                   // r8 = Fiber
        encode_abx(op::LOADK, 10, 3),                   // r10 = System
        encode_abx(op::LOADK, 1, 1),                     // r1 = inner closure
        encode_abc(op::MOVE, 2, 8, 0),                    // r2 = Fiber (receiver for new)
        encode_abc(op::MOVE, 3, 1, 0),                     // r3 = inner closure (arg)
        encode_vbvc(op::CALLK, 2, 1, new_symbol),           // r2 = Fiber.new(inner)
        encode_abc(op::MOVE, 9, 2, 0),                       // r9 = fiber instance
        encode_abx(op::LOADK, 0, 2),                          // r0 = 42 (sentinel)
        encode_abc(op::MOVE, 6, 9, 0),                         // r6 = fiber (receiver for try)
        encode_vbvc(op::CALLK, 6, 0, try_symbol),               // fiber.try(); inner aborts
        encode_abc(op::MOVE, 11, 10, 0),                         // r11 = System
        encode_abc(op::MOVE, 12, 0, 0),                           // r12 = sentinel, must still be 42
        encode_vbvc(op::CALLK, 11, 1, write_symbol),               // write "42"
        encode_abc(op::MOVE, 11, 10, 0),
        encode_abc(op::MOVE, 12, 6, 0),                             // r12 = caught error, "oops"
        encode_vbvc(op::CALLK, 11, 1, write_symbol),                // write "oops"
        encode_abc(op::RETURN, 12, 1, 0),
    ];
    let root_fn = build_fn(root_module, root_code, root_constants, 13, 0);
    let root_closure = vm.alloc_closure(root_fn, Captures::Runtime(vec![]));

    let result = vm.run(root_closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "42oops");
}

/// Regression test for the metaclass-corruption bug: `CLASS` must give
/// every runtime-declared class its own synthesized metaclass so static
/// methods bind per-class rather than onto a shared table.
#[test]
fn class_declares_methods_and_constructs_instances() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let greet_symbol = vm.method_names.ensure("greet()") as u16;
    let make_symbol = vm.method_names.ensure("make()") as u16;
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let greet_module = vm.alloc_module(None);
    let greet_fn = build_fn(
        greet_module,
        vec![encode_abx(op::LOADK, 0, 0), encode_abc(op::RETURN, 0, 1, 0)],
        vec![Value::Num(5.0)],
        1,
        0,
    );
    let greet_closure = vm.alloc_closure(greet_fn, Captures::Runtime(vec![]));

    let make_module = vm.alloc_module(None);
    let make_fn = build_fn(
        make_module,
        vec![encode_abx(op::LOADK, 0, 0), encode_abc(op::RETURN, 0, 1, 0)],
        vec![Value::Num(9.0)],
        1,
        0,
    );
    let make_closure = vm.alloc_closure(make_fn, Captures::Runtime(vec![]));

    let base_name = vm.alloc_string(b"Base".to_vec());
    let object_class_value = Value::obj(vm.core.object_class.cast());
    let root_module = vm.alloc_module(None);
    let root_constants = vec![
        Value::obj(base_name.cast()),
        object_class_value,
        Value::obj(greet_closure.cast()),
        Value::obj(make_closure.cast()),
        system_class_value(&vm),
    ];
    let root_code = vec![
        encode_abx(op::LOADK, 0, 0),                         // r0 = "Base"
        encode_abx(op::LOADK, 1, 1),                           // r1 = Object
        encode_asbx(op::CLASS, 1, 0),                            // r1 = class Base(Object), 0 fields
        encode_abx(op::LOADK, 2, 2),                              // r2 = greet closure
        encode_abc(op::MOVE, 3, 1, 0),                             // r3 = Base
        encode_asbx(op::METHOD, 3, i32::from(greet_symbol)),        // bind greet() (instance)
        encode_abx(op::LOADK, 2, 3),                                 // r2 = make closure
        encode_abc(op::MOVE, 3, 1, 0),                                // r3 = Base
        encode_asbx(op::METHOD, 3, -i32::from(make_symbol)),           // bind make() (static)
        encode_abc(op::LOADNULL, 2, 0, 0),                              // r2 = null attributes
        encode_abc(op::MOVE, 3, 1, 0),                                   // r3 = Base
        encode_abc(op::ENDCLASS, 2, 0, 0),                                // attach attributes
        encode_abc(op::MOVE, 4, 1, 0),                                     // r4 = Base
        encode_abx(op::CONSTRUCT, 4, 0),                                    // r4 = Base instance
        encode_abc(op::MOVE, 6, 4, 0),                                       // r6 = instance
        encode_vbvc(op::CALLK, 6, 0, greet_symbol),                           // r6 = instance.greet()
        encode_abx(op::LOADK, 7, 4),                                           // r7 = System
        encode_abc(op::MOVE, 8, 6, 0),                                         // r8 = 5
        encode_vbvc(op::CALLK, 7, 1, write_symbol),                            // write "5"
        encode_abc(op::MOVE, 6, 1, 0),                                         // r6 = Base class
        encode_vbvc(op::CALLK, 6, 0, make_symbol),                            // r6 = Base.make()
        encode_abx(op::LOADK, 7, 4),
        encode_abc(op::MOVE, 8, 6, 0),                                         // r8 = 9
        encode_vbvc(op::CALLK, 7, 1, write_symbol),                            // write "9"
        encode_abc(op::RETURN, 7, 1, 0),
    ];
    let root_fn = build_fn(root_module, root_code, root_constants, 9, 0);
    let root_closure = vm.alloc_closure(root_fn, Captures::Runtime(vec![]));

    let result = vm.run(root_closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "59");
}

/// Regression test: a static method bound on one runtime-declared class
/// must not leak onto another, unrelated class's metaclass. Before
/// `CLASS` was fixed to synthesize a distinct metaclass per class, every
/// declared class shared the single `Class` metaclass, so binding a
/// static method on one class bled into every other.
#[test]
fn static_methods_do_not_leak_across_sibling_classes() {
    let mut vm = Vm::new(Config::default());
    let make_symbol = vm.method_names.ensure("make()") as u16;

    let make_module = vm.alloc_module(None);
    let make_fn = build_fn(
        make_module,
        vec![encode_abx(op::LOADK, 0, 0), encode_abc(op::RETURN, 0, 1, 0)],
        vec![Value::Num(9.0)],
        1,
        0,
    );
    let make_closure = vm.alloc_closure(make_fn, Captures::Runtime(vec![]));

    let base_name = vm.alloc_string(b"Base".to_vec());
    let other_name = vm.alloc_string(b"Other".to_vec());
    let object_class_value = Value::obj(vm.core.object_class.cast());
    let root_module = vm.alloc_module(None);
    let root_constants = vec![
        Value::obj(base_name.cast()),
        Value::obj(other_name.cast()),
        object_class_value,
        Value::obj(make_closure.cast()),
    ];
    let root_code = vec![
        encode_abx(op::LOADK, 0, 0),                         // r0 = "Base"
        encode_abx(op::LOADK, 1, 2),                           // r1 = Object
        encode_asbx(op::CLASS, 1, 0),                            // r1 = Base
        encode_abx(op::LOADK, 2, 3),                              // r2 = make closure
        encode_abc(op::MOVE, 3, 1, 0),                             // r3 = Base
        encode_asbx(op::METHOD, 3, -i32::from(make_symbol)),        // bind make() on Base only
        encode_abx(op::LOADK, 4, 1),                                 // r4 = "Other"
        encode_abx(op::LOADK, 5, 2),                                  // r5 = Object
        encode_asbx(op::CLASS, 5, 0),                                  // r5 = Other, no methods
        encode_abc(op::MOVE, 6, 5, 0),                                  // r6 = Other
        encode_vbvc(op::CALLK, 6, 0, make_symbol),                      // Other.make(): must error
        encode_abc(op::RETURN, 6, 1, 0),
    ];
    let root_fn = build_fn(root_module, root_code, root_constants, 7, 0);
    let root_closure = vm.alloc_closure(root_fn, Captures::Runtime(vec![]));

    let result = vm.run(root_closure);
    assert_eq!(result, InterpretResult::RuntimeError);
}

/// `CLOSURE` materializes a runtime closure that captures an upvalue from
/// the enclosing frame, and `CLOSE` severs that capture from the stack
/// slot once the owning frame is about to go away.
#[test]
fn closure_captures_upvalue_and_close_detaches_it() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let call_symbol = vm.method_names.ensure("call(_)") as u16;
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    // The captured closure: `R[0]` is the implicit receiver (a bare `Fn`
    // value isn't used here; this prototype is only ever instantiated via
    // `CLOSURE`), `R[1]` is its single upvalue slot.
    let inner_module = vm.alloc_module(None);
    let inner_code = vec![encode_abx(op::GETUPVAL, 0, 0), encode_abc(op::RETURN, 0, 1, 0)];
    let inner_fn = build_fn(inner_module, inner_code, vec![], 2, 1);
    let prototype_closure = vm.alloc_closure(
        inner_fn,
        Captures::Prototype(vec![crate::object::closure::CompilerUpvalue {
            is_local: true,
            index: 1,
        }]),
    );

    let root_module = vm.alloc_module(None);
    let root_constants = vec![
        Value::Num(123.0),
        Value::obj(prototype_closure.cast()),
        system_class_value(&vm),
    ];
    let root_code = vec![
        encode_abx(op::LOADK, 1, 0),                  // r1 = 123 (to be captured)
        encode_abx(op::CLOSURE, 2, 1),                  // r2 = closure capturing r1
        encode_abc(op::CLOSE, 1, 0, 0),                   // sever r1's upvalue early
        encode_abc(op::MOVE, 4, 2, 0),                     // r4 = closure (receiver for call)
        encode_abx(op::LOADK, 5, 0),                        // r5 = dummy arg (unused by body)
        encode_vbvc(op::CALLK, 4, 1, call_symbol),           // r4 = closure.call(123)
        encode_abx(op::LOADK, 6, 2),                          // r6 = System
        encode_abc(op::MOVE, 7, 4, 0),                         // r7 = 123
        encode_vbvc(op::CALLK, 6, 1, write_symbol),            // write "123"
        encode_abc(op::RETURN, 6, 1, 0),
    ];
    let root_fn = build_fn(root_module, root_code, root_constants, 8, 0);
    let root_closure = vm.alloc_closure(root_fn, Captures::Runtime(vec![]));

    let result = vm.run(root_closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "123");
}

/// `CALLSUPERK` dispatches starting from an explicit superclass register
/// rather than the receiver's own class, the way an overriding method's
/// `super.foo()` call does: calling it on an instance whose own class
/// overrides the method must still reach the superclass's definition.
#[test]
fn callsuperk_dispatches_from_explicit_superclass() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let greet_symbol = vm.method_names.ensure("greet()") as u16;
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let base_module = vm.alloc_module(None);
    let base_fn = build_fn(
        base_module,
        vec![encode_abx(op::LOADK, 0, 0), encode_abc(op::RETURN, 0, 1, 0)],
        vec![Value::Num(1.0)],
        1,
        0,
    );
    let base_greet = vm.alloc_closure(base_fn, Captures::Runtime(vec![]));

    let derived_module = vm.alloc_module(None);
    let derived_fn = build_fn(
        derived_module,
        vec![encode_abx(op::LOADK, 0, 0), encode_abc(op::RETURN, 0, 1, 0)],
        vec![Value::Num(2.0)],
        1,
        0,
    );
    let derived_greet = vm.alloc_closure(derived_fn, Captures::Runtime(vec![]));

    let base_name = vm.alloc_string(b"Base".to_vec());
    let derived_name = vm.alloc_string(b"Derived".to_vec());
    let object_class_value = Value::obj(vm.core.object_class.cast());
    let root_module = vm.alloc_module(None);
    let root_constants = vec![
        Value::obj(base_name.cast()),
        object_class_value,
        Value::obj(base_greet.cast()),
        Value::obj(derived_name.cast()),
        Value::obj(derived_greet.cast()),
        system_class_value(&vm),
    ];
    let root_code = vec![
        encode_abx(op::LOADK, 0, 0),                         // r0 = "Base"
        encode_abx(op::LOADK, 1, 1),                           // r1 = Object
        encode_asbx(op::CLASS, 1, 0),                            // r1 = Base
        encode_abx(op::LOADK, 2, 2),                              // r2 = base greet()
        encode_abc(op::MOVE, 3, 1, 0),                             // r3 = Base
        encode_asbx(op::METHOD, 3, i32::from(greet_symbol)),        // Base.greet() = base_greet
        encode_abx(op::LOADK, 4, 3),                                 // r4 = "Derived"
        encode_abc(op::MOVE, 5, 1, 0),                                // r5 = Base (superclass)
        encode_asbx(op::CLASS, 5, 0),                                  // r5 = Derived(Base)
        encode_abx(op::LOADK, 2, 4),                                    // r2 = derived greet()
        encode_abc(op::MOVE, 3, 5, 0),                                   // r3 = Derived
        encode_asbx(op::METHOD, 3, i32::from(greet_symbol)),              // Derived.greet() override
        encode_abc(op::MOVE, 6, 5, 0),                                     // r6 = Derived class
        encode_abx(op::CONSTRUCT, 6, 0),                                    // r6 = Derived instance
        encode_abc(op::MOVE, 9, 6, 0),                                       // r9 = instance copy
        encode_vbvc(op::CALLK, 9, 0, greet_symbol),                          // r9 = instance.greet() = 2
        encode_abc(op::MOVE, 7, 1, 0),                                       // r7 = Base (explicit super)
        encode_vbvc(op::CALLSUPERK, 6, 0, greet_symbol),                     // r6 = super.greet() = 1
        encode_abx(op::LOADK, 8, 5),                                         // r8 = System
        encode_abc(op::MOVE, 10, 9, 0),                                      // r10 = 2
        encode_vbvc(op::CALLK, 8, 1, write_symbol),                          // write "2"
        encode_abx(op::LOADK, 8, 5),                                         // r8 = System, refreshed
        encode_abc(op::MOVE, 10, 6, 0),                                      // r10 = 1
        encode_vbvc(op::CALLK, 8, 1, write_symbol),                          // write "1"
        encode_abc(op::RETURN, 8, 1, 0),
    ];
    let root_fn = build_fn(root_module, root_code, root_constants, 11, 0);
    let root_closure = vm.alloc_closure(root_fn, Captures::Runtime(vec![]));

    let result = vm.run(root_closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "21");
}

/// `IMPORTMODULE` re-resolves a module already in the VM's module cache
/// without invoking `load_module_fn`, and `IMPORTVAR` then reads a
/// variable out of whichever module it most recently imported.
#[test]
fn importmodule_and_importvar_read_a_cached_module() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let mut other_module = vm.alloc_module(None);
    let slot = unsafe { other_module.as_mut() }.declare_variable("greeting") as u32;
    unsafe { other_module.as_mut() }.set_variable(slot as usize, Value::Num(77.0));
    vm.modules.insert("other".to_string(), other_module);

    let module_name = vm.alloc_string(b"other".to_vec());
    let var_name = vm.alloc_string(b"greeting".to_vec());
    let root_module = vm.alloc_module(None);
    let root_constants = vec![
        Value::obj(module_name.cast()),
        Value::obj(var_name.cast()),
        system_class_value(&vm),
    ];
    let root_code = vec![
        encode_abx(op::IMPORTMODULE, 0, 0),       // r0 = import "other"
        encode_abx(op::IMPORTVAR, 1, 1),            // r1 = other.greeting
        encode_abx(op::LOADK, 2, 2),                 // r2 = System
        encode_abc(op::MOVE, 3, 1, 0),                // r3 = 77
        encode_vbvc(op::CALLK, 2, 1, write_symbol),    // write "77"
        encode_abc(op::RETURN, 2, 1, 0),
    ];
    let root_fn = build_fn(root_module, root_code, root_constants, 4, 0);
    let root_closure = vm.alloc_closure(root_fn, Captures::Runtime(vec![]));

    let result = vm.run(root_closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "77");
}

/// The `K`-suffixed arithmetic and relational opcodes read one operand
/// straight from the constant pool instead of a register.
#[test]
fn k_variant_arithmetic_and_comparison_read_the_constant_operand() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let module = vm.alloc_module(None);
    let constants = vec![
        Value::Num(10.0), // 0
        Value::Num(5.0),  // 1
        Value::Num(2.0),  // 2
        Value::Num(100.0), // 3: branch-taken marker
        Value::Num(-1.0),  // 4: branch-not-taken marker
        system_class_value(&vm), // 5
    ];
    let code = vec![
        encode_abx(op::LOADK, 0, 0),                  // r0 = 10
        encode_abc(op::ADDK, 1, 0, 1),                  // r1 = r0 + K[1](5) = 15
        encode_abc(op::SUBK, 2, 2, 1),                   // r2 = r1 - K[1](5) = 10
        encode_abc(op::MULK, 3, 4, 2),                    // r3 = r2 * K[2](2) = 20
        encode_abc(op::DIVK, 4, 6, 2),                     // r4 = r3 / K[2](2) = 10
        encode_abc(op::EQK, 1, 4, 0),                       // (r4 == K[0](10)) == true?
        encode_sjx(op::JUMP, 2),                             // matched: jump to success load
        encode_abx(op::LOADK, 5, 4),                          // else: r5 = -1
        encode_sjx(op::JUMP, 1),                               // skip the success load
        encode_abx(op::LOADK, 5, 3),                            // then: r5 = 100
        encode_abx(op::LOADK, 6, 5),                             // r6 = System
        encode_abc(op::MOVE, 7, 4, 0),                            // r7 = 10
        encode_vbvc(op::CALLK, 6, 1, write_symbol),                // write "10"
        encode_abx(op::LOADK, 6, 5),
        encode_abc(op::MOVE, 7, 5, 0),                              // r7 = 100
        encode_vbvc(op::CALLK, 6, 1, write_symbol),                 // write "100"
        encode_abc(op::RETURN, 6, 1, 0),
    ];
    let function = build_fn(module, code, constants, 8, 0);
    let closure = vm.alloc_closure(function, Captures::Runtime(vec![]));

    let result = vm.run(closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "10100");
}

/// `ADDELEM`/`ADDELEMK` append an element to a list in place, reading the
/// operand from a register or the constant pool respectively.
#[test]
fn addelem_and_addelemk_append_to_a_list() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let count_symbol = vm.method_names.ensure("count") as u16;
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let module = vm.alloc_module(None);
    let list = vm.alloc_list();
    let constants = vec![
        Value::obj(list.cast()),
        Value::Num(1.0),
        Value::Num(2.0),
        system_class_value(&vm),
    ];
    let code = vec![
        encode_abx(op::LOADK, 0, 0),                  // r0 = list
        encode_abx(op::LOADK, 1, 1),                    // r1 = 1 (register operand)
        encode_abc(op::ADDELEM, 0, 0, 1),                 // list.push(r1); `A` is unused
        encode_abc(op::ADDELEMK, 0, 0, 2),                 // list.push(K[2] = 2)
        encode_abc(op::MOVE, 2, 0, 0),                      // r2 = list (receiver for count)
        encode_vbvc(op::CALLK, 2, 0, count_symbol),          // r2 = list.count
        encode_abx(op::LOADK, 3, 3),                          // r3 = System
        encode_abc(op::MOVE, 4, 2, 0),                         // r4 = 2
        encode_vbvc(op::CALLK, 3, 1, write_symbol),             // write "2"
        encode_abc(op::RETURN, 3, 1, 0),
    ];
    let function = build_fn(module, code, constants, 10, 0);
    let closure = vm.alloc_closure(function, Captures::Runtime(vec![]));

    let result = vm.run(closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "2");
}

/// `GETSUB`/`SETSUB` dispatch the overloadable `[_]`/`[_]=(_)` operators
/// directly, bypassing `CALLK`'s method-symbol lookup.
#[test]
fn getsub_and_setsub_index_a_list() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let module = vm.alloc_module(None);
    let list = vm.alloc_list();
    unsafe { list.as_ptr().as_mut().unwrap() }.elements.push(Value::Num(1.0));
    unsafe { list.as_ptr().as_mut().unwrap() }.elements.push(Value::Num(2.0));
    let constants = vec![
        Value::obj(list.cast()),
        Value::Num(0.0),
        Value::Num(9.0),
        system_class_value(&vm),
    ];
    let code = vec![
        encode_abx(op::LOADK, 0, 0),                 // r0 = list
        encode_abx(op::LOADK, 1, 1),                   // r1 = index 0
        encode_abx(op::LOADK, 2, 2),                    // r2 = 9 (new value)
        encode_abc(op::SETSUB, 2, 0, 1),                 // list[0] = 9
        encode_abc(op::GETSUB, 3, 0, 1),                  // r3 = list[0]
        encode_abx(op::LOADK, 4, 3),                       // r4 = System
        encode_abc(op::MOVE, 5, 3, 0),                      // r5 = 9
        encode_vbvc(op::CALLK, 4, 1, write_symbol),          // write "9"
        encode_abc(op::RETURN, 4, 1, 0),
    ];
    let function = build_fn(module, code, constants, 6, 0);
    let closure = vm.alloc_closure(function, Captures::Runtime(vec![]));

    let result = vm.run(closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "9");
}

/// `RANGE` builds a `Range` object from two registers, with the inclusive
/// flag packed into the low bit of its `C` operand.
#[test]
fn range_builds_inclusive_and_exclusive_ranges() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let from_symbol = vm.method_names.ensure("from") as u16;
    let to_symbol = vm.method_names.ensure("to") as u16;
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let module = vm.alloc_module(None);
    let constants = vec![Value::Num(1.0), Value::Num(5.0), system_class_value(&vm)];
    let code = vec![
        encode_abx(op::LOADK, 0, 0),                 // r0 = 1
        encode_abx(op::LOADK, 1, 1),                   // r1 = 5
        encode_abc(op::RANGE, 2, 0, (1 << 1) | 1),       // r2 = 1..5 inclusive (c = r1<<1 | 1)
        encode_abc(op::MOVE, 4, 2, 0),                    // r4 = range (receiver for `to`)
        encode_vbvc(op::CALLK, 4, 0, to_symbol),            // r4 = range.to
        encode_abx(op::LOADK, 5, 2),                         // r5 = System
        encode_abc(op::MOVE, 6, 4, 0),                        // r6 = 5
        encode_vbvc(op::CALLK, 5, 1, write_symbol),            // write "5"
        encode_abc(op::RETURN, 5, 1, 0),
    ];
    let function = build_fn(module, code, constants, 7, 0);
    let closure = vm.alloc_closure(function, Captures::Runtime(vec![]));

    let result = vm.run(closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "5");
    let _ = from_symbol;
}

/// `NOOP` is a reserved no-op left behind by the relational-overload
/// peephole rewrite; dispatching it must simply fall through.
#[test]
fn noop_is_a_harmless_no_op() {
    let mut vm = Vm::new(Config::default());
    let output = capture_output(&mut vm);
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let module = vm.alloc_module(None);
    let constants = vec![Value::Num(3.0), system_class_value(&vm)];
    let code = vec![
        encode_abx(op::LOADK, 0, 0),                  // r0 = 3
        encode_abc(op::NOOP, 0, 0, 0),
        encode_abc(op::NOOP, 0, 0, 0),
        encode_abx(op::LOADK, 1, 1),                    // r1 = System
        encode_abc(op::MOVE, 2, 0, 0),                    // r2 = 3
        encode_vbvc(op::CALLK, 1, 1, write_symbol),        // write "3"
        encode_abc(op::RETURN, 1, 1, 0),
    ];
    let function = build_fn(module, code, constants, 3, 0);
    let closure = vm.alloc_closure(function, Captures::Runtime(vec![]));

    let result = vm.run(closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "3");
}

/// Debug aid for catching missing GC roots: with `gc.stress` enabled,
/// every allocation runs a full collection rather than only once the heap
/// crosses its growth threshold. A class built without temp-rooting its
/// intermediate metaclass allocation would have that metaclass swept out
/// from under it the moment this flag is on.
#[test]
fn gc_stress_mode_collects_on_every_allocation() {
    let mut vm = Vm::new(Config::default());
    vm.set_gc_stress(true);
    let output = capture_output(&mut vm);
    let greet_symbol = vm.method_names.ensure("greet()") as u16;
    let write_symbol = vm.method_names.ensure("write_(_)") as u16;

    let greet_module = vm.alloc_module(None);
    let greet_fn = build_fn(
        greet_module,
        vec![encode_abx(op::LOADK, 0, 0), encode_abc(op::RETURN, 0, 1, 0)],
        vec![Value::Num(4.0)],
        1,
        0,
    );
    let greet_closure = vm.alloc_closure(greet_fn, Captures::Runtime(vec![]));

    let base_name = vm.alloc_string(b"Base".to_vec());
    let object_class_value = Value::obj(vm.core.object_class.cast());
    let root_module = vm.alloc_module(None);
    let root_constants = vec![
        Value::obj(base_name.cast()),
        object_class_value,
        Value::obj(greet_closure.cast()),
        system_class_value(&vm),
    ];
    let root_code = vec![
        encode_abx(op::LOADK, 0, 0),                         // r0 = "Base"
        encode_abx(op::LOADK, 1, 1),                           // r1 = Object
        encode_asbx(op::CLASS, 1, 0),                            // r1 = Base, stress-GC on every alloc
        encode_abx(op::LOADK, 2, 2),                              // r2 = greet closure
        encode_abc(op::MOVE, 3, 1, 0),                             // r3 = Base
        encode_asbx(op::METHOD, 3, i32::from(greet_symbol)),        // bind greet()
        encode_abc(op::MOVE, 4, 1, 0),                               // r4 = Base class
        encode_abx(op::CONSTRUCT, 4, 0),                              // r4 = instance
        encode_abc(op::MOVE, 6, 4, 0),                                 // r6 = instance
        encode_vbvc(op::CALLK, 6, 0, greet_symbol),                    // r6 = instance.greet()
        encode_abx(op::LOADK, 7, 3),                                    // r7 = System
        encode_abc(op::MOVE, 8, 6, 0),                                   // r8 = 4
        encode_vbvc(op::CALLK, 7, 1, write_symbol),                      // write "4"
        encode_abc(op::RETURN, 7, 1, 0),
    ];
    let root_fn = build_fn(root_module, root_code, root_constants, 9, 0);
    let root_closure = vm.alloc_closure(root_fn, Captures::Runtime(vec![]));

    let result = vm.run(root_closure);
    assert_eq!(result, InterpretResult::Success);
    assert_eq!(output.borrow().as_str(), "4");
}
