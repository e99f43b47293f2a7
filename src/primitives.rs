// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The core-class bootstrap and every primitive method bound to a built-in
//! class, plus the free functions the opcode dispatch loop calls directly
//! for subscripting and iteration (`ITERATE`/`ITERATORVALUE`/`GETSUB`/
//! `SETSUB`) rather than through a method-table lookup.
//!
//! Binding order matters: a class's method table is copied wholesale from
//! its superclass at the moment [`crate::vm::Vm::alloc_class`] runs, so
//! `Object`'s methods must be bound before any subclass is created, and
//! likewise for `Class` before the metaclasses that inherit from it.

use core::ptr::NonNull;

use crate::hashing::values_equal;
use crate::object::class::{ClassObj, Method, PrimitiveFn, PrimitiveOutcome};
use crate::object::closure::ClosureObj;
use crate::object::fiber::{FiberObj, FiberState};
use crate::object::header::ObjType;
use crate::object::list::{self, ListObj};
use crate::object::map::MapObj;
use crate::object::range::RangeObj;
use crate::object::string_obj::StringObj;
use crate::value::Value;
use crate::vm::Vm;

// ---------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------

/// Build every built-in class and wire `vm.core`/`vm.core.core_module`.
/// Called once from [`crate::vm::Vm::new`], before any script runs.
pub fn bootstrap(vm: &mut Vm) {
    let object_name = vm.alloc_string(b"Object".to_vec());
    let object_class = vm.alloc_class(object_name, None, 0);
    vm.core.object_class = object_class;
    bind_object_methods(vm, object_class);

    let class_name = vm.alloc_string(b"Class".to_vec());
    let class_class = vm.alloc_class(class_name, Some(object_class), 0);
    vm.core.class_class = class_class;
    bind_class_methods(vm, class_class);

    let object_meta_name = vm.alloc_string(b"Object metaclass".to_vec());
    let object_meta = vm.alloc_class(object_meta_name, Some(class_class), 0);
    let class_meta_name = vm.alloc_string(b"Class metaclass".to_vec());
    let class_meta = vm.alloc_class(class_meta_name, Some(object_meta), 0);
    unsafe {
        object_meta.as_ptr().as_mut().unwrap().is_metaclass = true;
        object_meta.as_ptr().as_mut().unwrap().header.class_obj = Some(class_class.cast());
        class_meta.as_ptr().as_mut().unwrap().is_metaclass = true;
        class_meta.as_ptr().as_mut().unwrap().header.class_obj = Some(class_class.cast());
        object_class.as_ptr().as_mut().unwrap().header.class_obj = Some(object_meta.cast());
        class_class.as_ptr().as_mut().unwrap().header.class_obj = Some(class_meta.cast());
    }

    vm.core.null_class = create_builtin(vm, "Null", object_class);
    bind_null_methods(vm, vm.core.null_class);

    vm.core.bool_class = create_builtin(vm, "Bool", object_class);
    bind_bool_methods(vm, vm.core.bool_class);

    vm.core.num_class = create_builtin(vm, "Num", object_class);
    bind_num_methods(vm, vm.core.num_class);

    vm.core.string_class = create_builtin(vm, "String", object_class);
    bind_string_methods(vm, vm.core.string_class);

    vm.core.list_class = create_builtin(vm, "List", object_class);
    bind_list_methods(vm, vm.core.list_class);

    vm.core.map_class = create_builtin(vm, "Map", object_class);
    bind_map_methods(vm, vm.core.map_class);

    vm.core.range_class = create_builtin(vm, "Range", object_class);
    bind_range_methods(vm, vm.core.range_class);

    vm.core.fn_class = create_builtin(vm, "Fn", object_class);
    bind_fn_methods(vm, vm.core.fn_class);

    vm.core.fiber_class = create_builtin(vm, "Fiber", object_class);
    bind_fiber_methods(vm, vm.core.fiber_class);

    vm.core.system_class = create_builtin(vm, "System", object_class);
    bind_system_methods(vm, vm.core.system_class);

    let core_module = vm.alloc_module(None);
    vm.core.core_module = core_module;
    for (name, class) in [
        ("Object", object_class),
        ("Class", class_class),
        ("Null", vm.core.null_class),
        ("Bool", vm.core.bool_class),
        ("Num", vm.core.num_class),
        ("String", vm.core.string_class),
        ("List", vm.core.list_class),
        ("Map", vm.core.map_class),
        ("Range", vm.core.range_class),
        ("Fn", vm.core.fn_class),
        ("Fiber", vm.core.fiber_class),
        ("System", vm.core.system_class),
    ] {
        let value = Value::obj(class.cast());
        unsafe { core_module.as_ptr().as_mut().unwrap() }.define_variable(name, value);
    }

    repair_string_class_obj(vm);
}

/// Every string allocated while bootstrapping `Object`/`Class` (including
/// their own class names) was built before `string_class` existed, so its
/// header carries whatever dangling placeholder `vm.core` held at that
/// instant. Sweep those up now that the real class is in hand.
fn repair_string_class_obj(vm: &mut Vm) {
    let correct = Some(vm.core.string_class.cast());
    let mut node = vm.objects;
    while let Some(mut header) = node {
        let next = unsafe { header.as_ref() }.next;
        if unsafe { header.as_ref() }.obj_type == ObjType::String {
            unsafe { header.as_mut() }.class_obj = correct;
        }
        node = next;
    }
}

fn create_builtin(vm: &mut Vm, name: &str, object_class: NonNull<ClassObj>) -> NonNull<ClassObj> {
    let name = vm.alloc_string(name.as_bytes().to_vec());
    vm.create_user_class(name, object_class, 0)
}

fn bind(vm: &mut Vm, class: NonNull<ClassObj>, signature: &str, f: PrimitiveFn) {
    let symbol = vm.method_names.ensure(signature);
    unsafe { class.as_ptr().as_mut().unwrap() }
        .methods
        .set(symbol, Method::Primitive(f));
}

fn bind_fn_call(vm: &mut Vm, class: NonNull<ClassObj>, signature: &str) {
    let symbol = vm.method_names.ensure(signature);
    unsafe { class.as_ptr().as_mut().unwrap() }
        .methods
        .set(symbol, Method::FunctionCall);
}

fn bind_static(vm: &mut Vm, class: NonNull<ClassObj>, signature: &str, f: PrimitiveFn) {
    let meta = unsafe { class.as_ref() }
        .header
        .class_obj
        .expect("builtin classes always have a metaclass")
        .cast();
    bind(vm, meta, signature, f);
}

// ---------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------

fn expect_num(vm: &mut Vm, value: Value) -> Result<f64, Value> {
    value
        .as_num()
        .ok_or_else(|| vm.format_runtime_error("$ must be a number.", &[value.type_name()]))
}

fn expect_string(vm: &mut Vm, value: Value) -> Result<NonNull<StringObj>, Value> {
    match value.as_header() {
        Some(h) if value.is_obj_type(ObjType::String) => Ok(h.cast()),
        _ => Err(vm.format_runtime_error("$ must be a string.", &[value.type_name()])),
    }
}

fn ok(value: Value) -> PrimitiveOutcome {
    PrimitiveOutcome::Value(value)
}

// ---------------------------------------------------------------------
// Object
// ---------------------------------------------------------------------

fn bind_object_methods(vm: &mut Vm, class: NonNull<ClassObj>) {
    bind(vm, class, "==(_)", |vm, args| {
        ok(Value::Bool(values_equal(&args[0], &args[1])))
    });
    bind(vm, class, "!=(_)", |vm, args| {
        ok(Value::Bool(!values_equal(&args[0], &args[1])))
    });
    bind(vm, class, "is(_)", |vm, args| {
        let Some(class_header) = args[1].as_header().filter(|_| args[1].is_obj_type(ObjType::Class))
        else {
            return PrimitiveOutcome::Error(
                vm.format_runtime_error("$ must be a class.", &[args[1].type_name()]),
            );
        };
        let target: NonNull<ClassObj> = class_header.cast();
        let mut cursor = Some(vm.class_of(args[0]));
        while let Some(c) = cursor {
            if c == target {
                return ok(Value::Bool(true));
            }
            cursor = unsafe { c.as_ref() }.superclass;
        }
        ok(Value::Bool(false))
    });
    bind(vm, class, "toString", |vm, args| {
        let text = vm.stringify(args[0]);
        ok(Value::obj(vm.alloc_string(text.into_bytes()).cast()))
    });
    bind(vm, class, "type", |vm, args| {
        ok(Value::obj(vm.class_of(args[0]).cast()))
    });
    bind(vm, class, "!", |_vm, args| ok(Value::Bool(!args[0].is_truthy())));
}

// ---------------------------------------------------------------------
// Class
// ---------------------------------------------------------------------

fn bind_class_methods(vm: &mut Vm, class: NonNull<ClassObj>) {
    bind(vm, class, "name", |vm, args| {
        let Some(header) = args[0].as_header() else {
            return ok(Value::Null);
        };
        let c = unsafe { header.cast::<ClassObj>().as_ref() };
        ok(Value::obj(c.name.cast()))
    });
    bind(vm, class, "supertype", |_vm, args| {
        let Some(header) = args[0].as_header() else {
            return ok(Value::Null);
        };
        let c = unsafe { header.cast::<ClassObj>().as_ref() };
        ok(c.superclass.map_or(Value::Null, |s| Value::obj(s.cast())))
    });
    bind(vm, class, "toString", |vm, args| {
        let Some(header) = args[0].as_header() else {
            return ok(Value::Null);
        };
        let c = unsafe { header.cast::<ClassObj>().as_ref() };
        ok(Value::obj(c.name.cast()))
    });
}

// ---------------------------------------------------------------------
// Null
// ---------------------------------------------------------------------

fn bind_null_methods(vm: &mut Vm, class: NonNull<ClassObj>) {
    bind(vm, class, "!", |_vm, _args| ok(Value::Bool(true)));
    bind(vm, class, "toString", |vm, _args| {
        ok(Value::obj(vm.intern_string("null").cast()))
    });
}

// ---------------------------------------------------------------------
// Bool
// ---------------------------------------------------------------------

fn bind_bool_methods(vm: &mut Vm, class: NonNull<ClassObj>) {
    bind(vm, class, "!", |_vm, args| {
        ok(Value::Bool(!args[0].as_bool().unwrap_or(false)))
    });
    bind(vm, class, "toString", |vm, args| {
        let text = if args[0].as_bool().unwrap_or(false) { "true" } else { "false" };
        ok(Value::obj(vm.intern_string(text).cast()))
    });
}

// ---------------------------------------------------------------------
// Num
// ---------------------------------------------------------------------

fn bind_num_methods(vm: &mut Vm, class: NonNull<ClassObj>) {
    macro_rules! binop {
        ($sig:expr, $op:expr) => {
            bind(vm, class, $sig, |vm, args| {
                let x = match expect_num(vm, args[0]) {
                    Ok(v) => v,
                    Err(e) => return PrimitiveOutcome::Error(e),
                };
                let y = match expect_num(vm, args[1]) {
                    Ok(v) => v,
                    Err(e) => return PrimitiveOutcome::Error(e),
                };
                ok(Value::Num($op(x, y)))
            });
        };
    }
    macro_rules! cmp {
        ($sig:expr, $op:expr) => {
            bind(vm, class, $sig, |vm, args| {
                let x = match expect_num(vm, args[0]) {
                    Ok(v) => v,
                    Err(e) => return PrimitiveOutcome::Error(e),
                };
                let y = match expect_num(vm, args[1]) {
                    Ok(v) => v,
                    Err(e) => return PrimitiveOutcome::Error(e),
                };
                ok(Value::Bool($op(x, y)))
            });
        };
    }
    binop!("+(_)", |x: f64, y: f64| x + y);
    binop!("-(_)", |x: f64, y: f64| x - y);
    binop!("*(_)", |x: f64, y: f64| x * y);
    binop!("/(_)", |x: f64, y: f64| x / y);
    binop!("%(_)", |x: f64, y: f64| x % y);
    cmp!("<(_)", |x: f64, y: f64| x < y);
    cmp!("<=(_)", |x: f64, y: f64| x <= y);
    cmp!(">(_)", |x: f64, y: f64| x > y);
    cmp!(">=(_)", |x: f64, y: f64| x >= y);
    bind(vm, class, "==(_)", |vm, args| {
        ok(Value::Bool(values_equal(&args[0], &args[1])))
    });
    bind(vm, class, "!=(_)", |vm, args| {
        ok(Value::Bool(!values_equal(&args[0], &args[1])))
    });
    bind(vm, class, "-", |vm, args| {
        let x = match expect_num(vm, args[0]) {
            Ok(v) => v,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        ok(Value::Num(-x))
    });
    bind(vm, class, "&(_)", |vm, args| bitwise(vm, args, |x, y| x & y));
    bind(vm, class, "|(_)", |vm, args| bitwise(vm, args, |x, y| x | y));
    bind(vm, class, "^(_)", |vm, args| bitwise(vm, args, |x, y| x ^ y));
    bind(vm, class, "<<(_)", |vm, args| bitwise(vm, args, |x, y| x.wrapping_shl(y as u32)));
    bind(vm, class, ">>(_)", |vm, args| bitwise(vm, args, |x, y| x.wrapping_shr(y as u32)));
    bind(vm, class, "~", |vm, args| {
        let x = match expect_num(vm, args[0]) {
            Ok(v) => v,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        ok(Value::Num(!(x as i64) as f64))
    });
    bind(vm, class, "abs", |vm, args| num_unary(vm, args, f64::abs));
    bind(vm, class, "sqrt", |vm, args| num_unary(vm, args, f64::sqrt));
    bind(vm, class, "floor", |vm, args| num_unary(vm, args, f64::floor));
    bind(vm, class, "ceil", |vm, args| num_unary(vm, args, f64::ceil));
    bind(vm, class, "round", |vm, args| num_unary(vm, args, f64::round));
    bind(vm, class, "truncate", |vm, args| num_unary(vm, args, f64::trunc));
    bind(vm, class, "sign", |vm, args| num_unary(vm, args, f64::signum));
    bind(vm, class, "isNan", |vm, args| {
        let x = match expect_num(vm, args[0]) {
            Ok(v) => v,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        ok(Value::Bool(x.is_nan()))
    });
    bind(vm, class, "isInfinity", |vm, args| {
        let x = match expect_num(vm, args[0]) {
            Ok(v) => v,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        ok(Value::Bool(x.is_infinite()))
    });
    bind(vm, class, "toString", |vm, args| {
        let x = match expect_num(vm, args[0]) {
            Ok(v) => v,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        ok(Value::obj(vm.alloc_string(format!("{x}").into_bytes()).cast()))
    });
    bind_static(vm, class, "pi", |_vm, _args| ok(Value::Num(core::f64::consts::PI)));
    bind_static(vm, class, "infinity", |_vm, _args| ok(Value::Num(f64::INFINITY)));
    bind_static(vm, class, "nan", |_vm, _args| ok(Value::Num(f64::NAN)));
    bind_static(vm, class, "largest", |_vm, _args| ok(Value::Num(f64::MAX)));
    bind_static(vm, class, "smallest", |_vm, _args| ok(Value::Num(f64::MIN_POSITIVE)));
    bind_static(vm, class, "fromString(_)", |vm, args| {
        let s = match expect_string(vm, args[1]) {
            Ok(s) => s,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        let text = unsafe { s.as_ref() }.as_str_lossy();
        ok(text.trim().parse::<f64>().map_or(Value::Null, Value::Num))
    });
}

fn num_unary(vm: &mut Vm, args: &mut [Value], f: fn(f64) -> f64) -> PrimitiveOutcome {
    match expect_num(vm, args[0]) {
        Ok(x) => ok(Value::Num(f(x))),
        Err(e) => PrimitiveOutcome::Error(e),
    }
}

fn bitwise(vm: &mut Vm, args: &mut [Value], f: fn(i64, i64) -> i64) -> PrimitiveOutcome {
    let x = match expect_num(vm, args[0]) {
        Ok(v) => v,
        Err(e) => return PrimitiveOutcome::Error(e),
    };
    let y = match expect_num(vm, args[1]) {
        Ok(v) => v,
        Err(e) => return PrimitiveOutcome::Error(e),
    };
    ok(Value::Num(f(x as i64, y as i64) as f64))
}

// ---------------------------------------------------------------------
// String
// ---------------------------------------------------------------------

fn bind_string_methods(vm: &mut Vm, class: NonNull<ClassObj>) {
    bind(vm, class, "+(_)", |vm, args| {
        let a = match expect_string(vm, args[0]) {
            Ok(s) => s,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        let b = match expect_string(vm, args[1]) {
            Ok(s) => s,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        let mut bytes = unsafe { a.as_ref() }.bytes.clone();
        bytes.extend_from_slice(&unsafe { b.as_ref() }.bytes);
        ok(Value::obj(vm.alloc_string(bytes).cast()))
    });
    bind(vm, class, "==(_)", |vm, args| {
        ok(Value::Bool(values_equal(&args[0], &args[1])))
    });
    bind(vm, class, "!=(_)", |vm, args| {
        ok(Value::Bool(!values_equal(&args[0], &args[1])))
    });
    bind(vm, class, "count", |vm, args| {
        let s = match expect_string(vm, args[0]) {
            Ok(s) => s,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        ok(Value::Num(unsafe { s.as_ref() }.char_count() as f64))
    });
    bind(vm, class, "toString", |_vm, args| ok(args[0]));
    bind(vm, class, "contains(_)", |vm, args| {
        let haystack = match expect_string(vm, args[0]) {
            Ok(s) => s,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        let needle = match expect_string(vm, args[1]) {
            Ok(s) => s,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        let h = &unsafe { haystack.as_ref() }.bytes;
        let n = &unsafe { needle.as_ref() }.bytes;
        ok(Value::Bool(contains_subslice(h, n)))
    });
    bind(vm, class, "startsWith(_)", |vm, args| {
        let haystack = match expect_string(vm, args[0]) {
            Ok(s) => s,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        let needle = match expect_string(vm, args[1]) {
            Ok(s) => s,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        ok(Value::Bool(unsafe { haystack.as_ref() }.bytes.starts_with(&unsafe { needle.as_ref() }.bytes)))
    });
    bind(vm, class, "endsWith(_)", |vm, args| {
        let haystack = match expect_string(vm, args[0]) {
            Ok(s) => s,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        let needle = match expect_string(vm, args[1]) {
            Ok(s) => s,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        ok(Value::Bool(unsafe { haystack.as_ref() }.bytes.ends_with(&unsafe { needle.as_ref() }.bytes)))
    });
    bind(vm, class, "indexOf(_)", |vm, args| {
        let haystack = match expect_string(vm, args[0]) {
            Ok(s) => s,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        let needle = match expect_string(vm, args[1]) {
            Ok(s) => s,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        let h = &unsafe { haystack.as_ref() }.bytes;
        let n = &unsafe { needle.as_ref() }.bytes;
        ok(Value::Num(find_subslice(h, n).map_or(-1.0, |i| i as f64)))
    });
    bind(vm, class, "byteAt_(_)", |vm, args| {
        let s = match expect_string(vm, args[0]) {
            Ok(s) => s,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        let index = match expect_num(vm, args[1]) {
            Ok(v) => v,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        match list::resolve_index(index, unsafe { s.as_ref() }.bytes.len()) {
            Some(i) => ok(Value::Num(f64::from(unsafe { s.as_ref() }.bytes[i]))),
            None => PrimitiveOutcome::Error(vm.new_error("String byte index out of bounds.")),
        }
    });
    bind(vm, class, "[_]", |vm, args| string_subscript(vm, args[0], args[1]));
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    find_subslice(haystack, needle).is_some()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn string_subscript(vm: &mut Vm, receiver: Value, index: Value) -> PrimitiveOutcome {
    let s = match expect_string(vm, receiver) {
        Ok(s) => s,
        Err(e) => return PrimitiveOutcome::Error(e),
    };
    let string = unsafe { s.as_ref() };
    if let Some(i) = index.as_num() {
        match list::resolve_index(i, string.char_count()) {
            Some(char_index) => {
                let start = string.char_byte_offset(char_index).unwrap_or(0);
                let len = string.char_len_at(start);
                let bytes = string.bytes[start..start + len].to_vec();
                ok(Value::obj(vm.alloc_string(bytes).cast()))
            }
            None => PrimitiveOutcome::Error(vm.new_error("String index out of bounds.")),
        }
    } else {
        PrimitiveOutcome::Error(vm.format_runtime_error("$ cannot be used to index a string.", &[index.type_name()]))
    }
}

// ---------------------------------------------------------------------
// List
// ---------------------------------------------------------------------

fn bind_list_methods(vm: &mut Vm, class: NonNull<ClassObj>) {
    bind(vm, class, "add(_)", |_vm, args| {
        let Some(mut header) = args[0].as_header() else {
            return ok(args[1]);
        };
        unsafe { header.cast::<ListObj>().as_mut() }.elements.push(args[1]);
        ok(args[1])
    });
    bind(vm, class, "count", |_vm, args| {
        let header = args[0].as_header().expect("receiver is a list");
        ok(Value::Num(unsafe { header.cast::<ListObj>().as_ref() }.elements.len() as f64))
    });
    bind(vm, class, "clear()", |_vm, args| {
        let mut header = args[0].as_header().expect("receiver is a list");
        unsafe { header.cast::<ListObj>().as_mut() }.elements.clear();
        ok(Value::Null)
    });
    bind(vm, class, "insert(_,_)", |vm, args| {
        let mut header = args[0].as_header().expect("receiver is a list");
        let list = unsafe { header.cast::<ListObj>().as_mut() };
        let index = match expect_num(vm, args[1]) {
            Ok(v) => v,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        let len = list.elements.len();
        match list::resolve_index(index, len + 1) {
            Some(i) => {
                list.elements.insert(i, args[2]);
                ok(args[2])
            }
            None => PrimitiveOutcome::Error(vm.new_error("List index out of bounds.")),
        }
    });
    bind(vm, class, "removeAt(_)", |vm, args| {
        let mut header = args[0].as_header().expect("receiver is a list");
        let list = unsafe { header.cast::<ListObj>().as_mut() };
        let index = match expect_num(vm, args[1]) {
            Ok(v) => v,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        match list.resolve_index(index) {
            Some(i) => ok(list.elements.remove(i)),
            None => PrimitiveOutcome::Error(vm.new_error("List index out of bounds.")),
        }
    });
    bind(vm, class, "swap(_,_)", |vm, args| {
        let mut header = args[0].as_header().expect("receiver is a list");
        let list = unsafe { header.cast::<ListObj>().as_mut() };
        let i = match expect_num(vm, args[1]).and_then(|v| list.resolve_index(v).ok_or_else(|| vm.new_error("List index out of bounds."))) {
            Ok(v) => v,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        let j = match expect_num(vm, args[2]).and_then(|v| list.resolve_index(v).ok_or_else(|| vm.new_error("List index out of bounds."))) {
            Ok(v) => v,
            Err(e) => return PrimitiveOutcome::Error(e),
        };
        list.elements.swap(i, j);
        ok(Value::Null)
    });
    bind(vm, class, "[_]", |vm, args| list_get_subscript(vm, args[0], args[1]));
    bind(vm, class, "[_]=(_)", |vm, args| {
        match list_set_subscript(vm, args[0], args[1], args[2]) {
            Ok(()) => ok(args[2]),
            Err(e) => PrimitiveOutcome::Error(e),
        }
    });
    bind(vm, class, "iterate(_)", |vm, args| iterate(vm, args[0], args[1]).map_or_else(PrimitiveOutcome::Error, ok));
    bind(vm, class, "iteratorValue(_)", |vm, args| {
        iterator_value(vm, args[0], args[1]).map_or_else(PrimitiveOutcome::Error, ok)
    });
}

fn list_get_subscript(vm: &mut Vm, receiver: Value, index: Value) -> PrimitiveOutcome {
    let header = receiver.as_header().expect("receiver is a list");
    let list = unsafe { header.cast::<ListObj>().as_ref() };
    let Some(i) = index.as_num() else {
        return PrimitiveOutcome::Error(vm.format_runtime_error("$ cannot be used to index a list.", &[index.type_name()]));
    };
    match list.resolve_index(i) {
        Some(i) => ok(list.elements[i]),
        None => PrimitiveOutcome::Error(vm.new_error("List index out of bounds.")),
    }
}

fn list_set_subscript(vm: &mut Vm, receiver: Value, index: Value, value: Value) -> Result<(), Value> {
    let mut header = receiver.as_header().expect("receiver is a list");
    let list = unsafe { header.cast::<ListObj>().as_mut() };
    let Some(i) = index.as_num() else {
        return Err(vm.format_runtime_error("$ cannot be used to index a list.", &[index.type_name()]));
    };
    match list.resolve_index(i) {
        Some(i) => {
            list.elements[i] = value;
            Ok(())
        }
        None => Err(vm.new_error("List index out of bounds.")),
    }
}

// ---------------------------------------------------------------------
// Map
// ---------------------------------------------------------------------

fn bind_map_methods(vm: &mut Vm, class: NonNull<ClassObj>) {
    bind(vm, class, "count", |_vm, args| {
        let header = args[0].as_header().expect("receiver is a map");
        ok(Value::Num(unsafe { header.cast::<MapObj>().as_ref() }.len() as f64))
    });
    bind(vm, class, "containsKey(_)", |vm, args| {
        let header = args[0].as_header().expect("receiver is a map");
        let map = unsafe { header.cast::<MapObj>().as_ref() };
        if !crate::hashing::validate_key(&args[1]) {
            return PrimitiveOutcome::Error(vm.new_error("Key must be immutable."));
        }
        ok(Value::Bool(map.contains_key(&args[1])))
    });
    bind(vm, class, "remove(_)", |vm, args| {
        let mut header = args[0].as_header().expect("receiver is a map");
        let map = unsafe { header.cast::<MapObj>().as_mut() };
        if !crate::hashing::validate_key(&args[1]) {
            return PrimitiveOutcome::Error(vm.new_error("Key must be immutable."));
        }
        ok(map.remove(&args[1]).unwrap_or(Value::Null))
    });
    bind(vm, class, "clear()", |_vm, args| {
        let mut header = args[0].as_header().expect("receiver is a map");
        unsafe { header.cast::<MapObj>().as_mut() }.clear();
        ok(Value::Null)
    });
    bind(vm, class, "[_]", |vm, args| map_get_subscript(vm, args[0], args[1]));
    bind(vm, class, "[_]=(_)", |vm, args| {
        match map_set_subscript(vm, args[0], args[1], args[2]) {
            Ok(()) => ok(args[2]),
            Err(e) => PrimitiveOutcome::Error(e),
        }
    });
    bind(vm, class, "iterate(_)", |vm, args| iterate(vm, args[0], args[1]).map_or_else(PrimitiveOutcome::Error, ok));
    bind(vm, class, "keyIteratorValue_(_)", |vm, args| {
        map_cursor_entry(vm, args[0], args[1]).map_or_else(PrimitiveOutcome::Error, |(k, _)| ok(k))
    });
    bind(vm, class, "valueIteratorValue_(_)", |vm, args| {
        map_cursor_entry(vm, args[0], args[1]).map_or_else(PrimitiveOutcome::Error, |(_, v)| ok(v))
    });
}

fn map_get_subscript(vm: &mut Vm, receiver: Value, key: Value) -> PrimitiveOutcome {
    if !crate::hashing::validate_key(&key) {
        return PrimitiveOutcome::Error(vm.new_error("Key must be immutable."));
    }
    let header = receiver.as_header().expect("receiver is a map");
    let map = unsafe { header.cast::<MapObj>().as_ref() };
    ok(map.get(&key).unwrap_or(Value::Null))
}

fn map_set_subscript(vm: &mut Vm, receiver: Value, key: Value, value: Value) -> Result<(), Value> {
    if !crate::hashing::validate_key(&key) {
        return Err(vm.new_error("Key must be immutable."));
    }
    let mut header = receiver.as_header().expect("receiver is a map");
    let map = unsafe { header.cast::<MapObj>().as_mut() };
    map.insert(key, value).map(|_| ()).map_err(|_| vm.new_error("Key must be immutable."))
}

/// Shared by `keyIteratorValue_`/`valueIteratorValue_`: `it` is the slot
/// index `Map.iterate` last returned.
fn map_cursor_entry(vm: &mut Vm, receiver: Value, it: Value) -> Result<(Value, Value), Value> {
    let header = receiver.as_header().expect("receiver is a map");
    let map = unsafe { header.cast::<MapObj>().as_ref() };
    let Some(cursor) = it.as_num() else {
        return Err(vm.new_error("Invalid map iterator."));
    };
    map.entry_at(cursor as usize)
        .ok_or_else(|| vm.new_error("Invalid map iterator."))
}

// ---------------------------------------------------------------------
// Range
// ---------------------------------------------------------------------

fn bind_range_methods(vm: &mut Vm, class: NonNull<ClassObj>) {
    bind(vm, class, "from", |_vm, args| {
        let header = args[0].as_header().expect("receiver is a range");
        ok(Value::Num(unsafe { header.cast::<RangeObj>().as_ref() }.from))
    });
    bind(vm, class, "to", |_vm, args| {
        let header = args[0].as_header().expect("receiver is a range");
        ok(Value::Num(unsafe { header.cast::<RangeObj>().as_ref() }.to))
    });
    bind(vm, class, "isInclusive", |_vm, args| {
        let header = args[0].as_header().expect("receiver is a range");
        ok(Value::Bool(unsafe { header.cast::<RangeObj>().as_ref() }.is_inclusive))
    });
    bind(vm, class, "min", |_vm, args| {
        let header = args[0].as_header().expect("receiver is a range");
        let r = unsafe { header.cast::<RangeObj>().as_ref() };
        ok(Value::Num(r.from.min(r.to)))
    });
    bind(vm, class, "max", |_vm, args| {
        let header = args[0].as_header().expect("receiver is a range");
        let r = unsafe { header.cast::<RangeObj>().as_ref() };
        ok(Value::Num(r.from.max(r.to)))
    });
    bind(vm, class, "iterate(_)", |vm, args| iterate(vm, args[0], args[1]).map_or_else(PrimitiveOutcome::Error, ok));
    bind(vm, class, "iteratorValue(_)", |vm, args| {
        iterator_value(vm, args[0], args[1]).map_or_else(PrimitiveOutcome::Error, ok)
    });
}

// ---------------------------------------------------------------------
// Fn
// ---------------------------------------------------------------------

fn bind_fn_methods(vm: &mut Vm, class: NonNull<ClassObj>) {
    bind(vm, class, "arity", |_vm, args| {
        let header = args[0].as_header().expect("receiver is a closure");
        let closure = unsafe { header.cast::<ClosureObj>().as_ref() };
        ok(Value::Num(f64::from(unsafe { closure.function.as_ref() }.arity)))
    });
    for arity in 0..=16 {
        let params = vec!["_"; arity].join(",");
        bind_fn_call(vm, class, &format!("call({params})"));
    }
}

/// Validate a `Fn.call(...)` invocation and return the callee closure the
/// interpreter should push a fresh frame for.
///
/// # Errors
/// Returns the runtime error value if `receiver` is not a closure or the
/// argument count doesn't match its declared arity.
pub fn resolve_fn_call(vm: &mut Vm, receiver: Value, argc: usize) -> Result<NonNull<ClosureObj>, Value> {
    let Some(header) = receiver.as_header().filter(|_| receiver.is_obj_type(ObjType::Closure)) else {
        return Err(vm.format_runtime_error("$ is not a function.", &[receiver.type_name()]));
    };
    let closure: NonNull<ClosureObj> = header.cast();
    let arity = unsafe { closure.as_ref().function.as_ref() }.arity as usize;
    if arity != argc {
        return Err(vm.format_runtime_error(
            "Function expects $ argument(s).",
            &[&arity.to_string()],
        ));
    }
    Ok(closure)
}

// ---------------------------------------------------------------------
// Fiber
// ---------------------------------------------------------------------

fn bind_fiber_methods(vm: &mut Vm, class: NonNull<ClassObj>) {
    bind_static(vm, class, "new(_)", |vm, args| {
        let Some(header) = args[1].as_header().filter(|_| args[1].is_obj_type(ObjType::Closure)) else {
            return PrimitiveOutcome::Error(vm.format_runtime_error("$ is not a function.", &[args[1].type_name()]));
        };
        let fiber = vm.alloc_fiber(Some(header.cast()));
        ok(Value::obj(fiber.cast()))
    });
    bind_static(vm, class, "current", |vm, _args| {
        ok(vm.fiber.map_or(Value::Null, |f| Value::obj(f.cast())))
    });
    bind_static(vm, class, "yield()", |vm, _args| fiber_yield(vm, Value::Null));
    bind_static(vm, class, "yield(_)", |vm, args| fiber_yield(vm, args[1]));
    bind_static(vm, class, "abort(_)", |vm, args| PrimitiveOutcome::Error(args[1]));

    bind(vm, class, "call()", |vm, args| fiber_call(vm, args[0], Value::Null, false));
    bind(vm, class, "call(_)", |vm, args| fiber_call(vm, args[0], args[1], false));
    bind(vm, class, "transfer()", |vm, args| fiber_call(vm, args[0], Value::Null, true));
    bind(vm, class, "transfer(_)", |vm, args| fiber_call(vm, args[0], args[1], true));
    bind(vm, class, "try()", |vm, args| fiber_try(vm, args[0]));
    bind(vm, class, "isDone", |_vm, args| {
        let header = args[0].as_header().expect("receiver is a fiber");
        ok(Value::Bool(unsafe { header.cast::<FiberObj>().as_ref() }.is_done))
    });
    bind(vm, class, "error", |_vm, args| {
        let header = args[0].as_header().expect("receiver is a fiber");
        ok(unsafe { header.cast::<FiberObj>().as_ref() }.error)
    });
}

/// Resize a not-yet-started fiber's stack so its entry closure's registers
/// are addressable, placing `value` at the slot a `CALLK` would have used
/// for a block method's sole argument.
fn prime_fiber_stack(mut fiber: NonNull<FiberObj>, value: Value) {
    let f = unsafe { fiber.as_mut() };
    if !f.stack.is_empty() || f.frames.is_empty() {
        return;
    }
    let max_slots = unsafe { f.frames[0].closure.as_ref().function.as_ref() }.max_slots as usize;
    f.stack.resize(max_slots.max(2), Value::Null);
    f.stack[1] = value;
}

fn deliver_into_resume_slot(mut fiber: NonNull<FiberObj>, value: Value) {
    let f = unsafe { fiber.as_mut() };
    // The register to resume into is wherever this fiber's own suspending
    // call landed, not necessarily its current frame's register 0. A
    // fiber that suspends after assigning its `CALLK` result to a local
    // other than register 0 would otherwise have that local overwritten.
    if let Some(dest) = f.last_call_reg.or_else(|| f.frames.last().map(|fr| fr.stack_start)) {
        if dest < f.stack.len() {
            f.stack[dest] = value;
        }
    }
}

fn fiber_call(vm: &mut Vm, receiver: Value, value: Value, is_transfer: bool) -> PrimitiveOutcome {
    let Some(header) = receiver.as_header().filter(|_| receiver.is_obj_type(ObjType::Fiber)) else {
        return PrimitiveOutcome::Error(vm.format_runtime_error("$ is not a fiber.", &[receiver.type_name()]));
    };
    let mut target: NonNull<FiberObj> = header.cast();
    if unsafe { target.as_ref() }.is_done {
        return PrimitiveOutcome::Error(vm.new_error("Cannot call a finished fiber."));
    }
    if unsafe { target.as_ref() }.stack.is_empty() {
        prime_fiber_stack(target, value);
    } else {
        deliver_into_resume_slot(target, value);
    }
    if !is_transfer {
        unsafe { target.as_mut() }.caller = vm.fiber;
    }
    vm.fiber = Some(target);
    PrimitiveOutcome::FiberSwitch
}

fn fiber_try(vm: &mut Vm, receiver: Value) -> PrimitiveOutcome {
    let Some(header) = receiver.as_header().filter(|_| receiver.is_obj_type(ObjType::Fiber)) else {
        return PrimitiveOutcome::Error(vm.format_runtime_error("$ is not a fiber.", &[receiver.type_name()]));
    };
    let mut target: NonNull<FiberObj> = header.cast();
    if unsafe { target.as_ref() }.stack.is_empty() {
        prime_fiber_stack(target, Value::Null);
    }
    unsafe {
        target.as_mut().state = FiberState::Try;
        target.as_mut().caller = vm.fiber;
    }
    vm.fiber = Some(target);
    PrimitiveOutcome::FiberSwitch
}

fn fiber_yield(vm: &mut Vm, value: Value) -> PrimitiveOutcome {
    let Some(mut current) = vm.fiber else {
        return PrimitiveOutcome::Error(vm.new_error("No fiber to yield from."));
    };
    let caller = unsafe { current.as_ref() }.caller;
    unsafe { current.as_mut() }.caller = None;
    match caller {
        Some(c) => {
            deliver_into_resume_slot(c, value);
            vm.fiber = Some(c);
        }
        None => vm.fiber = None,
    }
    PrimitiveOutcome::FiberSwitch
}

// ---------------------------------------------------------------------
// System
// ---------------------------------------------------------------------

fn bind_system_methods(vm: &mut Vm, class: NonNull<ClassObj>) {
    bind_static(vm, class, "write_(_)", |vm, args| {
        let text = vm.stringify(args[1]);
        if let Some(cb) = vm.config.write_fn.as_mut() {
            cb(&text);
        }
        ok(args[1])
    });
}

// ---------------------------------------------------------------------
// Iteration and subscript protocol (opcode-driven, not method-table driven)
// ---------------------------------------------------------------------

/// `ITERATE seq, it`: advance (or start, if `it` is `null`) an iteration
/// cursor; `false` signals exhaustion.
///
/// # Errors
/// Propagates an instance/class override's error, or a type error if
/// `seq` is not an iterable built-in and has no `iterate(_)` override.
pub fn iterate(vm: &mut Vm, seq: Value, it: Value) -> Result<Value, Value> {
    if let Some(result) = vm.try_overload(seq, it, crate::vm::overload_symbol::ITERATE) {
        return result;
    }
    match seq.obj_type() {
        Some(ObjType::List) => {
            let header = seq.as_header().unwrap();
            let len = unsafe { header.cast::<ListObj>().as_ref() }.elements.len();
            let next = match it {
                Value::Null => 0,
                Value::Num(n) => n as usize + 1,
                _ => return Err(vm.new_error("Invalid iterator.")),
            };
            Ok(if next < len { Value::Num(next as f64) } else { Value::Bool(false) })
        }
        Some(ObjType::Map) => {
            let header = seq.as_header().unwrap();
            let map = unsafe { header.cast::<MapObj>().as_ref() };
            let start = match it {
                Value::Null => 0,
                Value::Num(n) => n as usize + 1,
                _ => return Err(vm.new_error("Invalid iterator.")),
            };
            Ok(map.next_cursor(start).map_or(Value::Bool(false), |c| Value::Num(c as f64)))
        }
        Some(ObjType::Range) => {
            let header = seq.as_header().unwrap();
            let range = unsafe { header.cast::<RangeObj>().as_ref() };
            let next = match it {
                Value::Null => range.from,
                Value::Num(n) => n + range.step(),
                _ => return Err(vm.new_error("Invalid iterator.")),
            };
            Ok(if range.is_past_end(next) { Value::Bool(false) } else { Value::Num(next) })
        }
        Some(ObjType::String) => {
            let header = seq.as_header().unwrap();
            let s = unsafe { header.cast::<StringObj>().as_ref() };
            let next = match it {
                Value::Null => 0,
                Value::Num(n) => n as usize + 1,
                _ => return Err(vm.new_error("Invalid iterator.")),
            };
            Ok(if next < s.char_count() { Value::Num(next as f64) } else { Value::Bool(false) })
        }
        _ => Err(vm.format_runtime_error("$ is not iterable.", &[seq.type_name()])),
    }
}

/// `ITERATORVALUE seq, it`: project a cursor produced by [`iterate`] into
/// the value at that position.
///
/// # Errors
/// Propagates an instance/class override's error, or a type error if
/// `seq` is not iterable.
pub fn iterator_value(vm: &mut Vm, seq: Value, it: Value) -> Result<Value, Value> {
    if let Some(result) = vm.try_overload(seq, it, crate::vm::overload_symbol::ITERATOR_VALUE) {
        return result;
    }
    match seq.obj_type() {
        Some(ObjType::List) => {
            let header = seq.as_header().unwrap();
            let list = unsafe { header.cast::<ListObj>().as_ref() };
            let Some(i) = it.as_num() else {
                return Err(vm.new_error("Invalid iterator."));
            };
            list.elements
                .get(i as usize)
                .copied()
                .ok_or_else(|| vm.new_error("Iterator out of bounds."))
        }
        Some(ObjType::Map) => {
            let header = seq.as_header().unwrap();
            let map = unsafe { header.cast::<MapObj>().as_ref() };
            let Some(i) = it.as_num() else {
                return Err(vm.new_error("Invalid iterator."));
            };
            let (key, value) = map.entry_at(i as usize).ok_or_else(|| vm.new_error("Invalid map iterator."))?;
            let entry = vm.alloc_map_entry(key, value);
            Ok(Value::obj(entry.cast()))
        }
        Some(ObjType::Range) => Ok(it),
        Some(ObjType::String) => {
            let header = seq.as_header().unwrap();
            let s = unsafe { header.cast::<StringObj>().as_ref() };
            let Some(i) = it.as_num() else {
                return Err(vm.new_error("Invalid iterator."));
            };
            let start = s.char_byte_offset(i as usize).ok_or_else(|| vm.new_error("Iterator out of bounds."))?;
            let len = s.char_len_at(start);
            let bytes = s.bytes[start..start + len].to_vec();
            Ok(Value::obj(vm.alloc_string(bytes).cast()))
        }
        _ => Err(vm.format_runtime_error("$ is not iterable.", &[seq.type_name()])),
    }
}

/// `GETSUB receiver, index`: subscript read, for the built-in collections
/// plus any instance/class that overrides `[_]`.
///
/// # Errors
/// Propagates an override's error, or a type/bounds error for the built-ins.
pub fn subscript_get(vm: &mut Vm, receiver: Value, index: Value) -> Result<Value, Value> {
    if let Some(result) = vm.try_overload(receiver, index, crate::vm::overload_symbol::SUBSCRIPT_GET) {
        return result;
    }
    match receiver.obj_type() {
        Some(ObjType::List) => match list_get_subscript(vm, receiver, index) {
            PrimitiveOutcome::Value(v) => Ok(v),
            PrimitiveOutcome::Error(e) => Err(e),
            PrimitiveOutcome::FiberSwitch => Ok(Value::Null),
        },
        Some(ObjType::Map) => match map_get_subscript(vm, receiver, index) {
            PrimitiveOutcome::Value(v) => Ok(v),
            PrimitiveOutcome::Error(e) => Err(e),
            PrimitiveOutcome::FiberSwitch => Ok(Value::Null),
        },
        Some(ObjType::String) => match string_subscript(vm, receiver, index) {
            PrimitiveOutcome::Value(v) => Ok(v),
            PrimitiveOutcome::Error(e) => Err(e),
            PrimitiveOutcome::FiberSwitch => Ok(Value::Null),
        },
        _ => Err(vm.format_runtime_error("$ does not support `[_]`.", &[receiver.type_name()])),
    }
}

/// `SETSUB receiver, index, value`: subscript write, for `List`/`Map` plus
/// any instance/class that overrides `[_]=(_)`.
///
/// # Errors
/// Propagates an override's error, or a type/bounds error for the built-ins.
pub fn subscript_set(vm: &mut Vm, receiver: Value, index: Value, value: Value) -> Result<(), Value> {
    if let Some(result) = vm.try_overload(receiver, index, crate::vm::overload_symbol::SUBSCRIPT_SET) {
        return result.map(|_| ());
    }
    match receiver.obj_type() {
        Some(ObjType::List) => list_set_subscript(vm, receiver, index, value),
        Some(ObjType::Map) => map_set_subscript(vm, receiver, index, value),
        _ => Err(vm.format_runtime_error("$ does not support `[_]=(_)`.", &[receiver.type_name()])),
    }
}
