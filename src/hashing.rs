// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Hashing and structural equality for [`Value`].
//!
//! Hash algorithm by type:
//! - Strings: FNV-1a over the byte content.
//! - Numbers (and the immediate `Null`/`Bool` tags): the Wang integer mix
//!   applied to the value's raw bit pattern.
//! - Ranges: a composition of the component hashes of `from`, `to` and
//!   `isInclusive`.
//! - Classes: recursive over the class name.
//! - Functions: a composition of arity and code length, standing in for
//!   identity (two distinct function objects must not collide in practice,
//!   but *may*; a hash only needs to be consistent, not unique).
//!
//! Only immutable value types are valid map keys ([`validate_key`]); lists,
//! maps and instances are rejected because their content (and thus their
//! hash) can change after insertion.

use crate::object::header::ObjType;
use crate::object::range::RangeObj;
use crate::object::string_obj::StringObj;
use crate::value::Value;

/// FNV-1a over a byte string.
#[must_use]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01B3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Wang's 64-bit integer mix, used to hash numbers and other immediate
/// values via their raw bit pattern.
#[must_use]
pub fn wang_mix(mut key: u64) -> u64 {
    key = (!key).wrapping_add(key << 21);
    key ^= key >> 24;
    key = key.wrapping_add(key << 3).wrapping_add(key << 8);
    key ^= key >> 14;
    key = key.wrapping_add(key << 2).wrapping_add(key << 4);
    key ^= key >> 28;
    key = key.wrapping_add(key << 31);
    key
}

/// `true` if `value` is an accepted map key type.
#[must_use]
pub fn validate_key(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(_) | Value::Num(_) => true,
        Value::Undefined => false,
        Value::Obj(_) => matches!(
            value.obj_type(),
            Some(ObjType::String | ObjType::Range | ObjType::Class | ObjType::Fn | ObjType::Closure)
        ),
    }
}

/// Hash a value. Caller must have already checked [`validate_key`]; hashing
/// an unsupported type falls back to a tag-only hash rather than panicking.
#[must_use]
pub fn hash_value(value: &Value) -> u64 {
    match value {
        Value::Null => wang_mix(0),
        Value::Bool(b) => wang_mix(u64::from(*b)),
        Value::Undefined => wang_mix(u64::MAX),
        Value::Num(n) => wang_mix(n.to_bits()),
        Value::Obj(header) => match value.obj_type() {
            Some(ObjType::String) => {
                // SAFETY: header points at a live StringObj.
                let s = unsafe { header.cast::<StringObj>().as_ref() };
                s.hash
            }
            Some(ObjType::Range) => {
                // SAFETY: header points at a live RangeObj.
                let r = unsafe { header.cast::<RangeObj>().as_ref() };
                wang_mix(r.from.to_bits())
                    ^ wang_mix(r.to.to_bits()).rotate_left(1)
                    ^ wang_mix(u64::from(r.is_inclusive)).rotate_left(2)
            }
            Some(ObjType::Class) => {
                let c = unsafe { header.cast::<crate::object::class::ClassObj>().as_ref() };
                let name = unsafe { c.name.as_ref() };
                fnv1a(&name.bytes).rotate_left(7)
            }
            Some(ObjType::Fn) => {
                let f = unsafe { header.cast::<crate::object::function::FnObj>().as_ref() };
                wang_mix(u64::from(f.arity)) ^ wang_mix(f.code.len() as u64).rotate_left(3)
            }
            Some(ObjType::Closure) => {
                let c = unsafe { header.cast::<crate::object::closure::ClosureObj>().as_ref() };
                let f = unsafe { c.function.as_ref() };
                hash_value(&Value::obj(core::ptr::NonNull::from(&f.header))).rotate_left(5)
            }
            _ => wang_mix(header.as_ptr() as u64),
        },
    }
}

/// Structural equality matching the contract required of map keys and the
/// `==` fallback operator: strings compare by content, everything else
/// (including object identity for lists/maps/instances) compares by
/// pointer/tag identity.
#[must_use]
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) | (Value::Undefined, Value::Undefined) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Obj(x), Value::Obj(y)) => {
            if x == y {
                return true;
            }
            match (a.obj_type(), b.obj_type()) {
                (Some(ObjType::String), Some(ObjType::String)) => {
                    let sa = unsafe { x.cast::<StringObj>().as_ref() };
                    let sb = unsafe { y.cast::<StringObj>().as_ref() };
                    sa.hash == sb.hash && sa.bytes == sb.bytes
                }
                (Some(ObjType::Range), Some(ObjType::Range)) => {
                    let ra = unsafe { x.cast::<RangeObj>().as_ref() };
                    let rb = unsafe { y.cast::<RangeObj>().as_ref() };
                    ra.from == rb.from && ra.to == rb.to && ra.is_inclusive == rb.is_inclusive
                }
                _ => false,
            }
        }
        _ => false,
    }
}
