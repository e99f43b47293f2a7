// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Fibers: cooperative, single-threaded coroutines.
//!
//! Each fiber owns its own value stack and call-frame stack, an intrusive
//! list of the upvalues it has opened (kept sorted by descending stack
//! address so the common "capture the most recent slot" case is O(1) and
//! reuse of an existing capture is found before address order breaks
//! down), and a link back to whichever fiber transferred control to it.
//! That caller link is how an uncaught runtime error unwinds: each fiber
//! propagates its error to its caller until one marked `Try` catches it or
//! the root fiber is reached and the whole interpretation aborts.

use core::ptr::NonNull;

use crate::object::closure::ClosureObj;
use crate::object::header::ObjHeader;
use crate::object::upvalue::UpvalueObj;
use crate::value::Value;

/// One activation record: which closure is running, where in its bytecode,
/// and where its registers begin on the shared value stack.
pub struct CallFrame {
    pub closure: NonNull<ClosureObj>,
    pub ip: usize,
    pub stack_start: usize,
}

/// How a fiber was started and how errors inside it should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// The fiber the host started interpretation on; an uncaught error here
    /// aborts the whole interpretation.
    Root,
    /// Started via `Fiber.call`/`Fiber.transfer`; an uncaught error
    /// propagates to `caller`.
    Other,
    /// Started via `Fiber.try`; an uncaught error is caught here instead of
    /// propagating further, and `error` holds it.
    Try,
}

#[repr(C)]
pub struct FiberObj {
    pub header: ObjHeader,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// Head of the descending-address open-upvalue list.
    pub open_upvalues: Option<NonNull<UpvalueObj>>,
    pub caller: Option<NonNull<FiberObj>>,
    pub state: FiberState,
    /// `Null` while no error is pending; otherwise the error that
    /// unwound this fiber (or the value `Fiber.try` caught).
    pub error: Value,
    /// `true` once this fiber has run to completion or errored and can no
    /// longer be resumed.
    pub is_done: bool,
    /// The absolute stack index of the register that the `CALLK` currently
    /// suspended on this fiber wrote its receiver into. This is where a
    /// resuming `Fiber.call`/`yield`/`transfer`, a matching `return`, or a
    /// caught error must land its value. Call-site-specific, not always
    /// register 0 of the frame. `None` until a suspending call is dispatched.
    pub last_call_reg: Option<usize>,
}

impl FiberObj {
    #[must_use]
    pub fn new(header: ObjHeader, state: FiberState) -> Self {
        Self {
            header,
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: None,
            caller: None,
            state,
            error: Value::Null,
            is_done: false,
            last_call_reg: None,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("pop from empty fiber stack")
    }

    #[must_use]
    pub fn peek(&self, depth_from_top: usize) -> Value {
        self.stack[self.stack.len() - 1 - depth_from_top]
    }

    #[must_use]
    pub fn current_frame(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    #[must_use]
    pub fn current_frame_mut(&mut self) -> Option<&mut CallFrame> {
        self.frames.last_mut()
    }

    /// Find an already-open upvalue aliasing `slot`, if one exists,
    /// searching outward from the head (highest address first).
    #[must_use]
    pub fn find_open_upvalue(&self, slot: NonNull<Value>) -> Option<NonNull<UpvalueObj>> {
        let mut cursor = self.open_upvalues;
        while let Some(upvalue_ptr) = cursor {
            let upvalue = unsafe { upvalue_ptr.as_ref() };
            match upvalue.open_slot() {
                Some(open) if open == slot => return Some(upvalue_ptr),
                Some(open) if (open.as_ptr() as usize) < (slot.as_ptr() as usize) => return None,
                _ => {}
            }
            cursor = upvalue.next_open;
        }
        None
    }

    /// Insert a freshly allocated, still-open upvalue into the list,
    /// keeping descending-address order.
    pub fn insert_open_upvalue(&mut self, mut new_upvalue: NonNull<UpvalueObj>) {
        let slot = unsafe { new_upvalue.as_ref() }
            .open_slot()
            .expect("newly opened upvalue must be open");

        let mut prev: Option<NonNull<UpvalueObj>> = None;
        let mut cursor = self.open_upvalues;
        while let Some(cursor_ptr) = cursor {
            let cursor_ref = unsafe { cursor_ptr.as_ref() };
            let Some(cursor_slot) = cursor_ref.open_slot() else {
                break;
            };
            if (cursor_slot.as_ptr() as usize) < (slot.as_ptr() as usize) {
                break;
            }
            prev = cursor;
            cursor = cursor_ref.next_open;
        }

        unsafe {
            new_upvalue.as_mut().next_open = cursor;
        }
        match prev {
            Some(mut prev_ptr) => unsafe { prev_ptr.as_mut().next_open = Some(new_upvalue) },
            None => self.open_upvalues = Some(new_upvalue),
        }
    }

    /// Close every open upvalue whose slot is at or above `floor` (i.e.
    /// belongs to a frame being popped), unlinking it from the open list.
    pub fn close_upvalues_above(&mut self, floor: NonNull<Value>) {
        while let Some(mut upvalue_ptr) = self.open_upvalues {
            let upvalue = unsafe { upvalue_ptr.as_mut() };
            let Some(slot) = upvalue.open_slot() else {
                break;
            };
            if (slot.as_ptr() as usize) < (floor.as_ptr() as usize) {
                break;
            }
            self.open_upvalues = upvalue.next_open;
            upvalue.next_open = None;
            upvalue.close();
        }
    }
}
