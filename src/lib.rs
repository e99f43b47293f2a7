// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! # Wren VM
//!
//! Execution core for the Wren scripting language: a register-based
//! bytecode interpreter, a tracing mark-and-sweep collector, the built-in
//! object model (classes, instances, closures, fibers, collections), and
//! the slot-based API a host embeds it with.
//!
//! This crate does not include a compiler, CLI, or module loader; it
//! consumes [`object::function::FnObj`] values assembled by an external
//! front end and executes them.

pub mod api;
pub mod bytecode;
pub mod error;
pub mod gc;
pub mod handle;
pub mod hashing;
pub mod object;
pub mod primitives;
pub mod symbol;
pub mod value;
pub mod vm;

pub use api::{SlotType, Wren};
pub use error::InterpretResult;
pub use handle::Handle;
pub use value::Value;
pub use vm::{Config, ErrorKind, Vm};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
