// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Append-only name interners.
//!
//! Two distinct tables use this same structure: a single VM-wide table
//! mapping method names to dense `u16` symbols shared by every class's
//! method table, and one per-module table mapping top-level variable names
//! to indices into that module's variable array. Both only ever grow:
//! existing symbols never change meaning, which is what lets bytecode
//! reference them by raw index instead of by name.

/// A dense, append-only name-to-index table.
#[derive(Default)]
pub struct SymbolTable {
    names: Vec<String>,
}

impl SymbolTable {
    #[must_use]
    pub fn new() -> Self {
        Self { names: Vec::new() }
    }

    /// Look up `name`, returning its existing symbol if interned.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Intern `name`, reusing an existing symbol if already present.
    pub fn ensure(&mut self, name: &str) -> usize {
        if let Some(existing) = self.find(name) {
            return existing;
        }
        self.names.push(name.to_string());
        self.names.len() - 1
    }

    /// Add `name` unconditionally, even if already present. Used when
    /// duplicate declarations must be distinguishable (for example a
    /// module re-declaring a variable it will immediately report as an
    /// error through another channel).
    pub fn add(&mut self, name: &str) -> usize {
        self.names.push(name.to_string());
        self.names.len() - 1
    }

    #[must_use]
    pub fn name(&self, symbol: usize) -> Option<&str> {
        self.names.get(symbol).map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
