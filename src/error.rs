// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Interpretation results and the runtime error-message mini-formatter.

/// Outcome of [`crate::vm::Vm::interpret`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Success,
    CompileError,
    RuntimeError,
}

/// Build a runtime error message from a template where `$` interpolates a
/// string argument and `@` interpolates an already-stringified value;
/// every other character is copied literally.
///
/// Arguments are consumed in order, one per `$`/`@` placeholder.
#[must_use]
pub fn format_error(template: &str, args: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    for ch in template.chars() {
        match ch {
            '$' | '@' => {
                if let Some(arg) = args.next() {
                    out.push_str(arg);
                }
            }
            other => out.push(other),
        }
    }
    out
}
