// Copyright (C) 2025 The Direktiv Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Glob matching for error catchers, retry codes and event filters.

use glob::Pattern;

/// Match `text` against a glob pattern supporting `*`, `?` and `[...]`.
///
/// A pattern that fails to compile only matches itself literally.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(p) => p.matches(text),
        Err(_) => pattern == text,
    }
}

/// Returns true if `pattern` compiles as a glob.
pub fn is_valid_glob(pattern: &str) -> bool {
    Pattern::new(pattern).is_ok()
}
