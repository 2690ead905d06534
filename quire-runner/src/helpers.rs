// Copyright (c) The quire Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Small helpers shared across the crate.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A source location inside a test file, as captured at registration time.
///
/// Locations are stored repo-relative so that every user-facing path is
/// stable across machines.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Repo-relative file.
    pub file: Utf8PathBuf,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

impl SourceLocation {
    /// Captures the caller's location. Intended for use in `#[track_caller]`
    /// registration entry points.
    #[track_caller]
    pub fn caller() -> Self {
        let loc = std::panic::Location::caller();
        Self {
            file: rel_path(Utf8Path::new(loc.file())),
            line: loc.line(),
            column: loc.column(),
        }
    }

    /// Creates a location from explicit parts.
    pub fn new(file: impl Into<Utf8PathBuf>, line: u32, column: u32) -> Self {
        Self {
            file: rel_path(&file.into()),
            line,
            column,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Strips the current directory prefix from a path, if present.
pub(crate) fn rel_path(path: &Utf8Path) -> Utf8PathBuf {
    let cwd = std::env::current_dir()
        .ok()
        .and_then(|p| Utf8PathBuf::from_path_buf(p).ok());
    match cwd {
        Some(cwd) => path
            .strip_prefix(&cwd)
            .map(Utf8Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf()),
        None => path.to_path_buf(),
    }
}

/// Converts a string into a path-safe slug: any character outside
/// `[A-Za-z0-9_-]` becomes `-`, runs collapse, and leading/trailing dashes
/// are trimmed.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = true;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Renders a panic payload as a string, the way the default panic hook does.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub(crate) fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(ser)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(de)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("simple", "simple")]
    #[test_case("with space", "with-space")]
    #[test_case("lots   of!! punctuation??", "lots-of-punctuation")]
    #[test_case("--edges  trimmed--", "edges-trimmed" ; "dash runs collapse and trim")]
    #[test_case("tests/auth.rs", "tests-auth-rs")]
    #[test_case("", "")]
    fn slugify_cases(input: &str, expected: &str) {
        assert_eq!(slugify(input), expected);
    }

    #[test]
    fn slugify_trims_leading_separator_runs() {
        assert_eq!(slugify("!!leading"), "leading");
        assert_eq!(slugify("trailing!!"), "trailing");
    }
}
