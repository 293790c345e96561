//! Object-graph path trace for error messages.
//!
//! Segments are only formatted when tracking is enabled; on the error path
//! nothing is popped, so the trace still points at the failing position when
//! it is rendered into the final error.

use itertools::Itertools;

use crate::runtime::value::Value;

pub(crate) struct PathTrace {
    enabled: bool,
    segments: Vec<String>,
}

impl PathTrace {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            segments: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, f: impl FnOnce() -> String) {
        if self.enabled {
            self.segments.push(f());
        }
    }

    pub(crate) fn pop(&mut self) {
        if self.enabled {
            self.segments.pop();
        }
    }

    pub(crate) fn render(&self) -> Option<String> {
        self.enabled.then(|| self.segments.iter().join(""))
    }
}

/// Path segment for a table key: `.name` for string keys, `[value]` for the
/// rest.
pub(crate) fn format_key(key: &Value) -> String {
    match key {
        Value::Str(s) => format!(".{}", String::from_utf8_lossy(s.as_bytes())),
        other => format!("[{other:?}]"),
    }
}
