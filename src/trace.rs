//! Parse trace: the stack of named contexts (types, fields, cases, array items) a reader or
//! writer is currently inside.
//!
//! Frames are pushed through [`Traced::enter`], which hands back a [`ContextGuard`]; the
//! guard pops its frame when dropped, so the stack is balanced on every exit path including
//! `?` returns. Errors snapshot the trail with [`crate::CodecError::at`] before unwinding.

use std::fmt;
use std::ops::{Deref, DerefMut};

/// One entry of the trail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    pub line: u32,
    pub column: u32,
    pub context: String,
    /// Buffer position (bits) when the frame was entered.
    pub bit_offset: u64,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{}) @bit {}", self.context, self.line, self.column, self.bit_offset)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseTrace {
    frames: Vec<TraceFrame>,
}

impl ParseTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: u32, column: u32, named_context: impl Into<String>) {
        self.push_at(line, column, named_context, 0);
    }

    pub fn push_at(&mut self, line: u32, column: u32, named_context: impl Into<String>, bit_offset: u64) {
        self.frames.push(TraceFrame {
            line,
            column,
            context: named_context.into(),
            bit_offset,
        });
    }

    pub fn pop(&mut self) -> Option<TraceFrame> {
        self.frames.pop()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Outermost first.
    pub fn frames(&self) -> &[TraceFrame] {
        &self.frames
    }

    pub fn top(&self) -> Option<&TraceFrame> {
        self.frames.last()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// `"field x inside type Y at bit offset 12"`; empty string for an empty trace.
    pub fn render(&self) -> String {
        render_frames(&self.frames)
    }
}

/// Renders a frame snapshot innermost first.
pub fn render_frames(frames: &[TraceFrame]) -> String {
    let Some(innermost) = frames.last() else {
        return String::new();
    };
    let path = frames
        .iter()
        .rev()
        .map(|f| f.context.as_str())
        .collect::<Vec<_>>()
        .join(" inside ");
    format!("{} at bit offset {}", path, innermost.bit_offset)
}

/// Anything carrying a parse trace and a bit cursor (read and write buffers).
pub trait Traced {
    fn trace(&self) -> &ParseTrace;
    fn trace_mut(&mut self) -> &mut ParseTrace;
    fn bit_position(&self) -> u64;

    /// Runs right after [`Traced::enter`] pushed a frame.
    fn context_opened(&mut self) {}

    /// Runs right before a guard pops its frame.
    fn context_closed(&mut self) {}

    /// Push a frame at the current position; it is popped when the guard drops.
    fn enter(&mut self, line: u32, column: u32, context: impl Into<String>) -> ContextGuard<'_, Self>
    where
        Self: Sized,
    {
        let pos = self.bit_position();
        self.trace_mut().push_at(line, column, context, pos);
        self.context_opened();
        ContextGuard { inner: self }
    }
}

/// Scoped frame: derefs to the traced value, pops its frame on drop.
pub struct ContextGuard<'a, T: Traced> {
    inner: &'a mut T,
}

impl<T: Traced> Deref for ContextGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner
    }
}

impl<T: Traced> DerefMut for ContextGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner
    }
}

impl<T: Traced> Drop for ContextGuard<'_, T> {
    fn drop(&mut self) {
        self.inner.context_closed();
        self.inner.trace_mut().pop();
    }
}

impl Traced for ParseTrace {
    fn trace(&self) -> &ParseTrace {
        self
    }

    fn trace_mut(&mut self) -> &mut ParseTrace {
        self
    }

    fn bit_position(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails_inside(trace: &mut ParseTrace) -> Result<(), String> {
        let mut outer = trace.enter(1, 1, "type Outer");
        let inner = outer.enter(2, 5, "field inner");
        assert_eq!(inner.depth(), 2);
        Err(inner.render())
    }

    #[test]
    fn push_pop_is_lifo() {
        let mut t = ParseTrace::new();
        t.push(1, 1, "type A");
        t.push(3, 2, "field b");
        assert_eq!(t.depth(), 2);
        assert_eq!(t.pop().map(|f| f.context), Some("field b".to_string()));
        assert_eq!(t.top().map(|f| f.line), Some(1));
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.pop(), None);
    }

    #[test]
    fn render_is_innermost_first() {
        let mut t = ParseTrace::new();
        t.push_at(1, 1, "type ModbusPDU", 0);
        t.push_at(4, 3, "field functionFlag", 1);
        assert_eq!(t.render(), "field functionFlag inside type ModbusPDU at bit offset 1");
        assert_eq!(ParseTrace::new().render(), "");
    }

    #[test]
    fn guard_pops_on_early_return() {
        let mut t = ParseTrace::new();
        let rendered = fails_inside(&mut t).unwrap_err();
        assert_eq!(rendered, "field inner inside type Outer at bit offset 0");
        assert!(t.is_empty());
    }
}
