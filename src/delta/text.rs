//! A plain-text operational-transform delta: a reference implementation of
//! [`DeltaAlgebra`] used for the body stream in this crate's own tests.
//!
//! Three op kinds, in the shape most rich-text OT libraries use: `Retain(n)`
//! skips `n` characters of the base document, `Insert(s)` inserts `s` at the
//! current position, `Delete(n)` removes `n` characters. A delta is a
//! document delta iff it contains only `Insert` ops (it doesn't reference
//! any prior state).

use serde::{Deserialize, Serialize};

use super::{DeltaAlgebra, DeltaError, Priority};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextOp {
    Retain(usize),
    Insert(String),
    Delete(usize),
}

impl TextOp {
    fn char_len(&self) -> usize {
        match self {
            TextOp::Retain(n) | TextOp::Delete(n) => *n,
            TextOp::Insert(s) => s.chars().count(),
        }
    }

    fn is_noop(&self) -> bool {
        match self {
            TextOp::Retain(0) | TextOp::Delete(0) => true,
            TextOp::Insert(s) => s.is_empty(),
            _ => false,
        }
    }

    fn split_at(self, at: usize) -> (TextOp, TextOp) {
        match self {
            TextOp::Retain(n) => (TextOp::Retain(at), TextOp::Retain(n - at)),
            TextOp::Delete(n) => (TextOp::Delete(at), TextOp::Delete(n - at)),
            TextOp::Insert(s) => {
                let chars: Vec<char> = s.chars().collect();
                let head: String = chars[..at].iter().collect();
                let tail: String = chars[at..].iter().collect();
                (TextOp::Insert(head), TextOp::Insert(tail))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TextDelta {
    pub ops: Vec<TextOp>,
}

impl TextDelta {
    pub fn insert(s: impl Into<String>) -> Self {
        let s = s.into();
        if s.is_empty() {
            Self::default()
        } else {
            Self { ops: vec![TextOp::Insert(s)] }
        }
    }

    pub fn retain(n: usize) -> Self {
        if n == 0 {
            Self::default()
        } else {
            Self { ops: vec![TextOp::Retain(n)] }
        }
    }

    pub fn delete(n: usize) -> Self {
        if n == 0 {
            Self::default()
        } else {
            Self { ops: vec![TextOp::Delete(n)] }
        }
    }

    /// Builds `Retain(len).compose(Insert(s))` in one op list; a common
    /// shape for "insert at a fixed cursor position" test deltas.
    pub fn retain_then_insert(retain: usize, s: impl Into<String>) -> Self {
        let mut ops = Vec::new();
        push(&mut ops, TextOp::Retain(retain));
        push(&mut ops, TextOp::Insert(s.into()));
        Self { ops }
    }

    /// The flattened content of a document delta (only `Insert` ops).
    pub fn content(&self) -> Result<String, DeltaError> {
        if !self.is_document() {
            return Err(DeltaError("content() called on a non-document delta".into()));
        }
        let mut s = String::new();
        for op in &self.ops {
            if let TextOp::Insert(piece) = op {
                s.push_str(piece);
            }
        }
        Ok(s)
    }

    fn base_len(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                TextOp::Retain(n) | TextOp::Delete(n) => *n,
                TextOp::Insert(_) => 0,
            })
            .sum()
    }
}

fn push(ops: &mut Vec<TextOp>, op: TextOp) {
    if op.is_noop() {
        return;
    }
    if let Some(last) = ops.last_mut() {
        let merged = match (last, &op) {
            (TextOp::Insert(a), TextOp::Insert(b)) => {
                a.push_str(b);
                true
            }
            (TextOp::Retain(a), TextOp::Retain(b)) => {
                *a += b;
                true
            }
            (TextOp::Delete(a), TextOp::Delete(b)) => {
                *a += b;
                true
            }
            _ => false,
        };
        if merged {
            return;
        }
    }
    ops.push(op);
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum Kind {
    Retain,
    Insert,
    Delete,
    None,
}

/// Walks an op list one logical "unit" at a time, transparently splitting
/// ops so callers can consume an exact length across both sides of a merge.
struct OpReader<'a> {
    rest: std::slice::Iter<'a, TextOp>,
    current: Option<TextOp>,
}

impl<'a> OpReader<'a> {
    fn new(ops: &'a [TextOp]) -> Self {
        let mut rest = ops.iter();
        let current = rest.next().cloned();
        Self { rest, current }
    }

    fn peek_kind(&self) -> Kind {
        match &self.current {
            None => Kind::None,
            Some(TextOp::Retain(_)) => Kind::Retain,
            Some(TextOp::Insert(_)) => Kind::Insert,
            Some(TextOp::Delete(_)) => Kind::Delete,
        }
    }

    fn peek_len(&self) -> usize {
        self.current.as_ref().map(TextOp::char_len).unwrap_or(usize::MAX)
    }

    /// Takes the next op, splitting it if it's longer than `max_len`
    /// (ignored for inserts, which are always taken whole).
    fn next(&mut self, max_len: usize) -> Option<TextOp> {
        let cur = self.current.take()?;
        if matches!(cur, TextOp::Insert(_)) || cur.char_len() <= max_len {
            self.current = self.rest.next().cloned();
            Some(cur)
        } else {
            let (head, tail) = cur.split_at(max_len);
            self.current = Some(tail);
            Some(head)
        }
    }

    fn has_next(&self) -> bool {
        self.current.is_some()
    }
}

impl DeltaAlgebra for TextDelta {
    fn identity() -> Self {
        Self::default()
    }

    fn is_empty(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, TextOp::Retain(_)))
    }

    fn is_document(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, TextOp::Insert(_)))
    }

    fn compose(&self, other: &Self) -> Result<Self, DeltaError> {
        let mut a = OpReader::new(&self.ops);
        let mut b = OpReader::new(&other.ops);
        let mut ops = Vec::new();

        while a.has_next() || b.has_next() {
            if b.peek_kind() == Kind::Insert {
                ops.push_op(b.next(usize::MAX).unwrap());
                continue;
            }
            if a.peek_kind() == Kind::Delete {
                ops.push_op(a.next(usize::MAX).unwrap());
                continue;
            }
            if !a.has_next() || !b.has_next() {
                return Err(DeltaError("compose: base length mismatch".into()));
            }
            let len = a.peek_len().min(b.peek_len());
            let a_op = a.next(len).unwrap();
            let b_op = b.next(len).unwrap();
            match b_op {
                TextOp::Retain(_) => ops.push_op(a_op),
                TextOp::Delete(n) => {
                    if matches!(a_op, TextOp::Insert(_)) {
                        // insert immediately deleted: cancels out.
                    } else {
                        ops.push_op(TextOp::Delete(n));
                    }
                }
                TextOp::Insert(_) => unreachable!("insert handled above"),
            }
        }
        Ok(Self { ops })
    }

    fn transform(&self, other: &Self, priority: Priority) -> Result<Self, DeltaError> {
        let self_wins = matches!(priority, Priority::Left);
        let mut a = OpReader::new(&self.ops);
        let mut b = OpReader::new(&other.ops);
        let mut ops = Vec::new();

        while a.has_next() || b.has_next() {
            if a.peek_kind() == Kind::Insert && (self_wins || b.peek_kind() != Kind::Insert) {
                let op = a.next(usize::MAX).unwrap();
                ops.push_op(TextOp::Retain(op.char_len()));
                continue;
            }
            if b.peek_kind() == Kind::Insert {
                ops.push_op(b.next(usize::MAX).unwrap());
                continue;
            }
            if !a.has_next() || !b.has_next() {
                return Err(DeltaError("transform: base length mismatch".into()));
            }
            let len = a.peek_len().min(b.peek_len());
            let a_op = a.next(len).unwrap();
            let b_op = b.next(len).unwrap();
            match (a_op, b_op) {
                (TextOp::Delete(_), _) => {
                    // already deleted on the other side; drop from the output.
                }
                (_, TextOp::Delete(n)) => ops.push_op(TextOp::Delete(n)),
                _ => ops.push_op(TextOp::Retain(len)),
            }
        }
        Ok(Self { ops })
    }

    fn diff(&self, other: &Self) -> Result<Self, DeltaError> {
        let a = self.content()?;
        let b = other.content()?;
        let a_chars: Vec<char> = a.chars().collect();
        let b_chars: Vec<char> = b.chars().collect();

        let mut prefix = 0;
        while prefix < a_chars.len() && prefix < b_chars.len() && a_chars[prefix] == b_chars[prefix] {
            prefix += 1;
        }
        let mut suffix = 0;
        while suffix < a_chars.len() - prefix
            && suffix < b_chars.len() - prefix
            && a_chars[a_chars.len() - 1 - suffix] == b_chars[b_chars.len() - 1 - suffix]
        {
            suffix += 1;
        }

        let mut ops = Vec::new();
        push(&mut ops, TextOp::Retain(prefix));
        let deleted = a_chars.len() - prefix - suffix;
        push(&mut ops, TextOp::Delete(deleted));
        let inserted: String = b_chars[prefix..b_chars.len() - suffix].iter().collect();
        push(&mut ops, TextOp::Insert(inserted));
        push(&mut ops, TextOp::Retain(suffix));
        Ok(Self { ops })
    }

    fn invert(&self, base: &Self) -> Result<Self, DeltaError> {
        let content = base.content()?;
        let chars: Vec<char> = content.chars().collect();
        if self.base_len() > chars.len() {
            return Err(DeltaError("invert: delta's base length exceeds base document".into()));
        }
        let mut index = 0;
        let mut ops = Vec::new();
        for op in &self.ops {
            match op {
                TextOp::Retain(n) => {
                    push(&mut ops, TextOp::Retain(*n));
                    index += n;
                }
                TextOp::Insert(s) => {
                    push(&mut ops, TextOp::Delete(s.chars().count()));
                }
                TextOp::Delete(n) => {
                    let deleted: String = chars[index..index + n].iter().collect();
                    push(&mut ops, TextOp::Insert(deleted));
                    index += n;
                }
            }
        }
        Ok(Self { ops })
    }
}

trait PushOp {
    fn push_op(&mut self, op: TextOp);
}

impl PushOp for Vec<TextOp> {
    fn push_op(&mut self, op: TextOp) {
        push(self, op)
    }
}
