//! The delta algebra contract (§6) and its reference implementations.
//!
//! The control layer is generic over [`DeltaAlgebra`] and never inspects a
//! delta's internal structure beyond the operations this trait exposes. The
//! three concrete types in this module ([`text::TextDelta`],
//! [`caret::CaretDelta`], [`property::PropertyDelta`]) are reference
//! implementations used by the control layer's own tests; a production
//! deployment could swap in a richer rich-text algebra without touching
//! `control/`.

pub mod caret;
pub mod property;
pub mod text;

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

/// Which side wins when two deltas make conflicting edits at the same
/// position during `transform`. The OT apply loop always transforms the
/// client delta against the server delta with the server listed first
/// (`Priority::Left` from the server's point of view), matching the
/// "server-first" tie-break used throughout §8 Scenario C.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Left,
    Right,
}

/// Error produced by a delta-algebra operation (malformed input, mismatched
/// base length, etc). Distinct from [`crate::error::BayouError`]: this is
/// purely an algebra-level failure that the control layer wraps as
/// `bad_value` or `invariant_violation` depending on context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaError(pub String);

impl fmt::Display for DeltaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DeltaError {}

/// The algebraic contract every stream's delta type must satisfy (§6):
///
/// - `compose` is associative and has `identity` as its unit.
/// - `transform` satisfies TP1 (two-sided convergence): applying `a` then
///   `b.transform(a, other_priority)` reaches the same document as applying
///   `b` then `a.transform(b, priority)`.
/// - `diff(a, b)` composed onto `a` yields `b`, when both are documents.
/// - `is_document` is true iff the delta can stand alone as full document
///   state (no dependency on prior state via retain/delete-style ops).
pub trait DeltaAlgebra: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The empty delta: `compose`'s identity element.
    fn identity() -> Self;

    /// True if applying this delta changes nothing.
    fn is_empty(&self) -> bool;

    /// True if this delta fully describes a document's state (e.g. the
    /// result of composing `change/0..=N`), rather than an edit relative to
    /// some prior state.
    fn is_document(&self) -> bool;

    /// `self` then `other`, in that order.
    fn compose(&self, other: &Self) -> Result<Self, DeltaError>;

    /// Rebase `self` against a concurrently-applied `other`, returning the
    /// delta that, applied after `other`, reaches the same document `other`
    /// and `self` would reach if applied in the opposite order. `priority`
    /// breaks ties when both deltas touch the same position.
    fn transform(&self, other: &Self, priority: Priority) -> Result<Self, DeltaError>;

    /// The delta that turns document `self` into document `other`. Only
    /// defined when both satisfy `is_document`.
    fn diff(&self, other: &Self) -> Result<Self, DeltaError>;

    /// The delta that undoes `self` when applied to the document produced by
    /// composing `base` with `self`.
    fn invert(&self, base: &Self) -> Result<Self, DeltaError>;
}
