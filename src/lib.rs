//! # bayou-docs — a revisioned, operational-transform document-control engine
//!
//! Each document is a small set of independently-revisioned, append-only
//! change logs ("streams": body text, carets, properties) stored behind a
//! transactional key/value [`storage::FileStore`]. Clients submit edits
//! against a base revision; the engine rebases conflicting concurrent edits
//! with operational transformation and returns a correction delta so every
//! client converges on the same document regardless of submission order.
//!
//! ## Modules
//!
//! - [`error`] — the crate's wire-stable error taxonomy ([`error::BayouError`])
//! - [`path`] — validated storage keys ([`path::StoragePath`]) and the
//!   canonical paths each stream uses
//! - [`delta`] — the [`delta::DeltaAlgebra`] contract plus reference
//!   implementations for text, caret, and property streams
//! - [`storage`] — the [`storage::FileStore`] transactional contract, an
//!   in-memory implementation used by this crate's own tests, and a
//!   RocksDB-backed implementation
//! - [`control`] — the generic OT engine ([`control::Control`]) and its
//!   per-stream faces ([`control::body::BodyControl`],
//!   [`control::caret::CaretControl`], [`control::property::PropertyControl`])
//! - [`snapshot_cache`] — the bounded, de-duplicating snapshot cache each
//!   `Control` keeps
//! - [`change_reader`] — batched change reads and the long-poll wait primitive
//! - [`session`] — the author-facing [`session::Session`] handle
//! - [`doc_complex`] — [`doc_complex::DocComplex`], the per-document
//!   coordinator, and its process-wide registry

pub mod change_reader;
pub mod control;
pub mod delta;
pub mod doc_complex;
pub mod error;
pub mod path;
pub mod session;
pub mod snapshot_cache;
pub mod storage;

pub use control::{Change, Snapshot};
pub use delta::{DeltaAlgebra, DeltaError, Priority};
pub use doc_complex::{DocComplex, DocComplexRegistry, DocStatus, OpenOutcome};
pub use error::{BayouError, ErrorKind};
pub use path::StoragePath;
pub use session::{Session, SessionRegistry};
pub use storage::{FileStore, StoreError, TransactOp, TransactResult, TransactValue, TransactionSpec};
