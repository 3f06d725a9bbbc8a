#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-transactions** – Nested transactional execution scopes for Weft.
//!
//! A transaction scope coordinates whether the result a body produces is
//! persisted, discarded, or recovered from a previously committed record.
//! Scopes nest: children defer their commit decision to the parent by
//! default, an EAGER child commits on its own even inside a lazy parent, and
//! a rollback anywhere in the tree propagates to every ancestor that has not
//! already committed. Under SERIALIZABLE isolation the record store's per-key
//! lock serializes entries, and a later entrant finding a committed record
//! short-circuits straight to COMMITTED without running its own persistence.
//!
//! The ambient transaction is task-local: concurrent flows on one worker see
//! independent stacks, and [`Transaction::run`] scopes the body future so the
//! ambient frame is popped on every exit path.

mod scope;
mod transaction;

pub use scope::transaction;
pub use transaction::{
    current_transaction, CommitMode, Transaction, TransactionError, TransactionHook,
    TransactionOptions, TransactionState,
};

// The isolation contract lives with the stores that declare support for it.
pub use weft_records::IsolationLevel;
