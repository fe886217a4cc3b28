//! Purpose: Library crate behind the `tablestream` binary and its tests.
//! Exports: `core` (store, chunk reader/writer, export streams, errors).
//! Role: Everything except HTTP routing and CLI parsing lives here.
//! Invariants: A chunk is persisted before its line is returned to a caller.
//! Invariants: Store and filesystem errors propagate; nothing is swallowed.
pub mod core;
