//! Core value types for the file store.
//!
//! These describe what a request asks for (`TransformRequest`) and what the
//! store hands back (`StoredContent`). They carry no I/O of their own.

pub mod stored;
pub mod transform;
