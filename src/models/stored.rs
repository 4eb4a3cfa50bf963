//! Content handed back by the store for a retrieve request.

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A served body: either raw file bytes, transformed image bytes, or an
/// on-demand zip of an archive directory.
#[derive(Clone, Debug)]
pub struct StoredContent {
    /// File name the content is served under (`archive.zip` for archives).
    pub name: String,

    /// Disk modification time, or the request time for downloads.
    pub mod_time: DateTime<Utc>,

    /// Response body. Cheap to clone; cache hits share the same buffer.
    pub content: Bytes,
}
