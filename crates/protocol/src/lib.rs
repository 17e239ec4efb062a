//! Wire types for the reelsync upload pipeline.
//!
//! Shared by the signing client, the chunked transfer engine and the
//! upload coordinator so that every crate agrees on field names and
//! header spellings.

pub mod constants;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use messages::{DeleteRequest, RecordUpdate, SignQuery, SignResponse};
pub use types::UploadStatus;
