// ABOUTME: Core library for eventrelay, containing domain types shared by storage and server.
// ABOUTME: Defines the JSON merge schema, content hashes, and the StatusUpdate work item.

pub mod hash;
pub mod merge;
pub mod status;

pub use hash::{ContentHash, HashError, Hashed};
pub use merge::{MergeError, MergeSchema, MergeStrategy};
pub use status::{NO_ISSUE_CREATED, StatusUpdate};
