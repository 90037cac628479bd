//! Kinwatch store: the resource relationship cache and the coalescing,
//! rate-limited work queue that feeds the controllers.

#![forbid(unsafe_code)]

pub mod cache;
pub mod queue;

pub use cache::{NodeFields, RelationshipCache, ResourceNode, TreeView};
pub use queue::{RateLimit, WorkQueue};
