//! Source revisions, projection state, slots and dependency edges.

pub mod migrations;
mod schema;
mod store;
mod types;

pub use store::MetadataStore;
pub use types::{DependencyEdge, Slot, SourceMetadata, ViewMetadata, ViewState};
