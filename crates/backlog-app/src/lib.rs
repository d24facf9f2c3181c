//! Application layer for backlog ordering.
//!
//! This crate provides the collaborator traits, the drag-and-drop reorder
//! coordinator, the backlog service, configuration, and user-facing filter helpers.

pub mod config;
pub mod filter_util;
pub mod memory_store;
pub mod reorder;
pub mod service;
pub mod store;

// Re-exports for convenience
pub use config::{ProjectConfig, RankingConfig};
pub use filter_util::{FilterBuildError, FilterBuildResult, FilterSetBuilder};
pub use memory_store::InMemoryBacklog;
pub use reorder::{DragOutcome, DragPhase, DragReorderCoordinator, DropTarget, RefetchRequest, ReorderError};
pub use service::{BacklogQuery, BacklogService};
pub use store::{ItemSource, PositionStore, PositionUpdate, ScopeFilter, StoreError};
