//! Ordering and retrieval primitives for hierarchical backlogs.
//!
//! - [`rank`] allocates lexicographic stack-rank keys between neighbors.
//! - [`tree`] materializes the item hierarchy and applies moves immutably.
//! - [`filter`] compiles named filters into a single retrieval predicate.

/// Named filter compilation.
pub mod filter;
/// Identifier types.
pub mod id;
/// Work item model.
pub mod item;
/// Stack-rank keys and their allocator.
pub mod rank;
/// Text normalization shared by search filters.
pub mod text_matcher;
/// Hierarchical index.
pub mod tree;

pub use filter::{
    CompiledFilter, Condition, Field, FilterCompiler, FilterContext, FilterError, FilterName, FilterSet,
    FilterValue, MatchMode, Predicate, SkipReason, StatusFilter,
};
pub use id::ItemId;
pub use item::{ItemKind, Scope, UnknownKind, WorkItem};
pub use rank::{RankAllocator, RankError, RankKey};
pub use tree::{DropSlot, MoveRequest, Placement, TreeIndex, TreeNode};
