//! Collaborator interfaces for durable position writes and item retrieval.

use backlog_core::filter::Predicate;
use backlog_core::id::ItemId;
use backlog_core::item::{ItemKind, Scope, WorkItem};
use backlog_core::rank::RankKey;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by storage collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested position is no longer valid (target moved, deleted or taken).
    #[error("reorder conflict on {item}: {reason}")]
    Conflict {
        /// Item whose write was rejected.
        item: ItemId,
        /// Human-readable cause.
        reason: String,
    },
    /// The item does not exist in the store.
    #[error("item not found: {0}")]
    NotFound(ItemId),
    /// Transport or backend failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether the local view has diverged from the store and must be re-fetched.
    #[must_use]
    pub const fn requires_refetch(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::NotFound(_))
    }
}

/// Durable position of one item: its scope and stack rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionUpdate {
    /// Item being repositioned.
    pub id: ItemId,
    /// Scope the item ranks in after the write.
    pub scope: Scope,
    /// New stack rank.
    pub stack_rank: RankKey,
}

impl PositionUpdate {
    /// Position currently held by `item`.
    #[must_use]
    pub fn of(item: &WorkItem) -> Self {
        Self {
            id: item.id,
            scope: item.scope(),
            stack_rank: item.stack_rank.clone(),
        }
    }

    /// New parent.
    #[must_use]
    pub const fn parent(&self) -> Option<ItemId> {
        self.scope.parent
    }

    /// True when `item` already sits at this position.
    #[must_use]
    pub fn is_applied_to(&self, item: &WorkItem) -> bool {
        item.id == self.id && item.stack_rank == self.stack_rank && item.scope() == self.scope
    }
}

/// Persistence collaborator.
#[allow(async_fn_in_trait)]
pub trait PositionStore: Send + Sync {
    /// Persist the position of a single item, returning the stored item.
    ///
    /// Implementations must be idempotent for a repeated `(id, stack_rank)`.
    ///
    /// # Errors
    /// Returns [`StoreError::Conflict`] when the position was invalidated concurrently.
    async fn update_item_position(&self, update: &PositionUpdate) -> Result<WorkItem, StoreError>;

    /// Persist several positions, such as a rebalanced scope.
    ///
    /// The default writes one item at a time in the given order, stopping at
    /// the first failure. Earlier writes stay stored in that case. The
    /// coordinator orders a batch so every write targets a rank that is free
    /// by the time it is sent.
    ///
    /// # Errors
    /// Propagates the first failure from [`update_item_position`](Self::update_item_position).
    async fn update_positions(&self, updates: &[PositionUpdate]) -> Result<Vec<WorkItem>, StoreError> {
        let mut stored = Vec::with_capacity(updates.len());
        for update in updates {
            stored.push(self.update_item_position(update).await?);
        }
        Ok(stored)
    }
}

/// Which part of the backlog a retrieval covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    /// Restrict to one container.
    pub container: Option<String>,
    /// Restrict to one project.
    pub project: Option<String>,
    /// Restrict to these kinds; empty admits every kind.
    pub kinds: BTreeSet<ItemKind>,
}

impl ScopeFilter {
    /// Everything in `container`.
    #[must_use]
    pub fn container(container: impl Into<String>) -> Self {
        Self {
            container: Some(container.into()),
            ..Self::default()
        }
    }

    /// Narrow to one project.
    #[must_use]
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Narrow to the given kinds.
    #[must_use]
    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = ItemKind>) -> Self {
        self.kinds.extend(kinds);
        self
    }

    /// Whether `item` falls inside the filter.
    #[must_use]
    pub fn admits(&self, item: &WorkItem) -> bool {
        self.container.as_ref().is_none_or(|c| *c == item.container)
            && self.project.as_ref().is_none_or(|p| *p == item.project)
            && (self.kinds.is_empty() || self.kinds.contains(&item.kind))
    }
}

/// Retrieval collaborator.
#[allow(async_fn_in_trait)]
pub trait ItemSource: Send + Sync {
    /// Items inside `scope` that satisfy `predicate`.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the backend cannot be queried.
    async fn list_items(&self, scope: &ScopeFilter, predicate: &Predicate) -> Result<Vec<WorkItem>, StoreError>;
}

impl<T: PositionStore> PositionStore for Arc<T> {
    async fn update_item_position(&self, update: &PositionUpdate) -> Result<WorkItem, StoreError> {
        (**self).update_item_position(update).await
    }

    async fn update_positions(&self, updates: &[PositionUpdate]) -> Result<Vec<WorkItem>, StoreError> {
        (**self).update_positions(updates).await
    }
}

impl<T: ItemSource> ItemSource for Arc<T> {
    async fn list_items(&self, scope: &ScopeFilter, predicate: &Predicate) -> Result<Vec<WorkItem>, StoreError> {
        (**self).list_items(scope, predicate).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(container: &str, project: &str, kind: ItemKind) -> WorkItem {
        let rank = RankKey::parse("i").unwrap_or_else(|err| panic!("{err}"));
        WorkItem::new(ItemId::new(), kind, container, project, rank)
    }

    #[test]
    fn scope_filter_narrows_by_each_dimension() {
        let task = item("board", "alpha", ItemKind::Task);
        assert!(ScopeFilter::default().admits(&task));
        assert!(ScopeFilter::container("board").admits(&task));
        assert!(!ScopeFilter::container("other").admits(&task));
        assert!(!ScopeFilter::container("board").with_project("beta").admits(&task));
        assert!(!ScopeFilter::container("board").with_kinds([ItemKind::Epic]).admits(&task));
        assert!(ScopeFilter::container("board").with_kinds([ItemKind::Epic, ItemKind::Task]).admits(&task));
    }

    #[test]
    fn only_divergence_errors_require_refetch() {
        let id = ItemId::new();
        assert!(StoreError::Conflict { item: id, reason: "taken".into() }.requires_refetch());
        assert!(StoreError::NotFound(id).requires_refetch());
        assert!(!StoreError::Other(anyhow::anyhow!("offline")).requires_refetch());
    }

    #[test]
    fn position_update_mirrors_item() {
        let mut task = item("board", "alpha", ItemKind::Task);
        let update = PositionUpdate::of(&task);
        assert!(update.is_applied_to(&task));
        assert_eq!(update.parent(), None);
        task.stack_rank = RankKey::parse("j").unwrap_or_else(|err| panic!("{err}"));
        assert!(!update.is_applied_to(&task));
    }
}
