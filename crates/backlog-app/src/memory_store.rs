//! In-process backlog implementing both collaborator traits.

use backlog_core::filter::Predicate;
use backlog_core::id::ItemId;
use backlog_core::item::WorkItem;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::store::{ItemSource, PositionStore, PositionUpdate, ScopeFilter, StoreError};

/// Backlog held in memory.
///
/// Position writes are checked the way a server would check them: the item and
/// its new parent must exist, the parent must not sit inside the item's own
/// subtree, and no other item may already hold the same rank in the scope.
#[derive(Debug, Default)]
pub struct InMemoryBacklog {
    items: Mutex<BTreeMap<ItemId, WorkItem>>,
}

impl InMemoryBacklog {
    /// Backlog seeded with `items`.
    #[must_use]
    pub fn new(items: impl IntoIterator<Item = WorkItem>) -> Self {
        Self {
            items: Mutex::new(items.into_iter().map(|item| (item.id, item)).collect()),
        }
    }

    /// Insert or replace an item.
    pub async fn insert(&self, item: WorkItem) {
        self.items.lock().await.insert(item.id, item);
    }

    /// Remove an item, returning it when present.
    pub async fn remove(&self, id: ItemId) -> Option<WorkItem> {
        self.items.lock().await.remove(&id)
    }

    /// Current version of one item.
    pub async fn get(&self, id: ItemId) -> Option<WorkItem> {
        self.items.lock().await.get(&id).cloned()
    }

    /// Every item, ordered by id.
    pub async fn snapshot(&self) -> Vec<WorkItem> {
        self.items.lock().await.values().cloned().collect()
    }
}

fn conflict(item: ItemId, reason: impl Into<String>) -> StoreError {
    StoreError::Conflict {
        item,
        reason: reason.into(),
    }
}

/// Validate `updates` against `items` as if all of them were applied at once.
fn check(items: &BTreeMap<ItemId, WorkItem>, updates: &[PositionUpdate]) -> Result<Vec<WorkItem>, StoreError> {
    let mut staged = items.clone();
    for update in updates {
        let Some(item) = staged.get_mut(&update.id) else {
            return Err(StoreError::NotFound(update.id));
        };
        item.relocate(&update.scope);
        item.stack_rank = update.stack_rank.clone();
    }

    for update in updates {
        if let Some(parent) = update.parent() {
            if !staged.contains_key(&parent) {
                return Err(conflict(update.id, format!("parent {parent} no longer exists")));
            }
            let mut cursor = Some(parent);
            let mut hops = 0;
            while let Some(current) = cursor {
                if current == update.id || hops > staged.len() {
                    return Err(conflict(update.id, format!("parent {parent} would create a cycle")));
                }
                cursor = staged.get(&current).and_then(|item| item.parent);
                hops += 1;
            }
        }
        let taken = staged.values().any(|other| {
            other.id != update.id && other.stack_rank == update.stack_rank && other.scope() == update.scope
        });
        if taken {
            return Err(conflict(
                update.id,
                format!("rank {} is already taken in its scope", update.stack_rank),
            ));
        }
    }

    Ok(updates
        .iter()
        .filter_map(|update| staged.get(&update.id).cloned())
        .collect())
}

impl PositionStore for InMemoryBacklog {
    async fn update_item_position(&self, update: &PositionUpdate) -> Result<WorkItem, StoreError> {
        let mut stored = self.update_positions(std::slice::from_ref(update)).await?;
        stored.pop().ok_or(StoreError::NotFound(update.id))
    }

    async fn update_positions(&self, updates: &[PositionUpdate]) -> Result<Vec<WorkItem>, StoreError> {
        let mut items = self.items.lock().await;
        let already = updates
            .iter()
            .all(|update| items.get(&update.id).is_some_and(|item| update.is_applied_to(item)));
        if already {
            debug!(count = updates.len(), "Position write already applied");
            return Ok(updates
                .iter()
                .filter_map(|update| items.get(&update.id).cloned())
                .collect());
        }
        let stored = check(&items, updates)?;
        for item in &stored {
            items.insert(item.id, item.clone());
        }
        debug!(count = stored.len(), "Stored item positions");
        Ok(stored)
    }
}

impl ItemSource for InMemoryBacklog {
    async fn list_items(&self, scope: &ScopeFilter, predicate: &Predicate) -> Result<Vec<WorkItem>, StoreError> {
        let items = self.items.lock().await;
        Ok(items
            .values()
            .filter(|item| scope.admits(item) && predicate.matches(item))
            .cloned()
            .collect())
    }
}
