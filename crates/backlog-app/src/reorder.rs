//! Drag-and-drop reordering with optimistic tree updates.
//!
//! Each item runs its own small state machine:
//! `Idle -> Dragging -> Resolving -> {Idle, RolledBack}`. A drop computes the
//! new rank synchronously, applies the move to the shared [`TreeIndex`] right
//! away, and only then awaits the persistence collaborator. A failed write
//! restores the previous tree and, when the failure means the local view is
//! stale, emits a [`RefetchRequest`].

use std::collections::HashMap;

use backlog_core::id::ItemId;
use backlog_core::item::{Scope, WorkItem};
use backlog_core::rank::{RankAllocator, RankError, RankKey};
use backlog_core::tree::{MoveRequest, Placement, TreeIndex};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::config::RankingConfig;
use crate::store::{PositionStore, PositionUpdate, StoreError};

/// Errors surfaced by [`DragReorderCoordinator::on_drag_end`].
#[derive(Debug, Error)]
pub enum ReorderError {
    /// Rank allocation failed even after rebalancing.
    #[error(transparent)]
    Rank(#[from] RankError),
    /// The persistence collaborator rejected the write; the move was rolled back.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The item is not part of the loaded tree.
    #[error("unknown item: {0}")]
    UnknownItem(ItemId),
    /// No drag is in progress for the item.
    #[error("item {0} is not being dragged")]
    NotDragging(ItemId),
    /// The drop would target the item itself, its own subtree, or an unknown item.
    #[error("cannot drop {item} {placement:?} {over}")]
    Rejected {
        /// Dragged item.
        item: ItemId,
        /// Item it was dropped on.
        over: ItemId,
        /// Requested placement.
        placement: Placement,
    },
}

/// Per-item drag state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DragPhase {
    /// No gesture in progress.
    Idle,
    /// Picked up, not dropped yet.
    Dragging,
    /// Dropped; waiting for the persistence collaborator.
    Resolving,
    /// The last drop failed and the tree was restored.
    RolledBack,
}

/// Where an item is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropTarget {
    /// Item under the pointer.
    pub over: ItemId,
    /// Landing position relative to `over`.
    pub placement: Placement,
}

impl DropTarget {
    /// Sibling slot right before `over`.
    #[must_use]
    pub const fn before(over: ItemId) -> Self {
        Self {
            over,
            placement: Placement::Before,
        }
    }

    /// Sibling slot right after `over`.
    #[must_use]
    pub const fn after(over: ItemId) -> Self {
        Self {
            over,
            placement: Placement::After,
        }
    }

    /// First child of `over`.
    #[must_use]
    pub const fn child_of(over: ItemId) -> Self {
        Self {
            over,
            placement: Placement::AsChild,
        }
    }
}

/// Successful resolution of a drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DragOutcome {
    /// The store accepted the new position.
    Committed {
        /// Item as stored.
        item: WorkItem,
        /// Number of siblings re-ranked to make room.
        rebalanced: usize,
    },
    /// A reload happened while the write was in flight; its result was ignored.
    Superseded,
}

/// Ask the owner of the coordinator to reload the affected scopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefetchRequest {
    /// Item whose reorder was rolled back.
    pub item: ItemId,
    /// Scope the item left and scope it tried to enter.
    pub scopes: Vec<Scope>,
    /// Store failure that caused the request.
    pub reason: String,
}

#[derive(Debug, Clone)]
struct DragSession {
    phase: DragPhase,
    origin: Scope,
    origin_index: usize,
    hover: Option<DropTarget>,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    tree: TreeIndex,
    revision: u64,
    sessions: HashMap<ItemId, DragSession>,
    latest_seq: HashMap<ItemId, u64>,
    next_seq: u64,
}

impl CoordinatorState {
    fn set_phase(&mut self, item: ItemId, phase: DragPhase) {
        if let Some(session) = self.sessions.get_mut(&item) {
            session.phase = phase;
        }
    }

    fn replace_tree(&mut self, tree: TreeIndex) {
        self.tree = tree;
        self.revision += 1;
    }
}

struct Plan {
    tree: TreeIndex,
    landing: Scope,
    changes: Vec<PositionUpdate>,
    originals: Vec<WorkItem>,
    rebalanced: usize,
}

/// Drives drag gestures against a shared tree and a persistence collaborator.
pub struct DragReorderCoordinator<S> {
    store: S,
    allocator: RankAllocator,
    rebalance_on_duplicates: bool,
    state: Mutex<CoordinatorState>,
    refetch: mpsc::UnboundedSender<RefetchRequest>,
}

impl<S> DragReorderCoordinator<S> {
    /// Create a coordinator over `tree`; re-fetch requests arrive on the returned receiver.
    ///
    /// `tree` must hold every stored item of the scopes being reordered, as
    /// returned by [`BacklogService::load_scope`](crate::service::BacklogService::load_scope).
    /// A filtered tree hides neighbors, and drops next to them pick taken ranks.
    #[must_use]
    pub fn new(
        store: S,
        tree: TreeIndex,
        ranking: &RankingConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RefetchRequest>) {
        let (refetch, requests) = mpsc::unbounded_channel();
        let coordinator = Self {
            store,
            allocator: ranking.allocator(),
            rebalance_on_duplicates: ranking.rebalance_on_duplicates,
            state: Mutex::new(CoordinatorState {
                tree,
                ..CoordinatorState::default()
            }),
            refetch,
        };
        (coordinator, requests)
    }

    /// Persistence collaborator.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Copy of the tree as the UI should currently render it.
    pub async fn tree(&self) -> TreeIndex {
        self.state.lock().await.tree.clone()
    }

    /// Drag state of `item`.
    pub async fn phase(&self, item: ItemId) -> DragPhase {
        self.state
            .lock()
            .await
            .sessions
            .get(&item)
            .map_or(DragPhase::Idle, |session| session.phase)
    }

    /// Last hover target reported for a dragged item.
    pub async fn hover_target(&self, item: ItemId) -> Option<DropTarget> {
        self.state.lock().await.sessions.get(&item).and_then(|session| session.hover)
    }

    /// Scope and sibling index `item` had when its drag started.
    pub async fn drag_origin(&self, item: ItemId) -> Option<(Scope, usize)> {
        self.state
            .lock()
            .await
            .sessions
            .get(&item)
            .map(|session| (session.origin.clone(), session.origin_index))
    }

    /// Pick up `item`. Returns false when the item is unknown or already in flight.
    pub async fn on_drag_start(&self, item: ItemId) -> bool {
        let mut state = self.state.lock().await;
        let busy = state
            .sessions
            .get(&item)
            .is_some_and(|session| matches!(session.phase, DragPhase::Dragging | DragPhase::Resolving));
        if busy {
            debug!(%item, "Ignoring drag start for item already in flight");
            return false;
        }
        let Some(slot) = state.tree.find_parent_and_index(item) else {
            warn!(%item, "Ignoring drag start for unknown item");
            return false;
        };
        let session = DragSession {
            phase: DragPhase::Dragging,
            origin: slot.item.scope(),
            origin_index: slot.index,
            hover: None,
        };
        state.sessions.insert(item, session);
        debug!(%item, "Drag started");
        true
    }

    /// Record the tentative drop target. The tree is not touched.
    pub async fn on_drag_over(&self, item: ItemId, target: Option<DropTarget>) -> bool {
        let mut state = self.state.lock().await;
        match state.sessions.get_mut(&item) {
            Some(session) if session.phase == DragPhase::Dragging => {
                session.hover = target;
                true
            }
            _ => false,
        }
    }

    /// Abandon a drag without dropping.
    pub async fn on_drag_cancel(&self, item: ItemId) -> bool {
        let mut state = self.state.lock().await;
        let dragging = state
            .sessions
            .get(&item)
            .is_some_and(|session| session.phase == DragPhase::Dragging);
        if dragging {
            state.sessions.remove(&item);
            debug!(%item, "Drag cancelled");
        }
        dragging
    }

    /// Replace the tree with freshly loaded data.
    ///
    /// Writes still in flight are superseded: their outcomes are discarded and
    /// their items return to `Idle`. Drags that have not been dropped yet survive
    /// when their item is still present.
    pub async fn reload(&self, tree: TreeIndex) {
        let mut state = self.state.lock().await;
        let superseded = state.latest_seq.len();
        state.latest_seq.clear();
        state
            .sessions
            .retain(|id, session| session.phase == DragPhase::Dragging && tree.contains(*id));
        state.replace_tree(tree);
        info!(superseded, items = state.tree.len(), "Reloaded backlog");
    }

    fn request_refetch(&self, request: RefetchRequest) {
        let item = request.item;
        if self.refetch.send(request).is_err() {
            debug!(%item, "Re-fetch receiver dropped");
        } else {
            info!(%item, "Requested re-fetch");
        }
    }

    fn plan(&self, tree: &TreeIndex, item: ItemId, target: DropTarget) -> Result<Plan, ReorderError> {
        let rejected = || ReorderError::Rejected {
            item,
            over: target.over,
            placement: target.placement,
        };
        let slot = tree
            .drop_slot(item, target.over, target.placement)
            .ok_or_else(rejected)?;
        let landing = slot.scope.clone();
        let flagged = self.rebalance_on_duplicates && tree.rebalance_candidates().contains(&landing);
        let taken: Vec<RankKey> = tree
            .scope_items(&landing)
            .into_iter()
            .filter(|peer| peer.id != item)
            .map(|peer| peer.stack_rank.clone())
            .collect();

        let attempt = if flagged {
            debug!(scope = ?landing, "Scope holds duplicate ranks");
            None
        } else {
            Some(self.free_key(slot.prev_rank(), slot.next_rank(), &taken))
        };
        let (rebalanced_tree, key, rebalanced) = match attempt {
            Some(Ok(key)) => (None, key, 0),
            Some(Err(RankError::Exhausted { .. })) | None => {
                let count = slot.peers.len();
                let keys = self.allocator.rebalance(count)?;
                let respaced: Vec<WorkItem> = slot
                    .peers
                    .iter()
                    .zip(keys)
                    .map(|(peer, key)| {
                        let mut peer = (*peer).clone();
                        peer.stack_rank = key;
                        peer
                    })
                    .collect();
                info!(scope = ?landing, count, "Rebalancing scope");
                let respaced_tree = tree.apply_items(&respaced);
                let key = {
                    let slot = respaced_tree
                        .drop_slot(item, target.over, target.placement)
                        .ok_or_else(rejected)?;
                    self.free_key(slot.prev_rank(), slot.next_rank(), &taken)?
                };
                (Some(respaced_tree), key, count)
            }
            Some(Err(err)) => return Err(err.into()),
        };

        let base = rebalanced_tree.as_ref().unwrap_or(tree);
        let request = MoveRequest {
            source: item,
            target: target.over,
            placement: target.placement,
            rank: Some(key),
        };
        let moved = base.move_item(&request).ok_or_else(rejected)?;

        let mut changes: Vec<PositionUpdate> = moved
            .flatten()
            .into_iter()
            .filter(|node| {
                tree.find_by_id(node.item.id).is_none_or(|before| {
                    before.stack_rank != node.item.stack_rank || before.scope() != node.item.scope()
                })
            })
            .map(|node| PositionUpdate::of(node.item))
            .collect();
        changes.sort_by_key(|update| update.id != item);
        let changes = order_writes(changes, tree);
        let originals = changes
            .iter()
            .filter_map(|update| tree.find_by_id(update.id).cloned())
            .collect();

        Ok(Plan {
            tree: moved,
            landing,
            changes,
            originals,
            rebalanced,
        })
    }

    /// Key for the slot between `prev` and `next` that no other item of the
    /// scope holds before the drop.
    fn free_key(
        &self,
        prev: Option<&RankKey>,
        next: Option<&RankKey>,
        taken: &[RankKey],
    ) -> Result<RankKey, RankError> {
        let mut key = self.allocator.key_for_slot(prev, next)?;
        while taken.contains(&key) {
            key = self.allocator.key_for_slot(prev, Some(&key))?;
        }
        Ok(key)
    }
}

/// Order `changes` so that no write targets a rank still held by an item that
/// is itself waiting to be written.
fn order_writes(changes: Vec<PositionUpdate>, tree: &TreeIndex) -> Vec<PositionUpdate> {
    let holders: Vec<Vec<ItemId>> = changes
        .iter()
        .map(|update| {
            changes
                .iter()
                .filter(|other| other.id != update.id)
                .filter(|other| {
                    tree.find_by_id(other.id).is_some_and(|held| {
                        held.stack_rank == update.stack_rank && held.scope() == update.scope
                    })
                })
                .map(|other| other.id)
                .collect()
        })
        .collect();

    let mut pending: Vec<(PositionUpdate, Vec<ItemId>)> = changes.into_iter().zip(holders).collect();
    let mut ordered: Vec<PositionUpdate> = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let ready = pending.iter().position(|(_, holders)| {
            holders
                .iter()
                .all(|holder| ordered.iter().any(|done| done.id == *holder))
        });
        let idx = ready.unwrap_or_else(|| {
            warn!(remaining = pending.len(), "Position writes hold each other's ranks");
            0
        });
        ordered.push(pending.remove(idx).0);
    }
    ordered
}

impl<S: PositionStore> DragReorderCoordinator<S> {
    /// Drop `item` on `target`.
    ///
    /// The move is visible through [`tree`](Self::tree) before the store is
    /// called. On a store failure the tree is restored and the error returned.
    ///
    /// # Errors
    /// - [`ReorderError::NotDragging`] when no drag is in progress for `item`.
    /// - [`ReorderError::Rejected`] when the drop is structurally invalid.
    /// - [`ReorderError::Rank`] when no key fits even after rebalancing.
    /// - [`ReorderError::Store`] when the write failed and was rolled back.
    pub async fn on_drag_end(&self, item: ItemId, target: DropTarget) -> Result<DragOutcome, ReorderError> {
        let (seq, revision, snapshot, origin, plan) = {
            let mut state = self.state.lock().await;
            let origin = match state.sessions.get(&item) {
                Some(session) if session.phase == DragPhase::Dragging => session.origin.clone(),
                _ => return Err(ReorderError::NotDragging(item)),
            };
            let snapshot = state.tree.clone();
            let mut plan = match self.plan(&snapshot, item, target) {
                Ok(plan) => plan,
                Err(err) => {
                    warn!(%item, over = %target.over, error = %err, "Drop rejected");
                    state.set_phase(item, DragPhase::RolledBack);
                    return Err(err);
                }
            };
            state.next_seq += 1;
            let seq = state.next_seq;
            state.latest_seq.insert(item, seq);
            state.set_phase(item, DragPhase::Resolving);
            state.replace_tree(std::mem::take(&mut plan.tree));
            debug!(
                %item,
                seq,
                cross_scope = origin != plan.landing,
                writes = plan.changes.len(),
                "Applied optimistic move"
            );
            (seq, state.revision, snapshot, origin, plan)
        };

        let result = match plan.changes.as_slice() {
            [single] => self
                .store
                .update_item_position(single)
                .await
                .map(|stored| vec![stored]),
            changes => self.store.update_positions(changes).await,
        };

        let mut state = self.state.lock().await;
        if state.latest_seq.get(&item) != Some(&seq) {
            debug!(%item, seq, "Discarding superseded reorder outcome");
            return Ok(DragOutcome::Superseded);
        }
        state.latest_seq.remove(&item);

        match result {
            Ok(stored) => {
                let confirmed = state.tree.apply_items(&stored);
                state.replace_tree(confirmed);
                state.sessions.remove(&item);
                let stored_item = stored
                    .into_iter()
                    .find(|candidate| candidate.id == item)
                    .or_else(|| state.tree.find_by_id(item).cloned())
                    .ok_or(ReorderError::UnknownItem(item))?;
                info!(%item, rank = %stored_item.stack_rank, "Reorder committed");
                Ok(DragOutcome::Committed {
                    item: stored_item,
                    rebalanced: plan.rebalanced,
                })
            }
            Err(err) => {
                if state.revision == revision {
                    state.replace_tree(snapshot);
                } else {
                    let restored = state.tree.apply_items(&plan.originals);
                    state.replace_tree(restored);
                }
                state.set_phase(item, DragPhase::RolledBack);
                warn!(%item, error = %err, "Reorder rolled back");
                // A failed batch may have been partly stored.
                if err.requires_refetch() || plan.changes.len() > 1 {
                    let mut scopes = vec![origin];
                    if !scopes.contains(&plan.landing) {
                        scopes.push(plan.landing);
                    }
                    self.request_refetch(RefetchRequest {
                        item,
                        scopes,
                        reason: err.to_string(),
                    });
                }
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryBacklog;
    use backlog_core::item::ItemKind;
    use std::sync::Arc;

    fn rank(text: &str) -> RankKey {
        RankKey::parse(text).unwrap_or_else(|err| panic!("{err}"))
    }

    fn task(key: &str) -> WorkItem {
        WorkItem::new(ItemId::new(), ItemKind::Task, "board", "alpha", rank(key))
    }

    fn coordinator(
        items: &[WorkItem],
        ranking: &RankingConfig,
    ) -> (
        DragReorderCoordinator<Arc<InMemoryBacklog>>,
        mpsc::UnboundedReceiver<RefetchRequest>,
    ) {
        let store = Arc::new(InMemoryBacklog::new(items.iter().cloned()));
        DragReorderCoordinator::new(store, TreeIndex::build(items.iter().cloned()), ranking)
    }

    fn root_order(tree: &TreeIndex) -> Vec<ItemId> {
        tree.roots().to_vec()
    }

    #[test]
    fn writes_wait_for_the_holder_of_their_rank() {
        let a = task("b");
        let b = task("d");
        let tree = TreeIndex::build([a.clone(), b.clone()]);
        let mut a_up = PositionUpdate::of(&a);
        a_up.stack_rank = rank("d");
        let mut b_up = PositionUpdate::of(&b);
        b_up.stack_rank = rank("m");
        let ordered = order_writes(vec![a_up.clone(), b_up.clone()], &tree);
        assert_eq!(ordered, vec![b_up, a_up]);
    }

    #[tokio::test]
    async fn same_item_cannot_be_picked_up_twice() {
        let a = task("b");
        let b = task("d");
        let (coord, _rx) = coordinator(&[a.clone(), b.clone()], &RankingConfig::default());
        assert!(coord.on_drag_start(a.id).await);
        assert!(!coord.on_drag_start(a.id).await);
        assert!(coord.on_drag_start(b.id).await);
        assert!(!coord.on_drag_start(ItemId::new()).await);
        assert_eq!(coord.phase(a.id).await, DragPhase::Dragging);
        let origin = coord.drag_origin(a.id).await.map(|(_, index)| index);
        assert_eq!(origin, Some(0));
    }

    #[tokio::test]
    async fn drag_over_only_records_hover() {
        let a = task("b");
        let b = task("d");
        let (coord, _rx) = coordinator(&[a.clone(), b.clone()], &RankingConfig::default());
        let before = coord.tree().await;
        assert!(!coord.on_drag_over(a.id, Some(DropTarget::after(b.id))).await);
        assert!(coord.on_drag_start(a.id).await);
        assert!(coord.on_drag_over(a.id, Some(DropTarget::after(b.id))).await);
        assert_eq!(coord.hover_target(a.id).await, Some(DropTarget::after(b.id)));
        assert_eq!(coord.tree().await, before);
        assert!(coord.on_drag_cancel(a.id).await);
        assert_eq!(coord.phase(a.id).await, DragPhase::Idle);
    }

    #[tokio::test]
    async fn drop_without_drag_is_an_error() {
        let a = task("b");
        let b = task("d");
        let (coord, _rx) = coordinator(&[a.clone(), b.clone()], &RankingConfig::default());
        assert!(matches!(
            coord.on_drag_end(a.id, DropTarget::after(b.id)).await,
            Err(ReorderError::NotDragging(_))
        ));
    }

    #[tokio::test]
    async fn committed_move_updates_tree_and_store() {
        let a = task("b");
        let b = task("d");
        let (coord, mut rx) = coordinator(&[a.clone(), b.clone()], &RankingConfig::default());
        assert!(coord.on_drag_start(a.id).await);
        let outcome = coord
            .on_drag_end(a.id, DropTarget::after(b.id))
            .await
            .unwrap_or_else(|err| panic!("drop must commit: {err}"));
        let DragOutcome::Committed { item, rebalanced } = outcome else {
            panic!("expected commit");
        };
        assert_eq!(rebalanced, 0);
        assert!(item.stack_rank > b.stack_rank);
        assert_eq!(root_order(&coord.tree().await), vec![b.id, a.id]);
        assert_eq!(coord.store().get(a.id).await, Some(item));
        assert_eq!(coord.phase(a.id).await, DragPhase::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn invalid_drop_leaves_tree_untouched() {
        let parent = task("b");
        let mut child = task("i");
        child.parent = Some(parent.id);
        let (coord, _rx) = coordinator(&[parent.clone(), child.clone()], &RankingConfig::default());
        let before = coord.tree().await;
        assert!(coord.on_drag_start(parent.id).await);
        assert!(matches!(
            coord.on_drag_end(parent.id, DropTarget::child_of(child.id)).await,
            Err(ReorderError::Rejected { .. })
        ));
        assert_eq!(coord.tree().await, before);
        assert_eq!(coord.phase(parent.id).await, DragPhase::RolledBack);
        assert!(coord.on_drag_start(parent.id).await);
    }

    #[tokio::test]
    async fn exhausted_gap_triggers_rebalance_and_retry() {
        let ranking = RankingConfig {
            max_key_length: 2,
            rebalance_on_duplicates: true,
        };
        let a = task("b1");
        let b = task("b2");
        let c = task("z");
        let (coord, _rx) = coordinator(&[a.clone(), b.clone(), c.clone()], &ranking);
        assert!(coord.on_drag_start(c.id).await);
        let outcome = coord
            .on_drag_end(c.id, DropTarget::before(b.id))
            .await
            .unwrap_or_else(|err| panic!("rebalanced drop must commit: {err}"));
        assert!(matches!(outcome, DragOutcome::Committed { rebalanced: 2, .. }));
        assert_eq!(root_order(&coord.tree().await), vec![a.id, c.id, b.id]);

        let stored = coord.store().snapshot().await;
        let mut ranks: Vec<(RankKey, ItemId)> =
            stored.iter().map(|item| (item.stack_rank.clone(), item.id)).collect();
        ranks.sort();
        assert_eq!(ranks.iter().map(|(_, id)| *id).collect::<Vec<_>>(), vec![a.id, c.id, b.id]);
        assert!(ranks.iter().all(|(key, _)| key.len() <= 2));
    }

    #[tokio::test]
    async fn duplicate_ranks_are_respaced_before_insert() {
        let a = task("m");
        let b = task("m");
        let c = task("x");
        let (coord, _rx) = coordinator(&[a.clone(), b.clone(), c.clone()], &RankingConfig::default());
        assert!(!coord.tree().await.rebalance_candidates().is_empty());
        assert!(coord.on_drag_start(c.id).await);
        let outcome = coord
            .on_drag_end(c.id, DropTarget::before(a.id.max(b.id)))
            .await
            .unwrap_or_else(|err| panic!("drop must commit: {err}"));
        assert!(matches!(outcome, DragOutcome::Committed { rebalanced: 2, .. }));
        let tree = coord.tree().await;
        assert!(tree.rebalance_candidates().is_empty());
        assert_eq!(root_order(&tree), vec![a.id.min(b.id), c.id, a.id.max(b.id)]);
    }
}
