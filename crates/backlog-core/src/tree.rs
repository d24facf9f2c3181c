//! Hierarchical view over a loaded backlog.
//!
//! Items live in a flat map keyed by id; parent/child links are id lists
//! resolved on demand. Every mutation returns a new index and leaves the
//! receiver untouched, so callers can keep the previous value as a snapshot.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::id::ItemId;
use crate::item::{Scope, WorkItem};
use crate::rank::RankKey;

/// Where a dragged item lands relative to the item it was dropped on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Sibling immediately before the target.
    Before,
    /// Sibling immediately after the target.
    After,
    /// First child of the target within the moved item's scope.
    AsChild,
}

/// Request for [`TreeIndex::move_item`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
    /// Item being moved.
    pub source: ItemId,
    /// Item the source is dropped on.
    pub target: ItemId,
    /// Landing position relative to `target`.
    pub placement: Placement,
    /// New stack rank for the source, if one was allocated.
    pub rank: Option<RankKey>,
}

impl MoveRequest {
    /// Sibling-before or first-child move without a rank change.
    #[must_use]
    pub const fn new(source: ItemId, target: ItemId, as_child_of: bool) -> Self {
        Self {
            source,
            target,
            placement: if as_child_of {
                Placement::AsChild
            } else {
                Placement::Before
            },
            rank: None,
        }
    }

    /// Attach the rank the source should carry after the move.
    #[must_use]
    pub fn with_rank(mut self, rank: RankKey) -> Self {
        self.rank = Some(rank);
        self
    }
}

/// Position of an item inside its parent's children list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot<'a> {
    /// Parent in the tree, `None` for the root list.
    pub parent: Option<ItemId>,
    /// Index within the parent's children list.
    pub index: usize,
    /// The item itself.
    pub item: &'a WorkItem,
}

/// Depth of an item below the root list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Depth<'a> {
    /// Zero for root items.
    pub depth: usize,
    /// Parent in the tree.
    pub parent: Option<ItemId>,
    /// The item itself.
    pub item: &'a WorkItem,
}

/// Entry of a pre-order traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatNode<'a> {
    /// Zero for root items.
    pub depth: usize,
    /// The item itself.
    pub item: &'a WorkItem,
}

/// Owned nested view used for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode {
    /// The item.
    pub item: WorkItem,
    /// Children in display order.
    pub children: Vec<TreeNode>,
}

/// Neighbors of the slot a dragged item would occupy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropSlot<'a> {
    /// Scope the item would rank in after the drop.
    pub scope: Scope,
    /// Same-scope item right before the slot.
    pub prev: Option<&'a WorkItem>,
    /// Same-scope item right after the slot.
    pub next: Option<&'a WorkItem>,
    /// Same-scope items in order, without the dragged item.
    pub peers: Vec<&'a WorkItem>,
}

impl DropSlot<'_> {
    /// Rank of the previous neighbor.
    #[must_use]
    pub fn prev_rank(&self) -> Option<&RankKey> {
        self.prev.map(|item| &item.stack_rank)
    }

    /// Rank of the next neighbor.
    #[must_use]
    pub fn next_rank(&self) -> Option<&RankKey> {
        self.next.map(|item| &item.stack_rank)
    }

    /// Index of the slot within [`peers`](Self::peers).
    #[must_use]
    pub fn insert_index(&self) -> usize {
        self.prev
            .and_then(|prev| self.peers.iter().position(|peer| peer.id == prev.id))
            .map_or(0, |idx| idx + 1)
    }
}

/// Materialized hierarchy for one loaded backlog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeIndex {
    items: HashMap<ItemId, WorkItem>,
    roots: Vec<ItemId>,
    children: HashMap<ItemId, Vec<ItemId>>,
    parent_of: HashMap<ItemId, ItemId>,
    rebalance: BTreeSet<Scope>,
}

impl TreeIndex {
    /// Build the hierarchy from a flat item set.
    ///
    /// Items whose parent is absent become roots. Parent links that form a
    /// cycle are cut at the lowest id of the cycle, which then becomes a root.
    #[must_use]
    pub fn build(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let mut index = Self::default();
        for item in items {
            index.items.insert(item.id, item);
        }

        let mut ids: Vec<ItemId> = index.items.keys().copied().collect();
        ids.sort_unstable();
        for &id in &ids {
            index.children.entry(id).or_default();
            let parent = index.items[&id]
                .parent
                .filter(|parent| *parent != id && index.items.contains_key(parent));
            match parent {
                Some(parent) => {
                    index.children.entry(parent).or_default().push(id);
                    index.parent_of.insert(id, parent);
                }
                None => index.roots.push(id),
            }
        }

        let mut visited = HashSet::with_capacity(ids.len());
        for root in index.roots.clone() {
            index.mark_subtree(root, &mut visited);
        }
        for &id in &ids {
            if visited.contains(&id) {
                continue;
            }
            index.detach(id);
            index.roots.push(id);
            index.mark_subtree(id, &mut visited);
        }

        index.sort_list(None);
        for id in ids {
            index.sort_list(Some(id));
        }
        index
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when no items are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether `id` is part of the tree.
    #[must_use]
    pub fn contains(&self, id: ItemId) -> bool {
        self.items.contains_key(&id)
    }

    /// Top-level items in display order.
    #[must_use]
    pub fn roots(&self) -> &[ItemId] {
        &self.roots
    }

    /// Children of `id` in display order.
    #[must_use]
    pub fn children_of(&self, id: ItemId) -> &[ItemId] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    /// Scopes holding two siblings with the same rank.
    #[must_use]
    pub const fn rebalance_candidates(&self) -> &BTreeSet<Scope> {
        &self.rebalance
    }

    /// Look up an item.
    #[must_use]
    pub fn find_by_id(&self, id: ItemId) -> Option<&WorkItem> {
        self.items.get(&id)
    }

    /// Parent and index of `id` in its parent's children list.
    #[must_use]
    pub fn find_parent_and_index(&self, id: ItemId) -> Option<Slot<'_>> {
        let item = self.items.get(&id)?;
        let parent = self.parent_of.get(&id).copied();
        let index = self.list(parent).iter().position(|sibling| *sibling == id)?;
        Some(Slot {
            parent,
            index,
            item,
        })
    }

    /// Depth and parent of `id`.
    #[must_use]
    pub fn depth_and_parent(&self, id: ItemId) -> Option<Depth<'_>> {
        let item = self.items.get(&id)?;
        let parent = self.parent_of.get(&id).copied();
        let mut depth = 0;
        let mut cursor = parent;
        while let Some(ancestor) = cursor {
            depth += 1;
            cursor = self.parent_of.get(&ancestor).copied();
        }
        Some(Depth {
            depth,
            parent,
            item,
        })
    }

    /// Pre-order traversal of the whole tree.
    #[must_use]
    pub fn flatten(&self) -> Vec<FlatNode<'_>> {
        let mut out = Vec::with_capacity(self.items.len());
        let mut stack: Vec<(usize, ItemId)> = self.roots.iter().rev().map(|id| (0, *id)).collect();
        while let Some((depth, id)) = stack.pop() {
            let Some(item) = self.items.get(&id) else {
                continue;
            };
            out.push(FlatNode { depth, item });
            stack.extend(self.children_of(id).iter().rev().map(|child| (depth + 1, *child)));
        }
        out
    }

    /// Items ranking in `scope`, in order.
    #[must_use]
    pub fn scope_items(&self, scope: &Scope) -> Vec<&WorkItem> {
        let list_parent = scope.parent.filter(|parent| self.items.contains_key(parent));
        self.list(list_parent)
            .iter()
            .filter_map(|id| self.items.get(id))
            .filter(|item| item.scope() == *scope)
            .collect()
    }

    /// Owned nested view of the whole tree.
    #[must_use]
    pub fn nodes(&self) -> Vec<TreeNode> {
        self.roots.iter().filter_map(|id| self.node(*id)).collect()
    }

    fn node(&self, id: ItemId) -> Option<TreeNode> {
        let item = self.items.get(&id)?.clone();
        let children = self
            .children_of(id)
            .iter()
            .filter_map(|child| self.node(*child))
            .collect();
        Some(TreeNode { item, children })
    }

    /// Neighbors of the slot `source` would take when dropped on `target`.
    ///
    /// Returns `None` under the same conditions as [`move_item`](Self::move_item).
    #[must_use]
    pub fn drop_slot(&self, source: ItemId, target: ItemId, placement: Placement) -> Option<DropSlot<'_>> {
        let (moving, over) = self.check_move(source, target)?;
        let scope = Self::landing_scope(moving, over, placement);
        let list_parent = match placement {
            Placement::Before | Placement::After => self.parent_of.get(&target).copied(),
            Placement::AsChild => Some(target),
        };
        let peers: Vec<&WorkItem> = self
            .list(list_parent)
            .iter()
            .filter(|id| **id != source)
            .filter_map(|id| self.items.get(id))
            .filter(|item| item.scope() == scope)
            .collect();

        let (prev, next) = match placement {
            Placement::AsChild => (None, peers.first().copied()),
            Placement::Before => {
                let idx = peers.iter().position(|peer| peer.id == target)?;
                (idx.checked_sub(1).map(|prev| peers[prev]), Some(peers[idx]))
            }
            Placement::After => {
                let idx = peers.iter().position(|peer| peer.id == target)?;
                (Some(peers[idx]), peers.get(idx + 1).copied())
            }
        };
        Some(DropSlot {
            scope,
            prev,
            next,
            peers,
        })
    }

    /// Move `source` next to or under `target`, returning the updated tree.
    ///
    /// A sibling drop adopts the target's scope; a child drop keeps the source's
    /// kind and takes the target as parent. The moved subtree follows the new
    /// container and project. Returns `None`, leaving nothing changed, when
    /// either id is unknown, when `source == target`, or when `target` lies
    /// inside the source's subtree.
    #[must_use]
    pub fn move_item(&self, request: &MoveRequest) -> Option<Self> {
        let (moving, over) = self.check_move(request.source, request.target)?;
        let scope = Self::landing_scope(moving, over, request.placement);

        let mut next = self.clone();
        let origin = next.parent_of.get(&request.source).copied();
        next.detach(request.source);
        if let Some(item) = next.items.get_mut(&request.source) {
            item.relocate(&scope);
            if let Some(rank) = &request.rank {
                item.stack_rank = rank.clone();
            }
        }
        next.propagate_location(request.source, &scope);

        let (list_parent, index) = match request.placement {
            Placement::Before | Placement::After => {
                let parent = next.parent_of.get(&request.target).copied();
                let idx = next.list(parent).iter().position(|id| *id == request.target)?;
                let offset = usize::from(request.placement == Placement::After);
                (parent, idx + offset)
            }
            Placement::AsChild => {
                let idx = next
                    .children_of(request.target)
                    .iter()
                    .position(|id| next.items.get(id).is_some_and(|child| child.kind >= scope.kind))
                    .unwrap_or_else(|| next.children_of(request.target).len());
                (Some(request.target), idx)
            }
        };
        next.list_mut(list_parent).insert(index, request.source);
        if let Some(parent) = list_parent {
            next.parent_of.insert(request.source, parent);
        }
        next.refresh_flags(origin);
        next.refresh_flags(list_parent);
        Some(next)
    }

    /// Replace items with the given versions and re-place each one under its
    /// own parent, ordered by rank.
    ///
    /// Used to apply rebalanced ranks, accept server-confirmed items, and roll
    /// back optimistic moves. Ids not present in the tree are ignored.
    #[must_use]
    pub fn apply_items(&self, items: &[WorkItem]) -> Self {
        let mut next = self.clone();
        let mut dirty = BTreeSet::new();
        for item in items {
            if !next.items.contains_key(&item.id) {
                continue;
            }
            let desired = item
                .parent
                .filter(|parent| next.items.contains_key(parent) && !next.is_within(*parent, item.id));
            let current = next.parent_of.get(&item.id).copied();
            next.items.insert(item.id, item.clone());
            if desired != current {
                next.detach(item.id);
                next.list_mut(desired).push(item.id);
                if let Some(parent) = desired {
                    next.parent_of.insert(item.id, parent);
                }
                dirty.insert(current);
            }
            dirty.insert(desired);
        }
        for parent in dirty {
            next.sort_list(parent);
        }
        next
    }

    /// Items of the subtree rooted at `id`, root first.
    #[must_use]
    pub fn subtree(&self, id: ItemId) -> Vec<&WorkItem> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(item) = self.items.get(&current) {
                out.push(item);
                stack.extend(self.children_of(current).iter().rev());
            }
        }
        out
    }

    fn check_move(&self, source: ItemId, target: ItemId) -> Option<(&WorkItem, &WorkItem)> {
        if source == target {
            return None;
        }
        let moving = self.items.get(&source)?;
        let over = self.items.get(&target)?;
        if self.is_within(target, source) {
            return None;
        }
        Some((moving, over))
    }

    fn landing_scope(moving: &WorkItem, over: &WorkItem, placement: Placement) -> Scope {
        match placement {
            Placement::Before | Placement::After => over.scope(),
            Placement::AsChild => Scope {
                container: over.container.clone(),
                project: over.project.clone(),
                kind: moving.kind,
                parent: Some(over.id),
            },
        }
    }

    /// True when `id` equals `ancestor` or sits below it.
    fn is_within(&self, id: ItemId, ancestor: ItemId) -> bool {
        let mut cursor = Some(id);
        let mut hops = 0;
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            hops += 1;
            if hops > self.items.len() {
                return false;
            }
            cursor = self.parent_of.get(&current).copied();
        }
        false
    }

    fn list(&self, parent: Option<ItemId>) -> &[ItemId] {
        match parent {
            Some(parent) => self.children_of(parent),
            None => &self.roots,
        }
    }

    fn list_mut(&mut self, parent: Option<ItemId>) -> &mut Vec<ItemId> {
        match parent {
            Some(parent) => self.children.entry(parent).or_default(),
            None => &mut self.roots,
        }
    }

    fn detach(&mut self, id: ItemId) {
        let parent = self.parent_of.remove(&id);
        self.list_mut(parent).retain(|member| *member != id);
    }

    fn mark_subtree(&self, root: ItemId, visited: &mut HashSet<ItemId>) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if visited.insert(id) {
                stack.extend(self.children_of(id).iter().copied());
            }
        }
    }

    fn propagate_location(&mut self, root: ItemId, scope: &Scope) {
        let mut stack: Vec<ItemId> = self.children_of(root).to_vec();
        while let Some(id) = stack.pop() {
            if let Some(item) = self.items.get_mut(&id) {
                item.container.clone_from(&scope.container);
                item.project.clone_from(&scope.project);
            }
            stack.extend(self.children_of(id).iter().copied());
        }
    }

    fn sort_list(&mut self, parent: Option<ItemId>) {
        let items = &self.items;
        let list = match parent {
            Some(parent) => self.children.entry(parent).or_default(),
            None => &mut self.roots,
        };
        list.sort_by(|a, b| match (items.get(a), items.get(b)) {
            (Some(a), Some(b)) => a.sibling_key().cmp(&b.sibling_key()),
            _ => a.cmp(b),
        });
        self.refresh_flags(parent);
    }

    /// Recompute duplicate-rank flags for the scopes found in one list.
    fn refresh_flags(&mut self, parent: Option<ItemId>) {
        let mut seen = HashSet::new();
        let mut scopes = BTreeSet::new();
        let mut duplicated = BTreeSet::new();
        for item in self.list(parent).iter().filter_map(|id| self.items.get(id)) {
            let scope = item.scope();
            if !seen.insert((scope.clone(), item.stack_rank.clone())) {
                duplicated.insert(scope.clone());
            }
            scopes.insert(scope);
        }
        for scope in scopes {
            if duplicated.contains(&scope) {
                self.rebalance.insert(scope);
            } else {
                self.rebalance.remove(&scope);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use crate::item::ItemKind;
    use crate::rank::RankAllocator;
    use std::str::FromStr;

    fn id(n: u8) -> ItemId {
        ItemId::from_str(&format!("00000000-0000-0000-0000-0000000000{n:02}"))
            .unwrap_or_else(|err| panic!("must parse item id: {err}"))
    }

    fn rank(text: &str) -> RankKey {
        RankKey::parse(text).unwrap_or_else(|err| panic!("{err}"))
    }

    fn item(n: u8, kind: ItemKind, parent: Option<u8>, key: &str) -> WorkItem {
        let mut item = WorkItem::new(id(n), kind, "board", "alpha", rank(key));
        item.parent = parent.map(id);
        item
    }

    /// Epic 1 { Task 3 "b", Task 4 "d" }, Epic 2 { }, Epic 5 { Task 6 "m" }
    fn sample() -> TreeIndex {
        TreeIndex::build(vec![
            item(4, ItemKind::Task, Some(1), "d"),
            item(1, ItemKind::Epic, None, "c"),
            item(3, ItemKind::Task, Some(1), "b"),
            item(2, ItemKind::Epic, None, "f"),
            item(5, ItemKind::Epic, None, "k"),
            item(6, ItemKind::Task, Some(5), "m"),
        ])
    }

    fn order(tree: &TreeIndex) -> Vec<(usize, ItemId)> {
        tree.flatten().iter().map(|node| (node.depth, node.item.id)).collect()
    }

    fn assert_single_membership(tree: &TreeIndex) {
        let mut seen = HashSet::new();
        for node in tree.flatten() {
            assert!(seen.insert(node.item.id), "{} listed twice", node.item.id);
        }
        assert_eq!(seen.len(), tree.len());
    }

    #[test]
    fn build_orders_siblings_by_rank() {
        let tree = sample();
        assert_eq!(
            order(&tree),
            vec![(0, id(1)), (1, id(3)), (1, id(4)), (0, id(2)), (0, id(5)), (1, id(6))]
        );
        assert!(tree.rebalance_candidates().is_empty());
    }

    #[test]
    fn lookups_report_position_and_depth() {
        let tree = sample();
        let slot = tree.find_parent_and_index(id(4)).expect("slot");
        assert_eq!(slot.parent, Some(id(1)));
        assert_eq!(slot.index, 1);
        let depth = tree.depth_and_parent(id(6)).expect("depth");
        assert_eq!(depth.depth, 1);
        assert_eq!(depth.parent, Some(id(5)));
        assert_eq!(tree.depth_and_parent(id(2)).map(|d| d.depth), Some(0));
        assert!(tree.find_by_id(id(99)).is_none());
        assert!(tree.find_parent_and_index(id(99)).is_none());
    }

    #[test]
    fn move_before_sibling_in_same_parent() {
        let tree = sample();
        let moved = tree
            .move_item(&MoveRequest::new(id(4), id(3), false))
            .expect("valid move");
        assert_eq!(moved.children_of(id(1)), &[id(4), id(3)]);
        assert_eq!(tree.children_of(id(1)), &[id(3), id(4)], "input tree untouched");
        assert_single_membership(&moved);
    }

    #[test]
    fn move_as_child_reparents_and_keeps_kind() {
        let tree = sample();
        let moved = tree
            .move_item(&MoveRequest::new(id(3), id(2), true))
            .expect("valid move");
        assert_eq!(moved.children_of(id(2)), &[id(3)]);
        assert_eq!(moved.children_of(id(1)), &[id(4)]);
        let item = moved.find_by_id(id(3)).expect("present");
        assert_eq!(item.parent, Some(id(2)));
        assert_eq!(item.kind, ItemKind::Task);
        assert_single_membership(&moved);
    }

    #[test]
    fn sibling_drop_adopts_target_scope() {
        let tree = sample();
        let moved = tree
            .move_item(&MoveRequest {
                source: id(3),
                target: id(2),
                placement: Placement::After,
                rank: Some(rank("g")),
            })
            .expect("valid move");
        let item = moved.find_by_id(id(3)).expect("present");
        assert_eq!(item.scope(), moved.find_by_id(id(2)).expect("target").scope());
        assert_eq!(item.stack_rank, rank("g"));
        assert_eq!(moved.roots(), &[id(1), id(2), id(3), id(5)]);
    }

    #[test]
    fn move_rejects_unknown_self_and_descendant_targets() {
        let tree = sample();
        assert!(tree.move_item(&MoveRequest::new(id(99), id(1), false)).is_none());
        assert!(tree.move_item(&MoveRequest::new(id(1), id(99), false)).is_none());
        assert!(tree.move_item(&MoveRequest::new(id(1), id(1), true)).is_none());
        assert!(tree.move_item(&MoveRequest::new(id(1), id(3), true)).is_none());
        assert!(tree.drop_slot(id(5), id(6), Placement::Before).is_none());
    }

    #[test]
    fn moved_subtree_follows_new_project() {
        let mut other = item(7, ItemKind::Epic, None, "i");
        other.project = "beta".into();
        let mut items: Vec<WorkItem> = sample().flatten().iter().map(|n| n.item.clone()).collect();
        items.push(other);
        let tree = TreeIndex::build(items);
        let moved = tree
            .move_item(&MoveRequest::new(id(1), id(7), false))
            .expect("valid move");
        assert_eq!(moved.find_by_id(id(1)).map(|i| i.project.as_str()), Some("beta"));
        assert_eq!(moved.find_by_id(id(3)).map(|i| i.project.as_str()), Some("beta"));
        assert_eq!(moved.children_of(id(1)), &[id(3), id(4)]);
    }

    #[test]
    fn drop_into_empty_epic_uses_initial_rank() {
        let tree = sample();
        let alloc = RankAllocator::default();
        let slot = tree.drop_slot(id(4), id(2), Placement::AsChild).expect("slot");
        assert!(slot.peers.is_empty());
        let key = alloc
            .key_for_slot(slot.prev_rank(), slot.next_rank())
            .unwrap_or_else(|err| panic!("{err}"));
        assert_eq!(key, alloc.initial());

        let moved = tree
            .move_item(&MoveRequest::new(id(4), id(2), true).with_rank(key.clone()))
            .expect("valid move");
        let item = moved.find_by_id(id(4)).expect("present");
        assert_eq!(item.parent, Some(id(2)));
        assert_eq!(item.stack_rank, key);
    }

    #[test]
    fn drop_slot_ignores_source_and_other_scopes() {
        let mut issue = item(8, ItemKind::Issue, Some(1), "a");
        issue.title = "other scope".into();
        let mut items: Vec<WorkItem> = sample().flatten().iter().map(|n| n.item.clone()).collect();
        items.push(issue);
        let tree = TreeIndex::build(items);

        let slot = tree.drop_slot(id(3), id(4), Placement::After).expect("slot");
        let peer_ids: Vec<ItemId> = slot.peers.iter().map(|p| p.id).collect();
        assert_eq!(peer_ids, vec![id(4)]);
        assert_eq!(slot.prev.map(|p| p.id), Some(id(4)));
        assert!(slot.next.is_none());
        assert_eq!(slot.insert_index(), 1);

        let slot = tree.drop_slot(id(6), id(3), Placement::Before).expect("slot");
        assert!(slot.prev.is_none());
        assert_eq!(slot.next.map(|p| p.id), Some(id(3)));
        assert_eq!(slot.scope.parent, Some(id(1)));
    }

    #[test]
    fn moving_there_and_back_restores_relative_order() {
        let alloc = RankAllocator::default();
        let tree = TreeIndex::build(vec![
            item(1, ItemKind::Epic, None, "c"),
            item(2, ItemKind::Task, Some(1), "b"),
            item(3, ItemKind::Task, Some(1), "d"),
            item(4, ItemKind::Task, Some(1), "f"),
        ]);
        let apply = |tree: &TreeIndex, source: u8, target: u8, placement: Placement| {
            let slot = tree.drop_slot(id(source), id(target), placement).expect("slot");
            let key = alloc
                .key_for_slot(slot.prev_rank(), slot.next_rank())
                .unwrap_or_else(|err| panic!("{err}"));
            tree.move_item(&MoveRequest {
                source: id(source),
                target: id(target),
                placement,
                rank: Some(key),
            })
            .expect("valid move")
        };

        let away = apply(&tree, 2, 4, Placement::After);
        assert_eq!(away.children_of(id(1)), &[id(3), id(4), id(2)]);
        let back = apply(&away, 2, 3, Placement::Before);
        assert_eq!(back.children_of(id(1)), tree.children_of(id(1)));

        let rebuilt = TreeIndex::build(back.flatten().iter().map(|n| n.item.clone()));
        assert_eq!(rebuilt.children_of(id(1)), tree.children_of(id(1)));
    }

    #[test]
    fn apply_items_rolls_back_a_move() {
        let tree = sample();
        let original = tree.find_by_id(id(3)).cloned().expect("present");
        let moved = tree
            .move_item(&MoveRequest::new(id(3), id(6), false).with_rank(rank("a")))
            .expect("valid move");
        assert_eq!(moved.children_of(id(5)), &[id(3), id(6)]);
        let restored = moved.apply_items(&[original]);
        assert_eq!(restored, tree);
    }

    #[test]
    fn duplicate_ranks_tie_break_by_id_and_flag_scope() {
        let tree = TreeIndex::build(vec![
            item(1, ItemKind::Epic, None, "c"),
            item(3, ItemKind::Task, Some(1), "b"),
            item(2, ItemKind::Task, Some(1), "b"),
        ]);
        assert_eq!(tree.children_of(id(1)), &[id(2), id(3)]);
        let scope = tree.find_by_id(id(2)).expect("present").scope();
        assert!(tree.rebalance_candidates().contains(&scope));

        let mut fixed = tree.find_by_id(id(3)).cloned().expect("present");
        fixed.stack_rank = rank("bi");
        let repaired = tree.apply_items(&[fixed]);
        assert!(repaired.rebalance_candidates().is_empty());
    }

    #[test]
    fn orphans_and_cycles_become_roots() {
        let tree = TreeIndex::build(vec![
            item(1, ItemKind::Epic, Some(2), "a"),
            item(2, ItemKind::Epic, Some(1), "b"),
            item(3, ItemKind::Task, Some(42), "c"),
        ]);
        assert_eq!(tree.roots(), &[id(1), id(3)]);
        assert_eq!(tree.children_of(id(1)), &[id(2)]);
        assert_single_membership(&tree);
    }

    #[test]
    fn nodes_mirror_flatten_order() {
        let tree = sample();
        let nodes = tree.nodes();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].item.id, id(1));
        let child_ids: Vec<ItemId> = nodes[0].children.iter().map(|n| n.item.id).collect();
        assert_eq!(child_ids, vec![id(3), id(4)]);
        assert_eq!(tree.subtree(id(1)).len(), 3);
    }

    #[test]
    fn scope_items_lists_only_matching_siblings() {
        let tree = sample();
        let scope = tree.find_by_id(id(3)).expect("present").scope();
        let ids: Vec<ItemId> = tree.scope_items(&scope).iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![id(3), id(4)]);
    }
}
