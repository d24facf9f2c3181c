use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::id::ItemId;
use crate::rank::RankKey;

/// Kind of a work item. Declaration order is the display order of kinds
/// sharing one parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Large body of work grouping tasks and issues.
    Epic,
    /// Planned unit of work.
    Task,
    /// Reported problem.
    Issue,
}

impl ItemKind {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Epic => "epic",
            Self::Task => "task",
            Self::Issue => "issue",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when text does not name an [`ItemKind`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown item kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for ItemKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "epic" => Ok(Self::Epic),
            "task" => Ok(Self::Task),
            "issue" => Ok(Self::Issue),
            _ => Err(UnknownKind(s.to_owned())),
        }
    }
}

/// Partition inside which stack ranks are compared.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// Owning container (board, workspace).
    pub container: String,
    /// Owning project.
    pub project: String,
    /// Item kind.
    pub kind: ItemKind,
    /// Parent item, `None` for top-level items.
    pub parent: Option<ItemId>,
}

/// The slice of a work item the ordering and filtering engine reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Identifier.
    pub id: ItemId,
    /// Item kind.
    pub kind: ItemKind,
    /// Weak reference to the parent item.
    #[serde(default)]
    pub parent: Option<ItemId>,
    /// Sibling order key within [`scope`](Self::scope).
    pub stack_rank: RankKey,
    /// Owning container.
    pub container: String,
    /// Owning project.
    pub project: String,
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Workflow state label.
    #[serde(default)]
    pub state: Option<String>,
    /// Area path.
    #[serde(default)]
    pub area: Option<String>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Curated labels.
    #[serde(default)]
    pub labels: BTreeSet<String>,
    /// Current assignee.
    #[serde(default)]
    pub assignee: Option<String>,
    /// Creator.
    #[serde(default)]
    pub created_by: Option<String>,
    /// Last editor.
    #[serde(default)]
    pub updated_by: Option<String>,
    /// Users following the item.
    #[serde(default)]
    pub followers: BTreeSet<String>,
}

impl WorkItem {
    /// Minimal item with empty business fields.
    #[must_use]
    pub fn new(
        id: ItemId,
        kind: ItemKind,
        container: impl Into<String>,
        project: impl Into<String>,
        stack_rank: RankKey,
    ) -> Self {
        Self {
            id,
            kind,
            parent: None,
            stack_rank,
            container: container.into(),
            project: project.into(),
            title: String::new(),
            state: None,
            area: None,
            tags: BTreeSet::new(),
            labels: BTreeSet::new(),
            assignee: None,
            created_by: None,
            updated_by: None,
            followers: BTreeSet::new(),
        }
    }

    /// Scope the item currently ranks in.
    #[must_use]
    pub fn scope(&self) -> Scope {
        Scope {
            container: self.container.clone(),
            project: self.project.clone(),
            kind: self.kind,
            parent: self.parent,
        }
    }

    /// Move the item into `scope`, keeping its rank untouched.
    pub fn relocate(&mut self, scope: &Scope) {
        self.container.clone_from(&scope.container);
        self.project.clone_from(&scope.project);
        self.kind = scope.kind;
        self.parent = scope.parent;
    }

    /// Sibling sort key: kind first, then rank, then id as the tie-break.
    #[must_use]
    pub fn sibling_key(&self) -> (ItemKind, &RankKey, ItemId) {
        (self.kind, &self.stack_rank, self.id)
    }
}
