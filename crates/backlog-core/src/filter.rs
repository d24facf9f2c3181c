//! Compile named backlog filters into a single predicate.
//!
//! Every filter contributes to one accumulating [`Predicate`] in one of three
//! ways: a field condition ANDed with the rest, an array-membership test with
//! an explicit [`MatchMode`], or an OR-group. A second OR-group never replaces
//! the first; both move into an AND-of-ORs list.
//!
//! Filters that need the caller's identity (`assignedToMe`, `createdByMe`,
//! `following`, `myActivity`) are skipped when [`FilterContext::user_id`] is
//! absent. The predicate is then simply broader; no error is raised.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::id::ItemId;
use crate::item::{ItemKind, UnknownKind, WorkItem};
use crate::text_matcher::{TextMatcher, contains_normalized};

/// Errors raised while compiling filters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// Filter name is not recognized.
    #[error("unknown filter: {0}")]
    UnknownFilter(String),
    /// `status` value is not recognized.
    #[error("unknown status filter: {0}")]
    UnknownStatus(String),
    /// Match mode token is neither `any` nor `all`.
    #[error("unknown match mode: {0}")]
    UnknownMatchMode(String),
    /// `type` value does not name an item kind.
    #[error(transparent)]
    InvalidKind(#[from] UnknownKind),
    /// `parent` value is not an item id.
    #[error("invalid parent id: {0}")]
    InvalidParent(String),
    /// The filter does not accept this value shape.
    #[error("filter {filter} expects {expected}")]
    UnsupportedValue {
        /// Filter that received the value.
        filter: FilterName,
        /// Accepted shape.
        expected: &'static str,
    },
}

/// Item field a condition reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    /// Item kind.
    Kind,
    /// Parent id.
    Parent,
    /// Title.
    Title,
    /// Workflow state.
    State,
    /// Area path.
    Area,
    /// Tags.
    Tags,
    /// Labels.
    Labels,
    /// Assignee.
    Assignee,
    /// Creator.
    CreatedBy,
    /// Last editor.
    UpdatedBy,
    /// Followers.
    Followers,
}

impl Field {
    /// Values the field holds on `item`; scalar fields yield zero or one value.
    #[must_use]
    pub fn values(self, item: &WorkItem) -> Vec<Cow<'_, str>> {
        fn one(value: Option<&str>) -> Vec<Cow<'_, str>> {
            value.map(Cow::Borrowed).into_iter().collect()
        }
        fn many(values: &BTreeSet<String>) -> Vec<Cow<'_, str>> {
            values.iter().map(|v| Cow::Borrowed(v.as_str())).collect()
        }
        match self {
            Self::Kind => vec![Cow::Borrowed(item.kind.as_str())],
            Self::Parent => item.parent.map(|p| Cow::Owned(p.to_string())).into_iter().collect(),
            Self::Title => vec![Cow::Borrowed(item.title.as_str())],
            Self::State => one(item.state.as_deref()),
            Self::Area => one(item.area.as_deref()),
            Self::Tags => many(&item.tags),
            Self::Labels => many(&item.labels),
            Self::Assignee => one(item.assignee.as_deref()),
            Self::CreatedBy => one(item.created_by.as_deref()),
            Self::UpdatedBy => one(item.updated_by.as_deref()),
            Self::Followers => many(&item.followers),
        }
    }
}

/// How a multi-value filter combines its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// At least one value must be present.
    Any,
    /// Every value must be present.
    All,
}

impl FromStr for MatchMode {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "any" | "in" | "or" => Ok(Self::Any),
            "all" | "and" => Ok(Self::All),
            _ => Err(FilterError::UnknownMatchMode(s.to_owned())),
        }
    }
}

/// One match condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Field holds exactly `value`.
    Equals {
        /// Field read.
        field: Field,
        /// Expected value.
        value: String,
    },
    /// Field holds at least one of `values`.
    AnyOf {
        /// Field read.
        field: Field,
        /// Accepted values.
        values: BTreeSet<String>,
    },
    /// Field holds every one of `values`.
    AllOf {
        /// Field read.
        field: Field,
        /// Required values.
        values: BTreeSet<String>,
    },
    /// Field contains `needle` (already lowercased), ignoring case.
    Contains {
        /// Field read.
        field: Field,
        /// Normalized search term.
        needle: String,
    },
    /// Field holds no value.
    Missing {
        /// Field read.
        field: Field,
    },
}

impl Condition {
    /// Evaluate against an item.
    #[must_use]
    pub fn matches(&self, item: &WorkItem) -> bool {
        match self {
            Self::Equals { field, value } => field.values(item).iter().any(|v| v == value),
            Self::AnyOf { field, values } => field
                .values(item)
                .iter()
                .any(|v| values.contains(v.as_ref())),
            Self::AllOf { field, values } => {
                let present = field.values(item);
                values.iter().all(|wanted| present.iter().any(|v| v == wanted))
            }
            Self::Contains { field, needle } => field
                .values(item)
                .iter()
                .any(|v| contains_normalized(v, needle)),
            Self::Missing { field } => field.values(item).is_empty(),
        }
    }
}

/// Accumulated predicate: every condition in `all`, at least one condition of
/// `or`, and at least one condition of each group in `and`.
///
/// `or` holds the only OR-group while there is one; once a second group is
/// contributed, both live in `and` and `or` stays empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    /// Conditions that must all hold.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<Condition>,
    /// Single OR-group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub or: Option<Vec<Condition>>,
    /// AND-of-ORs, used once more than one OR-group exists.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub and: Vec<Vec<Condition>>,
}

impl Predicate {
    /// Require `field` to equal `value`.
    pub fn assign(&mut self, field: Field, value: impl Into<String>) {
        self.all.push(Condition::Equals {
            field,
            value: value.into(),
        });
    }

    /// Require array membership under `mode`. Empty value lists are ignored.
    pub fn member<I, V>(&mut self, field: Field, values: I, mode: MatchMode)
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let values: BTreeSet<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return;
        }
        self.all.push(match mode {
            MatchMode::Any => Condition::AnyOf { field, values },
            MatchMode::All => Condition::AllOf { field, values },
        });
    }

    /// Require an arbitrary condition.
    pub fn require(&mut self, condition: Condition) {
        self.all.push(condition);
    }

    /// Add an OR-group, preserving any group contributed before it.
    pub fn or_group(&mut self, group: Vec<Condition>) {
        if group.is_empty() {
            return;
        }
        if !self.and.is_empty() {
            self.and.push(group);
        } else if let Some(existing) = self.or.take() {
            self.and = vec![existing, group];
        } else {
            self.or = Some(group);
        }
    }

    /// Every OR-group, wherever it is stored.
    pub fn or_groups(&self) -> impl Iterator<Item = &[Condition]> {
        self.or.iter().chain(self.and.iter()).map(Vec::as_slice)
    }

    /// True when the predicate matches every item.
    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        self.all.is_empty() && self.or.is_none() && self.and.is_empty()
    }

    /// Evaluate against an item.
    #[must_use]
    pub fn matches(&self, item: &WorkItem) -> bool {
        self.all.iter().all(|condition| condition.matches(item))
            && self
                .or_groups()
                .all(|group| group.iter().any(|condition| condition.matches(item)))
    }
}

/// Named filters understood by [`FilterCompiler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterName {
    /// Item kind.
    Type,
    /// Workflow state.
    State,
    /// Parent id.
    Parent,
    /// Assignee.
    Assignee,
    /// Area path.
    Area,
    /// Tags.
    Tags,
    /// Labels.
    Labels,
    /// Free-text search.
    Search,
    /// Personal views and assignment state.
    Status,
}

impl FilterName {
    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Type => "type",
            Self::State => "state",
            Self::Parent => "parent",
            Self::Assignee => "assignee",
            Self::Area => "area",
            Self::Tags => "tags",
            Self::Labels => "labels",
            Self::Search => "search",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for FilterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterName {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "type" | "kind" => Ok(Self::Type),
            "state" => Ok(Self::State),
            "parent" => Ok(Self::Parent),
            "assignee" => Ok(Self::Assignee),
            "area" => Ok(Self::Area),
            "tags" | "tag" => Ok(Self::Tags),
            "labels" | "label" => Ok(Self::Labels),
            "search" | "text" => Ok(Self::Search),
            "status" => Ok(Self::Status),
            _ => Err(FilterError::UnknownFilter(s.to_owned())),
        }
    }
}

/// Values accepted by the `status` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusFilter {
    /// Assigned to the current user.
    AssignedToMe,
    /// Created by the current user.
    CreatedByMe,
    /// Followed by the current user.
    Following,
    /// Created, assigned to, or last updated by the current user.
    MyActivity,
    /// No assignee.
    Unassigned,
}

impl StatusFilter {
    /// Whether the filter reads [`FilterContext::user_id`].
    #[must_use]
    pub const fn needs_user(self) -> bool {
        !matches!(self, Self::Unassigned)
    }
}

impl FromStr for StatusFilter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', '_', ' '], "");
        match normalized.as_str() {
            "assignedtome" => Ok(Self::AssignedToMe),
            "createdbyme" => Ok(Self::CreatedByMe),
            "following" => Ok(Self::Following),
            "myactivity" => Ok(Self::MyActivity),
            "unassigned" => Ok(Self::Unassigned),
            _ => Err(FilterError::UnknownStatus(s.to_owned())),
        }
    }
}

/// Raw value of one named filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    /// Single value.
    One(String),
    /// Several values combined under an explicit mode.
    Many {
        /// Values.
        values: Vec<String>,
        /// Combination mode.
        mode: MatchMode,
    },
}

impl FilterValue {
    /// Single value.
    #[must_use]
    pub fn one(value: impl Into<String>) -> Self {
        Self::One(value.into())
    }

    /// Values that must all be present.
    #[must_use]
    pub fn all_of<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self::Many {
            values: values.into_iter().map(Into::into).collect(),
            mode: MatchMode::All,
        }
    }

    /// Values of which at least one must be present.
    #[must_use]
    pub fn any_of<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self::Many {
            values: values.into_iter().map(Into::into).collect(),
            mode: MatchMode::Any,
        }
    }
}

/// Named filters keyed by name; each name appears at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSet(BTreeMap<FilterName, FilterValue>);

impl FilterSet {
    /// Empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name`, replacing any earlier value for the same name.
    #[must_use]
    pub fn with(mut self, name: FilterName, value: FilterValue) -> Self {
        self.insert(name, value);
        self
    }

    /// Set `name`, returning the previous value.
    pub fn insert(&mut self, name: FilterName, value: FilterValue) -> Option<FilterValue> {
        self.0.insert(name, value)
    }

    /// Value of `name`.
    #[must_use]
    pub fn get(&self, name: FilterName) -> Option<&FilterValue> {
        self.0.get(&name)
    }

    /// Number of filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no filter is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Filters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (FilterName, &FilterValue)> {
        self.0.iter().map(|(name, value)| (*name, value))
    }
}

impl FromIterator<(FilterName, FilterValue)> for FilterSet {
    fn from_iter<T: IntoIterator<Item = (FilterName, FilterValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Caller identity for personalized filters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterContext {
    /// Current user, if known.
    pub user_id: Option<String>,
}

impl FilterContext {
    /// Context without identity.
    #[must_use]
    pub const fn anonymous() -> Self {
        Self { user_id: None }
    }

    /// Context for `user_id`; blank ids count as absent.
    #[must_use]
    pub fn for_user(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let trimmed = user_id.trim();
        Self {
            user_id: (!trimmed.is_empty()).then(|| trimmed.to_owned()),
        }
    }
}

/// Why a filter left the predicate untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The filter needs [`FilterContext::user_id`].
    MissingContext,
    /// The value normalized to nothing (blank search).
    Blank,
}

/// Result of [`FilterCompiler::compile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledFilter {
    /// Predicate for the retrieval collaborator.
    pub predicate: Predicate,
    /// Filters that did not constrain the predicate.
    pub skipped: Vec<(FilterName, SkipReason)>,
}

/// Turns a [`FilterSet`] into one [`Predicate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCompiler {
    search_fields: Vec<Field>,
}

impl Default for FilterCompiler {
    fn default() -> Self {
        Self {
            search_fields: vec![Field::Title, Field::Tags, Field::Labels, Field::State, Field::Area],
        }
    }
}

impl FilterCompiler {
    /// Compiler searching the default fields.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fields spanned by the `search` filter.
    #[must_use]
    pub fn search_fields(&self) -> &[Field] {
        &self.search_fields
    }

    /// Compile `filters` for the caller described by `ctx`.
    ///
    /// # Errors
    /// Returns a [`FilterError`] when a value cannot be interpreted for its filter.
    pub fn compile(&self, filters: &FilterSet, ctx: &FilterContext) -> Result<CompiledFilter, FilterError> {
        let mut compiled = CompiledFilter::default();
        for (name, value) in filters.iter() {
            if let Some(reason) = self.contribute(name, value, ctx, &mut compiled.predicate)? {
                compiled.skipped.push((name, reason));
            }
        }
        Ok(compiled)
    }

    fn contribute(
        &self,
        name: FilterName,
        value: &FilterValue,
        ctx: &FilterContext,
        predicate: &mut Predicate,
    ) -> Result<Option<SkipReason>, FilterError> {
        match name {
            FilterName::Type => {
                let kinds = Self::map_values(value, |raw| {
                    Ok(raw.parse::<ItemKind>()?.as_str().to_owned())
                })?;
                Self::exact(predicate, Field::Kind, kinds);
            }
            FilterName::Parent => {
                let parents = Self::map_values(value, |raw| {
                    raw.parse::<ItemId>()
                        .map(|id| id.to_string())
                        .map_err(|_| FilterError::InvalidParent(raw.to_owned()))
                })?;
                Self::exact(predicate, Field::Parent, parents);
            }
            FilterName::State => Self::exact(predicate, Field::State, Self::plain(value)),
            FilterName::Assignee => Self::exact(predicate, Field::Assignee, Self::plain(value)),
            FilterName::Area => Self::exact(predicate, Field::Area, Self::plain(value)),
            FilterName::Tags => Self::membership(predicate, Field::Tags, value),
            FilterName::Labels => Self::membership(predicate, Field::Labels, value),
            FilterName::Search => return Ok(self.search(predicate, value)),
            FilterName::Status => return Self::status(predicate, value, ctx),
        }
        Ok(None)
    }

    fn plain(value: &FilterValue) -> (Vec<String>, Option<MatchMode>) {
        match value {
            FilterValue::One(raw) => (vec![raw.clone()], None),
            FilterValue::Many { values, mode } => (values.clone(), Some(*mode)),
        }
    }

    fn map_values(
        value: &FilterValue,
        parse: impl Fn(&str) -> Result<String, FilterError>,
    ) -> Result<(Vec<String>, Option<MatchMode>), FilterError> {
        let (raw, mode) = Self::plain(value);
        let parsed = raw.iter().map(|v| parse(v)).collect::<Result<Vec<_>, _>>()?;
        Ok((parsed, mode))
    }

    /// Scalar fields: a single value is an exact match, several use their mode.
    fn exact(predicate: &mut Predicate, field: Field, (values, mode): (Vec<String>, Option<MatchMode>)) {
        let mode = match (mode, values.len()) {
            (None, 1) => {
                if let Some(single) = values.into_iter().next() {
                    predicate.assign(field, single);
                }
                return;
            }
            (None, _) => MatchMode::Any,
            (Some(mode), _) => mode,
        };
        predicate.member(field, values, mode);
    }

    fn membership(predicate: &mut Predicate, field: Field, value: &FilterValue) {
        match value {
            FilterValue::One(raw) => predicate.member(field, [raw.clone()], MatchMode::Any),
            FilterValue::Many { values, mode } => predicate.member(field, values.clone(), *mode),
        }
    }

    fn search(&self, predicate: &mut Predicate, value: &FilterValue) -> Option<SkipReason> {
        let (raw, mode) = Self::plain(value);
        let terms: Vec<String> = raw
            .iter()
            .filter_map(|term| TextMatcher::new(term))
            .map(TextMatcher::into_needle)
            .collect();
        if terms.is_empty() {
            return Some(SkipReason::Blank);
        }
        let group_for = |needle: &String| -> Vec<Condition> {
            self.search_fields
                .iter()
                .map(|field| Condition::Contains {
                    field: *field,
                    needle: needle.clone(),
                })
                .collect()
        };
        if mode == Some(MatchMode::All) {
            for term in &terms {
                predicate.or_group(group_for(term));
            }
        } else {
            predicate.or_group(terms.iter().flat_map(group_for).collect());
        }
        None
    }

    fn status(
        predicate: &mut Predicate,
        value: &FilterValue,
        ctx: &FilterContext,
    ) -> Result<Option<SkipReason>, FilterError> {
        let FilterValue::One(raw) = value else {
            return Err(FilterError::UnsupportedValue {
                filter: FilterName::Status,
                expected: "a single status value",
            });
        };
        let status: StatusFilter = raw.parse()?;
        let user = ctx.user_id.as_deref();
        if status.needs_user() && user.is_none() {
            return Ok(Some(SkipReason::MissingContext));
        }
        let user = user.unwrap_or_default();
        match status {
            StatusFilter::AssignedToMe => predicate.assign(Field::Assignee, user),
            StatusFilter::CreatedByMe => predicate.assign(Field::CreatedBy, user),
            StatusFilter::Following => predicate.member(Field::Followers, [user], MatchMode::Any),
            StatusFilter::MyActivity => predicate.or_group(
                [Field::CreatedBy, Field::Assignee, Field::UpdatedBy]
                    .into_iter()
                    .map(|field| Condition::Equals {
                        field,
                        value: user.to_owned(),
                    })
                    .collect(),
            ),
            StatusFilter::Unassigned => predicate.require(Condition::Missing {
                field: Field::Assignee,
            }),
        }
        Ok(None)
    }
}
