use std::fmt::{self, Display};

use backlog_core::filter::{FilterError, FilterName, FilterSet, FilterValue, MatchMode, StatusFilter};
use backlog_core::id::ItemId;
use backlog_core::item::ItemKind;
use thiserror::Error;

/// Error type returned while constructing filter sets from user-facing inputs.
#[derive(Debug, Error)]
pub enum FilterBuildError {
    #[error("unknown filter: {token}")]
    UnknownFilter { token: String },
    #[error("invalid match mode: {token}")]
    InvalidMatchMode { token: String },
    #[error("invalid value for {filter}: {source}")]
    InvalidValue {
        filter: FilterName,
        #[source]
        source: FilterError,
    },
}

/// Result alias for filter construction helpers.
pub type FilterBuildResult<T> = Result<T, FilterBuildError>;

/// Builder that accepts user-facing strings and normalizes them into a [`FilterSet`].
///
/// Blank values are dropped. Later calls for the same filter replace earlier ones.
#[derive(Debug, Clone, Default)]
pub struct FilterSetBuilder {
    filters: FilterSet,
}

impl FilterSetBuilder {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single-valued filter by name.
    ///
    /// # Errors
    /// Returns an error if the name is unknown or the value cannot be used for it.
    pub fn with_value(self, name: &str, value: &str) -> FilterBuildResult<Self> {
        let name = parse_filter_name(name)?;
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok(self);
        }
        self.insert(name, FilterValue::one(trimmed))
    }

    /// Set a multi-valued filter by name with an explicit match mode token (`any` / `all`).
    ///
    /// # Errors
    /// Returns an error if the name or mode is unknown, or a value cannot be used.
    pub fn with_values(self, name: &str, values: &[String], mode: &str) -> FilterBuildResult<Self> {
        let name = parse_filter_name(name)?;
        let mode = mode
            .parse::<MatchMode>()
            .map_err(|_| FilterBuildError::InvalidMatchMode {
                token: mode.to_string(),
            })?;
        let values: Vec<String> = values
            .iter()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .collect();
        if values.is_empty() {
            return Ok(self);
        }
        self.insert(name, FilterValue::Many { values, mode })
    }

    /// Configure the optional search text (whitespace-only inputs are ignored).
    #[must_use]
    pub fn with_search(mut self, text: Option<String>) -> Self {
        if let Some(text) = text.as_deref().map(str::trim).filter(|text| !text.is_empty()) {
            self.filters.insert(FilterName::Search, FilterValue::one(text));
        }
        self
    }

    /// Configure the optional status view (`assignedToMe`, `myActivity`, ...).
    ///
    /// # Errors
    /// Returns an error if the status token is not recognized.
    pub fn with_status(self, status: Option<&str>) -> FilterBuildResult<Self> {
        match status.map(str::trim).filter(|status| !status.is_empty()) {
            Some(status) => self.insert(FilterName::Status, FilterValue::one(status)),
            None => Ok(self),
        }
    }

    /// Build the final [`FilterSet`].
    #[must_use]
    pub fn build(self) -> FilterSet {
        self.filters
    }

    fn insert(mut self, name: FilterName, value: FilterValue) -> FilterBuildResult<Self> {
        validate(name, &value).map_err(|source| FilterBuildError::InvalidValue { filter: name, source })?;
        self.filters.insert(name, value);
        Ok(self)
    }
}

fn parse_filter_name(token: &str) -> FilterBuildResult<FilterName> {
    token.parse().map_err(|_| FilterBuildError::UnknownFilter {
        token: token.to_string(),
    })
}

/// Reject values the compiler would refuse, so errors surface at input time.
fn validate(name: FilterName, value: &FilterValue) -> Result<(), FilterError> {
    let values: Vec<&str> = match value {
        FilterValue::One(raw) => vec![raw.as_str()],
        FilterValue::Many { values, .. } => values.iter().map(String::as_str).collect(),
    };
    match name {
        FilterName::Type => {
            for raw in values {
                raw.parse::<ItemKind>()?;
            }
        }
        FilterName::Parent => {
            for raw in values {
                raw.parse::<ItemId>()
                    .map_err(|_| FilterError::InvalidParent(raw.to_owned()))?;
            }
        }
        FilterName::Status => {
            let FilterValue::One(raw) = value else {
                return Err(FilterError::UnsupportedValue {
                    filter: name,
                    expected: "a single status value",
                });
            };
            raw.parse::<StatusFilter>()?;
        }
        _ => {}
    }
    Ok(())
}

impl FilterBuildError {
    /// Convert the error into a message that is friendly for end-users.
    #[must_use]
    pub fn describe_user_facing(&self) -> String {
        match self {
            Self::UnknownFilter { token } => format!("フィルタ名が不正です: {token}"),
            Self::InvalidMatchMode { token } => {
                format!("一致条件の指定が不正です: {token} (any または all)")
            }
            Self::InvalidValue { filter, source } => format!("{filter} の値が不正です: {source}"),
        }
    }
}

impl Display for FilterSetBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.filters.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok<T, E: Display>(result: Result<T, E>, context: &str) -> T {
        result.unwrap_or_else(|err| panic!("{context}: {err}"))
    }

    #[test]
    fn test_values_are_trimmed_and_blanks_dropped() {
        let filters = ok(
            FilterSetBuilder::new().with_value("state", "  doing "),
            "state value",
        )
        .with_search(Some("   ".into()))
        .build();
        assert_eq!(filters.get(FilterName::State), Some(&FilterValue::one("doing")));
        assert!(filters.get(FilterName::Search).is_none());
    }

    #[test]
    fn test_multi_values_carry_explicit_mode() {
        let tags = vec!["ux".to_string(), " ".to_string(), "web".to_string()];
        let filters = ok(
            FilterSetBuilder::new().with_values("tags", &tags, "all"),
            "tag values",
        )
        .build();
        assert_eq!(
            filters.get(FilterName::Tags),
            Some(&FilterValue::all_of(["ux", "web"]))
        );
    }

    #[test]
    fn test_invalid_inputs_are_reported() {
        let Err(err) = FilterSetBuilder::new().with_value("colour", "red") else {
            panic!("unknown filter should error");
        };
        assert!(matches!(err, FilterBuildError::UnknownFilter { .. }));

        let Err(err) = FilterSetBuilder::new().with_values("labels", &["a".into()], "some") else {
            panic!("unknown mode should error");
        };
        assert!(err.describe_user_facing().contains("some"));

        let Err(err) = FilterSetBuilder::new().with_status(Some("mine")) else {
            panic!("unknown status should error");
        };
        assert!(matches!(
            err,
            FilterBuildError::InvalidValue {
                filter: FilterName::Status,
                ..
            }
        ));

        assert!(FilterSetBuilder::new().with_value("type", "story").is_err());
        assert!(FilterSetBuilder::new().with_value("parent", "nope").is_err());
    }

    #[test]
    fn test_filter_builder_full_workflow() {
        let parent = ItemId::new();
        let filters = ok(
            ok(
                ok(
                    FilterSetBuilder::new().with_value("Type", "epic"),
                    "type",
                )
                .with_value("parent", &parent.to_string()),
                "parent",
            )
            .with_status(Some("my-activity")),
            "status",
        )
        .with_search(Some(" Drag ".into()))
        .build();
        assert_eq!(filters.len(), 4);
        assert_eq!(filters.get(FilterName::Search), Some(&FilterValue::one("Drag")));
        assert_eq!(filters.get(FilterName::Status), Some(&FilterValue::one("my-activity")));
    }
}
