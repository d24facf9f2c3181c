/// Case-insensitive substring matcher for free-text search terms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMatcher {
    needle: String,
}

impl TextMatcher {
    /// Normalize a query string into a matcher. Returns `None` for blank inputs.
    #[must_use]
    pub fn new(query: &str) -> Option<Self> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self {
            needle: trimmed.to_lowercase(),
        })
    }

    /// Normalized needle.
    #[must_use]
    pub fn needle(&self) -> &str {
        &self.needle
    }

    /// Consume the matcher, keeping the normalized needle.
    #[must_use]
    pub fn into_needle(self) -> String {
        self.needle
    }

    /// Whether `value` contains the query, ignoring case.
    #[must_use]
    pub fn matches_field(&self, value: &str) -> bool {
        contains_normalized(value, &self.needle)
    }
}

/// Whether `value` contains an already normalized `needle`, ignoring case.
#[must_use]
pub fn contains_normalized(value: &str, needle: &str) -> bool {
    value.to_lowercase().contains(needle)
}
