use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Identifier of a work item (UUID v7).
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct ItemId(pub Uuid);

impl ItemId {
    /// Generate a fresh item identifier.
    #[must_use]
    pub fn new() -> Self {
        // Version 7 sorts by creation time; equal-rank tie-breaks follow creation order.
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

impl Serialize for ItemId {
    fn serialize<S>(&self, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_uses_uuid_v7() {
        let id = ItemId::new();
        assert_eq!(id.0.get_version_num(), 7);
    }

    #[test]
    fn parse_accepts_surrounding_whitespace() {
        let uuid = Uuid::now_v7();
        let parsed: ItemId = format!(" {uuid}\n")
            .parse()
            .unwrap_or_else(|err| panic!("must parse item id: {err}"));
        assert_eq!(parsed.0, uuid);
    }

    #[test]
    fn deserialize_rejects_garbage() {
        let result: Result<ItemId, _> = serde_json::from_str("\"not-a-uuid\"");
        assert!(result.is_err());
    }
}
