//! Change-event wire record pushed through the index and backup queues.

use serde::{Deserialize, Serialize};

use crate::location::{first_path_segment, Location};
use crate::metadata::Metadata;
use crate::Result;

/// One change event. Serialized as UTF-8 JSON with PascalCase keys; unknown
/// fields are ignored on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StoreDataDetails {
    pub container: String,
    pub base_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl StoreDataDetails {
    pub fn new(loc: &Location, id: Option<i64>, metadata: Metadata) -> Self {
        Self {
            container: loc.container.clone(),
            base_path: loc.base_path.clone(),
            id,
            metadata,
        }
    }

    pub fn location(&self) -> Location {
        Location::new(self.container.clone(), self.base_path.clone())
    }

    /// The unit of per-key serialization in the index listener:
    /// `container + "_" + first path segment`. Events with an empty base path
    /// land in the common `"{container}_"` key.
    pub fn logical_key(&self) -> String {
        format!("{}_{}", self.container, first_path_segment(&self.base_path))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(body: &str) -> Result<Self> {
        Ok(serde_json::from_str(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_uses_pascal_case_keys() {
        let details = StoreDataDetails::new(
            &Location::new("kalixtest", "tests/A.dat"),
            Some(12),
            Metadata::from([("Type", "Order")]),
        );
        let json = details.to_json().unwrap();
        assert!(json.contains(r#""Container":"kalixtest""#));
        assert!(json.contains(r#""BasePath":"tests/A.dat""#));
        assert!(json.contains(r#""Id":12"#));
        assert_eq!(StoreDataDetails::from_json(&json).unwrap(), details);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let body = r#"{"Container":"c","BasePath":"a/b","Future":"field"}"#;
        let details = StoreDataDetails::from_json(body).unwrap();
        assert_eq!(details.container, "c");
        assert!(details.id.is_none());
        assert!(details.metadata.is_empty());
    }

    #[test]
    fn logical_key_takes_the_first_segment() {
        let details = StoreDataDetails::new(
            &Location::new("c", "orders/2024/1.json"),
            None,
            Metadata::new(),
        );
        assert_eq!(details.logical_key(), "c_orders");

        let empty = StoreDataDetails::new(&Location::new("c", ""), None, Metadata::new());
        assert_eq!(empty.logical_key(), "c_");
    }
}
