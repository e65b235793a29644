use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Ordered list of query parameters, e.g. `["products", {"category_id": "c1"}]`
///
/// Two keys are the same query when every part matches in order.
/// A key is a prefix of another when its parts lead the other's.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    /// Key with a single leading part, usually the entity name
    pub fn new(root: &str) -> Self {
        Self(vec![root.to_string()])
    }

    /// Append a part. Objects and arrays are stored as compact JSON;
    /// `serde_json` keeps object keys sorted, so equal filters give equal keys.
    pub fn with(mut self, part: impl Into<Value>) -> Self {
        let part = match part.into() {
            Value::String(s) => s,
            other => other.to_string(),
        };
        self.0.push(part);
        self
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

impl From<&str> for QueryKey {
    fn from(root: &str) -> Self {
        QueryKey::new(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filters_give_stable_keys() {
        let a = QueryKey::new("products").with(json!({"supplier_id": "s1", "category_id": "c1"}));
        let b = QueryKey::new("products").with(json!({"category_id": "c1", "supplier_id": "s1"}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_prefix_matching() {
        let all = QueryKey::new("products");
        let one = QueryKey::new("products").with("detail").with("p-1");
        let other = QueryKey::new("reviews").with("p-1");

        assert!(one.starts_with(&all));
        assert!(all.starts_with(&all));
        assert!(!other.starts_with(&all));
        assert!(!all.starts_with(&one));
    }

    #[test]
    fn test_display() {
        let key = QueryKey::new("products").with("search").with("cable");
        assert_eq!(key.to_string(), "[products, search, cable]");
    }
}
