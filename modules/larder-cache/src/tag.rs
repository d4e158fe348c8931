//! Invalidation tags.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A label attached to cache entries for invalidation fan-out.
///
/// `Tag::kind("Product")` invalidates every entry holding any `Product` tag.
/// `Tag::id("Product", 7)` invalidates only entries holding `Product:7`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Tag {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
        }
    }

    pub fn id(kind: impl Into<String>, id: impl ToString) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id.to_string()),
        }
    }

    /// Whether invalidating `self` hits an entry that provides `provided`.
    pub fn invalidates(&self, provided: &Tag) -> bool {
        self.kind == provided.kind && (self.id.is_none() || self.id == provided.id)
    }
}

impl From<&str> for Tag {
    fn from(kind: &str) -> Self {
        Tag::kind(kind)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{}", self.kind, id),
            None => f.write_str(&self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tag_invalidates_all_ids() {
        let all = Tag::kind("Product");
        assert!(all.invalidates(&Tag::id("Product", 1)));
        assert!(all.invalidates(&Tag::kind("Product")));
        assert!(!all.invalidates(&Tag::kind("Cart")));
    }

    #[test]
    fn id_tag_only_invalidates_exact_match() {
        let one = Tag::id("Product", 1);
        assert!(one.invalidates(&Tag::id("Product", 1)));
        assert!(!one.invalidates(&Tag::id("Product", 2)));
        assert!(!one.invalidates(&Tag::kind("Product")));
    }

    #[test]
    fn display_and_serde_shape() {
        assert_eq!(Tag::id("Orders", "LIST").to_string(), "Orders:LIST");
        assert_eq!(
            serde_json::to_value(Tag::kind("Cart")).unwrap(),
            serde_json::json!({"kind": "Cart"})
        );
    }
}
