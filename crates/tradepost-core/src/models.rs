use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tradepost_api::Order;

use crate::repository::{Entity, Searchable};

/// Marketplace account: buyer, supplier or admin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub company_name: Option<String>,
    /// "buyer", "supplier" or "admin"
    pub role: Option<String>,
    pub phone: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    /// Columns we don't model yet, kept so nothing gets lost
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Wholesale listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub supplier_id: Option<String>,
    pub category_id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
    pub min_order_quantity: Option<i64>,
    pub stock: Option<i64>,
    /// Nullable column; `None` when the row has no image list
    #[serde(default)]
    pub images: Option<Vec<String>>,
    pub is_active: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub parent_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Buyer feedback on a product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub product_id: String,
    pub user_id: Option<String>,
    /// 1 to 5
    pub rating: Option<i32>,
    pub comment: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Buyer/supplier direct message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: Option<String>,
    pub receiver_id: Option<String>,
    pub product_id: Option<String>,
    pub content: Option<String>,
    pub is_read: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Favorite {
    pub id: String,
    pub user_id: String,
    pub product_id: String,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub title: Option<String>,
    pub message: Option<String>,
    pub is_read: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Audit trail row (`logs` table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub user_id: Option<String>,
    pub action: Option<String>,
    #[serde(default)]
    pub details: Value,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Abuse report against a product or user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub reporter_id: Option<String>,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub reason: Option<String>,
    pub status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Entity for User {
    const TABLE: &'static str = "users";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Searchable for User {
    const SEARCH_COLUMNS: [&'static str; 2] = ["full_name", "company_name"];
}

impl Entity for Product {
    const TABLE: &'static str = "products";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Searchable for Product {
    const SEARCH_COLUMNS: [&'static str; 2] = ["name", "description"];
}

impl Entity for Category {
    const TABLE: &'static str = "categories";
    const DEFAULT_ORDER: (&'static str, Order) = ("name", Order::Asc);

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Review {
    const TABLE: &'static str = "reviews";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Message {
    const TABLE: &'static str = "messages";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Favorite {
    const TABLE: &'static str = "favorites";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Notification {
    const TABLE: &'static str = "notifications";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for LogEntry {
    const TABLE: &'static str = "logs";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Entity for Report {
    const TABLE: &'static str = "reports";

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_product_keeps_unknown_columns() {
        let row = json!({
            "id": "p-1",
            "supplier_id": "s-1",
            "category_id": null,
            "name": "USB-C cable",
            "description": "Braided, 2m",
            "price": 3.5,
            "images": ["a.jpg"],
            "created_at": "2024-05-01T10:00:00Z",
            "incoterm": "FOB"
        });

        let product: Product = serde_json::from_value(row.clone()).unwrap();
        assert_eq!(product.name, "USB-C cable");
        assert_eq!(product.extra["incoterm"], "FOB");

        let back = serde_json::to_value(&product).unwrap();
        assert_eq!(back["incoterm"], "FOB");
        assert_eq!(back["supplier_id"], "s-1");
    }

    #[test]
    fn test_product_with_null_images() {
        let product: Product =
            serde_json::from_value(json!({"id": "p-1", "name": "Drill", "images": null})).unwrap();
        assert_eq!(product.images, None);

        let product: Product =
            serde_json::from_value(json!({"id": "p-2", "name": "Saw", "images": ["saw.jpg"]})).unwrap();
        assert_eq!(product.images, Some(vec!["saw.jpg".to_string()]));
    }

    #[test]
    fn test_missing_optional_columns() {
        let category: Category = serde_json::from_value(json!({"id": "c-1", "name": "Tools"})).unwrap();
        assert_eq!(category.slug, None);
        assert!(category.extra.is_empty());
    }
}
