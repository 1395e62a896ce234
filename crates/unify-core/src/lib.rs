//! Core domain model for the unified ingestion service.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "unify-core";

/// Provenance source label stamped on records produced by the enrichment
/// engine, distinguishing them from freshly ingested ones.
pub const ENRICHED_SOURCE: &str = "Enriched Data";

/// The closed set of upstream sources the pipeline knows how to ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceId {
    Products,
    Users,
    Transactions,
}

impl SourceId {
    pub const ALL: [SourceId; 3] = [SourceId::Products, SourceId::Users, SourceId::Transactions];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Products => "products",
            SourceId::Users => "users",
            SourceId::Transactions => "transactions",
        }
    }

    /// Human-readable source label recorded in provenance blocks.
    pub fn label(&self) -> &'static str {
        match self {
            SourceId::Products => "FakeStoreAPI",
            SourceId::Users => "RandomUserAPI",
            SourceId::Transactions => "MockarooAPI",
        }
    }

    pub fn entity_type(&self) -> EntityType {
        match self {
            SourceId::Products => EntityType::Product,
            SourceId::Users => EntityType::User,
            SourceId::Transactions => EntityType::Transaction,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceId {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "products" => Ok(SourceId::Products),
            "users" => Ok(SourceId::Users),
            "transactions" => Ok(SourceId::Transactions),
            other => Err(UnknownName(other.to_string())),
        }
    }
}

/// Entity class of a unified record, the singular form of its source name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Product,
    User,
    Transaction,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Product => "product",
            EntityType::User => "user",
            EntityType::Transaction => "transaction",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" => Ok(EntityType::Product),
            "user" => Ok(EntityType::User),
            "transaction" => Ok(EntityType::Transaction),
            other => Err(UnknownName(other.to_string())),
        }
    }
}

/// Error for a name that is not part of a closed enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownName(pub String);

impl fmt::Display for UnknownName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown name: {}", self.0)
    }
}

impl std::error::Error for UnknownName {}

/// Metadata recording which source produced a record and when it was
/// processed. Informational only; never consulted for identity or dedup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub processed_at: DateTime<Utc>,
}

/// The common representation every ingested source maps into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub timestamp: DateTime<Utc>,
    pub payload: JsonValue,
    pub provenance: Provenance,
}

impl UnifiedRecord {
    /// The source-assigned identity nested inside the payload, canonicalized
    /// to text. Uniqueness of stored records is enforced on this value.
    pub fn external_id(&self) -> Option<String> {
        canonical_external_id(&self.payload)
    }
}

/// Renders `payload.external_id` the way Postgres `payload->>'external_id'`
/// does: strings as-is, numbers as their literal text. Other shapes (or an
/// absent field) carry no identity.
pub fn canonical_external_id(payload: &JsonValue) -> Option<String> {
    match payload.get("external_id")? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A user as maintained in the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub external_id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub country: String,
    pub registered_at: DateTime<Utc>,
}

/// A product as maintained in the relational store. `category` is the unique
/// category name; deleting a category nulls the reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub external_id: i64,
    pub title: String,
    pub price: Decimal,
    pub category: Option<String>,
    pub description: String,
    pub image_url: String,
}

/// A purchase linking one user to one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub external_id: Uuid,
    pub user_external_id: Uuid,
    pub product_external_id: i64,
    pub amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// A transaction with its user and product eagerly joined, the unit the
/// enrichment engine consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDetail {
    pub transaction: Transaction,
    pub user: UserProfile,
    pub product: Product,
}

/// Per-user spending rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSpending {
    pub external_id: Uuid,
    pub name: String,
    pub email: String,
    pub total_spent: Decimal,
}

/// Per-category transaction count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryActivity {
    pub name: String,
    pub transaction_count: i64,
}

/// Product-side insight rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductInsights {
    pub product_categories: Vec<CategoryActivity>,
    pub average_transaction_value: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_names_round_trip() {
        for source in SourceId::ALL {
            assert_eq!(source.as_str().parse::<SourceId>().unwrap(), source);
        }
        assert!("orders".parse::<SourceId>().is_err());
    }

    #[test]
    fn entity_type_matches_singular_source_form() {
        assert_eq!(SourceId::Products.entity_type().as_str(), "product");
        assert_eq!(SourceId::Users.entity_type().as_str(), "user");
        assert_eq!(SourceId::Transactions.entity_type().as_str(), "transaction");
    }

    #[test]
    fn external_id_canonicalizes_numbers_and_strings() {
        assert_eq!(
            canonical_external_id(&json!({"external_id": 1})),
            Some("1".to_string())
        );
        assert_eq!(
            canonical_external_id(&json!({"external_id": "ab-12"})),
            Some("ab-12".to_string())
        );
        assert_eq!(canonical_external_id(&json!({"external_id": null})), None);
        assert_eq!(canonical_external_id(&json!({"title": "x"})), None);
    }
}
