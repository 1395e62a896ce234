//! Per-source normalization of raw payloads into unified records.

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use unify_core::{Provenance, SourceId, UnifiedRecord};
use uuid::Uuid;

pub const CRATE_NAME: &str = "unify-adapters";

/// Batch-level normalization failure: the payload's top-level shape does not
/// match what the source emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnexpectedShape {
    pub source: SourceId,
    pub expected: &'static str,
}

impl std::fmt::Display for UnexpectedShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "expected {} payload for source `{}`",
            self.expected, self.source
        )
    }
}

impl std::error::Error for UnexpectedShape {}

/// Why one item of a batch could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    #[error("missing required field `{path}`")]
    MissingField { path: String },
    #[error("field `{path}` has an unexpected type")]
    InvalidField { path: String },
}

/// An item skipped during normalization, kept for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedItem {
    pub index: usize,
    pub error: ItemError,
}

/// Outcome of normalizing one raw payload. Malformed items are isolated into
/// `rejects`; the remaining items still produce records.
#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<UnifiedRecord>,
    pub rejects: Vec<RejectedItem>,
}

/// Maps a raw source payload into unified records. Pure: the caller supplies
/// the processing instant, and every produced record gets a fresh entity id,
/// the source's singular entity type, and a provenance block.
pub fn normalize(
    source: SourceId,
    raw: &JsonValue,
    processed_at: DateTime<Utc>,
) -> Result<NormalizedBatch, UnexpectedShape> {
    let items: &[JsonValue] = match source {
        SourceId::Products | SourceId::Transactions => raw
            .as_array()
            .map(Vec::as_slice)
            .ok_or(UnexpectedShape {
                source,
                expected: "a sequence",
            })?,
        SourceId::Users => match raw.as_object() {
            Some(obj) => match obj.get("results") {
                Some(results) => results.as_array().map(Vec::as_slice).ok_or(UnexpectedShape {
                    source,
                    expected: "an object with a `results` sequence",
                })?,
                // The user source wraps its items; an absent `results` key is
                // an empty page, not an error.
                None => &[],
            },
            None => {
                return Err(UnexpectedShape {
                    source,
                    expected: "an object with a `results` sequence",
                })
            }
        },
    };

    let mut batch = NormalizedBatch::default();
    for (index, item) in items.iter().enumerate() {
        let payload = match source {
            SourceId::Products => product_payload(item),
            SourceId::Users => user_payload(item),
            SourceId::Transactions => transaction_payload(item),
        };
        match payload {
            Ok(payload) => batch.records.push(UnifiedRecord {
                entity_id: Uuid::new_v4(),
                entity_type: source.entity_type(),
                timestamp: processed_at,
                payload,
                provenance: Provenance {
                    source: source.label().to_string(),
                    processed_at,
                },
            }),
            Err(error) => batch.rejects.push(RejectedItem { index, error }),
        }
    }
    Ok(batch)
}

fn product_payload(item: &JsonValue) -> Result<JsonValue, ItemError> {
    Ok(json!({
        "external_id": req_value(item, &["id"])?,
        "title": req_str(item, &["title"])?,
        "price": req_value(item, &["price"])?,
        "category": req_str(item, &["category"])?,
        "description": req_str(item, &["description"])?,
        "image_url": req_str(item, &["image"])?,
    }))
}

fn user_payload(item: &JsonValue) -> Result<JsonValue, ItemError> {
    let first = req_str(item, &["name", "first"])?;
    let last = req_str(item, &["name", "last"])?;
    Ok(json!({
        "external_id": req_str(item, &["login", "uuid"])?,
        "name": format!("{first} {last}"),
        "email": req_str(item, &["email"])?,
        "phone": opt_str(item, &["phone"]),
        "country": req_str(item, &["location", "country"])?,
        "registered_date": req_str(item, &["registered", "date"])?,
    }))
}

fn transaction_payload(item: &JsonValue) -> Result<JsonValue, ItemError> {
    // The upstream order feed carries no monetary field; the amount is a
    // placeholder derived from the order id, not business data.
    let amount = req_f64(item, &["id"])? * 10.0;
    Ok(json!({
        "external_id": req_value(item, &["id"])?,
        "status": req_str(item, &["status"])?,
        "eta": req_str(item, &["eta"])?,
        "user_name": req_str(item, &["user_name"])?,
        "user_phone": req_str(item, &["user_phone"])?,
        "amount": amount,
        "parcel_id": opt_str(item, &["parcel_id"]),
    }))
}

fn walk<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn dotted(path: &[&str]) -> String {
    path.join(".")
}

fn req_value(item: &JsonValue, path: &[&str]) -> Result<JsonValue, ItemError> {
    walk(item, path).cloned().ok_or_else(|| ItemError::MissingField {
        path: dotted(path),
    })
}

fn req_str<'a>(item: &'a JsonValue, path: &[&str]) -> Result<&'a str, ItemError> {
    let value = walk(item, path).ok_or_else(|| ItemError::MissingField {
        path: dotted(path),
    })?;
    value.as_str().ok_or_else(|| ItemError::InvalidField {
        path: dotted(path),
    })
}

fn opt_str<'a>(item: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    walk(item, path).and_then(JsonValue::as_str)
}

fn req_f64(item: &JsonValue, path: &[&str]) -> Result<f64, ItemError> {
    let value = walk(item, path).ok_or_else(|| ItemError::MissingField {
        path: dotted(path),
    })?;
    match value {
        JsonValue::Number(n) => n.as_f64().ok_or_else(|| ItemError::InvalidField {
            path: dotted(path),
        }),
        JsonValue::String(s) => s.parse().map_err(|_| ItemError::InvalidField {
            path: dotted(path),
        }),
        _ => Err(ItemError::InvalidField {
            path: dotted(path),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unify_core::{canonical_external_id, EntityType};

    fn now() -> DateTime<Utc> {
        "2026-03-01T09:30:00Z".parse().unwrap()
    }

    fn product_item() -> JsonValue {
        json!({
            "id": 1,
            "title": "Shirt",
            "price": 9.99,
            "category": "clothing",
            "description": "",
            "image": "http://x/y.png"
        })
    }

    #[test]
    fn products_map_into_one_record_each() {
        let raw = json!([product_item()]);
        let batch = normalize(SourceId::Products, &raw, now()).unwrap();
        assert!(batch.rejects.is_empty());
        assert_eq!(batch.records.len(), 1);

        let record = &batch.records[0];
        assert_eq!(record.entity_type, EntityType::Product);
        assert_eq!(record.payload["external_id"], json!(1));
        assert_eq!(record.payload["title"], json!("Shirt"));
        assert_eq!(record.payload["image_url"], json!("http://x/y.png"));
        assert_eq!(record.provenance.source, "FakeStoreAPI");
        assert_eq!(record.timestamp, now());
    }

    #[test]
    fn transaction_amount_is_derived_from_id() {
        let raw = json!([{
            "id": 5,
            "status": "placed",
            "eta": "2026-03-04",
            "user_name": "A",
            "user_phone": "1",
            "parcel_id": "p1"
        }]);
        let batch = normalize(SourceId::Transactions, &raw, now()).unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].payload["amount"], json!(50.0));
        assert_eq!(batch.records[0].payload["parcel_id"], json!("p1"));
        assert_eq!(batch.records[0].provenance.source, "MockarooAPI");
    }

    #[test]
    fn users_are_pulled_from_the_results_wrapper() {
        let raw = json!({
            "results": [{
                "login": {"uuid": "u-1"},
                "name": {"first": "Ada", "last": "Lovelace"},
                "email": "ada@example.com",
                "location": {"country": "UK"},
                "registered": {"date": "2019-05-02T10:00:00Z"}
            }]
        });
        let batch = normalize(SourceId::Users, &raw, now()).unwrap();
        assert_eq!(batch.records.len(), 1);

        let payload = &batch.records[0].payload;
        assert_eq!(payload["external_id"], json!("u-1"));
        assert_eq!(payload["name"], json!("Ada Lovelace"));
        assert_eq!(payload["phone"], json!(null));
        assert_eq!(batch.records[0].provenance.source, "RandomUserAPI");
    }

    #[test]
    fn users_payload_without_results_is_an_empty_page() {
        let batch = normalize(SourceId::Users, &json!({"info": {}}), now()).unwrap();
        assert!(batch.records.is_empty());
        assert!(batch.rejects.is_empty());
    }

    #[test]
    fn malformed_item_is_rejected_without_aborting_the_batch() {
        let mut broken = product_item();
        broken.as_object_mut().unwrap().remove("price");
        let raw = json!([product_item(), broken, product_item()]);

        let batch = normalize(SourceId::Products, &raw, now()).unwrap();
        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.rejects.len(), 1);
        assert_eq!(batch.rejects[0].index, 1);
        assert_eq!(
            batch.rejects[0].error,
            ItemError::MissingField { path: "price".to_string() }
        );
    }

    #[test]
    fn wrong_top_level_shape_is_a_batch_error() {
        assert!(normalize(SourceId::Products, &json!({"a": 1}), now()).is_err());
        assert!(normalize(SourceId::Users, &json!([1, 2]), now()).is_err());
    }

    #[test]
    fn repeated_normalization_keeps_the_external_identity_stable() {
        let raw = json!([product_item()]);
        let first = normalize(SourceId::Products, &raw, now()).unwrap();
        let second = normalize(SourceId::Products, &raw, now()).unwrap();

        let a = &first.records[0];
        let b = &second.records[0];
        assert_ne!(a.entity_id, b.entity_id);
        assert_eq!(
            canonical_external_id(&a.payload),
            canonical_external_id(&b.payload)
        );
    }
}
