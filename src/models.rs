//! Core data models flowing through the sync engine.
//!
//! Rows read from the change log are regrouped into [`LogicalDocument`]s,
//! embedded, and shipped to the vector index as [`VectorRecord`]s.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::fmt;

/// Denormalized projection of one unprocessed change joined with the
/// current state of its order, user and product.
///
/// Text columns stay optional and `order_date` stays raw: validation is
/// the grouper's job, so one bad row never fails the whole read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedRow {
    /// The change-log entry this row was read from.
    pub change_id: i64,
    pub record_id: i64,
    pub operation: String,
    pub change_time: String,
    pub user_id: i64,
    pub user_name: Option<String>,
    pub order_id: i64,
    pub product_id: i64,
    pub order_date: String,
    pub product_name: Option<String>,
    pub category: Option<String>,
}

/// Canonical order date.
///
/// Day-precision dates render as `YYYY-MM-DD`; timestamps render with a
/// fixed microsecond precision so the same instant always yields the same
/// document id, whatever textual form the store returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OrderDate {
    Day(NaiveDate),
    Instant(NaiveDateTime),
}

impl OrderDate {
    /// Parse the textual forms the store may hold.
    ///
    /// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS[.f]` and
    /// `YYYY-MM-DDTHH:MM:SS[.f]`. Returns `None` for anything else.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(day) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            return Some(OrderDate::Day(day));
        }
        ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
            .map(OrderDate::Instant)
    }
}

impl fmt::Display for OrderDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderDate::Day(day) => write!(f, "{}", day.format("%Y-%m-%d")),
            OrderDate::Instant(ts) => write!(f, "{}", ts.format("%Y-%m-%dT%H:%M:%S%.6f")),
        }
    }
}

/// Logical document boundary: one user's purchases at one order date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub user_id: i64,
    pub order_date: OrderDate,
}

impl GroupKey {
    /// Deterministic vector id for this purchase event.
    pub fn document_id(&self) -> String {
        crate::grouper::document_id(self.user_id, &self.order_date)
    }
}

/// Structured metadata attached to each vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentMetadata {
    pub user_id: i64,
    pub user_name: String,
    pub order_date: String,
    pub products: Vec<String>,
    pub categories: Vec<String>,
}

/// One grouped purchase event ready for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalDocument {
    pub key: GroupKey,
    pub display_name: String,
    pub summary_text: String,
    pub metadata: DocumentMetadata,
    /// Order ids that contributed to this document.
    pub record_ids: Vec<i64>,
    /// Change-log entries read for this document. Only these get marked.
    pub change_ids: Vec<i64>,
}

impl LogicalDocument {
    pub fn id(&self) -> String {
        self.key.document_id()
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.products.is_empty()
    }
}

/// What actually lands in the vector index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: DocumentMetadata,
    pub text: String,
}

impl VectorRecord {
    pub fn from_document(doc: &LogicalDocument, values: Vec<f32>) -> Self {
        Self {
            id: doc.id(),
            values,
            metadata: doc.metadata.clone(),
            text: doc.summary_text.clone(),
        }
    }

    /// Metadata as sent to the index: the structured fields plus the text.
    pub fn metadata_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(&self.metadata).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "text".to_string(),
                serde_json::Value::String(self.text.clone()),
            );
        }
        value
    }
}

/// A record the cycle could not handle for reasons specific to that record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub record_id: i64,
    pub reason: String,
}

/// A quarantined change-log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub record_id: i64,
    pub attempts: i64,
    pub last_error: String,
    pub dead_lettered_at: i64,
}
