//! Document grouping.
//!
//! Collapses the flat change rows of one cycle into one [`LogicalDocument`]
//! per purchase event, keyed by `(user_id, order_date)`. Document order is
//! the order in which keys are first seen; product order is row order.
//! Duplicate product lines are kept, so a product bought twice is listed
//! twice.

use std::collections::HashMap;

use tracing::warn;

use crate::models::{
    DocumentMetadata, GroupKey, JoinedRow, LogicalDocument, OrderDate, RejectedRecord,
};

/// Result of grouping one cycle's rows.
#[derive(Debug, Default)]
pub struct Grouping {
    pub documents: Vec<LogicalDocument>,
    /// Rows that could not be placed in any document.
    pub rejected: Vec<RejectedRecord>,
}

/// Deterministic vector id for a purchase event.
///
/// The date is rendered canonically, so `"2024-01-05 10:00:00"` and
/// `"2024-01-05T10:00:00.000"` map to the same id.
pub fn document_id(user_id: i64, order_date: &OrderDate) -> String {
    format!("{}_{}", user_id, order_date)
}

/// `"User {name} ordered {p1} ({c1}) and {p2} ({c2}) on {date}"`.
pub fn render_summary(
    user_name: &str,
    products: &[String],
    categories: &[String],
    order_date: &OrderDate,
) -> String {
    let products_text = products
        .iter()
        .zip(categories)
        .map(|(product, category)| format!("{} ({})", product, category))
        .collect::<Vec<_>>()
        .join(" and ");

    format!(
        "User {} ordered {} on {}",
        user_name, products_text, order_date
    )
}

struct Bucket {
    key: GroupKey,
    user_name: String,
    products: Vec<String>,
    categories: Vec<String>,
    record_ids: Vec<i64>,
    change_ids: Vec<i64>,
}

impl Bucket {
    fn new(key: GroupKey, user_name: &str) -> Self {
        Self {
            key,
            user_name: user_name.to_string(),
            products: Vec::new(),
            categories: Vec::new(),
            record_ids: Vec::new(),
            change_ids: Vec::new(),
        }
    }

    fn into_document(self) -> LogicalDocument {
        let summary_text = render_summary(
            &self.user_name,
            &self.products,
            &self.categories,
            &self.key.order_date,
        );
        LogicalDocument {
            key: self.key,
            display_name: self.user_name.clone(),
            summary_text,
            metadata: DocumentMetadata {
                user_id: self.key.user_id,
                user_name: self.user_name,
                order_date: self.key.order_date.to_string(),
                products: self.products,
                categories: self.categories,
            },
            record_ids: self.record_ids,
            change_ids: self.change_ids,
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Group rows into documents. Never fails: malformed rows are skipped with
/// a warning and reported in [`Grouping::rejected`].
pub fn group_rows(rows: &[JoinedRow]) -> Grouping {
    let mut buckets: Vec<Bucket> = Vec::new();
    let mut slots: HashMap<GroupKey, usize> = HashMap::new();
    let mut rejected = Vec::new();

    for row in rows {
        let Some(order_date) = OrderDate::parse(&row.order_date) else {
            warn!(
                record_id = row.record_id,
                order_date = %row.order_date,
                "skipping row with unparseable order date"
            );
            rejected.push(RejectedRecord {
                record_id: row.record_id,
                reason: format!("unparseable order_date '{}'", row.order_date),
            });
            continue;
        };

        let Some(user_name) = non_blank(row.user_name.as_deref()) else {
            warn!(
                record_id = row.record_id,
                user_id = row.user_id,
                "skipping row without user name"
            );
            rejected.push(RejectedRecord {
                record_id: row.record_id,
                reason: format!("user {} has no name", row.user_id),
            });
            continue;
        };

        let key = GroupKey {
            user_id: row.user_id,
            order_date,
        };
        let slot = *slots.entry(key).or_insert_with(|| {
            buckets.push(Bucket::new(key, user_name));
            buckets.len() - 1
        });
        let bucket = &mut buckets[slot];

        if !bucket.record_ids.contains(&row.record_id) {
            bucket.record_ids.push(row.record_id);
        }
        bucket.change_ids.push(row.change_id);

        match (
            non_blank(row.product_name.as_deref()),
            non_blank(row.category.as_deref()),
        ) {
            (Some(product), Some(category)) => {
                bucket.products.push(product.to_string());
                bucket.categories.push(category.to_string());
            }
            _ => warn!(
                record_id = row.record_id,
                product_id = row.product_id,
                "order line has no product name or category; leaving it out of the summary"
            ),
        }
    }

    Grouping {
        documents: buckets.into_iter().map(Bucket::into_document).collect(),
        rejected,
    }
}
