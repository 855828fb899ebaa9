//! Collection schema for the point-of-sale store.
//!
//! Upgrades are additive only: bump [`SCHEMA_VERSION`] and append
//! collections or indices. Nothing here is ever dropped from an existing
//! database.

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: u32 = 7;

/// Collection names used outside the storage crate.
pub mod names {
    pub const TRANSACTIONS: &str = "transactions";
    pub const PRODUCTS: &str = "products";
    pub const CUSTOMERS: &str = "customers";
    pub const CATEGORIES: &str = "categories";
    pub const OUTBOX: &str = "outbox";
    pub const SETTINGS: &str = "settings";
    pub const ATTENDANCE: &str = "attendance";
    pub const STAFF: &str = "staff";
    pub const AUDIT_LOGS: &str = "audit_logs";
    pub const EXPENSES: &str = "expenses";
    pub const TAXES: &str = "taxes";
    pub const INVOICES: &str = "invoices";
    pub const SUPPLIERS: &str = "suppliers";
    pub const PURCHASE_ORDERS: &str = "purchase_orders";
    pub const STOCK_TRANSFERS: &str = "stock_transfers";
    pub const STOCK_BATCHES: &str = "stock_batches";
    pub const CASH_SESSIONS: &str = "cash_sessions";
    pub const SYNC_SIGNALS: &str = "sync_signals";
}

/// A secondary, non-unique index over one record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub field: &'static str,
    /// Supports descending "last N" walks.
    pub ordered: bool,
}

impl IndexSpec {
    const fn on(field: &'static str) -> Self {
        Self {
            name: field,
            field,
            ordered: false,
        }
    }

    const fn ordered(field: &'static str) -> Self {
        Self {
            name: field,
            field,
            ordered: true,
        }
    }
}

/// A named partition of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSchema {
    pub name: &'static str,
    pub key_path: &'static str,
    pub indices: &'static [IndexSpec],
    /// Schema version that introduced the collection.
    pub since: u32,
}

impl CollectionSchema {
    pub fn index(&self, name: &str) -> Option<&IndexSpec> {
        self.indices.iter().find(|i| i.name == name)
    }

    /// Fields duplicated in plaintext on every envelope of this collection.
    pub fn preserved_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::with_capacity(self.indices.len() + 1);
        fields.push(self.key_path);
        for idx in self.indices {
            if !fields.contains(&idx.field) {
                fields.push(idx.field);
            }
        }
        fields
    }
}

use names::*;

const fn collection(
    name: &'static str,
    key_path: &'static str,
    indices: &'static [IndexSpec],
    since: u32,
) -> CollectionSchema {
    CollectionSchema {
        name,
        key_path,
        indices,
        since,
    }
}

const TRANSACTION_INDICES: &[IndexSpec] = &[
    IndexSpec::ordered("created_at"),
    IndexSpec::on("branch_id"),
    IndexSpec::on("status"),
];
const PRODUCT_INDICES: &[IndexSpec] = &[
    IndexSpec::on("branch_id"),
    IndexSpec::on("category_id"),
    IndexSpec::on("sku"),
];
const CUSTOMER_INDICES: &[IndexSpec] = &[IndexSpec::on("branch_id"), IndexSpec::on("phone")];
const CATEGORY_INDICES: &[IndexSpec] = &[IndexSpec::on("branch_id")];
const OUTBOX_INDICES: &[IndexSpec] = &[
    IndexSpec::ordered("created_at"),
    IndexSpec::on("status"),
    IndexSpec::on("type"),
];
const ATTENDANCE_INDICES: &[IndexSpec] = &[IndexSpec::ordered("clock_in")];
const STAFF_INDICES: &[IndexSpec] = &[IndexSpec::on("role")];
const AUDIT_LOG_INDICES: &[IndexSpec] = &[IndexSpec::ordered("timestamp")];
const EXPENSE_INDICES: &[IndexSpec] = &[IndexSpec::ordered("date"), IndexSpec::on("category")];
const INVOICE_INDICES: &[IndexSpec] = &[IndexSpec::on("status"), IndexSpec::ordered("due_date")];
const PURCHASE_ORDER_INDICES: &[IndexSpec] = &[IndexSpec::on("status")];
const STOCK_TRANSFER_INDICES: &[IndexSpec] = &[
    IndexSpec::on("status"),
    IndexSpec::on("source_branch"),
    IndexSpec::on("destination_branch"),
];
const STOCK_BATCH_INDICES: &[IndexSpec] = &[
    IndexSpec::on("product"),
    IndexSpec::on("batch_number"),
    IndexSpec::ordered("expiry_date"),
];
const CASH_SESSION_INDICES: &[IndexSpec] = &[
    IndexSpec::on("branch"),
    IndexSpec::on("status"),
    IndexSpec::ordered("start_time"),
];
const SIGNAL_INDICES: &[IndexSpec] = &[IndexSpec::ordered("created_at")];

static COLLECTIONS: &[CollectionSchema] = &[
    collection(TRANSACTIONS, "id", TRANSACTION_INDICES, 1),
    collection(PRODUCTS, "id", PRODUCT_INDICES, 1),
    collection(CUSTOMERS, "id", CUSTOMER_INDICES, 1),
    collection(CATEGORIES, "id", CATEGORY_INDICES, 1),
    collection(OUTBOX, "uuid", OUTBOX_INDICES, 1),
    collection(SETTINGS, "key", &[], 1),
    collection(ATTENDANCE, "id", ATTENDANCE_INDICES, 3),
    collection(STAFF, "id", STAFF_INDICES, 3),
    collection(AUDIT_LOGS, "id", AUDIT_LOG_INDICES, 3),
    collection(EXPENSES, "id", EXPENSE_INDICES, 4),
    collection(TAXES, "id", &[], 4),
    collection(INVOICES, "id", INVOICE_INDICES, 4),
    collection(SUPPLIERS, "id", &[], 4),
    collection(PURCHASE_ORDERS, "id", PURCHASE_ORDER_INDICES, 4),
    collection(STOCK_TRANSFERS, "id", STOCK_TRANSFER_INDICES, 5),
    collection(STOCK_BATCHES, "id", STOCK_BATCH_INDICES, 5),
    collection(CASH_SESSIONS, "id", CASH_SESSION_INDICES, 6),
    collection(SYNC_SIGNALS, "id", SIGNAL_INDICES, 7),
];

/// The full set of collections at [`SCHEMA_VERSION`].
pub fn collections() -> &'static [CollectionSchema] {
    COLLECTIONS
}

/// Looks up a collection by name.
pub fn find(name: &str) -> Option<&'static CollectionSchema> {
    COLLECTIONS.iter().find(|c| c.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn names_are_unique() {
        let names: HashSet<_> = collections().iter().map(|c| c.name).collect();
        assert_eq!(names.len(), collections().len());
    }

    #[test]
    fn no_collection_is_newer_than_schema() {
        assert!(collections().iter().all(|c| c.since <= SCHEMA_VERSION));
    }

    #[test]
    fn preserved_fields_include_key_and_indices() {
        let outbox = find(OUTBOX).unwrap();
        assert_eq!(outbox.preserved_fields(), vec!["uuid", "created_at", "status", "type"]);
        assert_eq!(find(SETTINGS).unwrap().preserved_fields(), vec!["key"]);
    }
}
