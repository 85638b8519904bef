use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, VariantId};
use serde::{Deserialize, Serialize};

use crate::StorageError;

/// A catalog product with a product-level stock counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub sku: String,
    pub price_cents: i64,
    pub description: String,
    pub stock: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A sellable size of a product with its own stock counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductVariant {
    pub id: VariantId,
    pub code: String,
    pub product_id: ProductId,
    pub name: String,
    pub stock: i64,
    pub price_cents: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to seed a product.
#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub sku: String,
    pub price_cents: i64,
    pub description: String,
    pub stock: i64,
}

impl NewProduct {
    pub fn new(sku: impl Into<String>, stock: i64) -> Self {
        let sku = sku.into();
        Self {
            name: sku.clone(),
            sku,
            price_cents: 0,
            description: String::new(),
            stock,
        }
    }
}

/// Fields needed to seed a variant.
#[derive(Debug, Clone)]
pub struct NewVariant {
    pub code: String,
    pub product_id: ProductId,
    pub name: String,
    pub stock: i64,
    pub price_cents: i64,
}

impl NewVariant {
    pub fn new(product_id: ProductId, code: impl Into<String>, stock: i64) -> Self {
        let code = code.into();
        Self {
            name: code.clone(),
            code,
            product_id,
            stock,
            price_cents: 0,
        }
    }
}

/// Which half of the deduct/revert pair a ledger record marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    Deduct,
    Revert,
}

impl LedgerKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deduct => "deduct",
            Self::Revert => "revert",
        }
    }
}

impl std::fmt::Display for LedgerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LedgerKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deduct" => Ok(Self::Deduct),
            "revert" => Ok(Self::Revert),
            other => Err(StorageError::CorruptRecord(format!(
                "unknown ledger kind '{other}'"
            ))),
        }
    }
}

/// Marker that an order's deduction (or its reversal) has been applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub id: i64,
    /// Id of the inbound event that caused the mutation.
    pub event_id: String,
    pub order_id: OrderId,
    pub kind: LedgerKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIdempotencyRecord {
    pub event_id: String,
    pub order_id: OrderId,
    pub kind: LedgerKind,
}

impl NewIdempotencyRecord {
    pub fn new(event_id: impl Into<String>, order_id: OrderId, kind: LedgerKind) -> Self {
        Self {
            event_id: event_id.into(),
            order_id,
            kind,
        }
    }
}

/// The row a stock mutation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockTarget {
    Product(ProductId),
    Variant(VariantId),
}

impl std::fmt::Display for StockTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Product(id) => write!(f, "product {id}"),
            Self::Variant(id) => write!(f, "variant {id}"),
        }
    }
}
