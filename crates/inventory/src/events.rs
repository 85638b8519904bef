//! Wire payloads exchanged with the order and payment services.

use common::{OrderId, ProductId, VariantId};
use serde::{Deserialize, Serialize};

use crate::request::{ProductLine, VariantLine};

pub mod topics {
    /// Published by the payment service once an order is paid.
    pub const ON_PAYMENT_SUCCESS: &str = "OnPaymentSuccess";
    /// Published here after stock for an order was deducted.
    pub const ON_INVENTORY_DEDUCT_SUCCESS: &str = "OnInventoryDeductSuccess";
    /// Undeliverable deduction confirmations; consuming it restores stock.
    pub const ON_INVENTORY_DEDUCT_SUCCESS_DLQ: &str = "OnInventoryDeductSuccessDLQ";
}

/// One line of a paid order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaidItem {
    pub product_id: ProductId,
    /// Size sold, when the product is sold by size.
    #[serde(default, rename = "product_size_id")]
    pub variant_id: Option<VariantId>,
    #[serde(rename = "product_num")]
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSucceeded {
    pub order_id: OrderId,
    #[serde(default)]
    pub products: Vec<PaidItem>,
}

/// Confirmation that an order's stock was deducted, with the exact lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryDeducted {
    pub order_id: OrderId,
    #[serde(default)]
    pub products: Vec<ProductLine>,
    #[serde(default, rename = "product_sizes")]
    pub variants: Vec<VariantLine>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_event_decodes_from_order_service_shape() {
        let json = r#"{"order_id":7,"products":[
            {"product_id":1,"product_size_id":10,"product_num":2},
            {"product_id":2,"product_num":1}
        ]}"#;
        let event: PaymentSucceeded = serde_json::from_str(json).unwrap();
        assert_eq!(event.order_id, OrderId::new(7));
        assert_eq!(event.products[0].variant_id, Some(VariantId::new(10)));
        assert_eq!(event.products[1].variant_id, None);
    }

    #[test]
    fn missing_products_decode_as_empty() {
        let event: PaymentSucceeded = serde_json::from_str(r#"{"order_id":1}"#).unwrap();
        assert!(event.products.is_empty());
    }
}
