//! The unit of work handed to the orchestrator.

use common::{OrderId, ProductId, VariantId};
use serde::{Deserialize, Serialize};

use crate::events::{InventoryDeducted, PaymentSucceeded};
use crate::{InventoryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductLine {
    #[serde(rename = "id")]
    pub product_id: ProductId,
    #[serde(rename = "count")]
    pub quantity: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantLine {
    #[serde(rename = "id")]
    pub variant_id: VariantId,
    #[serde(rename = "count")]
    pub quantity: i64,
}

/// Stock changes for one order, one line per distinct product and variant.
///
/// Instances are recycled through [`RequestPool`](crate::RequestPool), so
/// every `fill_*` method starts from [`reset`](Self::reset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryDeductionRequest {
    pub order_id: OrderId,
    pub products: Vec<ProductLine>,
    pub variants: Vec<VariantLine>,
}

impl Default for InventoryDeductionRequest {
    fn default() -> Self {
        Self {
            order_id: OrderId::new(0),
            products: Vec::new(),
            variants: Vec::new(),
        }
    }
}

impl InventoryDeductionRequest {
    pub fn new(order_id: OrderId) -> Self {
        Self {
            order_id,
            ..Self::default()
        }
    }

    pub fn with_product(mut self, product_id: ProductId, quantity: i64) -> Result<Self> {
        self.add_product(product_id, quantity)?;
        Ok(self)
    }

    pub fn with_variant(mut self, variant_id: VariantId, quantity: i64) -> Result<Self> {
        self.add_variant(variant_id, quantity)?;
        Ok(self)
    }

    /// Adds `quantity` to the line for `product_id`, creating it if needed.
    ///
    /// Fails with `Validation` when the summed quantity overflows.
    pub fn add_product(&mut self, product_id: ProductId, quantity: i64) -> Result<()> {
        match self.products.iter_mut().find(|l| l.product_id == product_id) {
            Some(line) => {
                line.quantity = summed(line.quantity, quantity, "product", product_id)?;
            }
            None => self.products.push(ProductLine {
                product_id,
                quantity,
            }),
        }
        Ok(())
    }

    pub fn add_variant(&mut self, variant_id: VariantId, quantity: i64) -> Result<()> {
        match self.variants.iter_mut().find(|l| l.variant_id == variant_id) {
            Some(line) => {
                line.quantity = summed(line.quantity, quantity, "size", variant_id)?;
            }
            None => self.variants.push(VariantLine {
                variant_id,
                quantity,
            }),
        }
        Ok(())
    }

    /// Clears every field; allocated capacity is kept.
    pub fn reset(&mut self) {
        self.order_id = OrderId::new(0);
        self.products.clear();
        self.variants.clear();
    }

    /// Builds the request from a payment notification, summing quantities of
    /// repeated products and sizes.
    pub fn fill_from_payment(&mut self, event: &PaymentSucceeded) -> Result<()> {
        self.reset();
        self.order_id = event.order_id;
        for item in &event.products {
            self.add_product(item.product_id, item.quantity)?;
            if let Some(variant_id) = item.variant_id {
                self.add_variant(variant_id, item.quantity)?;
            }
        }
        Ok(())
    }

    /// Builds the compensation request from a deduction confirmation.
    pub fn fill_from_deducted(&mut self, event: &InventoryDeducted) -> Result<()> {
        self.reset();
        self.order_id = event.order_id;
        for line in &event.products {
            self.add_product(line.product_id, line.quantity)?;
        }
        for line in &event.variants {
            self.add_variant(line.variant_id, line.quantity)?;
        }
        Ok(())
    }

    pub fn to_deducted_event(&self) -> InventoryDeducted {
        InventoryDeducted {
            order_id: self.order_id,
            products: self.products.clone(),
            variants: self.variants.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty() && self.variants.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if !self.order_id.is_valid() {
            return Err(InventoryError::Validation(format!(
                "order id must be positive, got {}",
                self.order_id
            )));
        }
        if self.is_empty() {
            return Err(InventoryError::Validation(format!(
                "order {} has no line items",
                self.order_id
            )));
        }
        for line in &self.products {
            if !line.product_id.is_valid() || line.quantity <= 0 {
                return Err(InventoryError::Validation(format!(
                    "invalid line for product {}: quantity {}",
                    line.product_id, line.quantity
                )));
            }
        }
        for line in &self.variants {
            if !line.variant_id.is_valid() || line.quantity <= 0 {
                return Err(InventoryError::Validation(format!(
                    "invalid line for size {}: quantity {}",
                    line.variant_id, line.quantity
                )));
            }
        }
        Ok(())
    }
}

fn summed(current: i64, extra: i64, what: &str, id: impl std::fmt::Display) -> Result<i64> {
    current.checked_add(extra).ok_or_else(|| {
        InventoryError::Validation(format!("quantity for {what} {id} overflows"))
    })
}
