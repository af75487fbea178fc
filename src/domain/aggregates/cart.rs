//! Cart Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::domain::value_objects::{Money, MoneyError};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cart {
    id: String,
    customer_id: Option<String>,
    items: Vec<LineItem>,
    referral_code: Option<String>,
    currency: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub line_id: String,
    pub product_id: String,
    pub variant_id: String,
    pub title: String,
    pub quantity: u32,
    pub base_unit_price: Money,
}

impl LineItem {
    pub fn new(product_id: impl Into<String>, variant_id: impl Into<String>, title: impl Into<String>, quantity: u32, base_unit_price: Money) -> Self {
        Self {
            line_id: Uuid::new_v4().to_string(), product_id: product_id.into(), variant_id: variant_id.into(),
            title: title.into(), quantity, base_unit_price,
        }
    }

    pub fn base_total(&self) -> Money { self.base_unit_price.multiply(self.quantity) }
}

impl Cart {
    pub fn new(currency: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(), customer_id: None, items: vec![], referral_code: None,
            currency: currency.to_uppercase(), created_at: now, updated_at: now,
        }
    }

    pub fn for_customer(customer_id: impl Into<String>, currency: &str) -> Self {
        let mut cart = Self::new(currency);
        cart.customer_id = Some(customer_id.into());
        cart
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn customer_id(&self) -> Option<&str> { self.customer_id.as_deref() }
    pub fn items(&self) -> &[LineItem] { &self.items }
    pub fn currency(&self) -> &str { &self.currency }
    pub fn referral_code(&self) -> Option<&str> { self.referral_code.as_deref() }
    pub fn item_count(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Adds a line, merging quantities with an existing line for the same variant.
    pub fn add_item(&mut self, item: LineItem) -> Result<(), CartError> {
        if item.quantity == 0 { return Err(CartError::InvalidQuantity); }
        if item.base_unit_price.currency() != self.currency {
            return Err(CartError::Money(MoneyError::CurrencyMismatch {
                left: self.currency.clone(), right: item.base_unit_price.currency().to_string(),
            }));
        }
        if let Some(existing) = self.items.iter_mut().find(|i| i.variant_id == item.variant_id) {
            existing.quantity = existing.quantity.saturating_add(item.quantity);
        } else {
            self.items.push(item);
        }
        self.touch();
        Ok(())
    }

    /// Sets a line's quantity; zero removes the line.
    pub fn update_quantity(&mut self, variant_id: &str, quantity: u32) -> Result<(), CartError> {
        let item = self.items.iter_mut().find(|i| i.variant_id == variant_id).ok_or(CartError::ItemNotFound)?;
        if quantity == 0 { self.items.retain(|i| i.variant_id != variant_id); }
        else { item.quantity = quantity; }
        self.touch();
        Ok(())
    }

    pub fn remove_item(&mut self, variant_id: &str) -> Result<(), CartError> {
        let before = self.items.len();
        self.items.retain(|i| i.variant_id != variant_id);
        if self.items.len() == before { return Err(CartError::ItemNotFound); }
        self.touch();
        Ok(())
    }

    pub fn apply_referral_code(&mut self, code: impl Into<String>) { self.referral_code = Some(code.into()); self.touch(); }
    pub fn clear_referral_code(&mut self) { self.referral_code = None; self.touch(); }

    pub fn clear(&mut self) { self.items.clear(); self.referral_code = None; self.touch(); }

    /// Sum of base prices before any discount.
    pub fn base_subtotal(&self) -> Money {
        self.items.iter().fold(Money::zero(&self.currency), |acc, i| acc.add(&i.base_total()).unwrap_or(acc))
    }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CartError {
    #[error("item not found")]
    ItemNotFound,
    #[error("quantity must be at least 1")]
    InvalidQuantity,
    #[error(transparent)]
    Money(#[from] MoneyError),
}
