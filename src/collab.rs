//! Collaborators the booking core calls out to but never implements.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::engine::EngineError;
use crate::model::{Amount, PriceLine};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductConstraints {
    pub min_participants: u32,
    pub max_participants: u32,
    pub duration_minutes: u32,
    pub display_name: String,
}

/// One participant as the pricing collaborator sees them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub role_name: String,
    pub discount_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub final_amount: Amount,
    /// One line per participant, in the order they were passed in.
    pub breakdown: Vec<PriceLine>,
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn product_constraints(&self, product_ref: &str) -> Result<ProductConstraints, EngineError>;
}

#[async_trait]
pub trait Pricing: Send + Sync {
    async fn compute_order_price(
        &self,
        product_ref: &str,
        participants: &[Participant],
        date: NaiveDate,
    ) -> Result<PriceQuote, EngineError>;
}

#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store the bytes and return a stable reference URL.
    async fn put(&self, name: &str, bytes: Vec<u8>) -> Result<String, EngineError>;
}
