use serde::{Deserialize, Serialize};

use keymint_core::ProductId;

/// Catalog record: Product.
///
/// The average rating is denormalized from the review system and is
/// read-only to this core; it is carried so catalog listings do not need a
/// second lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    id: ProductId,
    name: String,
    avg_rating: f32,
}

impl Product {
    pub(crate) fn new(id: ProductId, name: String, avg_rating: f32) -> Self {
        Self {
            id,
            name,
            avg_rating,
        }
    }

    pub fn id(&self) -> ProductId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn avg_rating(&self) -> f32 {
        self.avg_rating
    }
}
