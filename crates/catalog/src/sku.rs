use serde::{Deserialize, Serialize};

use keymint_core::{DomainError, DomainResult, ProductId, SkuId};

/// How long a license bought under this SKU stays valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validity {
    Lifetime,
    /// Positive day count.
    Days(u32),
}

impl Validity {
    pub fn validate(self) -> DomainResult<()> {
        match self {
            Validity::Lifetime => Ok(()),
            Validity::Days(0) => Err(DomainError::validation("validity days must be positive")),
            Validity::Days(_) => Ok(()),
        }
    }
}

/// Catalog record: SKU — a purchasable validity/price tier of a product.
///
/// SKU fields are immutable after creation; a SKU leaves the catalog only
/// through `CatalogStore::delete_sku`, which cascades onto its key pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sku {
    id: SkuId,
    product_id: ProductId,
    name: String,
    /// Price in smallest currency unit (e.g., cents). Always positive.
    price_minor_units: u64,
    validity: Validity,
}

impl Sku {
    pub(crate) fn new(
        id: SkuId,
        product_id: ProductId,
        name: String,
        price_minor_units: u64,
        validity: Validity,
    ) -> DomainResult<Self> {
        if name.trim().is_empty() {
            return Err(DomainError::validation("sku name cannot be empty"));
        }
        if price_minor_units == 0 {
            return Err(DomainError::validation("price must be positive"));
        }
        validity.validate()?;

        Ok(Self {
            id,
            product_id,
            name,
            price_minor_units,
            validity,
        })
    }

    pub fn id(&self) -> SkuId {
        self.id
    }

    pub fn product_id(&self) -> ProductId {
        self.product_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn price_minor_units(&self) -> u64 {
        self.price_minor_units
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }
}
