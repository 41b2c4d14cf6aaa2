use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use keymint_catalog::CatalogStore;
use keymint_core::{DomainError, DomainResult, LicenseKeyId, OrderId, SkuId};

/// One line of demand: how many keys of a SKU an order wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Demand {
    pub sku_id: SkuId,
    pub quantity: u32,
}

/// Allocator tuning knobs. Defaults are fine for a single-process store;
/// the retry bound only matters under real contention.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    /// How many times a claim is retried from a fresh snapshot after losing
    /// an optimistic race, before the conflict is surfaced.
    pub max_claim_retries: u32,
    /// TTL applied to pre-payment reservation holds.
    pub reservation_ttl: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_claim_retries: 8,
            reservation_ttl: Duration::minutes(15),
        }
    }
}

/// Atomically assigns license keys from the catalog's per-SKU pools.
///
/// The allocator is the only component that mutates key status, and it does
/// so exclusively through the store's conditional updates. Failure of any
/// line rolls back everything the order picked up during the call, so an
/// order either holds keys for its full quantity or none at all.
#[derive(Debug, Clone)]
pub struct Allocator {
    catalog: Arc<CatalogStore>,
    config: AllocatorConfig,
}

impl Allocator {
    pub fn new(catalog: Arc<CatalogStore>) -> Self {
        Self::with_config(catalog, AllocatorConfig::default())
    }

    pub fn with_config(catalog: Arc<CatalogStore>, config: AllocatorConfig) -> Self {
        Self { catalog, config }
    }

    pub fn config(&self) -> AllocatorConfig {
        self.config
    }

    /// Assign `quantity` keys per line to the order, or fail the whole order.
    ///
    /// Selection is strict FIFO by key creation order. Keys the order already
    /// reserved are converted to assignments and preferred over fresh ones.
    /// On any failure every key this order holds is released before the
    /// error is returned, so no failure path leaves keys dangling.
    pub fn allocate(
        &self,
        order_id: OrderId,
        items: &[Demand],
    ) -> DomainResult<BTreeMap<SkuId, Vec<LicenseKeyId>>> {
        let span = info_span!("allocate", order_id = %order_id);
        let _guard = span.enter();

        if items.is_empty() {
            return Err(DomainError::validation("nothing to allocate"));
        }
        for demand in items {
            if demand.quantity == 0 {
                return Err(DomainError::validation("demand quantity must be at least 1"));
            }
        }

        let mut assigned: BTreeMap<SkuId, Vec<LicenseKeyId>> = BTreeMap::new();
        for demand in items {
            match self.claim_line(order_id, *demand) {
                Ok(ids) => assigned.entry(demand.sku_id).or_default().extend(ids),
                Err(err) => {
                    // Compensating rollback: drop every key claimed so far
                    // (and any reservation the order held).
                    self.catalog.release_for_order(order_id)?;
                    warn!(sku_id = %demand.sku_id, %err, "allocation failed, rolled back");
                    return Err(err);
                }
            }
        }

        info!(
            lines = items.len(),
            keys = assigned.values().map(Vec::len).sum::<usize>(),
            "allocation complete"
        );
        Ok(assigned)
    }

    fn claim_line(&self, order_id: OrderId, demand: Demand) -> DomainResult<Vec<LicenseKeyId>> {
        let quantity = demand.quantity as usize;
        let mut attempt = 0;
        loop {
            let now = Utc::now();
            let (version, candidates) =
                self.catalog
                    .available_snapshot(demand.sku_id, Some(order_id), now)?;
            if candidates.len() < quantity {
                return Err(DomainError::InsufficientInventory(demand.sku_id));
            }

            let picked: Vec<LicenseKeyId> = candidates[..quantity].to_vec();
            match self.catalog.claim(demand.sku_id, version, &picked, order_id, now) {
                Ok(()) => return Ok(picked),
                Err(err) if err.is_transient() && attempt < self.config.max_claim_retries => {
                    attempt += 1;
                    debug!(sku_id = %demand.sku_id, attempt, "claim lost optimistic race, retrying");
                }
                Err(err) => {
                    if err.is_transient() {
                        warn!(sku_id = %demand.sku_id, attempts = attempt, "claim retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Place TTL holds covering the order's demand ahead of payment.
    ///
    /// Same all-or-nothing and rollback semantics as `allocate`; the holds
    /// expire on their own if payment confirmation never arrives.
    pub fn reserve(
        &self,
        order_id: OrderId,
        items: &[Demand],
        now: DateTime<Utc>,
    ) -> DomainResult<BTreeMap<SkuId, Vec<LicenseKeyId>>> {
        let span = info_span!("reserve", order_id = %order_id);
        let _guard = span.enter();

        if items.is_empty() {
            return Err(DomainError::validation("nothing to reserve"));
        }
        let expires_at = now + self.config.reservation_ttl;

        let mut reserved: BTreeMap<SkuId, Vec<LicenseKeyId>> = BTreeMap::new();
        for demand in items {
            if demand.quantity == 0 {
                self.catalog.release_for_order(order_id)?;
                return Err(DomainError::validation("demand quantity must be at least 1"));
            }
            match self.reserve_line(order_id, *demand, now, expires_at) {
                Ok(ids) => reserved.entry(demand.sku_id).or_default().extend(ids),
                Err(err) => {
                    self.catalog.release_for_order(order_id)?;
                    warn!(sku_id = %demand.sku_id, %err, "reservation failed, rolled back");
                    return Err(err);
                }
            }
        }

        info!(
            keys = reserved.values().map(Vec::len).sum::<usize>(),
            expires_at = %expires_at,
            "reservation placed"
        );
        Ok(reserved)
    }

    fn reserve_line(
        &self,
        order_id: OrderId,
        demand: Demand,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> DomainResult<Vec<LicenseKeyId>> {
        let quantity = demand.quantity as usize;
        let mut attempt = 0;
        loop {
            let (version, candidates) = self.catalog.available_snapshot(demand.sku_id, None, now)?;
            if candidates.len() < quantity {
                return Err(DomainError::InsufficientInventory(demand.sku_id));
            }

            let picked: Vec<LicenseKeyId> = candidates[..quantity].to_vec();
            match self
                .catalog
                .reserve(demand.sku_id, version, &picked, order_id, expires_at)
            {
                Ok(()) => return Ok(picked),
                Err(err) if err.is_transient() && attempt < self.config.max_claim_retries => {
                    attempt += 1;
                    debug!(sku_id = %demand.sku_id, attempt, "reserve lost optimistic race, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Release every key the order holds back to the pool. Idempotent; shared
    /// by refunds and reservation expiry.
    pub fn release(&self, order_id: OrderId) -> DomainResult<usize> {
        let released = self.catalog.release_for_order(order_id)?;
        if released > 0 {
            info!(order_id = %order_id, released, "released order holdings");
        }
        Ok(released)
    }

    /// Background/periodic pass releasing expired holds across all pools.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> DomainResult<usize> {
        let released = self.catalog.expire_holds(now)?;
        if released > 0 {
            info!(released, "swept expired reservation holds");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keymint_catalog::Validity;

    fn setup(keys: &[&str]) -> (Arc<CatalogStore>, Allocator, SkuId) {
        let store = Arc::new(CatalogStore::new());
        let product = store.create_product("Photo Editor Pro", 4.2).unwrap();
        let sku = store
            .create_sku(product, "1 Year", 4999, Validity::Days(365))
            .unwrap();
        for key in keys {
            store.add_license_key(sku, key).unwrap();
        }
        let allocator = Allocator::new(store.clone());
        (store, allocator, sku)
    }

    #[test]
    fn allocates_fifo_and_leaves_the_rest() {
        let (store, allocator, sku) = setup(&["A", "B", "C"]);
        let order = OrderId::new();

        let assigned = allocator
            .allocate(order, &[Demand { sku_id: sku, quantity: 2 }])
            .unwrap();

        let ids = &assigned[&sku];
        let picked: Vec<&str> = ids
            .iter()
            .map(|id| store.license_key(*id).unwrap())
            .map(|k| match k.key() {
                "A" => "A",
                "B" => "B",
                other => panic!("unexpected key {other}"),
            })
            .collect();
        assert_eq!(picked, vec!["A", "B"]);

        let counts = store.count_by_status(sku).unwrap();
        assert_eq!((counts.available, counts.assigned), (1, 2));
        let remaining = store
            .license_keys_for_sku(sku)
            .unwrap()
            .into_iter()
            .find(|k| k.status() == keymint_catalog::LicenseStatus::Available)
            .unwrap();
        assert_eq!(remaining.key(), "C");
    }

    #[test]
    fn insufficient_inventory_names_the_sku() {
        let (_, allocator, sku) = setup(&["A"]);
        let err = allocator
            .allocate(OrderId::new(), &[Demand { sku_id: sku, quantity: 2 }])
            .unwrap_err();
        assert_eq!(err, DomainError::InsufficientInventory(sku));
    }

    #[test]
    fn second_line_shortage_rolls_back_the_first() {
        let store = Arc::new(CatalogStore::new());
        let product = store.create_product("Bundle", 4.0).unwrap();
        let sku_a = store
            .create_sku(product, "App A", 1000, Validity::Lifetime)
            .unwrap();
        let sku_b = store
            .create_sku(product, "App B", 2000, Validity::Lifetime)
            .unwrap();
        store.add_license_key(sku_a, "A-1").unwrap();
        store.add_license_key(sku_a, "A-2").unwrap();
        // sku_b is exhausted from the start.

        let allocator = Allocator::new(store.clone());
        let order = OrderId::new();
        let err = allocator
            .allocate(
                order,
                &[
                    Demand { sku_id: sku_a, quantity: 2 },
                    Demand { sku_id: sku_b, quantity: 1 },
                ],
            )
            .unwrap_err();
        assert_eq!(err, DomainError::InsufficientInventory(sku_b));

        // All-or-nothing: the provisional claims on sku_a were reverted.
        let counts = store.count_by_status(sku_a).unwrap();
        assert_eq!((counts.available, counts.assigned), (2, 0));
    }

    #[test]
    fn racing_orders_for_the_last_key_resolve_to_one_winner() {
        let (_, allocator, sku) = setup(&["LAST"]);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let allocator = allocator.clone();
            handles.push(std::thread::spawn(move || {
                allocator.allocate(OrderId::new(), &[Demand { sku_id: sku, quantity: 1 }])
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let losses = results
            .iter()
            .filter(|r| matches!(r, Err(DomainError::InsufficientInventory(s)) if *s == sku))
            .count();
        assert_eq!((wins, losses), (1, 1));
    }

    #[test]
    fn contended_allocation_retries_instead_of_failing() {
        // Plenty of stock for everyone; every thread must succeed even though
        // their optimistic claims collide.
        let keys: Vec<String> = (0..16).map(|i| format!("K-{i}")).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let (store, allocator, sku) = setup(&key_refs);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let allocator = allocator.clone();
            handles.push(std::thread::spawn(move || {
                allocator.allocate(OrderId::new(), &[Demand { sku_id: sku, quantity: 2 }])
            }));
        }
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        let counts = store.count_by_status(sku).unwrap();
        assert_eq!((counts.available, counts.assigned), (0, 16));
    }

    #[test]
    fn release_twice_is_a_no_op() {
        let (store, allocator, sku) = setup(&["A", "B"]);
        let order = OrderId::new();
        allocator
            .allocate(order, &[Demand { sku_id: sku, quantity: 2 }])
            .unwrap();

        assert_eq!(allocator.release(order).unwrap(), 2);
        assert_eq!(allocator.release(order).unwrap(), 0);
        assert_eq!(store.count_by_status(sku).unwrap().available, 2);
    }

    #[test]
    fn reservation_blocks_rivals_until_it_expires() {
        let (store, allocator, sku) = setup(&["ONLY"]);
        let holder = OrderId::new();
        let rival = OrderId::new();
        let now = Utc::now();

        allocator
            .reserve(holder, &[Demand { sku_id: sku, quantity: 1 }], now)
            .unwrap();

        // While the hold is in force the rival is starved.
        let err = allocator
            .allocate(rival, &[Demand { sku_id: sku, quantity: 1 }])
            .unwrap_err();
        assert_eq!(err, DomainError::InsufficientInventory(sku));

        // After the TTL the sweep frees it and the rival wins.
        let later = now + Duration::minutes(16);
        assert_eq!(allocator.sweep_expired(later).unwrap(), 1);
        allocator
            .allocate(rival, &[Demand { sku_id: sku, quantity: 1 }])
            .unwrap();
        assert_eq!(store.count_by_status(sku).unwrap().assigned, 1);
    }

    #[test]
    fn allocate_converts_own_reservation_to_assignment() {
        let (store, allocator, sku) = setup(&["R-1", "R-2"]);
        let order = OrderId::new();
        let now = Utc::now();

        let reserved = allocator
            .reserve(order, &[Demand { sku_id: sku, quantity: 2 }], now)
            .unwrap();
        let assigned = allocator
            .allocate(order, &[Demand { sku_id: sku, quantity: 2 }])
            .unwrap();
        assert_eq!(reserved[&sku], assigned[&sku]);

        let counts = store.count_by_status(sku).unwrap();
        assert_eq!((counts.reserved, counts.assigned), (0, 2));
    }

    #[test]
    fn rejects_zero_quantity_and_empty_demand() {
        let (_, allocator, sku) = setup(&["A"]);
        assert!(matches!(
            allocator.allocate(OrderId::new(), &[]),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            allocator.allocate(OrderId::new(), &[Demand { sku_id: sku, quantity: 0 }]),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn duplicate_sku_lines_draw_from_the_same_pool() {
        let (store, allocator, sku) = setup(&["A", "B", "C"]);
        let order = OrderId::new();

        let assigned = allocator
            .allocate(
                order,
                &[
                    Demand { sku_id: sku, quantity: 1 },
                    Demand { sku_id: sku, quantity: 2 },
                ],
            )
            .unwrap();
        assert_eq!(assigned[&sku].len(), 3);
        assert_eq!(store.count_by_status(sku).unwrap().available, 0);
    }
}
