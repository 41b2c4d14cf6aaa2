//! In-memory transactional catalog store.
//!
//! One authoritative store, per-SKU key pools. Each pool sits behind its own
//! mutex and carries a version counter that every mutation bumps, so the
//! allocator's claim/reserve steps can run as optimistic conditional updates:
//! snapshot the pool, pick keys, then commit against the expected version.
//! Operations on different SKUs never block each other; `count_by_status`
//! reads the four buckets under the pool lock, so it never sees a torn state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tracing::debug;

use keymint_core::{DomainError, DomainResult, LicenseKeyId, OrderId, ProductId, SkuId};

use crate::license::{LicenseKey, LicenseStatus, StatusCounts};
use crate::product::Product;
use crate::sku::{Sku, Validity};

const POISONED: &str = "catalog lock poisoned";

#[derive(Debug)]
struct SkuPool {
    sku: Sku,
    state: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    keys: HashMap<LicenseKeyId, LicenseKey>,
    /// Bumped on every pool mutation; the allocator's conditional updates
    /// check it before committing.
    version: u64,
    /// Insertion counter feeding `LicenseKey::seq` (FIFO tiebreak).
    next_seq: u64,
}

impl PoolState {
    fn has_duplicate_key(&self, key: &str, excluding: Option<LicenseKeyId>) -> bool {
        self.keys
            .values()
            .any(|k| Some(k.id()) != excluding && k.key() == key)
    }

    /// Release any expired holds in place. Returns how many were released.
    fn expire_overdue(&mut self, now: DateTime<Utc>) -> usize {
        let mut released = 0;
        for key in self.keys.values_mut() {
            if key.status() == LicenseStatus::Reserved
                && key.hold().is_some_and(|h| h.is_expired(now))
            {
                key.release();
                released += 1;
            }
        }
        if released > 0 {
            self.version += 1;
        }
        released
    }
}

/// Authoritative store for products, SKUs, and license keys.
#[derive(Debug, Default)]
pub struct CatalogStore {
    products: RwLock<HashMap<ProductId, Product>>,
    pools: RwLock<HashMap<SkuId, Arc<SkuPool>>>,
}

impl CatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self, sku_id: SkuId) -> DomainResult<Arc<SkuPool>> {
        let pools = self.pools.read().map_err(|_| DomainError::conflict(POISONED))?;
        pools.get(&sku_id).cloned().ok_or(DomainError::NotFound)
    }

    /// Locate the pool containing a key. Pools are locked one at a time, so
    /// the scan never blocks unrelated SKUs.
    fn pool_for_key(&self, id: LicenseKeyId) -> DomainResult<Arc<SkuPool>> {
        let pools = self.pools.read().map_err(|_| DomainError::conflict(POISONED))?;
        for pool in pools.values() {
            let state = pool.state.lock().map_err(|_| DomainError::conflict(POISONED))?;
            if state.keys.contains_key(&id) {
                drop(state);
                return Ok(pool.clone());
            }
        }
        Err(DomainError::NotFound)
    }

    // ---- products ----

    pub fn create_product(&self, name: impl Into<String>, avg_rating: f32) -> DomainResult<ProductId> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DomainError::validation("product name cannot be empty"));
        }
        let id = ProductId::new();
        let mut products = self.products.write().map_err(|_| DomainError::conflict(POISONED))?;
        products.insert(id, Product::new(id, name, avg_rating));
        Ok(id)
    }

    pub fn product(&self, id: ProductId) -> DomainResult<Product> {
        let products = self.products.read().map_err(|_| DomainError::conflict(POISONED))?;
        products.get(&id).cloned().ok_or(DomainError::NotFound)
    }

    // ---- skus ----

    pub fn create_sku(
        &self,
        product_id: ProductId,
        name: impl Into<String>,
        price_minor_units: u64,
        validity: Validity,
    ) -> DomainResult<SkuId> {
        self.product(product_id)?;

        let id = SkuId::new();
        let sku = Sku::new(id, product_id, name.into(), price_minor_units, validity)?;
        let mut pools = self.pools.write().map_err(|_| DomainError::conflict(POISONED))?;
        pools.insert(
            id,
            Arc::new(SkuPool {
                sku,
                state: Mutex::new(PoolState::default()),
            }),
        );
        Ok(id)
    }

    pub fn sku(&self, id: SkuId) -> DomainResult<Sku> {
        Ok(self.pool(id)?.sku.clone())
    }

    pub fn skus_for_product(&self, product_id: ProductId) -> DomainResult<Vec<Sku>> {
        self.product(product_id)?;
        let pools = self.pools.read().map_err(|_| DomainError::conflict(POISONED))?;
        let mut skus: Vec<Sku> = pools
            .values()
            .filter(|p| p.sku.product_id() == product_id)
            .map(|p| p.sku.clone())
            .collect();
        skus.sort_by(|a, b| a.id().cmp(&b.id()));
        Ok(skus)
    }

    /// Delete a SKU, cascading onto its license keys.
    ///
    /// Every key must be `Available` or `Revoked`; a single reserved or
    /// assigned key blocks the deletion with `SkuInUse`.
    pub fn delete_sku(&self, sku_id: SkuId) -> DomainResult<()> {
        let mut pools = self.pools.write().map_err(|_| DomainError::conflict(POISONED))?;
        let pool = pools.get(&sku_id).ok_or(DomainError::NotFound)?;
        {
            let state = pool.state.lock().map_err(|_| DomainError::conflict(POISONED))?;
            let in_use = state.keys.values().any(|k| {
                matches!(k.status(), LicenseStatus::Reserved | LicenseStatus::Assigned)
            });
            if in_use {
                return Err(DomainError::SkuInUse(sku_id));
            }
        }
        pools.remove(&sku_id);
        Ok(())
    }

    // ---- license keys ----

    /// Add a key to a SKU's pool. The key string is trimmed; comparison
    /// against existing keys is exact-match, case-sensitive.
    pub fn add_license_key(&self, sku_id: SkuId, key: &str) -> DomainResult<LicenseKeyId> {
        let key = key.trim();
        if key.is_empty() {
            return Err(DomainError::validation("license key cannot be empty"));
        }

        let pool = self.pool(sku_id)?;
        let mut state = pool.state.lock().map_err(|_| DomainError::conflict(POISONED))?;
        if state.has_duplicate_key(key, None) {
            return Err(DomainError::DuplicateKey(key.to_string()));
        }

        let id = LicenseKeyId::new();
        let seq = state.next_seq;
        state.next_seq += 1;
        state
            .keys
            .insert(id, LicenseKey::new(id, sku_id, key.to_string(), Utc::now(), seq));
        state.version += 1;
        Ok(id)
    }

    /// Rewrite the key string. Only `Available` keys can be edited.
    pub fn update_license_key(&self, id: LicenseKeyId, new_key: &str) -> DomainResult<()> {
        let new_key = new_key.trim();
        if new_key.is_empty() {
            return Err(DomainError::validation("license key cannot be empty"));
        }

        let pool = self.pool_for_key(id)?;
        let mut state = pool.state.lock().map_err(|_| DomainError::conflict(POISONED))?;
        let status = state.keys.get(&id).ok_or(DomainError::NotFound)?.status();
        if status != LicenseStatus::Available {
            return Err(DomainError::LicenseInUse(id));
        }
        if state.has_duplicate_key(new_key, Some(id)) {
            return Err(DomainError::DuplicateKey(new_key.to_string()));
        }

        if let Some(key) = state.keys.get_mut(&id) {
            key.set_key(new_key.to_string());
        }
        state.version += 1;
        Ok(())
    }

    /// Remove a key from the pool. Only `Available` or `Revoked` keys can be
    /// deleted; anything mid-flight fails `LicenseInUse`.
    pub fn delete_license_key(&self, id: LicenseKeyId) -> DomainResult<()> {
        let pool = self.pool_for_key(id)?;
        let mut state = pool.state.lock().map_err(|_| DomainError::conflict(POISONED))?;
        let status = state.keys.get(&id).ok_or(DomainError::NotFound)?.status();
        if !matches!(status, LicenseStatus::Available | LicenseStatus::Revoked) {
            return Err(DomainError::LicenseInUse(id));
        }
        state.keys.remove(&id);
        state.version += 1;
        Ok(())
    }

    /// Pull a leaked/compromised key out of circulation permanently.
    ///
    /// Admin-only and irreversible: the key keeps its assignment record for
    /// audit but never re-enters the pool, not even on release.
    pub fn revoke_license_key(&self, id: LicenseKeyId) -> DomainResult<()> {
        let pool = self.pool_for_key(id)?;
        let mut state = pool.state.lock().map_err(|_| DomainError::conflict(POISONED))?;
        let key = state.keys.get_mut(&id).ok_or(DomainError::NotFound)?;
        if key.status() != LicenseStatus::Assigned {
            return Err(DomainError::validation("only assigned keys can be revoked"));
        }
        key.revoke();
        state.version += 1;
        Ok(())
    }

    pub fn license_key(&self, id: LicenseKeyId) -> DomainResult<LicenseKey> {
        let pool = self.pool_for_key(id)?;
        let state = pool.state.lock().map_err(|_| DomainError::conflict(POISONED))?;
        state.keys.get(&id).cloned().ok_or(DomainError::NotFound)
    }

    /// All keys of a SKU in FIFO (creation) order. Admin listing surface.
    pub fn license_keys_for_sku(&self, sku_id: SkuId) -> DomainResult<Vec<LicenseKey>> {
        let pool = self.pool(sku_id)?;
        let state = pool.state.lock().map_err(|_| DomainError::conflict(POISONED))?;
        let mut keys: Vec<LicenseKey> = state.keys.values().cloned().collect();
        keys.sort_by_key(|k| k.fifo_key());
        Ok(keys)
    }

    /// Consistent per-SKU status snapshot.
    pub fn count_by_status(&self, sku_id: SkuId) -> DomainResult<StatusCounts> {
        let pool = self.pool(sku_id)?;
        let state = pool.state.lock().map_err(|_| DomainError::conflict(POISONED))?;
        let mut counts = StatusCounts::default();
        for key in state.keys.values() {
            counts.bump(key.status());
        }
        Ok(counts)
    }

    // ---- allocator-facing primitives ----

    /// Snapshot the claimable keys of a SKU in FIFO order.
    ///
    /// Expired holds are lazily released first. Keys reserved by `for_order`
    /// count as claimable for that order (its own holds convert on claim).
    /// Returns the pool version the snapshot was taken at; `claim`/`reserve`
    /// commit against it.
    pub fn available_snapshot(
        &self,
        sku_id: SkuId,
        for_order: Option<OrderId>,
        now: DateTime<Utc>,
    ) -> DomainResult<(u64, Vec<LicenseKeyId>)> {
        let pool = self.pool(sku_id)?;
        let mut state = pool.state.lock().map_err(|_| DomainError::conflict(POISONED))?;
        let expired = state.expire_overdue(now);
        if expired > 0 {
            debug!(sku_id = %sku_id, expired, "released expired holds during snapshot");
        }

        let mut candidates: Vec<&LicenseKey> = state
            .keys
            .values()
            .filter(|k| match k.status() {
                LicenseStatus::Available => true,
                LicenseStatus::Reserved => {
                    for_order.is_some() && k.hold().map(|h| h.order_id) == for_order
                }
                _ => false,
            })
            .collect();
        candidates.sort_by_key(|k| k.fifo_key());

        let ids = candidates.iter().map(|k| k.id()).collect();
        Ok((state.version, ids))
    }

    /// Conditionally assign the named keys to an order.
    ///
    /// Commits only if the pool version still matches the snapshot and every
    /// named key is still `Available` (or reserved by this same order). The
    /// check-then-mutate happens in one critical section, so no rival
    /// allocation can observe or claim the same keys in between. Any
    /// mismatch fails `ConcurrencyConflict` with the pool untouched.
    pub fn claim(
        &self,
        sku_id: SkuId,
        expected_version: u64,
        key_ids: &[LicenseKeyId],
        order_id: OrderId,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let pool = self.pool(sku_id)?;
        let mut state = pool.state.lock().map_err(|_| DomainError::conflict(POISONED))?;
        if state.version != expected_version {
            return Err(DomainError::conflict(format!(
                "sku {sku_id} pool moved (expected version {expected_version}, found {})",
                state.version
            )));
        }

        for id in key_ids {
            let eligible = state.keys.get(id).is_some_and(|k| match k.status() {
                LicenseStatus::Available => true,
                LicenseStatus::Reserved => k.hold().map(|h| h.order_id) == Some(order_id),
                _ => false,
            });
            if !eligible {
                return Err(DomainError::conflict(format!(
                    "license key {id} no longer claimable for sku {sku_id}"
                )));
            }
        }

        for id in key_ids {
            if let Some(key) = state.keys.get_mut(id) {
                key.assign(order_id, now);
            }
        }
        state.version += 1;
        Ok(())
    }

    /// Conditionally place TTL holds on the named keys. Same optimistic
    /// protocol as `claim`, but only `Available` keys are eligible.
    pub fn reserve(
        &self,
        sku_id: SkuId,
        expected_version: u64,
        key_ids: &[LicenseKeyId],
        order_id: OrderId,
        expires_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let pool = self.pool(sku_id)?;
        let mut state = pool.state.lock().map_err(|_| DomainError::conflict(POISONED))?;
        if state.version != expected_version {
            return Err(DomainError::conflict(format!(
                "sku {sku_id} pool moved (expected version {expected_version}, found {})",
                state.version
            )));
        }

        for id in key_ids {
            let available = state
                .keys
                .get(id)
                .is_some_and(|k| k.status() == LicenseStatus::Available);
            if !available {
                return Err(DomainError::conflict(format!(
                    "license key {id} no longer available for sku {sku_id}"
                )));
            }
        }

        for id in key_ids {
            if let Some(key) = state.keys.get_mut(id) {
                key.reserve(order_id, expires_at);
            }
        }
        state.version += 1;
        Ok(())
    }

    /// Return every key the order holds (assigned or reserved) to
    /// `Available`. Idempotent: releasing an order with no holdings is a
    /// no-op. Revoked keys are never touched.
    pub fn release_for_order(&self, order_id: OrderId) -> DomainResult<usize> {
        let pools = self.pools.read().map_err(|_| DomainError::conflict(POISONED))?;
        let mut released = 0;
        for pool in pools.values() {
            let mut state = pool.state.lock().map_err(|_| DomainError::conflict(POISONED))?;
            let mut touched = 0;
            for key in state.keys.values_mut() {
                if key.is_held_by(order_id) {
                    key.release();
                    touched += 1;
                }
            }
            if touched > 0 {
                state.version += 1;
                released += touched;
            }
        }
        if released > 0 {
            debug!(order_id = %order_id, released, "released keys for order");
        }
        Ok(released)
    }

    /// Sweep all pools for expired holds. The lazy path in
    /// `available_snapshot` covers contended SKUs; this covers idle ones.
    pub fn expire_holds(&self, now: DateTime<Utc>) -> DomainResult<usize> {
        let pools = self.pools.read().map_err(|_| DomainError::conflict(POISONED))?;
        let mut released = 0;
        for pool in pools.values() {
            let mut state = pool.state.lock().map_err(|_| DomainError::conflict(POISONED))?;
            released += state.expire_overdue(now);
        }
        Ok(released)
    }
}


#[cfg(test)]
mod conservation_props {
    //! Property test: no operation sequence can make keys appear or vanish.

    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Add(u32),
        DeleteFirstIdle,
        ClaimOne,
        ReleaseAll,
        RevokeFirstAssigned,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..10_000).prop_map(Op::Add),
            Just(Op::DeleteFirstIdle),
            Just(Op::ClaimOne),
            Just(Op::ReleaseAll),
            Just(Op::RevokeFirstAssigned),
        ]
    }

    proptest! {
        #[test]
        fn status_buckets_always_sum_to_live_keys(ops in proptest::collection::vec(op_strategy(), 1..60)) {
            let store = CatalogStore::new();
            let product = store.create_product("P", 0.0).unwrap();
            let sku = store.create_sku(product, "S", 100, Validity::Lifetime).unwrap();
            let order = OrderId::new();

            let mut created = 0usize;
            let mut deleted = 0usize;
            let mut suffix = 0u64;

            for op in ops {
                match op {
                    Op::Add(n) => {
                        // Suffix keeps key strings unique even when n repeats.
                        suffix += 1;
                        if store.add_license_key(sku, &format!("K-{n}-{suffix}")).is_ok() {
                            created += 1;
                        }
                    }
                    Op::DeleteFirstIdle => {
                        let idle = store.license_keys_for_sku(sku).unwrap().into_iter().find(|k| {
                            matches!(k.status(), LicenseStatus::Available | LicenseStatus::Revoked)
                        });
                        if let Some(key) = idle {
                            store.delete_license_key(key.id()).unwrap();
                            deleted += 1;
                        }
                    }
                    Op::ClaimOne => {
                        let now = Utc::now();
                        let (version, ids) = store.available_snapshot(sku, None, now).unwrap();
                        if let Some(first) = ids.first() {
                            store.claim(sku, version, &[*first], order, now).unwrap();
                        }
                    }
                    Op::ReleaseAll => {
                        store.release_for_order(order).unwrap();
                    }
                    Op::RevokeFirstAssigned => {
                        let assigned = store
                            .license_keys_for_sku(sku)
                            .unwrap()
                            .into_iter()
                            .find(|k| k.status() == LicenseStatus::Assigned);
                        if let Some(key) = assigned {
                            store.revoke_license_key(key.id()).unwrap();
                        }
                    }
                }

                let counts = store.count_by_status(sku).unwrap();
                prop_assert_eq!(counts.total(), created - deleted);
            }
        }
    }
}
