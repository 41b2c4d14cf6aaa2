use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use keymint_core::{LicenseKeyId, OrderId, SkuId};

/// License key lifecycle status.
///
/// Legal transitions:
/// `Available → Reserved → Assigned → Available` (release),
/// `Available → Assigned` (direct claim),
/// `Reserved → Available` (expiry/release),
/// `Assigned → Revoked` (admin, permanent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LicenseStatus {
    Available,
    Reserved,
    Assigned,
    Revoked,
}

/// Time-bounded hold placed on a `Reserved` key pending payment confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hold {
    pub order_id: OrderId,
    pub expires_at: DateTime<Utc>,
}

impl Hold {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Catalog record: a unique credential redeemable once, belonging to exactly
/// one SKU. The key string is trimmed on input, case-preserved, and unique
/// within its SKU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LicenseKey {
    id: LicenseKeyId,
    sku_id: SkuId,
    key: String,
    status: LicenseStatus,
    assigned_order_id: Option<OrderId>,
    hold: Option<Hold>,
    created_at: DateTime<Utc>,
    assigned_at: Option<DateTime<Utc>>,
    /// Pool-local insertion counter. Breaks `created_at` ties so FIFO
    /// selection stays deterministic even when keys share a timestamp.
    seq: u64,
}

impl LicenseKey {
    pub(crate) fn new(
        id: LicenseKeyId,
        sku_id: SkuId,
        key: String,
        created_at: DateTime<Utc>,
        seq: u64,
    ) -> Self {
        Self {
            id,
            sku_id,
            key,
            status: LicenseStatus::Available,
            assigned_order_id: None,
            hold: None,
            created_at,
            assigned_at: None,
            seq,
        }
    }

    pub fn id(&self) -> LicenseKeyId {
        self.id
    }

    pub fn sku_id(&self) -> SkuId {
        self.sku_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> LicenseStatus {
        self.status
    }

    pub fn assigned_order_id(&self) -> Option<OrderId> {
        self.assigned_order_id
    }

    pub fn hold(&self) -> Option<Hold> {
        self.hold
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn assigned_at(&self) -> Option<DateTime<Utc>> {
        self.assigned_at
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    /// FIFO sort key: creation time ascending, insertion order as tiebreak.
    pub(crate) fn fifo_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.seq)
    }

    pub(crate) fn set_key(&mut self, key: String) {
        self.key = key;
    }

    pub(crate) fn assign(&mut self, order_id: OrderId, now: DateTime<Utc>) {
        self.status = LicenseStatus::Assigned;
        self.assigned_order_id = Some(order_id);
        self.assigned_at = Some(now);
        self.hold = None;
    }

    pub(crate) fn reserve(&mut self, order_id: OrderId, expires_at: DateTime<Utc>) {
        self.status = LicenseStatus::Reserved;
        self.hold = Some(Hold {
            order_id,
            expires_at,
        });
    }

    pub(crate) fn release(&mut self) {
        self.status = LicenseStatus::Available;
        self.assigned_order_id = None;
        self.assigned_at = None;
        self.hold = None;
    }

    /// Permanent removal from circulation. The assignment record is kept for
    /// audit; the key never re-enters the pool.
    pub(crate) fn revoke(&mut self) {
        self.status = LicenseStatus::Revoked;
        self.hold = None;
    }

    /// Held by (assigned to or reserved for) the given order?
    pub fn is_held_by(&self, order_id: OrderId) -> bool {
        match self.status {
            LicenseStatus::Assigned => self.assigned_order_id == Some(order_id),
            LicenseStatus::Reserved => self.hold.map(|h| h.order_id) == Some(order_id),
            _ => false,
        }
    }
}

/// Per-SKU status bucket counts. Always read under the pool lock, so the
/// four buckets form a consistent snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub available: usize,
    pub reserved: usize,
    pub assigned: usize,
    pub revoked: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.available + self.reserved + self.assigned + self.revoked
    }

    pub(crate) fn bump(&mut self, status: LicenseStatus) {
        match status {
            LicenseStatus::Available => self.available += 1,
            LicenseStatus::Reserved => self.reserved += 1,
            LicenseStatus::Assigned => self.assigned += 1,
            LicenseStatus::Revoked => self.revoked += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key() -> LicenseKey {
        LicenseKey::new(
            LicenseKeyId::new(),
            SkuId::new(),
            "AAAA-BBBB".to_string(),
            Utc::now(),
            0,
        )
    }

    #[test]
    fn new_key_starts_available() {
        let k = key();
        assert_eq!(k.status(), LicenseStatus::Available);
        assert_eq!(k.assigned_order_id(), None);
        assert_eq!(k.hold(), None);
    }

    #[test]
    fn release_clears_assignment_fields() {
        let mut k = key();
        let order = OrderId::new();
        k.assign(order, Utc::now());
        assert!(k.is_held_by(order));

        k.release();
        assert_eq!(k.status(), LicenseStatus::Available);
        assert_eq!(k.assigned_order_id(), None);
        assert_eq!(k.assigned_at(), None);
    }

    #[test]
    fn revoke_keeps_assignment_for_audit() {
        let mut k = key();
        let order = OrderId::new();
        k.assign(order, Utc::now());
        k.revoke();
        assert_eq!(k.status(), LicenseStatus::Revoked);
        assert_eq!(k.assigned_order_id(), Some(order));
        assert!(!k.is_held_by(order));
    }

    #[test]
    fn hold_expiry_is_inclusive_of_deadline() {
        let now = Utc::now();
        let hold = Hold {
            order_id: OrderId::new(),
            expires_at: now,
        };
        assert!(hold.is_expired(now));
        assert!(!hold.is_expired(now - Duration::seconds(1)));
    }
}
