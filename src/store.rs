// ===============================
// src/store.rs (transactional in-memory tables)
// ===============================
//
// Satu lock untuk semua tabel, tapi lock hanya dipegang sebentar:
// - Tx membaca baris yang sudah commit dan mencatat versinya (read set).
// - Tulis di-stage lokal di Tx (read-your-writes).
// - commit(): lock, validasi read set, terapkan semua tulisan, naikkan versi.
//   Kalau ada versi yang berubah -> Conflict, tidak ada yang ditulis.
//
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap as HashMap;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::domain::{
    Cart, CartId, Holding, InventoryRecord, OwnerId, PricePoint, RedemptionId,
    RedemptionRequest, Transaction,
};
use crate::error::{LedgerError, SnapshotError, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RowKey {
    Inventory,
    Price,
    Holding(OwnerId),
    OwnerCart(OwnerId),
    Cart(CartId),
    Redemption(RedemptionId),
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Inventory => write!(f, "inventory"),
            RowKey::Price => write!(f, "price"),
            RowKey::Holding(o) => write!(f, "holding:{o}"),
            RowKey::OwnerCart(o) => write!(f, "owner_cart:{o}"),
            RowKey::Cart(id) => write!(f, "cart:{id}"),
            RowKey::Redemption(id) => write!(f, "redemption:{id}"),
        }
    }
}

/// Committed state. Also the on-disk snapshot shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    /// Ascending by `set_at`.
    pub price_history: Vec<PricePoint>,
    pub current_price: Option<PricePoint>,
    pub inventory: Option<InventoryRecord>,
    pub holdings: BTreeMap<OwnerId, Holding>,
    pub carts: BTreeMap<CartId, Cart>,
    /// Derived from `carts`, rebuilt on load.
    #[serde(skip)]
    pub pending_carts: BTreeMap<OwnerId, CartId>,
    pub transactions: Vec<Transaction>,
    pub redemptions: BTreeMap<RedemptionId, RedemptionRequest>,
}

impl Tables {
    fn rebuild_indexes(&mut self) {
        self.pending_carts = self
            .carts
            .values()
            .filter(|c| !c.status.is_terminal())
            .map(|c| (c.owner_id.clone(), c.id))
            .collect();
    }

    pub fn price_for_day(&self, day: NaiveDate) -> Option<&PricePoint> {
        self.price_history.iter().rev().find(|p| p.day == day)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub next_id: u64,
    pub tables: Tables,
}

impl Snapshot {
    /// Write to `path` via a temp file + rename so a crash never leaves half a file.
    pub async fn save_to_file(&self, path: &Path) -> Result<(), SnapshotError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, path).await?;
        debug!(?path, "snapshot saved");
        Ok(())
    }

    pub async fn load_from_file(path: &Path) -> Result<Self, SnapshotError> {
        if !fs::try_exists(path).await? {
            info!(?path, "snapshot not found, starting empty");
            return Ok(Self::default());
        }
        let raw = fs::read(path).await?;
        let snap: Self = serde_json::from_slice(&raw)?;
        info!(
            ?path,
            holdings = snap.tables.holdings.len(),
            transactions = snap.tables.transactions.len(),
            "snapshot loaded"
        );
        Ok(snap)
    }
}

struct Inner {
    tables: Tables,
    versions: HashMap<RowKey, u64>,
}

impl Inner {
    fn version(&self, key: &RowKey) -> u64 { self.versions.get(key).copied().unwrap_or(0) }

    fn bump(&mut self, key: RowKey) { *self.versions.entry(key).or_insert(0) += 1; }
}

pub struct Store {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Default for Store {
    fn default() -> Self { Self::new() }
}

impl Store {
    pub fn new() -> Self { Self::from_snapshot(Snapshot::default()) }

    pub fn from_snapshot(snap: Snapshot) -> Self {
        let mut tables = snap.tables;
        tables.rebuild_indexes();
        Self {
            inner: Mutex::new(Inner { tables, versions: HashMap::new() }),
            next_id: AtomicU64::new(snap.next_id.max(1)),
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Snapshot {
        let inner = self.inner.lock();
        Snapshot {
            taken_at: Some(now),
            next_id: self.next_id.load(Ordering::SeqCst),
            tables: inner.tables.clone(),
        }
    }

    /// Consistent read-only view of committed state.
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let inner = self.inner.lock();
        f(&inner.tables)
    }

    pub fn begin(&self) -> Tx<'_> {
        Tx {
            store: self,
            reads: HashMap::new(),
            price: None,
            inventory: None,
            holdings: HashMap::new(),
            carts: HashMap::new(),
            pending: HashMap::new(),
            transactions: Vec::new(),
            redemptions: HashMap::new(),
        }
    }

    /// Validate the read set and apply every staged write, or nothing.
    pub fn commit(&self, tx: Tx<'_>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        for (key, seen) in &tx.reads {
            if inner.version(key) != *seen {
                return Err(StoreError::Conflict { key: key.to_string() });
            }
        }

        if let Some(point) = tx.price {
            inner.tables.price_history.push(point.clone());
            inner.tables.current_price = Some(point);
            inner.bump(RowKey::Price);
        }
        if let Some(rec) = tx.inventory {
            inner.tables.inventory = Some(rec);
            inner.bump(RowKey::Inventory);
        }
        for (owner, h) in tx.holdings {
            inner.tables.holdings.insert(owner.clone(), h);
            inner.bump(RowKey::Holding(owner));
        }
        for (id, cart) in tx.carts {
            inner.tables.carts.insert(id, cart);
            inner.bump(RowKey::Cart(id));
        }
        for (owner, slot) in tx.pending {
            match slot {
                Some(id) => { inner.tables.pending_carts.insert(owner.clone(), id); }
                None => { inner.tables.pending_carts.remove(&owner); }
            }
            inner.bump(RowKey::OwnerCart(owner));
        }
        inner.tables.transactions.extend(tx.transactions);
        for (id, r) in tx.redemptions {
            inner.tables.redemptions.insert(id, r);
            inner.bump(RowKey::Redemption(id));
        }
        Ok(())
    }

    /// Run `f` in a fresh transaction, retrying on conflict up to `max_attempts`.
    /// Errors returned by `f` abort without retry.
    pub fn transact<T>(
        &self,
        max_attempts: u32,
        mut f: impl FnMut(&mut Tx<'_>) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            let mut tx = self.begin();
            let out = f(&mut tx)?;
            match self.commit(tx) {
                Ok(()) => return Ok(out),
                Err(StoreError::Conflict { key }) => {
                    debug!(%key, attempt, "store: conflict, retrying");
                }
            }
        }
        Err(LedgerError::CommitAborted { attempts })
    }
}

/// Staged unit of work against a `Store`. Dropping it discards every write.
pub struct Tx<'a> {
    store: &'a Store,
    reads: HashMap<RowKey, u64>,
    price: Option<PricePoint>,
    inventory: Option<InventoryRecord>,
    holdings: HashMap<OwnerId, Holding>,
    carts: HashMap<CartId, Cart>,
    pending: HashMap<OwnerId, Option<CartId>>,
    transactions: Vec<Transaction>,
    redemptions: HashMap<RedemptionId, RedemptionRequest>,
}

impl<'a> Tx<'a> {
    fn observe<T>(&mut self, key: RowKey, f: impl FnOnce(&Tables) -> T) -> T {
        let store = self.store;
        let inner = store.inner.lock();
        let v = inner.version(&key);
        self.reads.entry(key).or_insert(v);
        f(&inner.tables)
    }

    /// Ids are never reused, even when the transaction is dropped.
    pub fn next_id(&self) -> u64 { self.store.next_id.fetch_add(1, Ordering::SeqCst) }

    // ---- price ----

    pub fn current_price(&mut self) -> Option<PricePoint> {
        if let Some(p) = &self.price {
            return Some(p.clone());
        }
        self.observe(RowKey::Price, |t| t.current_price.clone())
    }

    pub fn price_for_day(&mut self, day: NaiveDate) -> Option<PricePoint> {
        if let Some(p) = self.price.as_ref().filter(|p| p.day == day) {
            return Some(p.clone());
        }
        self.observe(RowKey::Price, |t| t.price_for_day(day).cloned())
    }

    pub fn push_price(&mut self, point: PricePoint) { self.price = Some(point); }

    // ---- inventory ----

    pub fn inventory(&mut self) -> Option<InventoryRecord> {
        if let Some(rec) = &self.inventory {
            return Some(rec.clone());
        }
        self.observe(RowKey::Inventory, |t| t.inventory.clone())
    }

    pub fn put_inventory(&mut self, rec: InventoryRecord) { self.inventory = Some(rec); }

    // ---- holdings ----

    pub fn holding(&mut self, owner: &str) -> Option<Holding> {
        if let Some(h) = self.holdings.get(owner) {
            return Some(h.clone());
        }
        self.observe(RowKey::Holding(owner.to_string()), |t| t.holdings.get(owner).cloned())
    }

    pub fn put_holding(&mut self, h: Holding) { self.holdings.insert(h.owner_id.clone(), h); }

    // ---- carts ----

    fn pending_id(&mut self, owner: &str) -> Option<CartId> {
        if let Some(slot) = self.pending.get(owner) {
            return *slot;
        }
        self.observe(RowKey::OwnerCart(owner.to_string()), |t| t.pending_carts.get(owner).copied())
    }

    pub fn cart(&mut self, id: CartId) -> Option<Cart> {
        if let Some(c) = self.carts.get(&id) {
            return Some(c.clone());
        }
        self.observe(RowKey::Cart(id), |t| t.carts.get(&id).cloned())
    }

    pub fn pending_cart(&mut self, owner: &str) -> Option<Cart> {
        let id = self.pending_id(owner)?;
        self.cart(id)
    }

    /// Stage a cart row and keep the owner's pending slot in step with its status.
    pub fn put_cart(&mut self, cart: Cart) {
        let current = self.pending_id(&cart.owner_id);
        if !cart.status.is_terminal() {
            self.pending.insert(cart.owner_id.clone(), Some(cart.id));
        } else if current == Some(cart.id) {
            self.pending.insert(cart.owner_id.clone(), None);
        }
        self.carts.insert(cart.id, cart);
    }

    /// Pending carts whose TTL has run out, across all owners.
    pub fn overdue_carts(&mut self, now: DateTime<Utc>) -> Vec<Cart> {
        let owners: Vec<OwnerId> = self.store.read(|t| t.pending_carts.keys().cloned().collect());
        owners
            .iter()
            .filter_map(|o| self.pending_cart(o))
            .filter(|c| c.is_overdue(now))
            .collect()
    }

    // ---- transactions ----

    pub fn append_transaction(&mut self, t: Transaction) { self.transactions.push(t); }

    // ---- redemptions ----

    pub fn redemption(&mut self, id: RedemptionId) -> Option<RedemptionRequest> {
        if let Some(r) = self.redemptions.get(&id) {
            return Some(r.clone());
        }
        self.observe(RowKey::Redemption(id), |t| t.redemptions.get(&id).cloned())
    }

    pub fn put_redemption(&mut self, r: RedemptionRequest) { self.redemptions.insert(r.id, r); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record(g: rust_decimal::Decimal) -> InventoryRecord {
        InventoryRecord { available_grams: g, updated_at: Utc::now() }
    }

    #[test]
    fn stale_read_set_conflicts_and_writes_nothing() {
        let store = Store::new();
        store.transact(1, |tx| { tx.put_inventory(record(dec!(100))); Ok(()) }).unwrap();

        let mut slow = store.begin();
        let seen = slow.inventory().unwrap();
        slow.put_inventory(record(seen.available_grams - dec!(60)));
        slow.put_holding(Holding::empty("alice"));

        let mut fast = store.begin();
        let seen = fast.inventory().unwrap();
        fast.put_inventory(record(seen.available_grams - dec!(50)));
        store.commit(fast).unwrap();

        let err = store.commit(slow).unwrap_err();
        assert_eq!(err, StoreError::Conflict { key: "inventory".into() });
        store.read(|t| {
            assert_eq!(t.inventory.as_ref().unwrap().available_grams, dec!(50));
            assert!(t.holdings.is_empty());
        });
    }

    #[test]
    fn rival_write_on_every_attempt_exhausts_retries() {
        let store = Store::new();
        store.transact(1, |tx| { tx.put_inventory(record(dec!(10))); Ok(()) }).unwrap();

        let mut calls = 0;
        let res = store.transact(4, |tx| {
            calls += 1;
            let seen = tx.inventory().unwrap_or_else(|| record(dec!(0)));
            tx.put_inventory(record(seen.available_grams - dec!(1)));
            tx.put_holding(Holding::empty("alice"));

            let mut rival = store.begin();
            let cur = rival.inventory().unwrap_or_else(|| record(dec!(0)));
            rival.put_inventory(record(cur.available_grams + dec!(100)));
            store.commit(rival)?;
            Ok(())
        });

        assert_eq!(res, Err(LedgerError::CommitAborted { attempts: 4 }));
        assert_eq!(calls, 4);
        store.read(|t| {
            assert_eq!(t.inventory.as_ref().unwrap().available_grams, dec!(410));
            assert!(t.holdings.is_empty());
        });
    }

    #[test]
    fn dropped_tx_leaves_no_trace() {
        let store = Store::new();
        {
            let mut tx = store.begin();
            tx.put_inventory(record(dec!(5)));
        }
        assert!(store.read(|t| t.inventory.is_none()));
    }

    #[test]
    fn tx_reads_its_own_writes() {
        let store = Store::new();
        let mut tx = store.begin();
        tx.put_inventory(record(dec!(7)));
        assert_eq!(tx.inventory().unwrap().available_grams, dec!(7));
    }

    #[tokio::test]
    async fn snapshot_survives_a_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = Store::new();
        store.transact(1, |tx| { tx.put_inventory(record(dec!(12.5))); Ok(()) }).unwrap();
        let _ = store.begin().next_id();

        store.snapshot(Utc::now()).save_to_file(&path).await.unwrap();
        let restored = Store::from_snapshot(Snapshot::load_from_file(&path).await.unwrap());

        assert_eq!(restored.read(|t| t.inventory.clone()), store.read(|t| t.inventory.clone()));
        assert!(restored.begin().next_id() >= 2);
    }

    #[tokio::test]
    async fn missing_snapshot_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let snap = Snapshot::load_from_file(&dir.path().join("nope.json")).await.unwrap();
        assert!(snap.tables.inventory.is_none());
    }
}
