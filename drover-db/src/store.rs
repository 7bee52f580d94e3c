//! The store itself: transactions, views, and change triggers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tracing::warn;

use crate::{Row, RowId, StoredRow, TableId};

type TableData = BTreeMap<RowId, StoredRow>;

struct TableShared {
    rows: Mutex<TableData>,
    watchers: Mutex<Vec<mpsc::Sender<()>>>,
}

struct Shared {
    next_row_id: AtomicU64,
    tables: [TableShared; TableId::ALL.len()],
}

/// Handle to the process-wide datastore. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Db {
    shared: Arc<Shared>,
}

impl Default for Db {
    fn default() -> Self {
        Self::new()
    }
}

impl Db {
    pub fn new() -> Db {
        Db {
            shared: Arc::new(Shared {
                next_row_id: AtomicU64::new(0),
                tables: std::array::from_fn(|_| TableShared {
                    rows: Mutex::new(BTreeMap::new()),
                    watchers: Mutex::new(Vec::new()),
                }),
            }),
        }
    }

    /// Acquire a cooperative transaction over the named tables. Locks are
    /// taken in canonical table order, so transactions over overlapping table
    /// sets cannot deadlock. Only one writing transaction may be active over
    /// any given table at a time.
    pub fn txn(&self, tables: &[TableId]) -> View<'_> {
        let mut guards = BTreeMap::new();
        for table in TableId::ALL {
            if tables.contains(&table) {
                guards.insert(table, self.shared.tables[table.index()].rows.lock());
            }
        }
        View {
            shared: &self.shared,
            guards,
            dirty: Vec::new(),
        }
    }

    /// Read rows of one table outside any transaction. The returned copies
    /// are a consistent snapshot of that table.
    pub fn select<R: Row>(&self, pred: impl FnMut(&R) -> bool) -> Vec<R> {
        self.txn(&[R::TABLE]).select_from(pred)
    }

    /// A change-notification channel over the named tables. Deliveries are
    /// coalesced: a slow reader observes at most one pending signal no matter
    /// how many mutations occurred.
    pub fn trigger(&self, tables: &[TableId]) -> Trigger {
        let (tx, rx) = mpsc::channel(1);
        for table in tables {
            self.shared.tables[table.index()]
                .watchers
                .lock()
                .push(tx.clone());
        }
        Trigger { rx }
    }

    /// As [`Db::trigger`], but also fires every `period` even absent changes.
    /// Requires a tokio runtime.
    pub fn trigger_tick(&self, period: Duration, tables: &[TableId]) -> Trigger {
        let mut changes = self.trigger(tables);
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    changed = changes.recv() => {
                        if changed.is_none() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
                if let Err(TrySendError::Closed(())) = tx.try_send(()) {
                    break;
                }
            }
        });
        Trigger { rx }
    }
}

/// A coalesced change-notification channel returned by [`Db::trigger`].
pub struct Trigger {
    rx: mpsc::Receiver<()>,
}

impl Trigger {
    /// Wait for the next change signal. Returns `None` once the datastore is
    /// gone.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Take a pending signal without waiting.
    pub fn try_recv(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

/// A transaction over a set of tables. Reads see a stable snapshot; commits
/// are atomic with respect to any other transaction. Triggers for mutated
/// tables fire when the view drops.
pub struct View<'db> {
    shared: &'db Shared,
    guards: BTreeMap<TableId, MutexGuard<'db, TableData>>,
    dirty: Vec<TableId>,
}

impl View<'_> {
    fn table<R: Row>(&self) -> &TableData {
        self.guards
            .get(&R::TABLE)
            .unwrap_or_else(|| panic!("table {} not covered by this transaction", R::TABLE))
    }

    fn table_mut<R: Row>(&mut self) -> &mut TableData {
        self.guards
            .get_mut(&R::TABLE)
            .unwrap_or_else(|| panic!("table {} not covered by this transaction", R::TABLE))
    }

    fn mark_dirty(&mut self, table: TableId) {
        if !self.dirty.contains(&table) {
            self.dirty.push(table);
        }
    }

    /// Scan a table, returning copies of the rows the predicate accepts.
    pub fn select_from<R: Row>(&self, mut pred: impl FnMut(&R) -> bool) -> Vec<R> {
        self.table::<R>()
            .values()
            .filter_map(|stored| stored.clone().try_into().ok())
            .filter(|row| pred(row))
            .collect()
    }

    /// Fetch one row by primary key.
    pub fn get<R: Row>(&self, id: RowId) -> Option<R> {
        self.table::<R>()
            .get(&id)
            .and_then(|stored| stored.clone().try_into().ok())
    }

    /// Allocate a fresh ID and insert an empty row, returning it for the
    /// caller to populate and commit.
    pub fn insert<R: Row + Default>(&mut self) -> R {
        let id = self.shared.next_row_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut row = R::default();
        row.set_id(id);
        self.table_mut::<R>().insert(id, row.clone().into());
        self.mark_dirty(R::TABLE);
        row
    }

    /// Update an existing row by primary key. A commit that changes nothing
    /// is a no-op and does not fire triggers.
    pub fn commit<R: Row>(&mut self, row: R) {
        let id = row.id();
        let stored: StoredRow = row.into();
        match self.table_mut::<R>().get_mut(&id) {
            Some(existing) if *existing == stored => {}
            Some(existing) => {
                *existing = stored;
                self.mark_dirty(R::TABLE);
            }
            None => {
                warn!(table = %R::TABLE, id, "commit of a row that no longer exists");
            }
        }
    }

    /// Delete a row by primary key.
    pub fn remove<R: Row>(&mut self, row: &R) {
        if self.table_mut::<R>().remove(&row.id()).is_some() {
            self.mark_dirty(R::TABLE);
        }
    }
}

impl Drop for View<'_> {
    fn drop(&mut self) {
        // Triggers fire after commit: watchers are notified while the row
        // locks are still held, but try_send never blocks and readers take
        // the table lock themselves before observing anything.
        for table in &self.dirty {
            self.shared.tables[table.index()]
                .watchers
                .lock()
                .retain(|tx| !matches!(tx.try_send(()), Err(TrySendError::Closed(()))));
        }
    }
}
