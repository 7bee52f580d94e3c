//! The in-memory transactional datastore all of drover's control loops
//! synchronize through.
//!
//! Every core entity lives as a row in a named table. Rows are value-like:
//! reads hand out copies, and mutation happens by committing a modified copy
//! inside a transaction. A transaction holds per-table exclusive locks for
//! its duration, so observers see either the full effect of a transaction or
//! none of it. The store makes no durability guarantee; everything in it is
//! recoverable from live polling.

use std::fmt;

pub mod join;
mod rows;
mod store;

pub use join::{join, Join};
pub use rows::{
    Acl, BlueprintRow, Connection, Container, Etcd, Machine, MachineStatus, MinionSelf,
};
pub use store::{Db, Trigger, View};

/// Monotonically increasing primary key, assigned on insert and never reused.
pub type RowId = u64;

/// The tables the datastore holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
pub enum TableId {
    Blueprint,
    Machine,
    Container,
    Connection,
    Acl,
    Etcd,
    MinionSelf,
}

impl TableId {
    pub const ALL: [TableId; 7] = [
        TableId::Blueprint,
        TableId::Machine,
        TableId::Container,
        TableId::Connection,
        TableId::Acl,
        TableId::Etcd,
        TableId::MinionSelf,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            TableId::Blueprint => 0,
            TableId::Machine => 1,
            TableId::Container => 2,
            TableId::Connection => 3,
            TableId::Acl => 4,
            TableId::Etcd => 5,
            TableId::MinionSelf => 6,
        }
    }
}

/// Union of every row type the store can hold. Exists so the table storage
/// can be uniform; callers only ever see the concrete row types.
#[derive(Clone, Debug, PartialEq, derive_more::From, derive_more::TryInto)]
#[try_into(owned)]
pub enum StoredRow {
    Machine(Machine),
    Container(Container),
    Blueprint(BlueprintRow),
    Connection(Connection),
    Acl(Acl),
    Etcd(Etcd),
    MinionSelf(MinionSelf),
}

/// A typed row belonging to one table.
pub trait Row:
    Clone + fmt::Debug + PartialEq + Send + Into<StoredRow> + TryFrom<StoredRow> + 'static
{
    const TABLE: TableId;

    fn id(&self) -> RowId;
    fn set_id(&mut self, id: RowId);
}

macro_rules! impl_row {
    ($row:ty, $table:expr) => {
        impl Row for $row {
            const TABLE: TableId = $table;

            fn id(&self) -> RowId {
                self.id
            }

            fn set_id(&mut self, id: RowId) {
                self.id = id;
            }
        }
    };
}

impl_row!(Machine, TableId::Machine);
impl_row!(Container, TableId::Container);
impl_row!(BlueprintRow, TableId::Blueprint);
impl_row!(Connection, TableId::Connection);
impl_row!(Acl, TableId::Acl);
impl_row!(Etcd, TableId::Etcd);
impl_row!(MinionSelf, TableId::MinionSelf);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_indices_are_dense_and_ordered() {
        for (i, table) in TableId::ALL.iter().enumerate() {
            assert_eq!(table.index(), i);
        }
    }
}
