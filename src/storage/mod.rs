//! Mediated access to the embedded ordered key-value store. All reads go
//! through consistent snapshots and all writes through a single pessimistic
//! transaction, so a reader never observes a half-committed assertion.

use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DBRawIteratorWithThreadMode,
    Options, SnapshotWithThreadMode, Transaction, TransactionDB,
    TransactionDBOptions,
};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::common::{marshal_u256, unmarshal_u256, U256};
use crate::error::{Error, Result};

pub mod valuestore;

type Db = TransactionDB;

/// Column families of the store. Indexed columns use 32-byte big-endian
/// keys; the state column uses single-byte prefixed keys.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Column {
    Checkpoints,
    Logs,
    Sends,
    SequencerBatchItems,
    DelayedMessages,
    State,
    Sideload,
    Values,
    Code,
}

impl Column {
    pub const ALL: [Column; 9] = [
        Column::Checkpoints,
        Column::Logs,
        Column::Sends,
        Column::SequencerBatchItems,
        Column::DelayedMessages,
        Column::State,
        Column::Sideload,
        Column::Values,
        Column::Code,
    ];

    fn name(self) -> &'static str {
        match self {
            Column::Checkpoints => "checkpoints",
            Column::Logs => "logs",
            Column::Sends => "sends",
            Column::SequencerBatchItems => "messages-sequencer",
            Column::DelayedMessages => "messages-delayed",
            Column::State => "state",
            Column::Sideload => "sideload",
            Column::Values => "values",
            Column::Code => "code",
        }
    }
}

pub struct DataStorage {
    db: Db,
    path: PathBuf,
}

impl DataStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cfs = Column::ALL
            .iter()
            .map(|c| ColumnFamilyDescriptor::new(c.name(), Options::default()))
            .collect::<Vec<_>>();
        let db = Db::open_cf_descriptors(
            &opts,
            &TransactionDBOptions::default(),
            path.as_ref(),
            cfs,
        )?;
        Ok(Arc::new(Self {
            db,
            path: path.as_ref().to_path_buf(),
        }))
    }

    pub fn destroy(path: impl AsRef<Path>) -> Result<()> {
        rocksdb::DB::destroy(&Options::default(), path.as_ref())?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consistent point-in-time view for readers.
    pub fn begin_read(&self) -> ReadTransaction<'_> {
        ReadTransaction {
            snap: self.db.snapshot(),
            store: self,
        }
    }

    /// The single-writer transaction. Reads observe the transaction's own
    /// uncommitted writes, which the reference-counted value store relies
    /// on when one batch touches the same value twice.
    pub fn begin_write(&self) -> ReadWriteTransaction<'_> {
        ReadWriteTransaction {
            txn: self.db.transaction(),
            store: self,
        }
    }

    fn cf(&self, col: Column) -> &ColumnFamily {
        self.db
            .cf_handle(col.name())
            .expect("column family missing from opened database")
    }
}

/// Read interface shared by snapshot reads and the write transaction.
pub trait StoreRead {
    fn get(&self, col: Column, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn iter(&self, col: Column) -> RowIter<'_>;

    /// Point-read of a 32-byte big-endian counter; `NotFound` when absent.
    fn get_u256(&self, col: Column, key: &[u8]) -> Result<U256> {
        match self.get(col, key)? {
            Some(raw) if raw.len() == 32 => Ok(unmarshal_u256(&raw)),
            Some(_) => Err(Error::corrupt("bad counter width")),
            None => Err(Error::NotFound),
        }
    }
}

pub struct ReadTransaction<'a> {
    snap: SnapshotWithThreadMode<'a, Db>,
    store: &'a DataStorage,
}

impl<'a> StoreRead for ReadTransaction<'a> {
    fn get(&self, col: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.snap.get_cf(self.store.cf(col), key)?)
    }

    fn iter(&self, col: Column) -> RowIter<'_> {
        RowIter::Snap(self.snap.raw_iterator_cf(self.store.cf(col)))
    }
}

pub struct ReadWriteTransaction<'a> {
    txn: Transaction<'a, Db>,
    store: &'a DataStorage,
}

impl<'a> ReadWriteTransaction<'a> {
    pub fn put(&self, col: Column, key: &[u8], value: &[u8]) -> Result<()> {
        self.txn.put_cf(self.store.cf(col), key, value)?;
        Ok(())
    }

    pub fn put_u256(&self, col: Column, key: &[u8], val: &U256) -> Result<()> {
        self.put(col, key, &marshal_u256(val))
    }

    pub fn delete(&self, col: Column, key: &[u8]) -> Result<()> {
        self.txn.delete_cf(self.store.cf(col), key)?;
        Ok(())
    }

    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }
}

impl<'a> StoreRead for ReadWriteTransaction<'a> {
    fn get(&self, col: Column, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.txn.get_cf(self.store.cf(col), key)?)
    }

    fn iter(&self, col: Column) -> RowIter<'_> {
        RowIter::Txn(self.txn.raw_iterator_cf(self.store.cf(col)))
    }
}

/// Ordered iterator over one column, unifying snapshot and transactional
/// iteration so read helpers can serve both.
pub enum RowIter<'a> {
    Snap(DBRawIteratorWithThreadMode<'a, Db>),
    Txn(DBRawIteratorWithThreadMode<'a, Transaction<'a, Db>>),
}

macro_rules! delegate {
    ($self:ident, $it:ident => $body:expr) => {
        match $self {
            RowIter::Snap($it) => $body,
            RowIter::Txn($it) => $body,
        }
    };
}

impl<'a> RowIter<'a> {
    pub fn seek(&mut self, key: &[u8]) {
        delegate!(self, it => it.seek(key))
    }

    pub fn seek_for_prev(&mut self, key: &[u8]) {
        delegate!(self, it => it.seek_for_prev(key))
    }

    pub fn seek_to_last(&mut self) {
        delegate!(self, it => it.seek_to_last())
    }

    pub fn valid(&self) -> bool {
        delegate!(self, it => it.valid())
    }

    pub fn key(&self) -> Option<&[u8]> {
        delegate!(self, it => it.key())
    }

    pub fn value(&self) -> Option<&[u8]> {
        delegate!(self, it => it.value())
    }

    pub fn next(&mut self) {
        delegate!(self, it => it.next())
    }

    pub fn prev(&mut self) {
        delegate!(self, it => it.prev())
    }

    pub fn status(&self) -> Result<()> {
        delegate!(self, it => it.status().map_err(Error::from))
    }
}
