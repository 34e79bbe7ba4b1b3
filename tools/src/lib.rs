//! Scaffolding for driving the qavm engine in tests and demos: a scripted
//! reference [Interpreter](qavm::machine::Interpreter) whose programs are
//! carried by the inbox messages themselves, plus database helpers.

use std::path::PathBuf;
use std::sync::Arc;

use qavm::common::Bytes;
use qavm::storage::DataStorage;

mod interp;

pub use interp::{
    script_executable, ScriptInterp, GAS_PER_OP, OP_BLOCK, OP_HALT, OP_LOG,
    OP_SEND,
};

/// Build a script message: an 8-byte big-endian block number followed by
/// one byte per op (see the `OP_*` constants).
pub fn script_message(block: u64, ops: &str) -> Bytes {
    let mut raw = block.to_be_bytes().to_vec();
    raw.extend_from_slice(ops.as_bytes());
    raw.into()
}

/// A rocksdb instance under a unique temp path, wiped before opening.
/// Paths are stable per test name so a crashed run is cleaned on retry.
pub struct TestDb {
    pub storage: Arc<DataStorage>,
    path: PathBuf,
}

impl TestDb {
    pub fn open(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!("qavm-test-{}", name));
        let _ = std::fs::remove_dir_all(&path);
        let storage = DataStorage::open(&path).expect("open test db");
        Self { storage, path }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}
