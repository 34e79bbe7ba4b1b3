//! The execution core: a single long-running executor thread that drives
//! the live machine over the inbox, persists assertions and checkpoints,
//! rewinds through reorgs, and serves concurrent readers (logs cursors,
//! execution cursors, sideload lookups) from storage snapshots.

use log::error;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use parking_lot::{Mutex, RwLock};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

mod cursor;
mod exec;
mod logscursor;
mod reorg;

pub use cursor::ExecutionCursor;
pub use logscursor::LogsCursorLogs;

use crate::checkpoint;
use crate::common::{marshal_u256, Bytes, Hash, U256};
use crate::error::{Error, Result};
use crate::machine::{
    Code, CodePointRef, Interpreter, Machine, MachineOutput, MachineState,
    MachineThread, Op,
};
use crate::messages::{self, InboxItem};
use crate::storage::valuestore;
use crate::storage::{Column, DataStorage, ReadWriteTransaction, StoreRead};
use crate::value::{Value, ValueCache};
use logscursor::LogsCursor;

pub(crate) const LOG_INSERTED_KEY: [u8; 1] = [0xC4];
pub(crate) const LOG_PROCESSED_KEY: [u8; 1] = [0xC3];
pub(crate) const SEND_INSERTED_KEY: [u8; 1] = [0xC2];
pub(crate) const SEND_PROCESSED_KEY: [u8; 1] = [0xC1];
pub(crate) const MESSAGE_ENTRY_INSERTED_KEY: [u8; 1] = [0xC0];
pub(crate) const LOGSCURSOR_CURRENT_PREFIX: u8 = 0xBE;

/// Sideload cache window in blocks; at most this many behind the tip.
pub(crate) const SIDELOAD_CACHE_SIZE: u64 = 20;

/// State of the single-slot inbox mailbox. The feeder moves Empty to
/// Ready; the executor moves Ready to one of the terminal states; reading
/// a terminal state resets the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum MessageStatus {
    Empty = 0,
    Ready = 1,
    Success = 2,
    NeedOlder = 3,
    Error = 4,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct MessageData {
    pub items: Vec<InboxItem>,
    pub previous_inbox_acc: Hash,
    pub last_block_complete: bool,
    pub reorg_message_count: Option<U256>,
}

/// The program the machine boots from: the initial code segment plus the
/// static value handed to it.
pub struct LoadedExecutable {
    pub ops: Vec<Op>,
    pub static_val: Value,
}

pub struct Core {
    pub(crate) storage: Arc<DataStorage>,
    pub(crate) interp: Arc<dyn Interpreter>,
    pub(crate) code: Arc<Code>,

    core_thread: Mutex<Option<JoinHandle<()>>>,
    pub(crate) abort_flag: AtomicBool,

    /// Serializes checkpoint deletion and log truncation against readers
    /// resolving "closest checkpoint" for cursors.
    pub(crate) reorg_mutex: Mutex<()>,
    pub(crate) machine: Mutex<Option<MachineThread>>,

    pub(crate) message_status: AtomicU8,
    pub(crate) message_data: Mutex<MessageData>,
    pub(crate) core_error_string: Mutex<String>,

    pub(crate) machine_idle: AtomicBool,
    pub(crate) machine_error: AtomicBool,
    pub(crate) machine_error_string: Mutex<String>,

    pub(crate) logs_cursors: Vec<LogsCursor>,
    pub(crate) last_machine_output: RwLock<MachineOutput>,
    pub(crate) sideload_cache: RwLock<BTreeMap<U256, Machine>>,

    pub(crate) save_checkpoint_flag: AtomicBool,
    pub(crate) save_checkpoint_error: Mutex<Option<String>>,
}

impl Core {
    pub fn new(
        storage: Arc<DataStorage>, interp: Arc<dyn Interpreter>,
        logs_cursor_count: usize,
    ) -> Result<Arc<Self>> {
        assert!(logs_cursor_count <= 256, "too many logs cursors");
        let next_segment = {
            let tx = storage.begin_read();
            valuestore::next_segment_id(&tx)?
        };
        let code = Arc::new(Code::new(next_segment));
        let logs_cursors =
            (0..logs_cursor_count).map(LogsCursor::new).collect();
        Ok(Arc::new(Self {
            storage,
            interp,
            code,
            core_thread: Mutex::new(None),
            abort_flag: AtomicBool::new(false),
            reorg_mutex: Mutex::new(()),
            machine: Mutex::new(None),
            message_status: AtomicU8::new(MessageStatus::Empty as u8),
            message_data: Mutex::new(MessageData::default()),
            core_error_string: Mutex::new(String::new()),
            machine_idle: AtomicBool::new(false),
            machine_error: AtomicBool::new(false),
            machine_error_string: Mutex::new(String::new()),
            logs_cursors,
            last_machine_output: RwLock::new(MachineOutput::default()),
            sideload_cache: RwLock::new(BTreeMap::new()),
            save_checkpoint_flag: AtomicBool::new(false),
            save_checkpoint_error: Mutex::new(None),
        }))
    }

    /// Reload the latest valid checkpoint, or bootstrap a fresh database
    /// from the executable: genesis checkpoint at gas zero plus zeroed
    /// counters.
    pub fn initialize(&self, executable: LoadedExecutable) -> Result<()> {
        let mut cache = ValueCache::new(1, 0);
        match self.reorg_to_message_or_before(None, true, &mut cache) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                error!("error with initial reorg: {}", e);
                return Err(e)
            }
        }

        let segment = self.code.add_segment(executable.ops);
        let mut state =
            MachineState::new(self.code.clone(), executable.static_val);
        state.pc = CodePointRef {
            segment: segment.id,
            offset: 0,
        };
        state.err_pc = state.pc;
        let machine = Machine::new(state, self.interp.clone());

        let tx = self.storage.begin_write();
        valuestore::save_code_segment(&tx, &segment)?;
        checkpoint::save_checkpoint(&tx, &machine.machine_state)?;
        Self::update_log_inserted_count(&tx, &U256::zero())?;
        Self::update_send_inserted_count(&tx, &U256::zero())?;
        Self::update_message_entry_inserted_count(&tx, &U256::zero())?;
        for i in 0..self.logs_cursors.len() {
            self.logs_cursor_save_current_total_count(&tx, i, &U256::zero())?;
        }
        tx.commit()?;

        *self.last_machine_output.write() =
            machine.machine_state.output.clone();
        *self.machine.lock() = Some(MachineThread::new(machine));
        Ok(())
    }

    pub fn storage(&self) -> &Arc<DataStorage> {
        &self.storage
    }

    /// Whether the database carries the genesis checkpoint.
    pub fn initialized(&self) -> bool {
        let tx = self.storage.begin_read();
        checkpoint::get_checkpoint(&tx, &U256::zero()).is_ok()
    }

    // Thread interaction

    pub fn start_thread(self: &Arc<Self>) -> bool {
        self.abort_thread();
        let this = self.clone();
        *self.core_thread.lock() =
            Some(std::thread::spawn(move || this.run_loop()));
        true
    }

    pub fn abort_thread(&self) {
        let handle = self.core_thread.lock().take();
        if let Some(handle) = handle {
            self.abort_flag.store(true, Ordering::SeqCst);
            let _ = handle.join();
        }
        self.abort_flag.store(false, Ordering::SeqCst);
    }

    pub fn thread_running(&self) -> bool {
        self.core_thread.lock().is_some()
    }

    // Mailbox

    /// Hand a batch to the executor. Returns false while the slot is
    /// occupied; the feeder retries after polling [Core::messages_status].
    pub fn deliver_messages(
        &self, items: Vec<InboxItem>, previous_inbox_acc: Hash,
        last_block_complete: bool, reorg_message_count: Option<U256>,
    ) -> bool {
        if self.message_status.load(Ordering::SeqCst) !=
            MessageStatus::Empty as u8
        {
            return false
        }
        *self.message_data.lock() = MessageData {
            items,
            previous_inbox_acc,
            last_block_complete,
            reorg_message_count,
        };
        self.message_status
            .store(MessageStatus::Ready as u8, Ordering::SeqCst);
        true
    }

    /// Read the mailbox outcome. Terminal success states reset the slot so
    /// the feeder can deliver again.
    pub fn messages_status(&self) -> MessageStatus {
        let current =
            MessageStatus::from_u8(self.message_status.load(Ordering::SeqCst))
                .expect("invalid message status");
        if current != MessageStatus::Error && current != MessageStatus::Ready {
            self.message_status
                .store(MessageStatus::Empty as u8, Ordering::SeqCst);
        }
        current
    }

    pub fn messages_clear_error(&self) -> String {
        let current =
            MessageStatus::from_u8(self.message_status.load(Ordering::SeqCst))
                .expect("invalid message status");
        if current != MessageStatus::Error &&
            current != MessageStatus::NeedOlder
        {
            return String::new()
        }
        self.message_status
            .store(MessageStatus::Empty as u8, Ordering::SeqCst);
        std::mem::take(&mut *self.core_error_string.lock())
    }

    // Machine state

    pub fn machine_idle(&self) -> bool {
        self.machine_idle.load(Ordering::SeqCst)
    }

    pub fn machine_messages_read(&self) -> U256 {
        self.last_machine_output
            .read()
            .fully_processed_inbox
            .count
    }

    pub fn machine_clear_error(&self) -> Option<String> {
        if !self.machine_error.load(Ordering::SeqCst) {
            return None
        }
        self.machine_error.store(false, Ordering::SeqCst);
        Some(std::mem::take(&mut *self.machine_error_string.lock()))
    }

    /// Test hook: ask the executor to persist a checkpoint now and wait
    /// for it.
    pub fn trigger_save_checkpoint(&self) -> Result<()> {
        self.save_checkpoint_error.lock().take();
        self.save_checkpoint_flag.store(true, Ordering::SeqCst);
        while self.save_checkpoint_flag.load(Ordering::SeqCst) {
            if !self.thread_running() {
                return Err(Error::corrupt("core thread not running"))
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        match self.save_checkpoint_error.lock().take() {
            Some(msg) => Err(Error::Corruption(msg)),
            None => Ok(()),
        }
    }

    pub fn max_checkpoint_gas(&self) -> Result<U256> {
        let tx = self.storage.begin_read();
        checkpoint::max_checkpoint_gas(&tx)
    }

    pub fn is_checkpoints_empty(&self) -> Result<bool> {
        let tx = self.storage.begin_read();
        checkpoint::is_checkpoints_empty(&tx)
    }

    /// Rematerialize a plain machine from the checkpoint at exactly `gas`.
    pub fn get_machine_at(
        &self, gas: &U256, cache: &mut ValueCache,
    ) -> Result<Machine> {
        let tx = self.storage.begin_read();
        let keys = checkpoint::get_checkpoint(&tx, gas)?;
        checkpoint::materialize(
            &tx,
            &keys,
            &self.code,
            self.interp.clone(),
            cache,
        )
    }

    // Counters

    pub fn log_inserted_count(&self) -> Result<U256> {
        let tx = self.storage.begin_read();
        Self::log_inserted_count_impl(&tx)
    }

    pub(crate) fn log_inserted_count_impl(
        tx: &impl StoreRead,
    ) -> Result<U256> {
        tx.get_u256(Column::State, &LOG_INSERTED_KEY)
    }

    pub(crate) fn update_log_inserted_count(
        tx: &ReadWriteTransaction, count: &U256,
    ) -> Result<()> {
        tx.put_u256(Column::State, &LOG_INSERTED_KEY, count)
    }

    pub fn send_inserted_count(&self) -> Result<U256> {
        let tx = self.storage.begin_read();
        Self::send_inserted_count_impl(&tx)
    }

    pub(crate) fn send_inserted_count_impl(
        tx: &impl StoreRead,
    ) -> Result<U256> {
        tx.get_u256(Column::State, &SEND_INSERTED_KEY)
    }

    pub(crate) fn update_send_inserted_count(
        tx: &ReadWriteTransaction, count: &U256,
    ) -> Result<()> {
        tx.put_u256(Column::State, &SEND_INSERTED_KEY, count)
    }

    pub fn message_entry_inserted_count(&self) -> Result<U256> {
        let tx = self.storage.begin_read();
        tx.get_u256(Column::State, &MESSAGE_ENTRY_INSERTED_KEY)
    }

    pub(crate) fn update_message_entry_inserted_count(
        tx: &ReadWriteTransaction, count: &U256,
    ) -> Result<()> {
        tx.put_u256(Column::State, &MESSAGE_ENTRY_INSERTED_KEY, count)
    }

    /// Consumption progress recorded by the embedding node, not by the
    /// core itself.
    pub fn log_processed_count(&self) -> Result<U256> {
        let tx = self.storage.begin_read();
        tx.get_u256(Column::State, &LOG_PROCESSED_KEY)
    }

    pub fn update_log_processed_count(&self, count: &U256) -> Result<()> {
        let tx = self.storage.begin_write();
        tx.put_u256(Column::State, &LOG_PROCESSED_KEY, count)?;
        tx.commit()
    }

    pub fn send_processed_count(&self) -> Result<U256> {
        let tx = self.storage.begin_read();
        tx.get_u256(Column::State, &SEND_PROCESSED_KEY)
    }

    pub fn update_send_processed_count(&self, count: &U256) -> Result<()> {
        let tx = self.storage.begin_write();
        tx.put_u256(Column::State, &SEND_PROCESSED_KEY, count)?;
        tx.commit()
    }

    // Outputs

    pub fn get_logs(
        &self, index: U256, count: U256, cache: &mut ValueCache,
    ) -> Result<Vec<Value>> {
        let tx = self.storage.begin_read();
        Self::get_logs_no_lock(&tx, index, count, cache)
    }

    pub(crate) fn get_logs_no_lock(
        tx: &impl StoreRead, index: U256, count: U256, cache: &mut ValueCache,
    ) -> Result<Vec<Value>> {
        if count.is_zero() {
            return Ok(Vec::new())
        }
        let max_log_count = Self::log_inserted_count_impl(tx)?;
        if index >= max_log_count {
            return Ok(Vec::new())
        }
        let count = count.min(max_log_count - index);

        let mut logs = Vec::new();
        let mut it = tx.iter(Column::Logs);
        it.seek(&marshal_u256(&index));
        let mut remaining = count;
        while it.valid() && !remaining.is_zero() {
            let hash = Hash::from_slice(it.value().ok_or(Error::NotFound)?);
            logs.push(valuestore::get_value(tx, &hash, cache)?);
            remaining = remaining - 1;
            it.next();
        }
        it.status()?;
        if !remaining.is_zero() {
            return Err(Error::corrupt("log entries missing below count"))
        }
        Ok(logs)
    }

    pub fn get_sends(&self, index: U256, count: U256) -> Result<Vec<Bytes>> {
        let tx = self.storage.begin_read();
        if count.is_zero() {
            return Ok(Vec::new())
        }
        let max_send_count = Self::send_inserted_count_impl(&tx)?;
        if index >= max_send_count {
            return Err(Error::NotFound)
        }
        let count = count.min(max_send_count - index);

        let mut sends = Vec::new();
        let mut it = tx.iter(Column::Sends);
        it.seek(&marshal_u256(&index));
        let mut remaining = count;
        while it.valid() && !remaining.is_zero() {
            sends.push(it.value().ok_or(Error::NotFound)?.into());
            remaining = remaining - 1;
            it.next();
        }
        it.status()?;
        if !remaining.is_zero() {
            return Err(Error::corrupt("send entries missing below count"))
        }
        Ok(sends)
    }

    pub fn get_messages(&self, index: U256, count: U256) -> Result<Vec<Bytes>> {
        let tx = self.storage.begin_read();
        let messages = messages::get_messages_impl(&tx, index, count, None)?;
        Ok(messages.into_iter().map(|m| m.message).collect())
    }

    pub fn get_inbox_acc(&self, index: U256) -> Result<Hash> {
        let tx = self.storage.begin_read();
        Ok(messages::next_batch_item(&tx, &index)?.accumulator)
    }

    pub fn get_inbox_acc_pair(
        &self, index1: U256, index2: U256,
    ) -> Result<(Hash, Hash)> {
        let tx = self.storage.begin_read();
        let first = messages::next_batch_item(&tx, &index1)?.accumulator;
        let second = messages::next_batch_item(&tx, &index2)?.accumulator;
        Ok((first, second))
    }

    /// Running digest over a log range, chained from `start_acc`.
    pub fn get_log_acc(
        &self, start_acc: Hash, index: U256, count: U256,
        cache: &mut ValueCache,
    ) -> Result<Hash> {
        let logs = self.get_logs(index, count, cache)?;
        let mut acc = start_acc;
        for log in &logs {
            acc = acc.chain(&log.hash());
        }
        Ok(acc)
    }

    /// Running digest over a send range, chained from `start_acc`.
    pub fn get_send_acc(
        &self, start_acc: Hash, index: U256, count: U256,
    ) -> Result<Hash> {
        let sends = self.get_sends(index, count)?;
        let mut acc = start_acc;
        for send in &sends {
            acc = acc.chain(&Hash::hash(send));
        }
        Ok(acc)
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        let handle = self.core_thread.lock().take();
        if let Some(handle) = handle {
            self.abort_flag.store(true, Ordering::SeqCst);
            let _ = handle.join();
        }
    }
}
