//! Logs cursors: a fixed set of subscriber slots through which consumers
//! stream new logs and learn which delivered logs a reorg invalidated.
//! Each cursor runs the EMPTY -> REQUESTED -> READY -> EMPTY machine, with
//! ERROR reachable from anywhere and cleared explicitly.

use log::warn;
use parking_lot::Mutex;

use super::{Core, LOGSCURSOR_CURRENT_PREFIX};
use crate::common::{checked_as_u64, U256};
use crate::error::Result;
use crate::storage::{Column, ReadWriteTransaction, StoreRead};
use crate::value::{Value, ValueCache};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CursorStatus {
    Empty,
    Requested,
    Ready,
    Error,
}

pub(crate) struct CursorInner {
    pub status: CursorStatus,
    pub data: Vec<Value>,
    pub deleted_data: Vec<Value>,
    pub number_requested: U256,
    pub pending_total_count: U256,
    pub error_string: String,
}

pub(crate) struct LogsCursor {
    pub(crate) inner: Mutex<CursorInner>,
    /// State column key holding this cursor's confirmed count.
    current_total_key: [u8; 2],
}

impl LogsCursor {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            inner: Mutex::new(CursorInner {
                status: CursorStatus::Empty,
                data: Vec::new(),
                deleted_data: Vec::new(),
                number_requested: U256::zero(),
                pending_total_count: U256::zero(),
                error_string: String::new(),
            }),
            current_total_key: [LOGSCURSOR_CURRENT_PREFIX, index as u8],
        }
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.inner.lock().status == CursorStatus::Requested
    }
}

/// One delivery: new logs starting at `first_log_index`, plus the logs a
/// reorg removed since the last confirmation, newest first.
#[derive(Debug, Default)]
pub struct LogsCursorLogs {
    pub first_log_index: U256,
    pub logs: Vec<Value>,
    pub deleted_logs: Vec<Value>,
}

impl Core {
    /// Ask for up to `count` new logs. Only legal while the cursor is
    /// empty.
    pub fn logs_cursor_request(&self, cursor_index: usize, count: U256) -> bool {
        let cursor = &self.logs_cursors[cursor_index];
        let mut inner = cursor.inner.lock();
        if inner.status != CursorStatus::Empty {
            return false
        }
        inner.number_requested = count;
        inner.status = CursorStatus::Requested;
        true
    }

    /// Collect a delivery once the executor marked the cursor ready.
    /// `Ok(None)` means try again later.
    pub fn logs_cursor_get_logs(
        &self, cursor_index: usize,
    ) -> Result<Option<LogsCursorLogs>> {
        let cursor = &self.logs_cursors[cursor_index];
        let mut inner = cursor.inner.lock();
        if inner.status != CursorStatus::Ready {
            // No new logs yet
            return Ok(None)
        }

        let tx = self.storage.begin_read();
        let current =
            self.logs_cursor_get_current_total_count(&tx, cursor_index)?;
        let pending = current + inner.data.len();
        inner.pending_total_count = pending;

        Ok(Some(LogsCursorLogs {
            first_log_index: current,
            logs: std::mem::take(&mut inner.data),
            deleted_logs: std::mem::take(&mut inner.deleted_data),
        }))
    }

    /// Confirm the previous delivery was fully consumed, persisting the
    /// new confirmed count and freeing the slot.
    pub fn logs_cursor_confirm_received(&self, cursor_index: usize) -> bool {
        let cursor = &self.logs_cursors[cursor_index];
        let mut inner = cursor.inner.lock();
        if inner.status != CursorStatus::Ready {
            warn!(
                "logs cursor {} confirm_received called at wrong state",
                cursor_index
            );
            inner.error_string =
                "confirm_received called at wrong state".to_string();
            inner.status = CursorStatus::Error;
            return false
        }
        if !inner.data.is_empty() || !inner.deleted_data.is_empty() {
            // Still logs to hand out
            return false
        }

        let pending = inner.pending_total_count;
        let result: Result<()> = (|| {
            let tx = self.storage.begin_write();
            self.logs_cursor_save_current_total_count(
                &tx,
                cursor_index,
                &pending,
            )?;
            tx.commit()
        })();
        match result {
            Ok(()) => {
                inner.status = CursorStatus::Empty;
                true
            }
            Err(e) => {
                inner.error_string = e.to_string();
                inner.status = CursorStatus::Error;
                false
            }
        }
    }

    pub fn logs_cursor_check_error(&self, cursor_index: usize) -> bool {
        self.logs_cursors[cursor_index].inner.lock().status ==
            CursorStatus::Error
    }

    /// Read and clear the error, resetting the cursor to empty.
    pub fn logs_cursor_clear_error(
        &self, cursor_index: usize,
    ) -> Option<String> {
        let cursor = &self.logs_cursors[cursor_index];
        let mut inner = cursor.inner.lock();
        if inner.status != CursorStatus::Error {
            warn!("logs cursor clear_error called when status not error");
            return None
        }
        let message = std::mem::take(&mut inner.error_string);
        inner.data.clear();
        inner.deleted_data.clear();
        inner.status = CursorStatus::Empty;
        Some(message)
    }

    /// The confirmed position: every log below it has been handed out and
    /// acknowledged.
    pub fn logs_cursor_position(&self, cursor_index: usize) -> Result<U256> {
        let tx = self.storage.begin_read();
        self.logs_cursor_get_current_total_count(&tx, cursor_index)
    }

    /// Executor side: fill a requested cursor with whatever is available.
    /// Leaves the cursor requested when nothing new exists yet.
    pub(crate) fn handle_logs_cursor_requested(
        &self, tx: &impl StoreRead, cursor_index: usize,
        cache: &mut ValueCache,
    ) {
        let cursor = &self.logs_cursors[cursor_index];
        let mut inner = cursor.inner.lock();
        inner.data.clear();

        let fail = |inner: &mut CursorInner, msg: String| {
            warn!("logs cursor {}: {}", cursor_index, msg);
            inner.error_string = msg;
            inner.status = CursorStatus::Error;
        };

        let log_inserted_count = match Self::log_inserted_count_impl(tx) {
            Ok(count) => count,
            Err(e) => return fail(&mut inner, e.to_string()),
        };
        let current = match self
            .logs_cursor_get_current_total_count(tx, cursor_index)
        {
            Ok(count) => count,
            Err(e) => return fail(&mut inner, e.to_string()),
        };

        if current == log_inserted_count {
            // No new logs; a reorg-deleted suffix still has to go out,
            // otherwise stay requested
            if !inner.deleted_data.is_empty() {
                inner.status = CursorStatus::Ready;
            }
            return
        }
        if current > log_inserted_count {
            return fail(
                &mut inner,
                format!(
                    "current count {} above inserted count {}",
                    current, log_inserted_count
                ),
            )
        }
        if current + inner.number_requested > log_inserted_count {
            // Too many entries requested
            inner.number_requested = log_inserted_count - current;
        }
        if inner.number_requested.is_zero() {
            inner.status = CursorStatus::Ready;
            return
        }
        let requested = inner.number_requested;
        match Self::get_logs_no_lock(tx, current, requested, cache) {
            Ok(logs) => {
                inner.data = logs;
                inner.status = CursorStatus::Ready;
            }
            Err(e) => fail(&mut inner, e.to_string()),
        }
    }

    /// Executor side, called under the reorg mutex before log entries are
    /// removed: copy the doomed suffix into `deleted_data` (newest first),
    /// truncate any queued-but-undelivered data past the target, and clamp
    /// the persisted confirmed count.
    pub(crate) fn handle_logs_cursor_reorg(
        &self, cursor_index: usize, log_count: &U256, cache: &mut ValueCache,
    ) -> Result<()> {
        let cursor = &self.logs_cursors[cursor_index];
        let tx = self.storage.begin_write();
        let mut inner = cursor.inner.lock();

        let current =
            self.logs_cursor_get_current_total_count(&tx, cursor_index)?;
        if current > inner.pending_total_count {
            inner.pending_total_count = current;
        }

        if *log_count < inner.pending_total_count {
            // Save the logs that are about to be deleted
            let doomed = Self::get_logs_no_lock(
                &tx,
                *log_count,
                inner.pending_total_count - *log_count,
                cache,
            )?;
            inner.deleted_data.extend(doomed.into_iter().rev());
            inner.pending_total_count = *log_count;

            if current > *log_count {
                self.logs_cursor_save_current_total_count(
                    &tx,
                    cursor_index,
                    log_count,
                )?;
            }
        }

        if !inner.data.is_empty() {
            if current >= *log_count {
                // Everything queued is gone
                inner.data.clear();
            } else if current + inner.data.len() > *log_count {
                let keep = checked_as_u64(&(*log_count - current))
                    .expect("log window exceeds u64")
                    as usize;
                inner.data.truncate(keep);
            }
        }

        if inner.status == CursorStatus::Ready &&
            inner.data.is_empty() &&
            inner.deleted_data.is_empty()
        {
            // Nothing left to deliver; have the executor re-serve it
            inner.status = CursorStatus::Requested;
        }

        tx.commit()
    }

    pub(crate) fn logs_cursor_get_current_total_count(
        &self, tx: &impl StoreRead, cursor_index: usize,
    ) -> Result<U256> {
        tx.get_u256(
            Column::State,
            &self.logs_cursors[cursor_index].current_total_key,
        )
    }

    pub(crate) fn logs_cursor_save_current_total_count(
        &self, tx: &ReadWriteTransaction, cursor_index: usize, count: &U256,
    ) -> Result<()> {
        tx.put_u256(
            Column::State,
            &self.logs_cursors[cursor_index].current_total_key,
            count,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_starts_empty_and_requests_once() {
        let cursor = LogsCursor::new(3);
        assert_eq!(cursor.current_total_key, [LOGSCURSOR_CURRENT_PREFIX, 3]);
        assert!(!cursor.is_requested());
        {
            let mut inner = cursor.inner.lock();
            assert_eq!(inner.status, CursorStatus::Empty);
            inner.status = CursorStatus::Requested;
        }
        assert!(cursor.is_requested());
    }
}
