//! History rewrites: rolling the live machine back to the newest checkpoint
//! the message log still confirms, truncating downstream outputs to match,
//! and folding newly delivered batches into the log.

use log::{error, info, warn};

use super::{Core, MessageData};
use crate::checkpoint::{self, MachineStateKeys};
use crate::common::{Hash, U256};
use crate::error::{Error, Result};
use crate::machine::MachineThread;
use crate::messages::{self, InboxItem, SequencerBatchItem};
use crate::storage::valuestore;
use crate::storage::{Column, ReadWriteTransaction, StoreRead};
use crate::value::ValueCache;

impl Core {
    /// Rewind so the machine state is at or before the given message.
    /// With `use_latest` the newest still-valid checkpoint wins and
    /// `message_sequence_number` is ignored; `None` accepts only a
    /// checkpoint that has read no messages at all.
    ///
    /// Walking from the highest gas downward, every checkpoint that is too
    /// new or no longer confirmed by the message log is deleted together
    /// with its value store references. Logs cursors snapshot the doomed
    /// log suffix before it is removed; sends are truncated by counter
    /// only.
    pub fn reorg_to_message_or_before(
        &self, message_sequence_number: Option<&U256>, use_latest: bool,
        cache: &mut ValueCache,
    ) -> Result<()> {
        let _guard = self.reorg_mutex.lock();

        if use_latest {
            info!("reloading latest checkpoint");
        } else {
            info!("reorganizing to message {:?}", message_sequence_number);
        }

        let target = {
            let tx = self.storage.begin_write();
            let target = self.trim_checkpoints(
                &tx,
                message_sequence_number,
                use_latest,
            )?;
            tx.commit()?;
            target
        };

        let log_inserted_count = self.log_inserted_count()?;
        if target.output.log_count < log_inserted_count {
            // Snapshot the doomed suffix into each cursor before deletion
            for i in 0..self.logs_cursors.len() {
                self.handle_logs_cursor_reorg(
                    i,
                    &target.output.log_count,
                    cache,
                )?;
            }
        }

        let next_sideload_block = match &target.output.last_sideload {
            Some(block) => *block + 1,
            None => U256::zero(),
        };

        let tx = self.storage.begin_write();
        self.delete_sideloads_starting_at(&tx, &next_sideload_block)?;
        delete_logs_starting_at(&tx, &target.output.log_count)?;
        Self::update_log_inserted_count(&tx, &target.output.log_count)?;
        Self::update_send_inserted_count(&tx, &target.output.send_count)?;

        // Machine was executing obsolete messages, restore it from the
        // target checkpoint
        {
            let mut machine_guard = self.machine.lock();
            if let Some(machine) = machine_guard.as_mut() {
                machine.abort();
            }
            let machine = checkpoint::materialize(
                &tx,
                &target,
                &self.code,
                self.interp.clone(),
                cache,
            )?;
            *self.last_machine_output.write() =
                machine.machine_state.output.clone();
            *machine_guard = Some(MachineThread::new(machine));
        }

        tx.commit()
    }

    /// Delete checkpoints from the newest down until one both old enough
    /// and still valid remains; that one is the reorg target.
    fn trim_checkpoints(
        &self, tx: &ReadWriteTransaction,
        message_sequence_number: Option<&U256>, use_latest: bool,
    ) -> Result<MachineStateKeys> {
        let mut rows = Vec::new();
        {
            let mut it = tx.iter(Column::Checkpoints);
            it.seek_to_last();
            while it.valid() {
                rows.push((
                    it.key().ok_or(Error::NotFound)?.to_vec(),
                    it.value().ok_or(Error::NotFound)?.to_vec(),
                ));
                it.prev();
            }
            it.status()?;
        }
        if rows.is_empty() {
            return Err(Error::NotFound)
        }

        for (key, raw) in rows {
            let keys = MachineStateKeys::deserialize(&raw)?;
            let old_enough = keys.total_messages_read().is_zero() ||
                use_latest ||
                message_sequence_number
                    .map(|m| keys.total_messages_read() - 1 <= *m)
                    .unwrap_or(false);
            if old_enough {
                if self.checkpoint_still_valid(tx, &keys)? {
                    return Ok(keys)
                }
                error!(
                    "invalid checkpoint found at gas {}",
                    keys.output.arb_gas_used
                );
            }

            // Obsolete checkpoint, release the referenced machine state
            checkpoint::delete_machine_state(tx, &keys)?;
            tx.delete(Column::Checkpoints, &key)?;
        }
        Err(Error::NotFound)
    }

    /// A checkpoint is valid iff the log still yields its inbox
    /// accumulator, and its staged message (if any) is still the message
    /// it would consume next.
    pub(crate) fn checkpoint_still_valid(
        &self, tx: &impl StoreRead, keys: &MachineStateKeys,
    ) -> Result<bool> {
        if !messages::is_valid(tx, &keys.output.fully_processed_inbox)? {
            return Ok(false)
        }
        if let Some(staged) = &keys.staged_message {
            match messages::next_batch_item(
                tx,
                &keys.output.fully_processed_inbox.count,
            ) {
                Ok(item) => {
                    if item.accumulator != staged.accumulator {
                        return Ok(false)
                    }
                }
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub(crate) fn delete_sideloads_starting_at(
        &self, tx: &ReadWriteTransaction, block_number: &U256,
    ) -> Result<()> {
        // Clear the cache
        {
            let mut sideload_cache = self.sideload_cache.write();
            sideload_cache.split_off(block_number);
        }

        // Clear the index
        let mut doomed = Vec::new();
        {
            let mut it = tx.iter(Column::Sideload);
            it.seek(&crate::common::marshal_u256(block_number));
            while it.valid() {
                doomed.push(it.key().ok_or(Error::NotFound)?.to_vec());
                it.next();
            }
            it.status()?;
        }
        for key in doomed {
            tx.delete(Column::Sideload, &key)?;
        }
        Ok(())
    }

    /// Fold a delivered batch into the message log. `Ok(false)` means the
    /// batch's previous accumulator is unknown and the feeder must send
    /// older messages.
    pub(crate) fn add_messages(
        &self, data: &MessageData, cache: &mut ValueCache,
    ) -> Result<bool> {
        let (tip_count, tip_acc) = {
            let tx = self.storage.begin_read();
            match messages::tip_batch_item(&tx)? {
                Some(tip) => {
                    (tip.last_sequence_number + 1, tip.accumulator)
                }
                None => (U256::zero(), Hash::zero().clone()),
            }
        };

        // Where does this batch attach? A matching tip accumulator means a
        // plain append; otherwise history was rewritten and we must find
        // the fork point.
        let truncate_to = if let Some(n) = &data.reorg_message_count {
            Some(*n)
        } else if data.previous_inbox_acc == tip_acc {
            None
        } else if data.previous_inbox_acc == *Hash::zero() {
            Some(U256::zero())
        } else {
            match self.find_fork_point(&data.previous_inbox_acc)? {
                Some(seq) => Some(seq + 1),
                None => return Ok(false),
            }
        };

        let attach_count = match truncate_to {
            Some(n) if n < tip_count || data.reorg_message_count.is_some() => {
                warn!("inbox reorg to message count {}", n);
                self.truncate_message_log(&n)?
            }
            Some(n) => n,
            None => tip_count,
        };

        // The kept tip must be exactly what the feeder chained from
        let (kept_acc, kept_delayed) = {
            let tx = self.storage.begin_read();
            match messages::tip_batch_item(&tx)? {
                Some(tip) => (tip.accumulator, tip.total_delayed_count),
                None => (Hash::zero().clone(), U256::zero()),
            }
        };
        if kept_acc != data.previous_inbox_acc {
            return Ok(false)
        }

        if attach_count < tip_count {
            // Roll the machine back behind the rewritten suffix
            let target = if attach_count.is_zero() {
                None
            } else {
                Some(attach_count - 1)
            };
            self.reorg_to_message_or_before(
                target.as_ref(),
                false,
                cache,
            )?;
        }

        self.append_items(data, attach_count, kept_acc, kept_delayed)
    }

    /// Newest batch item whose accumulator equals `acc`, if any.
    fn find_fork_point(&self, acc: &Hash) -> Result<Option<U256>> {
        let tx = self.storage.begin_read();
        let mut it = tx.iter(Column::SequencerBatchItems);
        it.seek_to_last();
        while it.valid() {
            let last_seq = crate::common::unmarshal_u256(
                it.key().ok_or(Error::NotFound)?,
            );
            let item = SequencerBatchItem::decode(
                last_seq,
                it.value().ok_or(Error::NotFound)?,
            )?;
            if &item.accumulator == acc {
                return Ok(Some(item.last_sequence_number))
            }
            it.prev();
        }
        it.status()?;
        Ok(None)
    }

    /// Drop batch items (and the delayed messages they promoted) from
    /// `count` on. Returns the resulting message count, which lands on the
    /// nearest item boundary at or below `count`.
    fn truncate_message_log(&self, count: &U256) -> Result<U256> {
        let tx = self.storage.begin_write();
        let new_count = messages::delete_batch_items_from(&tx, count)?;
        let keep_delayed = match messages::tip_batch_item(&tx)? {
            Some(tip) => tip.total_delayed_count,
            None => U256::zero(),
        };
        messages::delete_delayed_from(&tx, &keep_delayed)?;
        Self::update_message_entry_inserted_count(&tx, &new_count)?;
        tx.commit()?;
        Ok(new_count)
    }

    fn append_items(
        &self, data: &MessageData, attach_count: U256, prev_acc: Hash,
        prev_delayed: U256,
    ) -> Result<bool> {
        let tx = self.storage.begin_write();
        let mut seq = attach_count;
        let mut acc = prev_acc;
        let mut delayed = prev_delayed;
        for item in &data.items {
            match item {
                InboxItem::Sequencer(msg) => {
                    acc = messages::sequencer_item_acc(&acc, msg);
                    messages::put_batch_item(
                        &tx,
                        &SequencerBatchItem {
                            last_sequence_number: seq,
                            total_delayed_count: delayed,
                            accumulator: acc.clone(),
                            sequencer_message: Some(msg.clone()),
                        },
                    )?;
                    seq = seq + 1;
                }
                InboxItem::Delayed(run) => {
                    if run.is_empty() {
                        continue
                    }
                    for msg in run {
                        messages::put_delayed_message(&tx, &delayed, msg)?;
                        delayed = delayed + 1;
                    }
                    acc = messages::delayed_item_acc(&acc, &delayed, run);
                    messages::put_batch_item(
                        &tx,
                        &SequencerBatchItem {
                            last_sequence_number: seq + run.len() - 1,
                            total_delayed_count: delayed,
                            accumulator: acc.clone(),
                            sequencer_message: None,
                        },
                    )?;
                    seq = seq + run.len();
                }
            }
        }
        Self::update_message_entry_inserted_count(&tx, &seq)?;
        tx.commit()?;
        Ok(true)
    }
}

/// Release and remove every log entry from `log_index` on. Must run after
/// the logs cursors have snapshotted the doomed suffix.
pub(crate) fn delete_logs_starting_at(
    tx: &ReadWriteTransaction, log_index: &U256,
) -> Result<()> {
    let mut doomed = Vec::new();
    {
        let mut it = tx.iter(Column::Logs);
        it.seek(&crate::common::marshal_u256(log_index));
        while it.valid() {
            doomed.push((
                it.key().ok_or(Error::NotFound)?.to_vec(),
                Hash::from_slice(it.value().ok_or(Error::NotFound)?),
            ));
            it.next();
        }
        it.status()?;
    }
    for (key, value_hash) in doomed {
        valuestore::delete_value(tx, &value_hash)?;
        tx.delete(Column::Logs, &key)?;
    }
    Ok(())
}
