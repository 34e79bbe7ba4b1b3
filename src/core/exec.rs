//! The executor tick loop: the single writer that drives the live machine,
//! persists each assertion atomically with its checkpoint, and services
//! logs cursors and the manual checkpoint flag between runs.

use log::{error, info, warn};

use std::sync::atomic::Ordering;
use std::time::Duration;

use super::{Core, MessageStatus};
use crate::checkpoint;
use crate::common::{marshal_u256, Bytes, U256};
use crate::error::Result;
use crate::machine::{Assertion, ExecConfig, Machine, MachineStatus};
use crate::machine::{MachineThread, MachineThreadStatus};
use crate::messages;
use crate::storage::valuestore;
use crate::storage::{Column, ReadWriteTransaction};
use crate::value::{Value, ValueCache};

const MAX_MESSAGE_BATCH_SIZE: usize = 10;

impl Core {
    pub(crate) fn run_loop(&self) {
        let mut cache = ValueCache::new(5, 0);

        while !self.abort_flag.load(Ordering::SeqCst) {
            if let Err(msg) = self.tick(&mut cache) {
                *self.core_error_string.lock() = msg.clone();
                error!("core thread stopped: {}", msg);
                break
            }

            if !self.machine_idle() ||
                self.message_status.load(Ordering::SeqCst) !=
                    MessageStatus::Ready as u8
            {
                // Machine is busy or nothing new arrived
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        // Make sure the machine stops cleanly
        if let Some(machine) = self.machine.lock().as_mut() {
            machine.abort();
        }
    }

    /// One executor tick. An `Err` carries the fatal error string and
    /// terminates the loop.
    fn tick(&self, cache: &mut ValueCache) -> std::result::Result<(), String> {
        // The machine may be executing messages a reorg rewrote from under
        // it; roll back to the newest checkpoint the log still confirms.
        let machine_inbox = {
            let mut machine = self.machine.lock();
            machine
                .as_mut()
                .ok_or_else(|| "core not initialized".to_string())?
                .get_reorg_data()
        };
        let machine_valid = {
            let tx = self.storage.begin_read();
            messages::is_valid(&tx, &machine_inbox)
                .map_err(|e| e.to_string())?
        };
        if !machine_valid {
            warn!("core thread operating on invalid machine, rolling back");
            self.reorg_to_message_or_before(None, true, cache)
                .map_err(|e| format!("error reorging to valid state: {}", e))?;
        }

        if self.message_status.load(Ordering::SeqCst) ==
            MessageStatus::Ready as u8
        {
            // A reorg might occur while adding messages
            let data = self.message_data.lock().clone();
            match self.add_messages(&data, cache) {
                Ok(true) => {
                    self.machine_idle.store(false, Ordering::SeqCst);
                    self.message_status
                        .store(MessageStatus::Success as u8, Ordering::SeqCst);
                }
                Ok(false) => {
                    // Previous accumulator unknown, request older messages
                    self.message_status.store(
                        MessageStatus::NeedOlder as u8,
                        Ordering::SeqCst,
                    );
                }
                Err(e) => {
                    self.message_status
                        .store(MessageStatus::Error as u8, Ordering::SeqCst);
                    return Err(format!("inbox processing stopped: {}", e))
                }
            }
        }

        {
            let mut machine_guard = self.machine.lock();
            let machine = machine_guard
                .as_mut()
                .ok_or_else(|| "core not initialized".to_string())?;
            match machine.status() {
                MachineThreadStatus::Error => {
                    return Err(format!(
                        "machine stopped with error: {}",
                        machine.error_string()
                    ))
                }
                MachineThreadStatus::Success => {
                    self.collect_assertion(machine, cache)?;
                }
                MachineThreadStatus::Aborted => {
                    // Just reset status so machine can be restarted
                    machine.clear_error();
                }
                MachineThreadStatus::None => {
                    self.start_machine_if_needed(machine)?;
                }
                MachineThreadStatus::Running => {}
            }
        }

        for i in 0..self.logs_cursors.len() {
            if self.logs_cursors[i].is_requested() {
                let tx = self.storage.begin_read();
                self.handle_logs_cursor_requested(&tx, i, cache);
            }
        }

        if self.save_checkpoint_flag.load(Ordering::SeqCst) {
            let result = self.save_requested_checkpoint();
            *self.save_checkpoint_error.lock() =
                result.err().map(|e| e.to_string());
            self.save_checkpoint_flag.store(false, Ordering::SeqCst);
        }

        Ok(())
    }

    /// Persist a finished run: logs, sends, sideload marker, and at a
    /// sideload boundary a checkpoint plus a cloned machine for the
    /// sideload cache, all in one transaction.
    fn collect_assertion(
        &self, machine: &mut MachineThread, cache: &mut ValueCache,
    ) -> std::result::Result<(), String> {
        let tx = self.storage.begin_write();
        let assertion = machine.next_assertion();
        let output = machine
            .machine()
            .expect("machine missing after successful run")
            .output()
            .clone();
        *self.last_machine_output.write() = output.clone();

        self.save_assertion(&tx, &assertion, &output.arb_gas_used)
            .map_err(|e| format!("assertion saving failed: {}", e))?;

        if let Some(block) = assertion.sideload_block_number {
            let clone = machine
                .machine()
                .expect("machine missing after successful run")
                .clone();
            self.cache_sideload_machine(block, clone);

            // Save a checkpoint for every sideload
            let state =
                &machine.machine().expect("machine missing").machine_state;
            self.save_checkpoint_checked(&tx, state)
                .map_err(|e| format!("checkpoint saving failed: {}", e))?;

            // Clear oldest cache and start populating the next one
            cache.next_cache();

            // Machine was stopped at the sideload, start it back up where
            // it left off
            if !machine.continue_running() {
                self.machine_error.store(true, Ordering::SeqCst);
                return Err("error starting machine thread".to_string())
            }
        }

        tx.commit()
            .map_err(|e| format!("database update failed: {}", e))?;
        Ok(())
    }

    fn start_machine_if_needed(
        &self, machine: &mut MachineThread,
    ) -> std::result::Result<(), String> {
        let state_status = machine
            .machine()
            .ok_or_else(|| "machine missing".to_string())?
            .machine_state
            .status;
        if matches!(
            state_status,
            MachineStatus::Halted | MachineStatus::Errored
        ) {
            // Nothing left for this machine to do
            self.machine_idle.store(true, Ordering::SeqCst);
            return Ok(())
        }

        let inbox = machine
            .machine()
            .ok_or_else(|| "machine missing".to_string())?
            .output()
            .fully_processed_inbox
            .clone();
        let messages_result = {
            let tx = self.storage.begin_read();
            messages::read_next_messages(&tx, &inbox, MAX_MESSAGE_BATCH_SIZE)
        };
        let inbox_messages = match messages_result {
            Ok(msgs) => msgs,
            Err(e) => {
                self.machine_error.store(true, Ordering::SeqCst);
                *self.machine_error_string.lock() = e.to_string();
                return Err(format!("failed getting message entry: {}", e))
            }
        };

        if inbox_messages.is_empty() {
            // Machine all caught up, no messages to process
            self.machine_idle.store(true, Ordering::SeqCst);
            return Ok(())
        }

        let config = ExecConfig {
            inbox_messages,
            max_gas: None,
            go_over_gas: false,
            stop_on_sideload: true,
        };
        if !machine.run_machine(config) {
            self.machine_error.store(true, Ordering::SeqCst);
            return Err("error starting machine thread".to_string())
        }
        Ok(())
    }

    fn save_requested_checkpoint(&self) -> Result<()> {
        info!("saving requested checkpoint");
        let mut machine_guard = self.machine.lock();
        let machine = machine_guard
            .as_mut()
            .ok_or_else(|| crate::error::Error::corrupt("no machine"))?;
        let state = match machine.machine() {
            Some(m) => &m.machine_state,
            None => {
                return Err(crate::error::Error::corrupt(
                    "machine busy during checkpoint save",
                ))
            }
        };
        let tx = self.storage.begin_write();
        self.save_checkpoint_checked(&tx, state)?;
        tx.commit()
    }

    /// Refuse to persist a state the message log no longer confirms; a
    /// reorg will rebuild the machine on the next tick.
    pub(crate) fn save_checkpoint_checked(
        &self, tx: &ReadWriteTransaction, state: &crate::machine::MachineState,
    ) -> Result<()> {
        if !messages::is_valid(tx, &state.output.fully_processed_inbox)? {
            error!(
                "attempted to save invalid checkpoint at gas {}",
                state.output.arb_gas_used
            );
            return Ok(())
        }
        checkpoint::save_checkpoint(tx, state)
    }

    pub(crate) fn save_assertion(
        &self, tx: &ReadWriteTransaction, assertion: &Assertion,
        arb_gas_used: &U256,
    ) -> Result<()> {
        self.save_logs(tx, &assertion.logs)?;
        self.save_sends(tx, &assertion.sends)?;
        if let Some(block) = &assertion.sideload_block_number {
            save_sideload_position(tx, block, arb_gas_used)?;
        }
        Ok(())
    }

    fn save_logs(
        &self, tx: &ReadWriteTransaction, vals: &[Value],
    ) -> Result<()> {
        if vals.is_empty() {
            return Ok(())
        }
        let mut log_index = Self::log_inserted_count_impl(tx)?;
        for val in vals {
            let hash = valuestore::save_value(tx, val)?;
            tx.put(
                Column::Logs,
                &marshal_u256(&log_index),
                hash.as_bytes(),
            )?;
            log_index = log_index + 1;
        }
        Self::update_log_inserted_count(tx, &log_index)
    }

    fn save_sends(
        &self, tx: &ReadWriteTransaction, sends: &[Bytes],
    ) -> Result<()> {
        if sends.is_empty() {
            return Ok(())
        }
        let mut send_index = Self::send_inserted_count_impl(tx)?;
        for send in sends {
            tx.put(Column::Sends, &marshal_u256(&send_index), send)?;
            send_index = send_index + 1;
        }
        Self::update_send_inserted_count(tx, &send_index)
    }

    fn cache_sideload_machine(&self, block: U256, machine: Machine) {
        let mut sideload_cache = self.sideload_cache.write();
        sideload_cache.insert(block, machine);
        // Drop entries more than the window behind, or past the tip
        // (those have been reorged out).
        let window: U256 = super::SIDELOAD_CACHE_SIZE.into();
        sideload_cache.retain(|cached_block, _| {
            !(block > window && *cached_block < block - window) &&
                *cached_block <= block
        });
    }
}

fn save_sideload_position(
    tx: &ReadWriteTransaction, block_number: &U256, arb_gas_used: &U256,
) -> Result<()> {
    tx.put(
        Column::Sideload,
        &marshal_u256(block_number),
        &marshal_u256(arb_gas_used),
    )
}
