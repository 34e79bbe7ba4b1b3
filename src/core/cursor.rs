//! Execution cursors: ephemeral read-only machine views advanceable to an
//! arbitrary gas target, plus the sideload service that forks view-call
//! machines just after recent blocks. Cursors hold no locks across machine
//! execution; every iteration reads through a fresh snapshot and a reorg
//! mid-advance simply rebuilds the cursor from the closest checkpoint.

use log::warn;

use std::time::Duration;

use super::{Core, SIDELOAD_CACHE_SIZE};
use crate::checkpoint::{self, MachineStateKeys};
use crate::common::{marshal_u256, unmarshal_u256, U256};
use crate::error::{Error, Result};
use crate::machine::{ExecConfig, Machine, MachineOutput};
use crate::messages;
use crate::storage::{Column, StoreRead};
use crate::value::ValueCache;

/// Reloading a checkpoint from disk is charged this much equivalent gas
/// when deciding whether an existing live cursor machine is worth keeping.
const CHECKPOINT_LOAD_GAS_COST: u64 = 100_000_000;

const MESSAGE_GROUP_SIZE: usize = 10;
const REORG_ATTEMPT_LIMIT: usize = 16;

enum CursorMachine {
    /// Persisted form; materialized on first use.
    Keys(MachineStateKeys),
    Live(Box<Machine>),
}

pub struct ExecutionCursor {
    machine: CursorMachine,
}

impl ExecutionCursor {
    fn new(keys: MachineStateKeys) -> Self {
        Self {
            machine: CursorMachine::Keys(keys),
        }
    }

    pub fn output(&self) -> &MachineOutput {
        match &self.machine {
            CursorMachine::Keys(keys) => &keys.output,
            CursorMachine::Live(machine) => machine.output(),
        }
    }

    fn live_mut(&mut self) -> Option<&mut Machine> {
        match &mut self.machine {
            CursorMachine::Live(machine) => Some(machine),
            CursorMachine::Keys(_) => None,
        }
    }
}

impl Core {
    /// A cursor positioned at exactly `total_gas_used` (or the closest
    /// boundary below it the machine cannot cross without going over).
    pub fn get_execution_cursor(
        &self, total_gas_used: U256, cache: &mut ValueCache,
    ) -> Result<ExecutionCursor> {
        let mut cursor = {
            let tx = self.storage.begin_read();
            ExecutionCursor::new(
                self.closest_checkpoint(&tx, &total_gas_used)?,
            )
        };
        self.advance_execution_cursor_impl(
            &mut cursor,
            total_gas_used,
            false,
            cache,
        )?;
        Ok(cursor)
    }

    /// Advance by up to `max_gas` more gas. Without `go_over_gas` the
    /// cursor stops before the instruction that would overshoot; with it,
    /// it stops after crossing the target.
    pub fn advance_execution_cursor(
        &self, cursor: &mut ExecutionCursor, max_gas: U256, go_over_gas: bool,
        cache: &mut ValueCache,
    ) -> Result<()> {
        let gas_target = cursor.output().arb_gas_used + max_gas;
        {
            let tx = self.storage.begin_read();
            let closest = self.closest_checkpoint(&tx, &gas_target)?;

            // Keep the already-materialized machine when running it to the
            // target is cheaper than reloading the checkpoint, provided a
            // reorg has not invalidated it.
            let mut already_newer = false;
            if cursor.output().arb_gas_used + CHECKPOINT_LOAD_GAS_COST >
                closest.output.arb_gas_used
            {
                if messages::is_valid(
                    &tx,
                    &cursor.output().fully_processed_inbox,
                )? {
                    already_newer = true;
                }
            }
            if !already_newer {
                cursor.machine = CursorMachine::Keys(closest);
            }
        }
        self.advance_execution_cursor_impl(
            cursor,
            gas_target,
            go_over_gas,
            cache,
        )
    }

    /// Extract the materialized machine, leaving the cursor keys-only at
    /// the same position.
    pub fn take_execution_cursor_machine(
        &self, cursor: &mut ExecutionCursor, cache: &mut ValueCache,
    ) -> Result<Machine> {
        let tx = self.storage.begin_read();
        self.resolve_cursor_machine(&tx, cursor, cache)?;
        let keys = MachineStateKeys::from_state(match cursor.live_mut() {
            Some(machine) => &machine.machine_state,
            None => return Err(Error::corrupt("cursor failed to resolve")),
        });
        match std::mem::replace(
            &mut cursor.machine,
            CursorMachine::Keys(keys),
        ) {
            CursorMachine::Live(machine) => Ok(*machine),
            CursorMachine::Keys(_) => unreachable!(),
        }
    }

    fn advance_execution_cursor_impl(
        &self, cursor: &mut ExecutionCursor, total_gas_used: U256,
        go_over_gas: bool, cache: &mut ValueCache,
    ) -> Result<()> {
        let mut handle_reorg = true;
        let mut reorg_attempts = 0usize;
        while handle_reorg {
            handle_reorg = false;
            if reorg_attempts > 0 {
                if reorg_attempts % 4 == 0 {
                    warn!(
                        "execution cursor retried through {} reorgs",
                        reorg_attempts
                    );
                }
                if reorg_attempts >= REORG_ATTEMPT_LIMIT {
                    return Err(Error::Busy)
                }
                std::thread::sleep(Duration::from_millis(250));
            }
            reorg_attempts += 1;

            loop {
                let inbox_messages;
                {
                    let tx = self.storage.begin_read();
                    self.resolve_cursor_machine(&tx, cursor, cache)?;

                    let gas_used = cursor.output().arb_gas_used;
                    if gas_used == total_gas_used {
                        break
                    }
                    if go_over_gas && gas_used > total_gas_used {
                        break
                    }
                    if !go_over_gas {
                        let next_cost = cursor
                            .live_mut()
                            .expect("cursor resolved")
                            .next_gas_cost();
                        if gas_used + next_cost > total_gas_used {
                            break
                        }
                    }

                    match messages::read_next_messages(
                        &tx,
                        &cursor.output().fully_processed_inbox,
                        MESSAGE_GROUP_SIZE,
                    ) {
                        Ok(msgs) => inbox_messages = msgs,
                        Err(e) if e.is_not_found() => {
                            // Reorg in progress, rebuild the machine
                            handle_reorg = true;
                            break
                        }
                        Err(e) => {
                            warn!(
                                "error getting messages for execution \
                                 cursor: {}",
                                e
                            );
                            return Err(e)
                        }
                    }
                }

                // Run without holding any snapshot
                let machine = cursor.live_mut().expect("cursor resolved");
                machine.set_context(ExecConfig {
                    inbox_messages,
                    max_gas: Some(total_gas_used),
                    go_over_gas,
                    stop_on_sideload: false,
                });
                let assertion = machine.run();
                if assertion.gas_count.is_zero() {
                    break
                }
            }

            if handle_reorg {
                let tx = self.storage.begin_read();
                let closest =
                    self.closest_checkpoint(&tx, &total_gas_used)?;
                cursor.machine = CursorMachine::Keys(closest);
            }
        }
        Ok(())
    }

    fn resolve_cursor_machine(
        &self, tx: &impl StoreRead, cursor: &mut ExecutionCursor,
        cache: &mut ValueCache,
    ) -> Result<()> {
        if let CursorMachine::Keys(keys) = &cursor.machine {
            let machine = checkpoint::materialize(
                tx,
                keys,
                &self.code,
                self.interp.clone(),
                cache,
            )?;
            cursor.machine = CursorMachine::Live(Box::new(machine));
        }
        Ok(())
    }

    /// Closest checkpoint at or below the gas target. Taken under the
    /// reorg mutex so a concurrent rewind cannot hand out a checkpoint it
    /// is about to delete.
    pub(crate) fn closest_checkpoint(
        &self, tx: &impl StoreRead, total_gas_used: &U256,
    ) -> Result<MachineStateKeys> {
        let _guard = self.reorg_mutex.lock();
        checkpoint::checkpoint_using_gas(tx, total_gas_used, false)
    }

    /// A cloned machine positioned at the end of `block_number` (or the
    /// nearest sideload before it): from the cache when the block is
    /// recent, otherwise checkpoint plus cursor advance.
    pub fn get_machine_for_sideload(
        &self, block_number: &U256, cache: &mut ValueCache,
    ) -> Result<Machine> {
        {
            let sideload_cache = self.sideload_cache.read();
            if let Some((_, machine)) =
                sideload_cache.range(..=*block_number).next_back()
            {
                return Ok(machine.clone())
            }
        }

        let (gas_target, mut cursor) = {
            let tx = self.storage.begin_read();
            let gas = sideload_position(&tx, block_number)?;
            let keys = self.closest_checkpoint(&tx, &gas)?;
            (gas, ExecutionCursor::new(keys))
        };
        self.advance_execution_cursor_impl(
            &mut cursor,
            gas_target,
            false,
            cache,
        )?;
        self.take_execution_cursor_machine(&mut cursor, cache)
    }

    /// Upper bound on sideload cache entries: the eviction window plus the
    /// entry at the tip itself.
    pub fn sideload_cache_capacity() -> u64 {
        SIDELOAD_CACHE_SIZE + 1
    }

    pub fn sideload_cache_len(&self) -> usize {
        self.sideload_cache.read().len()
    }
}

/// Gas at the end of the nearest block at or before `block_number` that
/// carries a sideload marker.
fn sideload_position(
    tx: &impl StoreRead, block_number: &U256,
) -> Result<U256> {
    let mut it = tx.iter(Column::Sideload);
    it.seek_for_prev(&marshal_u256(block_number));
    if !it.valid() {
        it.status()?;
        return Err(Error::NotFound)
    }
    Ok(unmarshal_u256(it.value().ok_or(Error::NotFound)?))
}
