//! Checkpoints: persisted machine states keyed by cumulative gas. A
//! checkpoint row is the serialized [MachineStateKeys] — scalars inline,
//! the four big value roots as hashes into the value store. Deleting a
//! checkpoint releases those roots in the same transaction, so an index
//! entry can never outlive the values it references.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::common::{marshal_u256, unmarshal_u256, Hash, U256};
use crate::error::{Error, Result};
use crate::machine::{
    AssertionContext, Code, CodePointRef, InboxState, Interpreter, Machine,
    MachineOutput, MachineState, MachineStatus, StagedMessage,
};
use crate::storage::valuestore;
use crate::storage::{Column, ReadWriteTransaction, StoreRead};
use crate::value::{take, Value, ValueCache};

/// The persisted form of a machine state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineStateKeys {
    pub register_hash: Hash,
    pub static_hash: Hash,
    pub datastack_hash: Hash,
    pub auxstack_hash: Hash,
    pub arb_gas_remaining: U256,
    pub status: MachineStatus,
    pub pc: CodePointRef,
    pub err_pc: CodePointRef,
    pub staged_message: Option<StagedMessage>,
    pub output: MachineOutput,
}

impl MachineStateKeys {
    pub fn from_state(state: &MachineState) -> Self {
        Self {
            register_hash: state.register.hash(),
            static_hash: state.static_val.hash(),
            datastack_hash: state.datastack.hash().clone(),
            auxstack_hash: state.auxstack.hash().clone(),
            arb_gas_remaining: state.arb_gas_remaining,
            status: state.status,
            pc: state.pc,
            err_pc: state.err_pc,
            staged_message: state.staged_message.clone(),
            output: state.output.clone(),
        }
    }

    pub fn total_messages_read(&self) -> U256 {
        let staged = if self.staged_message.is_some() { 1 } else { 0 };
        self.output.fully_processed_inbox.count + staged
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.register_hash.as_bytes());
        buf.extend_from_slice(self.static_hash.as_bytes());
        buf.extend_from_slice(self.datastack_hash.as_bytes());
        buf.extend_from_slice(self.auxstack_hash.as_bytes());
        buf.extend_from_slice(&marshal_u256(&self.arb_gas_remaining));
        buf.push(self.status as u8);
        buf.extend_from_slice(&self.pc.segment.to_be_bytes());
        buf.extend_from_slice(&self.pc.offset.to_be_bytes());
        buf.extend_from_slice(&self.err_pc.segment.to_be_bytes());
        buf.extend_from_slice(&self.err_pc.offset.to_be_bytes());
        match &self.staged_message {
            Some(staged) => {
                buf.push(1);
                buf.extend_from_slice(staged.accumulator.as_bytes());
                buf.extend_from_slice(&staged.ops_consumed.to_be_bytes());
                buf.extend_from_slice(
                    &(staged.message.len() as u64).to_be_bytes(),
                );
                buf.extend_from_slice(&staged.message);
            }
            None => buf.push(0),
        }
        let out = &self.output;
        buf.extend_from_slice(&marshal_u256(&out.arb_gas_used));
        buf.extend_from_slice(&marshal_u256(&out.log_count));
        buf.extend_from_slice(&marshal_u256(&out.send_count));
        buf.extend_from_slice(&marshal_u256(&out.fully_processed_inbox.count));
        buf.extend_from_slice(out.fully_processed_inbox.accumulator.as_bytes());
        match &out.last_sideload {
            Some(block) => {
                buf.push(1);
                buf.extend_from_slice(&marshal_u256(block));
            }
            None => buf.push(0),
        }
        buf
    }

    pub fn deserialize(mut raw: &[u8]) -> Result<Self> {
        use num_traits::FromPrimitive as _;
        let reader = &mut raw;
        let register_hash = Hash::from_slice(take(reader, 32)?);
        let static_hash = Hash::from_slice(take(reader, 32)?);
        let datastack_hash = Hash::from_slice(take(reader, 32)?);
        let auxstack_hash = Hash::from_slice(take(reader, 32)?);
        let arb_gas_remaining = unmarshal_u256(take(reader, 32)?);
        let status_byte = take(reader, 1)?[0];
        let status = MachineStatus::from_u8(status_byte).ok_or_else(|| {
            Error::corrupt(format!("bad machine status {:#x}", status_byte))
        })?;
        let pc = read_code_point(reader)?;
        let err_pc = read_code_point(reader)?;
        let staged_message = match take(reader, 1)?[0] {
            0 => None,
            1 => {
                let accumulator = Hash::from_slice(take(reader, 32)?);
                let ops_consumed = read_u64(reader)?;
                let len = read_u64(reader)? as usize;
                let message = take(reader, len)?.to_vec().into();
                Some(StagedMessage {
                    message,
                    accumulator,
                    ops_consumed,
                })
            }
            m => {
                return Err(Error::corrupt(format!(
                    "bad staged marker {:#x}",
                    m
                )))
            }
        };
        let arb_gas_used = unmarshal_u256(take(reader, 32)?);
        let log_count = unmarshal_u256(take(reader, 32)?);
        let send_count = unmarshal_u256(take(reader, 32)?);
        let inbox_count = unmarshal_u256(take(reader, 32)?);
        let inbox_acc = Hash::from_slice(take(reader, 32)?);
        let last_sideload = match take(reader, 1)?[0] {
            0 => None,
            1 => Some(unmarshal_u256(take(reader, 32)?)),
            m => {
                return Err(Error::corrupt(format!(
                    "bad sideload marker {:#x}",
                    m
                )))
            }
        };
        if !reader.is_empty() {
            return Err(Error::corrupt("trailing checkpoint bytes"))
        }
        Ok(Self {
            register_hash,
            static_hash,
            datastack_hash,
            auxstack_hash,
            arb_gas_remaining,
            status,
            pc,
            err_pc,
            staged_message,
            output: MachineOutput {
                arb_gas_used,
                log_count,
                send_count,
                fully_processed_inbox: InboxState {
                    count: inbox_count,
                    accumulator: inbox_acc,
                },
                last_sideload,
            },
        })
    }
}

fn read_u64(reader: &mut &[u8]) -> Result<u64> {
    Ok(u64::from_be_bytes(take(reader, 8)?.try_into().unwrap()))
}

fn read_code_point(reader: &mut &[u8]) -> Result<CodePointRef> {
    let segment = read_u64(reader)?;
    let offset = read_u64(reader)?;
    Ok(CodePointRef { segment, offset })
}

/// Persist the machine's value roots (bumping their reference counts) and
/// write the checkpoint row under the gas key.
pub fn save_checkpoint(
    tx: &ReadWriteTransaction, state: &MachineState,
) -> Result<()> {
    valuestore::save_value(tx, &state.register)?;
    valuestore::save_value(tx, &state.static_val)?;
    valuestore::save_value(tx, &Value::Tuple(state.datastack.clone()))?;
    valuestore::save_value(tx, &Value::Tuple(state.auxstack.clone()))?;
    let keys = MachineStateKeys::from_state(state);
    tx.put(
        Column::Checkpoints,
        &marshal_u256(&state.output.arb_gas_used),
        &keys.serialize(),
    )
}

/// Release the four value roots a checkpoint references.
pub fn delete_machine_state(
    tx: &ReadWriteTransaction, keys: &MachineStateKeys,
) -> Result<()> {
    valuestore::delete_value(tx, &keys.register_hash)?;
    valuestore::delete_value(tx, &keys.static_hash)?;
    valuestore::delete_value(tx, &keys.datastack_hash)?;
    valuestore::delete_value(tx, &keys.auxstack_hash)?;
    Ok(())
}

pub fn get_checkpoint(
    tx: &impl StoreRead, arb_gas_used: &U256,
) -> Result<MachineStateKeys> {
    let raw = tx
        .get(Column::Checkpoints, &marshal_u256(arb_gas_used))?
        .ok_or(Error::NotFound)?;
    MachineStateKeys::deserialize(&raw)
}

/// The checkpoint at or before `total_gas` when `after_gas` is false, the
/// one just after it otherwise.
pub fn checkpoint_using_gas(
    tx: &impl StoreRead, total_gas: &U256, after_gas: bool,
) -> Result<MachineStateKeys> {
    let mut it = tx.iter(Column::Checkpoints);
    it.seek_for_prev(&marshal_u256(total_gas));
    if !it.valid() {
        it.status()?;
        return Err(Error::NotFound)
    }
    if after_gas {
        it.next();
        if !it.valid() {
            it.status()?;
            return Err(Error::NotFound)
        }
    }
    MachineStateKeys::deserialize(it.value().ok_or(Error::NotFound)?)
}

pub fn max_checkpoint_gas(tx: &impl StoreRead) -> Result<U256> {
    let mut it = tx.iter(Column::Checkpoints);
    it.seek_to_last();
    if !it.valid() {
        it.status()?;
        return Ok(U256::zero())
    }
    Ok(unmarshal_u256(it.key().ok_or(Error::NotFound)?))
}

pub fn is_checkpoints_empty(tx: &impl StoreRead) -> Result<bool> {
    let mut it = tx.iter(Column::Checkpoints);
    it.seek_to_last();
    if it.valid() {
        return Ok(false)
    }
    it.status()?;
    Ok(true)
}

/// Rebuild a live machine from its persisted keys, restoring any code
/// segments the state references that are not yet loaded.
pub fn materialize(
    tx: &impl StoreRead, keys: &MachineStateKeys, code: &Arc<Code>,
    interp: Arc<dyn Interpreter>, cache: &mut ValueCache,
) -> Result<Machine> {
    let register = valuestore::get_value(tx, &keys.register_hash, cache)?;
    let static_val = valuestore::get_value(tx, &keys.static_hash, cache)?;
    let datastack =
        match valuestore::get_value(tx, &keys.datastack_hash, cache)? {
            Value::Tuple(tup) => tup,
            _ => return Err(Error::corrupt("machine datastack not a tuple")),
        };
    let auxstack =
        match valuestore::get_value(tx, &keys.auxstack_hash, cache)? {
            Value::Tuple(tup) => tup,
            _ => return Err(Error::corrupt("machine auxstack not a tuple")),
        };

    let mut segment_ids = BTreeSet::new();
    segment_ids.insert(keys.pc.segment);
    segment_ids.insert(keys.err_pc.segment);
    collect_segments(&register, &mut segment_ids);
    collect_segments(&static_val, &mut segment_ids);
    collect_segments(&Value::Tuple(datastack.clone()), &mut segment_ids);
    collect_segments(&Value::Tuple(auxstack.clone()), &mut segment_ids);
    restore_segments(tx, code, segment_ids)?;

    let state = MachineState {
        code: code.clone(),
        register,
        static_val,
        datastack,
        auxstack,
        arb_gas_remaining: keys.arb_gas_remaining,
        status: keys.status,
        pc: keys.pc,
        err_pc: keys.err_pc,
        staged_message: keys.staged_message.clone(),
        output: keys.output.clone(),
        context: AssertionContext::default(),
    };
    Ok(Machine::new(state, interp))
}

fn collect_segments(value: &Value, out: &mut BTreeSet<u64>) {
    match value {
        Value::Int(_) => {}
        Value::CodePoint(cp) => {
            out.insert(cp.segment);
        }
        Value::Tuple(tup) => {
            for elem in tup.iter() {
                collect_segments(elem, out);
            }
        }
    }
}

/// Load every referenced segment, chasing code points that appear as
/// instruction immediates into further segments.
fn restore_segments(
    tx: &impl StoreRead, code: &Arc<Code>, mut segment_ids: BTreeSet<u64>,
) -> Result<()> {
    while !segment_ids.is_empty() {
        let mut next_ids = BTreeSet::new();
        for id in segment_ids.iter().rev() {
            if code.contains_segment(*id) {
                continue
            }
            let segment = valuestore::load_code_segment(tx, *id)?;
            for op in &segment.ops {
                if let Some(imm) = &op.immediate {
                    collect_segments(imm, &mut next_ids);
                }
            }
            code.restore_segment(segment);
        }
        segment_ids = next_ids;
    }
    Ok(())
}
