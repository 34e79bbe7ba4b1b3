//! A deliberately tiny interpreter for exercising the engine: every inbox
//! message is a little program (8-byte block number header, then one byte
//! per op), each op costs a flat [GAS_PER_OP], and reading the next
//! message costs one op too. The real instruction set lives outside the
//! engine; this one only needs to produce logs, sends, sideload stops and
//! halts on demand.

use log::debug;

use qavm::common::U256;
use qavm::core::LoadedExecutable;
use qavm::machine::{
    Interpreter, MachineState, Op, StagedMessage, StepOutcome,
};
use qavm::value::{Tuple, Value};

pub const GAS_PER_OP: u64 = 10;

/// Emit a log carrying (messages read, op offset, block number).
pub const OP_LOG: u8 = b'L';
/// Emit the whole message as a send.
pub const OP_SEND: u8 = b'S';
/// End of block: consume the message and stop at a sideload boundary.
pub const OP_BLOCK: u8 = b'B';
/// Halt the machine for good.
pub const OP_HALT: u8 = b'H';

pub struct ScriptInterp;

impl ScriptInterp {
    fn header_block(staged: &StagedMessage) -> U256 {
        if staged.message.len() < 8 {
            return U256::zero()
        }
        u64::from_be_bytes(staged.message[..8].try_into().unwrap()).into()
    }

    fn op_at(staged: &StagedMessage) -> Option<u8> {
        staged
            .message
            .get(8 + staged.ops_consumed as usize)
            .copied()
    }
}

impl Interpreter for ScriptInterp {
    fn next_gas_cost(&self, _state: &MachineState) -> U256 {
        GAS_PER_OP.into()
    }

    fn step(&self, state: &mut MachineState) -> StepOutcome {
        let staged = match &state.staged_message {
            Some(staged) => staged.clone(),
            None => {
                // Fetch the next message, or report starvation
                let msg = match state.context.take_message() {
                    Some(msg) => msg,
                    None => return StepOutcome::Blocked,
                };
                debug!("staging message acc={}", msg.accumulator);
                state.staged_message = Some(StagedMessage {
                    message: msg.message,
                    accumulator: msg.accumulator,
                    ops_consumed: 0,
                });
                state.charge(GAS_PER_OP);
                return StepOutcome::Continue
            }
        };

        state.charge(GAS_PER_OP);
        let op = Self::op_at(&staged);
        if let Some(staged) = state.staged_message.as_mut() {
            staged.ops_consumed += 1;
        }
        match op {
            Some(OP_LOG) => {
                let entry = Value::Tuple(Tuple::new(vec![
                    Value::Int(state.output.fully_processed_inbox.count),
                    Value::Int(staged.ops_consumed.into()),
                    Value::Int(Self::header_block(&staged)),
                ]));
                state.register = entry.clone();
                state.datastack = state.datastack.clone().cons(entry.clone());
                state.context.logs.push(entry);
                StepOutcome::Continue
            }
            Some(OP_SEND) => {
                state.context.sends.push(staged.message.clone());
                StepOutcome::Continue
            }
            Some(OP_BLOCK) => {
                let block = Self::header_block(&staged);
                state.consume_staged();
                StepOutcome::Sideload(block)
            }
            Some(OP_HALT) => {
                state.consume_staged();
                StepOutcome::Halted
            }
            Some(other) => {
                StepOutcome::Errored(format!("bad opcode {:#x}", other))
            }
            None => {
                // Message exhausted without a block marker
                state.consume_staged();
                StepOutcome::Continue
            }
        }
    }
}

/// The boot program handed to [qavm::core::Core::initialize]. The script
/// machine takes its instructions from the messages, so the segment only
/// has to exist (and round-trip through the code index); the immediate
/// gives the restore path something nontrivial to carry.
pub fn script_executable() -> LoadedExecutable {
    LoadedExecutable {
        ops: vec![
            Op {
                opcode: 0x00,
                immediate: None,
            },
            Op {
                opcode: 0x01,
                immediate: Some(Value::Tuple(Tuple::new(vec![
                    Value::Int(U256::from(1u64)),
                    Value::Int(U256::from(2u64)),
                ]))),
            },
        ],
        static_val: Value::Int(U256::from(0x5eed_u64)),
    }
}
