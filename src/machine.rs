//! Machine-side contract of the engine: the persisted machine state, the
//! assertion context an execution run accumulates into, the [Interpreter]
//! seam behind which the instruction semantics live, and the two machine
//! flavors from the design notes: the plain [Machine] held by execution
//! cursors and the background-capable [MachineThread] held by the executor.

use log::warn;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use parking_lot::{Mutex, RwLock};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::common::{Bytes, Hash, U256};
use crate::value::{Tuple, Value};

/// One instruction of a code segment. The engine never interprets opcodes
/// itself; it only persists and reloads them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Op {
    pub opcode: u8,
    pub immediate: Option<Value>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeSegment {
    pub id: u64,
    pub ops: Vec<Op>,
}

/// In-memory view of the append-only code index, shared between the live
/// machine and every cursor-materialized machine. Segments are restored
/// lazily when a checkpoint referencing them is loaded.
pub struct Code {
    segments: RwLock<HashMap<u64, Arc<CodeSegment>>>,
    next_segment: AtomicU64,
}

impl Code {
    pub fn new(next_segment: u64) -> Self {
        Self {
            segments: RwLock::new(HashMap::new()),
            next_segment: AtomicU64::new(next_segment),
        }
    }

    pub fn add_segment(&self, ops: Vec<Op>) -> Arc<CodeSegment> {
        let id = self.next_segment.fetch_add(1, Ordering::SeqCst);
        let segment = Arc::new(CodeSegment { id, ops });
        self.segments.write().insert(id, segment.clone());
        segment
    }

    pub fn restore_segment(&self, segment: CodeSegment) {
        self.segments.write().insert(segment.id, Arc::new(segment));
    }

    pub fn contains_segment(&self, id: u64) -> bool {
        self.segments.read().contains_key(&id)
    }

    pub fn segment(&self, id: u64) -> Option<Arc<CodeSegment>> {
        self.segments.read().get(&id).cloned()
    }

    pub fn op(&self, pc: &CodePointRef) -> Option<Op> {
        self.segment(pc.segment)?.ops.get(pc.offset as usize).cloned()
    }
}

/// Program counter into the code index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CodePointRef {
    pub segment: u64,
    pub offset: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum MachineStatus {
    Running = 0,
    /// Waiting on an inbox message that has not arrived yet.
    Blocked = 1,
    Halted = 2,
    Errored = 3,
}

/// The machine's progress through the inbox: `count` messages fully
/// consumed, `accumulator` the chain hash at message `count - 1`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InboxState {
    pub count: U256,
    pub accumulator: Hash,
}

/// Cumulative counters published by the machine after every assertion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MachineOutput {
    pub arb_gas_used: U256,
    pub log_count: U256,
    pub send_count: U256,
    pub fully_processed_inbox: InboxState,
    pub last_sideload: Option<U256>,
}

/// A message the machine has peeked at but not yet counted into its
/// fully-processed inbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagedMessage {
    pub message: Bytes,
    pub accumulator: Hash,
    /// How far into the message the interpreter has progressed.
    pub ops_consumed: u64,
}

/// An inbox message paired with the accumulator it extends the chain to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineMessage {
    pub message: Bytes,
    pub accumulator: Hash,
}

/// External stop conditions for one execution run.
#[derive(Clone, Debug, Default)]
pub struct ExecConfig {
    pub inbox_messages: Vec<MachineMessage>,
    pub max_gas: Option<U256>,
    pub go_over_gas: bool,
    pub stop_on_sideload: bool,
}

/// Scratch state of the run in progress: the fed messages, the outputs
/// accumulated since the last assertion was drained, and the stop
/// conditions. Lives inside [MachineState] so a continued run picks up
/// exactly where the previous one left off.
#[derive(Clone, Debug, Default)]
pub struct AssertionContext {
    pub inbox_messages: Vec<MachineMessage>,
    pub next_message: usize,
    pub logs: Vec<Value>,
    pub sends: Vec<Bytes>,
    pub sideload_block: Option<U256>,
    pub gas_used: U256,
    pub steps: u64,
    pub max_gas: Option<U256>,
    pub go_over_gas: bool,
    pub stop_on_sideload: bool,
    pub error_message: Option<String>,
}

impl AssertionContext {
    pub fn new(config: ExecConfig) -> Self {
        Self {
            inbox_messages: config.inbox_messages,
            max_gas: config.max_gas,
            go_over_gas: config.go_over_gas,
            stop_on_sideload: config.stop_on_sideload,
            ..Default::default()
        }
    }

    pub fn peek_message(&self) -> Option<&MachineMessage> {
        self.inbox_messages.get(self.next_message)
    }

    pub fn take_message(&mut self) -> Option<MachineMessage> {
        let msg = self.inbox_messages.get(self.next_message)?.clone();
        self.next_message += 1;
        Some(msg)
    }
}

/// One atomic batch of machine output.
#[derive(Clone, Debug, Default)]
pub struct Assertion {
    pub logs: Vec<Value>,
    pub sends: Vec<Bytes>,
    pub sideload_block_number: Option<U256>,
    pub gas_count: U256,
    pub step_count: u64,
}

/// What one interpreter step did to the machine.
#[derive(Debug)]
pub enum StepOutcome {
    Continue,
    /// The machine reached a block boundary and may be forked for views.
    Sideload(U256),
    /// The next instruction needs an inbox message that is not available.
    Blocked,
    Halted,
    Errored(String),
}

/// The instruction semantics, supplied by the embedder. Implementations
/// charge gas through [MachineState::charge], read messages through the
/// context, and report message completion via
/// [MachineState::consume_staged].
pub trait Interpreter: Send + Sync + 'static {
    /// Gas cost of the instruction the machine would execute next.
    fn next_gas_cost(&self, state: &MachineState) -> U256;
    fn step(&self, state: &mut MachineState) -> StepOutcome;
}

#[derive(Clone)]
pub struct MachineState {
    pub code: Arc<Code>,
    pub register: Value,
    pub static_val: Value,
    pub datastack: Tuple,
    pub auxstack: Tuple,
    pub arb_gas_remaining: U256,
    pub status: MachineStatus,
    pub pc: CodePointRef,
    pub err_pc: CodePointRef,
    pub staged_message: Option<StagedMessage>,
    pub output: MachineOutput,
    pub context: AssertionContext,
}

impl MachineState {
    pub fn new(code: Arc<Code>, static_val: Value) -> Self {
        Self {
            code,
            register: Value::none(),
            static_val,
            datastack: Tuple::empty(),
            auxstack: Tuple::empty(),
            arb_gas_remaining: U256::MAX,
            status: MachineStatus::Running,
            pc: CodePointRef::default(),
            err_pc: CodePointRef::default(),
            staged_message: None,
            output: MachineOutput::default(),
            context: AssertionContext::default(),
        }
    }

    /// Messages the machine depends on: fully consumed plus any staged.
    pub fn total_messages_read(&self) -> U256 {
        let staged = if self.staged_message.is_some() { 1 } else { 0 };
        self.output.fully_processed_inbox.count + staged
    }

    pub fn charge(&mut self, gas: u64) {
        self.context.gas_used = self.context.gas_used + gas;
        self.arb_gas_remaining =
            self.arb_gas_remaining.saturating_sub(gas.into());
    }

    /// Count the staged message into the fully-processed inbox.
    pub fn consume_staged(&mut self) {
        if let Some(staged) = self.staged_message.take() {
            let inbox = &mut self.output.fully_processed_inbox;
            inbox.count = inbox.count + 1;
            inbox.accumulator = staged.accumulator;
        }
    }
}

/// A machine the caller drives synchronously. Cursors and the sideload
/// cache hold these; cloning forks the whole state cheaply (tuples and
/// code are shared).
#[derive(Clone)]
pub struct Machine {
    pub machine_state: MachineState,
    interp: Arc<dyn Interpreter>,
}

impl Machine {
    pub fn new(machine_state: MachineState, interp: Arc<dyn Interpreter>) -> Self {
        Self {
            machine_state,
            interp,
        }
    }

    pub fn interp(&self) -> Arc<dyn Interpreter> {
        self.interp.clone()
    }

    pub fn output(&self) -> &MachineOutput {
        &self.machine_state.output
    }

    pub fn next_gas_cost(&self) -> U256 {
        self.interp.next_gas_cost(&self.machine_state)
    }

    /// Install a fresh run context. A machine that was blocked on input
    /// becomes runnable again; whether input actually arrived is decided
    /// by the next run. Context messages start at the fully-processed
    /// count, so a staged message is already covered by the first entry
    /// and must not be consumed twice.
    pub fn set_context(&mut self, config: ExecConfig) {
        if self.machine_state.status == MachineStatus::Blocked {
            self.machine_state.status = MachineStatus::Running;
        }
        let mut context = AssertionContext::new(config);
        if self.machine_state.staged_message.is_some() {
            context.next_message = 1;
        }
        self.machine_state.context = context;
    }

    /// Run until a stop condition from the context is hit, then drain the
    /// accumulated outputs into an [Assertion] and fold its counters into
    /// the machine output.
    pub fn run(&mut self) -> Assertion {
        self.run_abortable(None)
    }

    pub(crate) fn run_abortable(
        &mut self, abort: Option<&AtomicBool>,
    ) -> Assertion {
        loop {
            if let Some(flag) = abort {
                if flag.load(Ordering::SeqCst) {
                    break
                }
            }
            match self.machine_state.status {
                MachineStatus::Halted |
                MachineStatus::Errored |
                MachineStatus::Blocked => break,
                MachineStatus::Running => {}
            }
            let ctx = &self.machine_state.context;
            if let Some(max_gas) = ctx.max_gas {
                let total =
                    self.machine_state.output.arb_gas_used + ctx.gas_used;
                if ctx.go_over_gas {
                    if total >= max_gas {
                        break
                    }
                } else if total + self.next_gas_cost() > max_gas {
                    break
                }
            }
            match self.interp.step(&mut self.machine_state) {
                StepOutcome::Continue => {
                    self.machine_state.context.steps += 1;
                }
                StepOutcome::Sideload(block) => {
                    self.machine_state.context.steps += 1;
                    self.machine_state.context.sideload_block = Some(block);
                    if self.machine_state.context.stop_on_sideload {
                        break
                    }
                }
                StepOutcome::Blocked => {
                    self.machine_state.status = MachineStatus::Blocked;
                    break
                }
                StepOutcome::Halted => {
                    self.machine_state.status = MachineStatus::Halted;
                    break
                }
                StepOutcome::Errored(msg) => {
                    warn!("machine errored: {}", msg);
                    self.machine_state.context.error_message = Some(msg);
                    self.machine_state.status = MachineStatus::Errored;
                    break
                }
            }
        }

        let ctx = &mut self.machine_state.context;
        let assertion = Assertion {
            logs: std::mem::take(&mut ctx.logs),
            sends: std::mem::take(&mut ctx.sends),
            sideload_block_number: ctx.sideload_block.take(),
            gas_count: std::mem::take(&mut ctx.gas_used),
            step_count: std::mem::take(&mut ctx.steps),
        };
        let output = &mut self.machine_state.output;
        output.arb_gas_used = output.arb_gas_used + assertion.gas_count;
        output.log_count = output.log_count + assertion.logs.len();
        output.send_count = output.send_count + assertion.sends.len();
        if let Some(block) = &assertion.sideload_block_number {
            output.last_sideload = Some(*block);
        }
        assertion
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum MachineThreadStatus {
    None = 0,
    Running = 1,
    Success = 2,
    Aborted = 3,
    Error = 4,
}

/// Background-capable wrapper around [Machine]. A run executes on its own
/// worker thread; the owner polls [MachineThread::status] and collects the
/// produced assertion once the run finished.
pub struct MachineThread {
    idle_machine: Option<Machine>,
    slot: Arc<Mutex<Option<Machine>>>,
    status: Arc<AtomicU8>,
    abort: Arc<AtomicBool>,
    assertion: Arc<Mutex<Option<Assertion>>>,
    error_string: Arc<Mutex<String>>,
    reorg_data: Arc<RwLock<InboxState>>,
    handle: Option<JoinHandle<()>>,
}

impl MachineThread {
    pub fn new(machine: Machine) -> Self {
        let reorg_data =
            machine.machine_state.output.fully_processed_inbox.clone();
        Self {
            idle_machine: Some(machine),
            slot: Arc::new(Mutex::new(None)),
            status: Arc::new(AtomicU8::new(MachineThreadStatus::None as u8)),
            abort: Arc::new(AtomicBool::new(false)),
            assertion: Arc::new(Mutex::new(None)),
            error_string: Arc::new(Mutex::new(String::new())),
            reorg_data: Arc::new(RwLock::new(reorg_data)),
            handle: None,
        }
    }

    pub fn status(&self) -> MachineThreadStatus {
        MachineThreadStatus::from_u8(self.status.load(Ordering::SeqCst))
            .expect("invalid machine thread status")
    }

    /// Start a background run with a fresh context. Returns false if a run
    /// is already in flight.
    pub fn run_machine(&mut self, config: ExecConfig) -> bool {
        self.collect();
        let machine = match self.idle_machine.as_mut() {
            Some(machine) => machine,
            None => return false,
        };
        machine.set_context(config);
        self.spawn()
    }

    /// Resume after a sideload stop, keeping the unconsumed tail of the
    /// previous context.
    pub fn continue_running(&mut self) -> bool {
        self.collect();
        if self.idle_machine.is_none() {
            return false
        }
        self.spawn()
    }

    fn spawn(&mut self) -> bool {
        let mut machine = match self.idle_machine.take() {
            Some(machine) => machine,
            None => return false,
        };
        self.status
            .store(MachineThreadStatus::Running as u8, Ordering::SeqCst);
        self.abort.store(false, Ordering::SeqCst);
        let slot = self.slot.clone();
        let status = self.status.clone();
        let abort = self.abort.clone();
        let assertion_slot = self.assertion.clone();
        let error_string = self.error_string.clone();
        let reorg_data = self.reorg_data.clone();
        self.handle = Some(std::thread::spawn(move || {
            let assertion = machine.run_abortable(Some(abort.as_ref()));
            *reorg_data.write() =
                machine.machine_state.output.fully_processed_inbox.clone();
            let final_status = if abort.load(Ordering::SeqCst) {
                MachineThreadStatus::Aborted
            } else if machine.machine_state.status == MachineStatus::Errored {
                *error_string.lock() = machine
                    .machine_state
                    .context
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "machine error".to_string());
                MachineThreadStatus::Error
            } else {
                MachineThreadStatus::Success
            };
            *assertion_slot.lock() = Some(assertion);
            *slot.lock() = Some(machine);
            status.store(final_status as u8, Ordering::SeqCst);
        }));
        true
    }

    /// Take the assertion of a finished run, resetting status to None.
    pub fn next_assertion(&mut self) -> Assertion {
        self.collect();
        let assertion = self.assertion.lock().take().unwrap_or_default();
        if self.status() == MachineThreadStatus::Success {
            self.status
                .store(MachineThreadStatus::None as u8, Ordering::SeqCst);
        }
        assertion
    }

    /// Stop any in-flight run and reclaim the machine.
    pub fn abort(&mut self) {
        self.abort.store(true, Ordering::SeqCst);
        let was_running = self.handle.is_some();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.collect();
        if was_running {
            self.status
                .store(MachineThreadStatus::Aborted as u8, Ordering::SeqCst);
        }
        self.abort.store(false, Ordering::SeqCst);
    }

    /// Reset an aborted or errored thread so the machine can restart.
    pub fn clear_error(&mut self) -> Option<String> {
        match self.status() {
            MachineThreadStatus::Aborted | MachineThreadStatus::Error => {
                let msg = std::mem::take(&mut *self.error_string.lock());
                self.status
                    .store(MachineThreadStatus::None as u8, Ordering::SeqCst);
                if msg.is_empty() {
                    None
                } else {
                    Some(msg)
                }
            }
            _ => None,
        }
    }

    pub fn error_string(&self) -> String {
        self.error_string.lock().clone()
    }

    /// Inbox progress as of the last completed run; safe to read while a
    /// run is in flight.
    pub fn get_reorg_data(&self) -> InboxState {
        self.reorg_data.read().clone()
    }

    /// The wrapped machine, available whenever no run is in flight.
    pub fn machine(&mut self) -> Option<&Machine> {
        self.collect();
        self.idle_machine.as_ref()
    }

    fn collect(&mut self) {
        if self.status() == MachineThreadStatus::Running {
            return
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        if let Some(machine) = self.slot.lock().take() {
            self.idle_machine = Some(machine);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TenGasNoop;

    impl Interpreter for TenGasNoop {
        fn next_gas_cost(&self, _state: &MachineState) -> U256 {
            10u64.into()
        }

        fn step(&self, state: &mut MachineState) -> StepOutcome {
            state.charge(10);
            if state.output.arb_gas_used + state.context.gas_used >=
                100u64.into()
            {
                return StepOutcome::Halted
            }
            StepOutcome::Continue
        }
    }

    fn machine() -> Machine {
        let code = Arc::new(Code::new(0));
        Machine::new(
            MachineState::new(code, Value::none()),
            Arc::new(TenGasNoop),
        )
    }

    #[test]
    fn run_respects_gas_ceiling_without_go_over() {
        let mut mach = machine();
        mach.set_context(ExecConfig {
            max_gas: Some(35u64.into()),
            ..Default::default()
        });
        let assertion = mach.run();
        assert_eq!(assertion.gas_count, 30u64.into());
        assert_eq!(mach.output().arb_gas_used, 30u64.into());
        assert_eq!(mach.machine_state.status, MachineStatus::Running);
    }

    #[test]
    fn run_goes_over_gas_when_asked() {
        let mut mach = machine();
        mach.set_context(ExecConfig {
            max_gas: Some(35u64.into()),
            go_over_gas: true,
            ..Default::default()
        });
        let assertion = mach.run();
        assert_eq!(assertion.gas_count, 40u64.into());
    }

    #[test]
    fn halted_machine_stops_for_good() {
        let mut mach = machine();
        mach.set_context(ExecConfig::default());
        let assertion = mach.run();
        assert_eq!(assertion.gas_count, 100u64.into());
        assert_eq!(mach.machine_state.status, MachineStatus::Halted);
        mach.set_context(ExecConfig::default());
        assert_eq!(mach.run().gas_count, U256::zero());
    }

    #[test]
    fn machine_thread_round_trip() {
        let mut thread = MachineThread::new(machine());
        assert!(thread.run_machine(ExecConfig {
            max_gas: Some(50u64.into()),
            ..Default::default()
        }));
        while thread.status() == MachineThreadStatus::Running {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(thread.status(), MachineThreadStatus::Success);
        let assertion = thread.next_assertion();
        assert_eq!(assertion.gas_count, 50u64.into());
        assert_eq!(thread.status(), MachineThreadStatus::None);
        assert_eq!(
            thread.machine().unwrap().output().arb_gas_used,
            50u64.into()
        );
    }
}
