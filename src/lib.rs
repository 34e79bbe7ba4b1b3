//! # qAVM: persistent, reorganizable AVM execution core
//!
//! qAVM is the storage-mediated execution engine for a deterministic
//! stack-based VM: a single long-running executor drives the live machine
//! over an ordered message inbox and emits two append-only output streams
//! (logs and sends) plus per-block sideload machine snapshots. Every
//! sideload boundary also persists a checkpoint — the machine state keyed
//! by cumulative gas — so any past state can be reconstituted, and when
//! the upstream feed rewrites history the engine rewinds to the newest
//! consistent checkpoint, invalidates the outputs past it, and replays
//! forward.
//!
//! The crate deliberately does *not* contain the VM's instruction
//! semantics: those live behind the [machine::Interpreter] seam, the same
//! way the raw message wire format and the network feed live outside the
//! engine. What the crate does own:
//!
//! - [value]: the AVM value model (integers, code points, tuples) with
//!   stable hashing and a shallow marshaled form.
//! - [storage]: the mediator over the embedded ordered key-value store —
//!   column layout, snapshot reads, the single write transaction — and
//!   [storage::valuestore], the content-addressed reference-counted value
//!   persistence plus the append-only code index.
//! - [checkpoint]: machine states in persisted form and the gas-ordered
//!   checkpoint index.
//! - [messages]: the sequencer/delayed message log and its accumulator
//!   chain, including the consistency-checked iteration that doubles as
//!   the engine's reorg detector.
//! - [machine]: the machine state, assertion context, and the plain /
//!   background-capable machine wrappers.
//! - [core]: the executor itself — tick loop, mailbox, reorg protocol,
//!   logs cursors, execution cursors, the sideload cache — and the whole
//!   caller-facing surface.
//!
//! # Data flow
//!
//! ```notrust
//!  feeder --deliver_messages--> [mailbox slot]
//!                                    |
//!                                    v            (single writer)
//!                              [ Executor ] --run--> [ MachineThread ]
//!                                    |                      |
//!                 +------------------+-----------+     assertions
//!                 v                  v           v          |
//!            [messages]        [checkpoints]  [logs|sends|sideloads]
//!                 ^                  ^           ^
//!                 |                  |           |
//!            (snapshots)        (snapshots)  (snapshots)
//!                 |                  |           |
//!          ExecutionCursor   get_machine_for_sideload   LogsCursors
//! ```
//!
//! Readers never block the executor: logs cursors, execution cursors and
//! sideload lookups all operate on store snapshots, and the only shared
//! exclusion is the reorg mutex that keeps "closest checkpoint" answers
//! from racing checkpoint deletion.

pub mod checkpoint;
pub mod common;
pub mod core;
pub mod error;
pub mod machine;
pub mod messages;
pub mod storage;
pub mod value;
