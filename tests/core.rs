//! End-to-end engine runs: boot, append, outputs, counters, the mailbox
//! protocol and the logs cursor happy path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use qavm::common::{Bytes, Hash, U256};
use qavm::core::{Core, MessageStatus};
use qavm::messages::{sequencer_item_acc, InboxItem};
use qavm::value::{Tuple, Value, ValueCache};
use qavm_tools::{script_executable, script_message, ScriptInterp, TestDb};

fn start_core(name: &str) -> (TestDb, Arc<Core>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let db = TestDb::open(name);
    let core =
        Core::new(db.storage.clone(), Arc::new(ScriptInterp), 1).unwrap();
    core.initialize(script_executable()).unwrap();
    core.start_thread();
    (db, core)
}

fn deliver(
    core: &Arc<Core>, items: Vec<InboxItem>, prev_acc: Hash,
    reorg: Option<U256>,
) -> MessageStatus {
    assert!(core.deliver_messages(items, prev_acc, true, reorg));
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = core.messages_status();
        if status != MessageStatus::Ready {
            return status
        }
        assert!(Instant::now() < deadline, "mailbox never drained");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn wait_idle(core: &Arc<Core>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !core.machine_idle() {
        assert!(Instant::now() < deadline, "machine never went idle");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn log_entry(count: u64, op: u64, block: u64) -> Value {
    Value::Tuple(Tuple::new(vec![
        Value::Int(count.into()),
        Value::Int(op.into()),
        Value::Int(block.into()),
    ]))
}

#[test]
fn fresh_init_reaches_idle_with_genesis_checkpoint() {
    let (_db, core) = start_core("core-fresh-init");
    wait_idle(&core);

    assert!(core.initialized());
    assert!(!core.is_checkpoints_empty().unwrap());
    assert_eq!(core.max_checkpoint_gas().unwrap(), U256::zero());
    assert_eq!(core.log_inserted_count().unwrap(), U256::zero());
    assert_eq!(core.send_inserted_count().unwrap(), U256::zero());
    assert_eq!(core.message_entry_inserted_count().unwrap(), U256::zero());
    assert_eq!(core.machine_messages_read(), U256::zero());
    core.abort_thread();
}

#[test]
fn happy_append_produces_logs_sends_and_a_checkpoint() {
    let (_db, core) = start_core("core-happy-append");
    let m1 = script_message(1, "L");
    let m2 = script_message(1, "S");
    let m3 = script_message(1, "LB");
    let items = vec![
        InboxItem::Sequencer(m1.clone()),
        InboxItem::Sequencer(m2.clone()),
        InboxItem::Sequencer(m3.clone()),
    ];
    assert_eq!(
        deliver(&core, items, Hash::zero().clone(), None),
        MessageStatus::Success
    );
    wait_idle(&core);

    let mut cache = ValueCache::new(1, 0);
    assert_eq!(core.log_inserted_count().unwrap(), 2u64.into());
    assert_eq!(
        core.get_logs(U256::zero(), 2u64.into(), &mut cache).unwrap(),
        vec![log_entry(0, 0, 1), log_entry(2, 0, 1)]
    );
    assert_eq!(core.send_inserted_count().unwrap(), 1u64.into());
    assert_eq!(
        core.get_sends(U256::zero(), 1u64.into()).unwrap(),
        vec![m2.clone()]
    );
    assert_eq!(core.message_entry_inserted_count().unwrap(), 3u64.into());
    assert_eq!(core.machine_messages_read(), 3u64.into());
    assert_eq!(core.max_checkpoint_gas().unwrap(), 90u64.into());

    // Stored accumulators equal the recomputed chain
    let a0 = sequencer_item_acc(Hash::zero(), &m1);
    let a1 = sequencer_item_acc(&a0, &m2);
    let a2 = sequencer_item_acc(&a1, &m3);
    assert_eq!(core.get_inbox_acc(U256::zero()).unwrap(), a0);
    assert_eq!(
        core.get_inbox_acc_pair(1u64.into(), 2u64.into()).unwrap(),
        (a1.clone(), a2)
    );
    assert_eq!(
        core.get_messages(U256::zero(), 3u64.into()).unwrap(),
        vec![m1, m2, m3]
    );

    // The pre-sideload machine is served from the cache
    let machine = core
        .get_machine_for_sideload(&1u64.into(), &mut cache)
        .unwrap();
    assert_eq!(machine.output().last_sideload, Some(1u64.into()));
    assert_eq!(machine.output().arb_gas_used, 90u64.into());
    core.abort_thread();
}

#[test]
fn delayed_messages_fill_one_slot_each() {
    let (_db, core) = start_core("core-delayed");
    let m0 = script_message(1, "LB");
    let d0 = script_message(2, "L");
    let d1 = script_message(2, "S");
    let m3 = script_message(2, "B");
    let items = vec![
        InboxItem::Sequencer(m0.clone()),
        InboxItem::Delayed(vec![d0.clone(), d1.clone()]),
        InboxItem::Sequencer(m3.clone()),
    ];
    assert_eq!(
        deliver(&core, items, Hash::zero().clone(), None),
        MessageStatus::Success
    );
    wait_idle(&core);

    assert_eq!(core.message_entry_inserted_count().unwrap(), 4u64.into());
    assert_eq!(
        core.get_messages(U256::zero(), 4u64.into()).unwrap(),
        vec![m0, d0, d1.clone(), m3]
    );

    // Both messages of the delayed run share the item's accumulator
    let (acc1, acc2) =
        core.get_inbox_acc_pair(1u64.into(), 2u64.into()).unwrap();
    assert_eq!(acc1, acc2);
    assert_ne!(acc1, core.get_inbox_acc(U256::zero()).unwrap());

    let mut cache = ValueCache::new(1, 0);
    assert_eq!(
        core.get_logs(U256::zero(), 10u64.into(), &mut cache).unwrap(),
        vec![log_entry(0, 0, 1), log_entry(1, 0, 2)]
    );
    assert_eq!(
        core.get_sends(U256::zero(), 1u64.into()).unwrap(),
        vec![d1]
    );
    assert_eq!(core.max_checkpoint_gas().unwrap(), 110u64.into());
    assert_eq!(core.machine_messages_read(), 4u64.into());
    core.abort_thread();
}

#[test]
fn trigger_save_checkpoint_persists_the_current_state() {
    let (_db, core) = start_core("core-trigger-checkpoint");
    assert_eq!(
        deliver(
            &core,
            vec![InboxItem::Sequencer(script_message(1, "L"))],
            Hash::zero().clone(),
            None,
        ),
        MessageStatus::Success
    );
    wait_idle(&core);

    // No sideload boundary, so no checkpoint beyond genesis yet
    assert_eq!(core.max_checkpoint_gas().unwrap(), U256::zero());
    core.trigger_save_checkpoint().unwrap();
    assert_eq!(core.max_checkpoint_gas().unwrap(), 30u64.into());
    core.abort_thread();
}

#[test]
fn halted_machine_goes_idle_and_stays_there() {
    let (_db, core) = start_core("core-halt");
    assert_eq!(
        deliver(
            &core,
            vec![InboxItem::Sequencer(script_message(1, "H"))],
            Hash::zero().clone(),
            None,
        ),
        MessageStatus::Success
    );
    wait_idle(&core);
    assert_eq!(core.machine_messages_read(), 1u64.into());

    // More messages still append to the log, but the machine is done
    let prev = core.get_inbox_acc(U256::zero()).unwrap();
    assert_eq!(
        deliver(
            &core,
            vec![InboxItem::Sequencer(script_message(2, "L"))],
            prev,
            None,
        ),
        MessageStatus::Success
    );
    wait_idle(&core);
    assert_eq!(core.message_entry_inserted_count().unwrap(), 2u64.into());
    assert_eq!(core.machine_messages_read(), 1u64.into());
    assert_eq!(core.log_inserted_count().unwrap(), U256::zero());
    core.abort_thread();
}

#[test]
fn reads_past_the_tail() {
    let (_db, core) = start_core("core-boundaries");
    wait_idle(&core);

    let mut cache = ValueCache::new(1, 0);
    assert!(core
        .get_logs(100u64.into(), 5u64.into(), &mut cache)
        .unwrap()
        .is_empty());
    assert!(core
        .get_logs(U256::zero(), U256::zero(), &mut cache)
        .unwrap()
        .is_empty());
    assert!(core
        .get_sends(100u64.into(), 5u64.into())
        .unwrap_err()
        .is_not_found());
    assert!(core.get_inbox_acc(U256::zero()).unwrap_err().is_not_found());
    core.abort_thread();
}

#[test]
fn unknown_previous_accumulator_needs_older_messages() {
    let (_db, core) = start_core("core-need-older");
    assert_eq!(
        deliver(
            &core,
            vec![InboxItem::Sequencer(script_message(1, "L"))],
            Hash::hash(b"nobody chained from this"),
            None,
        ),
        MessageStatus::NeedOlder
    );
    assert_eq!(core.messages_clear_error(), String::new());

    // A correctly chained batch is accepted afterwards
    assert_eq!(
        deliver(
            &core,
            vec![InboxItem::Sequencer(script_message(1, "L"))],
            Hash::zero().clone(),
            None,
        ),
        MessageStatus::Success
    );
    wait_idle(&core);
    assert_eq!(core.message_entry_inserted_count().unwrap(), 1u64.into());
    core.abort_thread();
}

#[test]
fn mailbox_slot_accepts_one_batch_at_a_time() {
    let (_db, core) = start_core("core-mailbox");
    let msg = Bytes::from(&b"unused"[..]);
    assert!(core.deliver_messages(
        vec![InboxItem::Sequencer(script_message(1, "L"))],
        Hash::zero().clone(),
        true,
        None,
    ));
    // Slot is occupied until the executor reports back
    assert!(!core.deliver_messages(
        vec![InboxItem::Sequencer(msg)],
        Hash::zero().clone(),
        true,
        None,
    ));
    core.abort_thread();
}

#[test]
fn output_digests_and_direct_machine_load() {
    let (_db, core) = start_core("core-digests");
    let items = (1..=5u64)
        .map(|block| InboxItem::Sequencer(script_message(block, "LSB")))
        .collect();
    assert_eq!(
        deliver(&core, items, Hash::zero().clone(), None),
        MessageStatus::Success
    );
    wait_idle(&core);
    assert_eq!(core.log_inserted_count().unwrap(), 5u64.into());
    assert_eq!(core.send_inserted_count().unwrap(), 5u64.into());

    // The log digest equals the chain recomputed over the fetched range
    let mut cache = ValueCache::new(1, 0);
    let logs = core
        .get_logs(U256::zero(), 5u64.into(), &mut cache)
        .unwrap();
    let mut expected = Hash::zero().clone();
    for log in &logs {
        expected = expected.chain(&log.hash());
    }
    assert_eq!(
        core.get_log_acc(
            Hash::zero().clone(),
            U256::zero(),
            5u64.into(),
            &mut cache,
        )
        .unwrap(),
        expected
    );

    // Digests compose: a partial digest extends to the full one
    let head = core
        .get_log_acc(
            Hash::zero().clone(),
            U256::zero(),
            2u64.into(),
            &mut cache,
        )
        .unwrap();
    assert_eq!(
        core.get_log_acc(head, 2u64.into(), 3u64.into(), &mut cache)
            .unwrap(),
        expected
    );

    // Same law for sends
    let sends = core.get_sends(U256::zero(), 5u64.into()).unwrap();
    let mut expected = Hash::zero().clone();
    for send in &sends {
        expected = expected.chain(&Hash::hash(send));
    }
    assert_eq!(
        core.get_send_acc(Hash::zero().clone(), U256::zero(), 5u64.into())
            .unwrap(),
        expected
    );
    let head = core
        .get_send_acc(Hash::zero().clone(), U256::zero(), 3u64.into())
        .unwrap();
    assert_eq!(
        core.get_send_acc(head, 3u64.into(), 2u64.into()).unwrap(),
        expected
    );

    // A machine loads directly from a checkpoint key (40 gas per message,
    // one checkpoint per block boundary)
    let machine = core.get_machine_at(&80u64.into(), &mut cache).unwrap();
    assert_eq!(machine.output().arb_gas_used, 80u64.into());
    assert_eq!(
        machine.output().fully_processed_inbox.count,
        2u64.into()
    );
    assert_eq!(machine.output().last_sideload, Some(2u64.into()));

    // The key is exact; off-checkpoint gas is not found
    assert!(core
        .get_machine_at(&81u64.into(), &mut cache)
        .unwrap_err()
        .is_not_found());
    core.abort_thread();
}

#[test]
fn logs_cursor_streams_new_logs() {
    let (_db, core) = start_core("core-logs-cursor");
    assert!(core.logs_cursor_request(0, 10u64.into()));
    assert!(!core.logs_cursor_request(0, 10u64.into()));

    assert_eq!(
        deliver(
            &core,
            vec![InboxItem::Sequencer(script_message(1, "LLB"))],
            Hash::zero().clone(),
            None,
        ),
        MessageStatus::Success
    );
    wait_idle(&core);

    let deadline = Instant::now() + Duration::from_secs(10);
    let delivery = loop {
        if let Some(delivery) = core.logs_cursor_get_logs(0).unwrap() {
            break delivery
        }
        assert!(Instant::now() < deadline, "cursor never became ready");
        std::thread::sleep(Duration::from_millis(2));
    };
    assert_eq!(delivery.first_log_index, U256::zero());
    assert_eq!(delivery.logs, vec![log_entry(0, 0, 1), log_entry(0, 1, 1)]);
    assert!(delivery.deleted_logs.is_empty());

    assert!(core.logs_cursor_confirm_received(0));
    assert_eq!(core.logs_cursor_position(0).unwrap(), 2u64.into());
    assert!(!core.logs_cursor_check_error(0));
    core.abort_thread();
}
