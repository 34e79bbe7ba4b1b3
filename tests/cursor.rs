//! Execution cursors and sideload service: gas-target positioning, the
//! go-over-gas boundary, checkpoint reuse, cache eviction and the busy
//! path through persistent reorgs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use qavm::common::{Hash, U256};
use qavm::core::{Core, MessageStatus};
use qavm::error::Error;
use qavm::messages::{self, InboxItem};
use qavm::value::ValueCache;
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
) -> MessageStatus {
    assert!(core.deliver_messages(items, prev_acc, true, None));
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

fn block_messages(blocks: std::ops::RangeInclusive<u64>) -> Vec<InboxItem> {
    blocks
        .map(|block| InboxItem::Sequencer(script_message(block, "LB")))
        .collect()
}

#[test]
fn cursor_lands_at_or_before_the_gas_target() {
    let (_db, core) = start_core("cursor-basic");
    assert_eq!(
        deliver(&core, block_messages(1..=10), Hash::zero().clone()),
        MessageStatus::Success
    );
    wait_idle(&core);
    assert_eq!(core.max_checkpoint_gas().unwrap(), 300u64.into());

    let mut cache = ValueCache::new(2, 0);
    let mut cursor = core.get_execution_cursor(75u64.into(), &mut cache).unwrap();
    assert_eq!(cursor.output().arb_gas_used, 70u64.into());
    assert_eq!(cursor.output().fully_processed_inbox.count, 2u64.into());

    // Without go-over the cursor stops before the overshooting instruction
    core.advance_execution_cursor(&mut cursor, 20u64.into(), false, &mut cache)
        .unwrap();
    assert_eq!(cursor.output().arb_gas_used, 90u64.into());

    // With go-over it stops just past the target
    core.advance_execution_cursor(&mut cursor, 15u64.into(), true, &mut cache)
        .unwrap();
    assert_eq!(cursor.output().arb_gas_used, 110u64.into());

    // Taking the machine leaves a keys-only cursor at the same position
    let machine = core
        .take_execution_cursor_machine(&mut cursor, &mut cache)
        .unwrap();
    assert_eq!(machine.output().arb_gas_used, 110u64.into());
    assert_eq!(cursor.output().arb_gas_used, 110u64.into());
    core.abort_thread();
}

#[test]
fn cursor_at_genesis_and_past_the_tip() {
    let (_db, core) = start_core("cursor-bounds");
    assert_eq!(
        deliver(&core, block_messages(1..=3), Hash::zero().clone()),
        MessageStatus::Success
    );
    wait_idle(&core);

    let mut cache = ValueCache::new(2, 0);
    let cursor = core.get_execution_cursor(U256::zero(), &mut cache).unwrap();
    assert_eq!(cursor.output().arb_gas_used, U256::zero());
    assert_eq!(cursor.output().fully_processed_inbox.count, U256::zero());

    // A target past everything executed parks at the machine tip
    let cursor = core
        .get_execution_cursor(1_000_000u64.into(), &mut cache)
        .unwrap();
    assert_eq!(cursor.output().arb_gas_used, 90u64.into());
    core.abort_thread();
}

#[test]
fn cursor_advances_through_a_delayed_run() {
    let (_db, core) = start_core("cursor-delayed");
    let items = vec![
        InboxItem::Sequencer(script_message(1, "LB")),
        InboxItem::Delayed(vec![
            script_message(2, "L"),
            script_message(2, "S"),
        ]),
        InboxItem::Sequencer(script_message(2, "B")),
    ];
    assert_eq!(
        deliver(&core, items, Hash::zero().clone()),
        MessageStatus::Success
    );
    wait_idle(&core);
    assert_eq!(core.max_checkpoint_gas().unwrap(), 110u64.into());

    let mut cache = ValueCache::new(2, 0);
    // Stop mid-run, with the first delayed message staged
    let mut cursor = core.get_execution_cursor(45u64.into(), &mut cache).unwrap();
    assert_eq!(cursor.output().arb_gas_used, 40u64.into());
    assert_eq!(cursor.output().fully_processed_inbox.count, 1u64.into());

    core.advance_execution_cursor(&mut cursor, 30u64.into(), false, &mut cache)
        .unwrap();
    assert_eq!(cursor.output().arb_gas_used, 70u64.into());
    assert_eq!(cursor.output().fully_processed_inbox.count, 2u64.into());

    let cursor = core.get_execution_cursor(110u64.into(), &mut cache).unwrap();
    assert_eq!(cursor.output().arb_gas_used, 110u64.into());
    assert_eq!(cursor.output().fully_processed_inbox.count, 4u64.into());
    core.abort_thread();
}

#[test]
fn sideload_cache_stays_within_its_window() {
    let (_db, core) = start_core("cursor-sideload");
    assert_eq!(
        deliver(&core, block_messages(1..=10), Hash::zero().clone()),
        MessageStatus::Success
    );
    wait_idle(&core);
    assert_eq!(core.sideload_cache_len(), 10);

    let mut cache = ValueCache::new(2, 0);
    let machine = core
        .get_machine_for_sideload(&5u64.into(), &mut cache)
        .unwrap();
    assert_eq!(machine.output().last_sideload, Some(5u64.into()));
    assert_eq!(machine.output().arb_gas_used, 150u64.into());

    // 25 more blocks roll block 5 out of the cache
    let prev = core.get_inbox_acc(9u64.into()).unwrap();
    assert_eq!(
        deliver(&core, block_messages(11..=35), prev),
        MessageStatus::Success
    );
    wait_idle(&core);
    assert_eq!(
        core.sideload_cache_len() as u64,
        Core::sideload_cache_capacity()
    );

    // Served from checkpoint plus cursor advance instead
    let machine = core
        .get_machine_for_sideload(&5u64.into(), &mut cache)
        .unwrap();
    assert_eq!(machine.output().last_sideload, Some(5u64.into()));
    assert_eq!(machine.output().arb_gas_used, 150u64.into());

    // No sideload at or before block zero
    assert!(core
        .get_machine_for_sideload(&U256::zero(), &mut cache)
        .unwrap_err()
        .is_not_found());
    core.abort_thread();
}

#[test]
fn cursor_gives_up_busy_after_persistent_reorgs() {
    let (_db, core) = start_core("cursor-busy");
    assert_eq!(
        deliver(&core, block_messages(1..=5), Hash::zero().clone()),
        MessageStatus::Success
    );
    wait_idle(&core);
    core.abort_thread();

    let mut cache = ValueCache::new(2, 0);
    let mut cursor = core
        .get_execution_cursor(150u64.into(), &mut cache)
        .unwrap();
    assert_eq!(cursor.output().arb_gas_used, 150u64.into());

    // Rewrite the item the cursor's inbox state depends on; with the
    // executor stopped nothing ever reconciles, so every retry sees a
    // reorg in progress
    {
        let tampered = {
            let tx = core.storage().begin_read();
            let mut item =
                messages::next_batch_item(&tx, &4u64.into()).unwrap();
            item.accumulator = Hash::hash(b"rewritten");
            item
        };
        let tx = core.storage().begin_write();
        messages::put_batch_item(&tx, &tampered).unwrap();
        tx.commit().unwrap();
    }

    let err = core
        .advance_execution_cursor(&mut cursor, 5u64.into(), true, &mut cache)
        .unwrap_err();
    assert!(matches!(err, Error::Busy));
    core.abort_thread();
}
