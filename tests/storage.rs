//! Value store and code index laws against a real database.

use qavm::common::{Hash, U256};
use qavm::machine::{CodeSegment, Op};
use qavm::storage::valuestore::{
    delete_value, get_value, load_code_segment, next_segment_id, refcount,
    save_value, save_code_segment,
};
use qavm::value::{Tuple, Value, ValueCache};
use qavm_tools::TestDb;

fn tup(vals: Vec<Value>) -> Value {
    Value::Tuple(Tuple::new(vals))
}

#[test]
fn value_round_trip_and_delete() {
    let db = TestDb::open("storage-round-trip");
    let val = tup(vec![
        Value::Int(7u64.into()),
        tup(vec![Value::Int(8u64.into()), Value::Int(9u64.into())]),
    ]);
    let hash = {
        let tx = db.storage.begin_write();
        let hash = save_value(&tx, &val).unwrap();
        tx.commit().unwrap();
        hash
    };
    assert_eq!(hash, val.hash());

    let mut cache = ValueCache::new(1, 0);
    {
        let tx = db.storage.begin_read();
        assert_eq!(get_value(&tx, &hash, &mut cache).unwrap(), val);
    }

    {
        let tx = db.storage.begin_write();
        delete_value(&tx, &hash).unwrap();
        tx.commit().unwrap();
    }
    let tx = db.storage.begin_read();
    let mut cache = ValueCache::new(1, 0);
    assert!(get_value(&tx, &hash, &mut cache)
        .unwrap_err()
        .is_not_found());
    // Children were released recursively
    assert_eq!(
        refcount(&tx, &Value::Int(7u64.into()).hash()).unwrap(),
        None
    );
}

#[test]
fn shared_children_survive_partial_delete() {
    let db = TestDb::open("storage-shared-children");
    let shared = tup(vec![Value::Int(1u64.into()), Value::Int(2u64.into())]);
    let left = tup(vec![shared.clone(), Value::Int(3u64.into())]);
    let right = tup(vec![shared.clone(), Value::Int(4u64.into())]);

    {
        let tx = db.storage.begin_write();
        save_value(&tx, &left).unwrap();
        save_value(&tx, &right).unwrap();
        tx.commit().unwrap();
    }
    {
        let tx = db.storage.begin_read();
        assert_eq!(refcount(&tx, &shared.hash()).unwrap(), Some(2));
    }

    {
        let tx = db.storage.begin_write();
        delete_value(&tx, &left.hash()).unwrap();
        tx.commit().unwrap();
    }
    let mut cache = ValueCache::new(1, 0);
    {
        let tx = db.storage.begin_read();
        assert_eq!(refcount(&tx, &shared.hash()).unwrap(), Some(1));
        assert_eq!(get_value(&tx, &right.hash(), &mut cache).unwrap(), right);
        assert!(get_value(&tx, &left.hash(), &mut cache)
            .unwrap_err()
            .is_not_found());
    }

    {
        let tx = db.storage.begin_write();
        delete_value(&tx, &right.hash()).unwrap();
        tx.commit().unwrap();
    }
    let tx = db.storage.begin_read();
    assert_eq!(refcount(&tx, &shared.hash()).unwrap(), None);
}

#[test]
fn resaving_bumps_the_refcount() {
    let db = TestDb::open("storage-resave");
    let val = Value::Int(77u64.into());
    {
        let tx = db.storage.begin_write();
        save_value(&tx, &val).unwrap();
        save_value(&tx, &val).unwrap();
        tx.commit().unwrap();
    }
    {
        let tx = db.storage.begin_read();
        assert_eq!(refcount(&tx, &val.hash()).unwrap(), Some(2));
    }
    {
        let tx = db.storage.begin_write();
        delete_value(&tx, &val.hash()).unwrap();
        tx.commit().unwrap();
    }
    let tx = db.storage.begin_read();
    assert_eq!(refcount(&tx, &val.hash()).unwrap(), Some(1));
}

#[test]
#[should_panic(expected = "refcount underflow")]
fn deleting_a_missing_value_is_fatal() {
    let db = TestDb::open("storage-underflow");
    let tx = db.storage.begin_write();
    let _ = delete_value(&tx, &Hash::hash(b"never stored"));
}

#[test]
fn code_segments_round_trip_in_order() {
    let db = TestDb::open("storage-code");
    let segment0 = CodeSegment {
        id: 0,
        ops: vec![
            Op {
                opcode: 0x10,
                immediate: None,
            },
            Op {
                opcode: 0x11,
                immediate: Some(tup(vec![Value::Int(5u64.into())])),
            },
        ],
    };
    let segment1 = CodeSegment {
        id: 1,
        ops: vec![Op {
            opcode: 0x12,
            immediate: Some(Value::Int(U256::MAX)),
        }],
    };

    {
        let tx = db.storage.begin_read();
        assert_eq!(next_segment_id(&tx).unwrap(), 0);
    }
    {
        let tx = db.storage.begin_write();
        save_code_segment(&tx, &segment0).unwrap();
        save_code_segment(&tx, &segment1).unwrap();
        tx.commit().unwrap();
    }
    let tx = db.storage.begin_read();
    assert_eq!(next_segment_id(&tx).unwrap(), 2);
    assert_eq!(load_code_segment(&tx, 0).unwrap(), segment0);
    assert_eq!(load_code_segment(&tx, 1).unwrap(), segment1);
    assert!(load_code_segment(&tx, 2).unwrap_err().is_not_found());
}
