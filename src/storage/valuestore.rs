//! Content-addressed persistence of AVM values with reference counting,
//! plus the append-only code segment index. Every value row is
//! `refcount (u64 le) || shallow payload`; a tuple's payload holds child
//! hashes only, so shared subtrees are stored once and freed when the last
//! referencing root is deleted.

use crate::common::Hash;
use crate::error::{Error, Result};
use crate::machine::{CodeSegment, Op};
use crate::storage::{Column, ReadWriteTransaction, StoreRead};
use crate::value::{take, Shallow, Value, ValueCache};

const REFCOUNT_WIDTH: usize = 8;

fn split_row(raw: &[u8]) -> Result<(u64, &[u8])> {
    if raw.len() < REFCOUNT_WIDTH {
        return Err(Error::corrupt("short value row"))
    }
    let rc = u64::from_le_bytes(raw[..REFCOUNT_WIDTH].try_into().unwrap());
    Ok((rc, &raw[REFCOUNT_WIDTH..]))
}

fn put_row(
    tx: &ReadWriteTransaction, hash: &Hash, rc: u64, payload: &[u8],
) -> Result<()> {
    let mut row = Vec::with_capacity(REFCOUNT_WIDTH + payload.len());
    row.extend_from_slice(&rc.to_le_bytes());
    row.extend_from_slice(payload);
    tx.put(Column::Values, hash.as_bytes(), &row)
}

/// Persist `value`, incrementing its reference count. A value that is
/// already present keeps its stored payload; only a newly created row
/// recursively saves (and so references) its children.
pub fn save_value(tx: &ReadWriteTransaction, value: &Value) -> Result<Hash> {
    let hash = value.hash();
    match tx.get(Column::Values, hash.as_bytes())? {
        Some(raw) => {
            let (rc, payload) = split_row(&raw)?;
            put_row(tx, &hash, rc + 1, payload)?;
        }
        None => {
            if let Value::Tuple(tup) = value {
                for child in tup.iter() {
                    save_value(tx, child)?;
                }
            }
            let mut payload = Vec::new();
            value.marshal_shallow(&mut payload);
            put_row(tx, &hash, 1, &payload)?;
        }
    }
    Ok(hash)
}

/// Drop one reference. When the count reaches zero the row is removed and
/// the children are released recursively.
///
/// Panics on a missing row: a dangling reference means the database is
/// corrupt and continuing would compound the damage.
pub fn delete_value(tx: &ReadWriteTransaction, hash: &Hash) -> Result<()> {
    let raw = tx
        .get(Column::Values, hash.as_bytes())?
        .unwrap_or_else(|| panic!("value refcount underflow at {}", hash));
    let (rc, payload) = split_row(&raw)?;
    if rc == 0 {
        panic!("value refcount underflow at {}", hash);
    }
    if rc > 1 {
        return put_row(tx, hash, rc - 1, payload)
    }
    let shallow = Shallow::parse(payload)?;
    tx.delete(Column::Values, hash.as_bytes())?;
    if let Shallow::Tuple(children) = shallow {
        for child in children {
            delete_value(tx, &child)?;
        }
    }
    Ok(())
}

/// Reconstitute the value stored under `hash`, resolving tuple children
/// through `cache` so repeated subtrees are fetched once per operation.
pub fn get_value(
    tx: &impl StoreRead, hash: &Hash, cache: &mut ValueCache,
) -> Result<Value> {
    if let Some(val) = cache.get(hash) {
        return Ok(val)
    }
    let raw = tx
        .get(Column::Values, hash.as_bytes())?
        .ok_or(Error::NotFound)?;
    let (_, payload) = split_row(&raw)?;
    let val = match Shallow::parse(payload)? {
        Shallow::Int(v) => Value::Int(v),
        Shallow::CodePoint(cp) => Value::CodePoint(cp),
        Shallow::Tuple(children) => {
            let mut elems = Vec::with_capacity(children.len());
            for child in &children {
                elems.push(get_value(tx, child, cache)?);
            }
            Value::Tuple(crate::value::Tuple::new(elems))
        }
    };
    cache.put(hash.clone(), val.clone());
    Ok(val)
}

/// Current reference count of a stored value, if present. Test support.
pub fn refcount(tx: &impl StoreRead, hash: &Hash) -> Result<Option<u64>> {
    match tx.get(Column::Values, hash.as_bytes())? {
        Some(raw) => Ok(Some(split_row(&raw)?.0)),
        None => Ok(None),
    }
}

// Code segments are append-only: rows are never reference counted and
// never deleted, so a checkpointed code point stays loadable forever.

pub fn save_code_segment(
    tx: &ReadWriteTransaction, segment: &CodeSegment,
) -> Result<()> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(segment.ops.len() as u64).to_be_bytes());
    for op in &segment.ops {
        buf.push(op.opcode);
        match &op.immediate {
            Some(imm) => {
                buf.push(1);
                imm.marshal_deep(&mut buf);
            }
            None => buf.push(0),
        }
    }
    tx.put(Column::Code, &segment.id.to_be_bytes(), &buf)
}

pub fn load_code_segment(tx: &impl StoreRead, id: u64) -> Result<CodeSegment> {
    let raw = tx
        .get(Column::Code, &id.to_be_bytes())?
        .ok_or(Error::NotFound)?;
    let reader = &mut &raw[..];
    let count = u64::from_be_bytes(take(reader, 8)?.try_into().unwrap());
    let mut ops = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let header = take(reader, 2)?;
        let opcode = header[0];
        let immediate = match header[1] {
            0 => None,
            1 => Some(Value::unmarshal_deep(reader)?),
            m => {
                return Err(Error::corrupt(format!(
                    "bad immediate marker {:#x}",
                    m
                )))
            }
        };
        ops.push(Op { opcode, immediate });
    }
    Ok(CodeSegment { id, ops })
}

/// One past the highest stored segment id, i.e. the id the next appended
/// segment will take.
pub fn next_segment_id(tx: &impl StoreRead) -> Result<u64> {
    let mut it = tx.iter(Column::Code);
    it.seek_to_last();
    if !it.valid() {
        it.status()?;
        return Ok(0)
    }
    let key = it.key().ok_or(Error::NotFound)?;
    if key.len() != 8 {
        return Err(Error::corrupt("bad code segment key"))
    }
    Ok(u64::from_be_bytes(key.try_into().unwrap()) + 1)
}
