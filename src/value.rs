//! The AVM value model: 256-bit integers, code points and tuples of up to
//! eight values, each with a stable 256-bit hash. Values are persisted in
//! shallow form (tuples store child hashes only) so that identical subtrees
//! are shared in storage; see [crate::storage::valuestore].

use sha3::{Digest, Keccak256};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::common::{marshal_u256, unmarshal_u256, Hash, U256};
use crate::error::{Error, Result};

pub const MAX_TUPLE_SIZE: usize = 8;

// Type tags of the marshaled forms. A tuple of size n is tagged TUPLE + n.
pub(crate) const NUM: u8 = 0;
pub(crate) const CODEPT: u8 = 1;
pub(crate) const HASH_ONLY: u8 = 2;
pub(crate) const TUPLE: u8 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Int(U256),
    CodePoint(CodePoint),
    Tuple(Tuple),
}

/// A position in the code index plus the hash of the following code point,
/// making every code point a commitment to the rest of its segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodePoint {
    pub segment: u64,
    pub offset: u64,
    pub next_hash: Hash,
}

/// Immutable tuple of up to [MAX_TUPLE_SIZE] values. Cloning is cheap and
/// the hash is computed once at construction.
#[derive(Clone, Debug)]
pub struct Tuple {
    elems: Arc<Vec<Value>>,
    hash: Hash,
}

impl Value {
    pub fn none() -> Value {
        Value::Tuple(Tuple::empty())
    }

    pub fn hash(&self) -> Hash {
        match self {
            Value::Int(v) => {
                let mut buf = [0u8; 33];
                buf[0] = NUM;
                buf[1..].copy_from_slice(&marshal_u256(v));
                Hash::hash(&buf)
            }
            Value::CodePoint(cp) => cp.hash(),
            Value::Tuple(t) => t.hash().clone(),
        }
    }

    /// Single-level marshaled form: tuple children appear as HASH_ONLY
    /// references. This is the payload stored in the value store.
    pub fn marshal_shallow(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Int(v) => {
                buf.push(NUM);
                buf.extend_from_slice(&marshal_u256(v));
            }
            Value::CodePoint(cp) => cp.marshal(buf),
            Value::Tuple(t) => {
                buf.push(TUPLE + t.len() as u8);
                for elem in t.iter() {
                    buf.push(HASH_ONLY);
                    buf.extend_from_slice(elem.hash().as_bytes());
                }
            }
        }
    }

    /// Fully inlined marshaled form, used for code segment immediates where
    /// no value-store indirection exists.
    pub fn marshal_deep(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Int(v) => {
                buf.push(NUM);
                buf.extend_from_slice(&marshal_u256(v));
            }
            Value::CodePoint(cp) => cp.marshal(buf),
            Value::Tuple(t) => {
                buf.push(TUPLE + t.len() as u8);
                for elem in t.iter() {
                    elem.marshal_deep(buf);
                }
            }
        }
    }

    pub fn unmarshal_deep(reader: &mut &[u8]) -> Result<Value> {
        let tag = take(reader, 1)?[0];
        match tag {
            NUM => Ok(Value::Int(unmarshal_u256(take(reader, 32)?))),
            CODEPT => Ok(Value::CodePoint(CodePoint::unmarshal(reader)?)),
            t if (TUPLE..=TUPLE + MAX_TUPLE_SIZE as u8).contains(&t) => {
                let size = (t - TUPLE) as usize;
                let mut elems = Vec::with_capacity(size);
                for _ in 0..size {
                    elems.push(Value::unmarshal_deep(reader)?);
                }
                Ok(Value::Tuple(Tuple::new(elems)))
            }
            t => Err(Error::corrupt(format!("bad value tag {:#x}", t))),
        }
    }
}

impl From<U256> for Value {
    fn from(v: U256) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v.into())
    }
}

impl CodePoint {
    pub fn hash(&self) -> Hash {
        let mut buf = [0u8; 49];
        buf[0] = CODEPT;
        buf[1..9].copy_from_slice(&self.segment.to_be_bytes());
        buf[9..17].copy_from_slice(&self.offset.to_be_bytes());
        buf[17..].copy_from_slice(self.next_hash.as_bytes());
        Hash::hash(&buf)
    }

    pub fn marshal(&self, buf: &mut Vec<u8>) {
        buf.push(CODEPT);
        buf.extend_from_slice(&self.segment.to_be_bytes());
        buf.extend_from_slice(&self.offset.to_be_bytes());
        buf.extend_from_slice(self.next_hash.as_bytes());
    }

    pub fn unmarshal(reader: &mut &[u8]) -> Result<CodePoint> {
        let segment = u64::from_be_bytes(take(reader, 8)?.try_into().unwrap());
        let offset = u64::from_be_bytes(take(reader, 8)?.try_into().unwrap());
        let next_hash = Hash::from_slice(take(reader, 32)?);
        Ok(CodePoint {
            segment,
            offset,
            next_hash,
        })
    }
}

impl Tuple {
    pub fn new(elems: Vec<Value>) -> Self {
        assert!(elems.len() <= MAX_TUPLE_SIZE, "tuple too large");
        let mut hasher = Keccak256::new();
        hasher.update([TUPLE + elems.len() as u8]);
        for elem in &elems {
            hasher.update(elem.hash().as_bytes());
        }
        let hash = Hash::from_slice(hasher.finalize().as_slice());
        Self {
            elems: Arc::new(elems),
            hash,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Value> {
        self.elems.get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.elems.iter()
    }

    #[inline(always)]
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Push in the AVM stack encoding: `(top, rest)` pairs.
    pub fn cons(self, top: Value) -> Tuple {
        Tuple::new(vec![top, Value::Tuple(self)])
    }

    /// Pop the AVM stack encoding, returning `(top, rest)`.
    pub fn uncons(&self) -> Option<(Value, Tuple)> {
        if self.len() != 2 {
            return None
        }
        let top = self.get(0).unwrap().clone();
        match self.get(1).unwrap() {
            Value::Tuple(rest) => Some((top, rest.clone())),
            _ => None,
        }
    }
}

impl Default for Tuple {
    fn default() -> Self {
        Tuple::empty()
    }
}

impl PartialEq for Tuple {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Tuple {}

/// A parsed shallow payload from the value store, before child resolution.
#[derive(Debug)]
pub(crate) enum Shallow {
    Int(U256),
    CodePoint(CodePoint),
    Tuple(Vec<Hash>),
}

impl Shallow {
    pub(crate) fn parse(mut raw: &[u8]) -> Result<Shallow> {
        let reader = &mut raw;
        let tag = take(reader, 1)?[0];
        match tag {
            NUM => Ok(Shallow::Int(unmarshal_u256(take(reader, 32)?))),
            CODEPT => Ok(Shallow::CodePoint(CodePoint::unmarshal(reader)?)),
            t if (TUPLE..=TUPLE + MAX_TUPLE_SIZE as u8).contains(&t) => {
                let size = (t - TUPLE) as usize;
                let mut children = Vec::with_capacity(size);
                for _ in 0..size {
                    let marker = take(reader, 1)?[0];
                    if marker != HASH_ONLY {
                        return Err(Error::corrupt(format!(
                            "bad tuple child marker {:#x}",
                            marker
                        )))
                    }
                    children.push(Hash::from_slice(take(reader, 32)?));
                }
                Ok(Shallow::Tuple(children))
            }
            t => Err(Error::corrupt(format!("bad value tag {:#x}", t))),
        }
    }
}

pub(crate) fn take<'a>(reader: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if reader.len() < n {
        return Err(Error::corrupt("short value payload"))
    }
    let (head, tail) = reader.split_at(n);
    *reader = tail;
    Ok(head)
}

/// Bounded cache of materialized values keyed by hash. Entries live in
/// generations; [ValueCache::next_cache] retires the oldest generation so
/// the executor can rotate after each sideload without unbounded growth.
pub struct ValueCache {
    caches: VecDeque<HashMap<Hash, Value>>,
    max_caches: usize,
}

impl ValueCache {
    pub fn new(max_caches: usize, initial_capacity: usize) -> Self {
        let mut caches = VecDeque::with_capacity(max_caches.max(1));
        caches.push_front(HashMap::with_capacity(initial_capacity));
        Self {
            caches,
            max_caches: max_caches.max(1),
        }
    }

    pub fn get(&self, hash: &Hash) -> Option<Value> {
        for cache in &self.caches {
            if let Some(val) = cache.get(hash) {
                return Some(val.clone())
            }
        }
        None
    }

    pub fn put(&mut self, hash: Hash, val: Value) {
        self.caches.front_mut().unwrap().insert(hash, val);
    }

    /// Start a fresh generation, evicting the oldest if at capacity.
    pub fn next_cache(&mut self) {
        if self.caches.len() == self.max_caches {
            self.caches.pop_back();
        }
        self.caches.push_front(HashMap::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tuple() -> Tuple {
        Tuple::new(vec![
            Value::Int(7u64.into()),
            Value::Tuple(Tuple::new(vec![Value::Int(9u64.into())])),
            Value::CodePoint(CodePoint {
                segment: 1,
                offset: 4,
                next_hash: Hash::hash(b"next"),
            }),
        ])
    }

    #[test]
    fn hash_is_stable_across_reconstruction() {
        assert_eq!(sample_tuple().hash(), sample_tuple().hash());
        assert_ne!(
            Tuple::new(vec![Value::Int(1u64.into())]).hash(),
            Tuple::new(vec![Value::Int(2u64.into())]).hash()
        );
    }

    #[test]
    fn deep_marshal_round_trip() {
        let val = Value::Tuple(sample_tuple());
        let mut buf = Vec::new();
        val.marshal_deep(&mut buf);
        let mut reader = &buf[..];
        let back = Value::unmarshal_deep(&mut reader).unwrap();
        assert!(reader.is_empty());
        assert_eq!(back, val);
        assert_eq!(back.hash(), val.hash());
    }

    #[test]
    fn shallow_tuple_stores_child_hashes() {
        let tup = sample_tuple();
        let val = Value::Tuple(tup.clone());
        let mut buf = Vec::new();
        val.marshal_shallow(&mut buf);
        match Shallow::parse(&buf).unwrap() {
            Shallow::Tuple(children) => {
                assert_eq!(children.len(), 3);
                for (child, elem) in children.iter().zip(tup.iter()) {
                    assert_eq!(child, &elem.hash());
                }
            }
            other => panic!("expected tuple, got {:?}", other),
        }
    }

    #[test]
    fn stack_encoding_round_trip() {
        let stack = Tuple::empty()
            .cons(Value::Int(1u64.into()))
            .cons(Value::Int(2u64.into()));
        let (top, rest) = stack.uncons().unwrap();
        assert_eq!(top, Value::Int(2u64.into()));
        let (next, rest) = rest.uncons().unwrap();
        assert_eq!(next, Value::Int(1u64.into()));
        assert!(rest.is_empty());
    }

    #[test]
    fn cache_generations_rotate() {
        let mut cache = ValueCache::new(2, 0);
        let h1 = Hash::hash(b"one");
        let h2 = Hash::hash(b"two");
        cache.put(h1.clone(), Value::Int(1u64.into()));
        cache.next_cache();
        cache.put(h2.clone(), Value::Int(2u64.into()));
        assert!(cache.get(&h1).is_some());
        cache.next_cache();
        assert!(cache.get(&h1).is_none());
        assert!(cache.get(&h2).is_some());
    }
}
