use hex::ToHex;
use once_cell::sync::OnceCell;
use primitive_types::H256;
pub use primitive_types::U256;
use sha3::{Digest, Keccak256};

use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

/// 256-bit Keccak hash. Used both for content addresses in the value store
/// and for the inbox accumulator chain.
#[derive(Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Hash(H256);

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Bytes(Vec<u8>);

// Hash

impl Hash {
    #[inline(always)]
    pub fn hash(slice: &[u8]) -> Self {
        Self::from_slice(Keccak256::digest(slice).as_slice())
    }

    /// Extend an accumulator: `keccak(self || next)`.
    #[inline]
    pub fn chain(&self, next: &Hash) -> Self {
        let mut hasher = Keccak256::new();
        hasher.update(self.as_bytes());
        hasher.update(next.as_bytes());
        Self::from_slice(hasher.finalize().as_slice())
    }

    #[inline]
    pub fn zero() -> &'static Self {
        static V: OnceCell<Hash> = OnceCell::new();
        V.get_or_init(|| Self(H256::zero()))
    }

    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    #[inline(always)]
    pub fn from_slice(s: &[u8]) -> Self {
        Self(H256::from_slice(s))
    }

    #[inline]
    pub fn to_fixed_bytes(self) -> [u8; 32] {
        self.0.to_fixed_bytes()
    }
}

impl From<[u8; 32]> for Hash {
    fn from(u: [u8; 32]) -> Self {
        Self(u.into())
    }
}

impl From<U256> for Hash {
    fn from(u: U256) -> Self {
        Self::from_slice(&marshal_u256(&u))
    }
}

impl From<Hash> for U256 {
    fn from(hash: Hash) -> Self {
        U256::from_big_endian(hash.as_bytes())
    }
}

impl FromStr for Hash {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        Ok(Self(H256::from_str(s).map_err(|_| ())?))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// Bytes

impl Bytes {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&[u8]> for Bytes {
    fn from(s: &[u8]) -> Self {
        Self(s.into())
    }
}

impl Deref for Bytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        <BytesRef as fmt::LowerHex>::fmt(&BytesRef(self), f)
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        <BytesRef as fmt::LowerHex>::fmt(&BytesRef(self), f)
    }
}

impl rlp::Encodable for Bytes {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.encoder().encode_value(self)
    }
}

impl rlp::Decodable for Bytes {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|bytes| Ok(Self(bytes.to_vec())))
    }
}

impl rlp::Encodable for Hash {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.encoder().encode_value(self.as_bytes())
    }
}

impl rlp::Decodable for Hash {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|bytes| match bytes.len().cmp(&32) {
            std::cmp::Ordering::Less => Err(rlp::DecoderError::RlpIsTooShort),
            std::cmp::Ordering::Greater => Err(rlp::DecoderError::RlpIsTooBig),
            std::cmp::Ordering::Equal => Ok(Hash::from_slice(bytes)),
        })
    }
}

pub struct BytesRef<'a>(&'a [u8]);

impl<'a> From<&'a [u8]> for BytesRef<'a> {
    fn from(s: &'a [u8]) -> Self {
        Self(s)
    }
}

impl<'a> fmt::LowerHex for BytesRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.0.encode_hex::<String>())
    }
}

/// Big-endian fixed-width form used for all 256-bit column keys.
#[inline]
pub fn marshal_u256(val: &U256) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    val.to_big_endian(&mut bytes);
    bytes
}

#[inline]
pub fn unmarshal_u256(raw: &[u8]) -> U256 {
    U256::from_big_endian(raw)
}

#[inline(always)]
pub fn checked_as_u64(x: &U256) -> Option<u64> {
    if x > &u64::MAX.into() {
        None
    } else {
        Some(x.as_u64())
    }
}

#[test]
fn test_marshal_u256_round_trip() {
    let v = U256::from(0x1234_5678_9abc_def0u64);
    assert_eq!(unmarshal_u256(&marshal_u256(&v)), v);
    let mut expected = [0u8; 32];
    expected[24..].copy_from_slice(&0x1234_5678_9abc_def0u64.to_be_bytes());
    assert_eq!(marshal_u256(&v), expected);
}

#[test]
fn test_hash_chain() {
    let a = Hash::hash(b"a");
    let b = Hash::hash(b"b");
    let mut buf = Vec::new();
    buf.extend_from_slice(a.as_bytes());
    buf.extend_from_slice(b.as_bytes());
    assert_eq!(a.chain(&b), Hash::hash(&buf));
    assert_ne!(a.chain(&b), b.chain(&a));
}
