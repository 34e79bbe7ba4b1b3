//! The message log: sequencer batch items keyed by last sequence number,
//! delayed messages keyed by delayed index, and the accumulator chain that
//! ties the machine's inbox progress to a specific history. Reads carry a
//! start-accumulator consistency check; a mismatch surfaces as `NotFound`
//! and tells the caller the history it was following has been rewritten.

use crate::common::{checked_as_u64, marshal_u256, unmarshal_u256};
use crate::common::{Bytes, Hash, U256};
use crate::error::{Error, Result};
use crate::machine::{InboxState, MachineMessage};
use crate::storage::{Column, ReadWriteTransaction, StoreRead};

/// One entry of the sequencer feed. A sequencer message fills exactly one
/// sequence slot; an item without one promotes delayed messages, one slot
/// each, up to `total_delayed_count`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequencerBatchItem {
    pub last_sequence_number: U256,
    pub total_delayed_count: U256,
    pub accumulator: Hash,
    pub sequencer_message: Option<Bytes>,
}

impl SequencerBatchItem {
    /// Stored row value; the key carries `last_sequence_number`.
    pub fn encode(&self) -> Vec<u8> {
        let mut s = rlp::RlpStream::new();
        match &self.sequencer_message {
            Some(msg) => {
                s.begin_list(3);
                s.append(&self.total_delayed_count);
                s.append(&self.accumulator);
                s.append(msg);
            }
            None => {
                s.begin_list(2);
                s.append(&self.total_delayed_count);
                s.append(&self.accumulator);
            }
        }
        s.out().to_vec()
    }

    pub fn decode(last_sequence_number: U256, raw: &[u8]) -> Result<Self> {
        let rlp = rlp::Rlp::new(raw);
        let total_delayed_count = rlp.val_at(0)?;
        let accumulator = rlp.val_at(1)?;
        let sequencer_message = match rlp.item_count()? {
            2 => None,
            3 => Some(rlp.val_at::<Bytes>(2)?),
            n => {
                return Err(Error::corrupt(format!(
                    "batch item with {} fields",
                    n
                )))
            }
        };
        Ok(Self {
            last_sequence_number,
            total_delayed_count,
            accumulator,
            sequencer_message,
        })
    }
}

/// Feed input: what one appended batch item carries.
#[derive(Clone, Debug)]
pub enum InboxItem {
    /// A sequencer message, filling one sequence slot.
    Sequencer(Bytes),
    /// A run of delayed messages promoted into the sequence, one slot each.
    Delayed(Vec<Bytes>),
}

/// `keccak(prev_acc || item_hash)` for a sequencer message item.
pub fn sequencer_item_acc(prev_acc: &Hash, message: &Bytes) -> Hash {
    prev_acc.chain(&Hash::hash(message))
}

/// Accumulator for a delayed-run item: the run digest folds the message
/// hashes in order, then is bound to the delayed count it advances to.
pub fn delayed_item_acc(
    prev_acc: &Hash, total_delayed_count: &U256, run: &[Bytes],
) -> Hash {
    let mut digest = Hash::zero().clone();
    for msg in run {
        digest = digest.chain(&Hash::hash(msg));
    }
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&marshal_u256(total_delayed_count));
    buf.extend_from_slice(digest.as_bytes());
    prev_acc.chain(&Hash::hash(&buf))
}

pub fn put_batch_item(
    tx: &ReadWriteTransaction, item: &SequencerBatchItem,
) -> Result<()> {
    tx.put(
        Column::SequencerBatchItems,
        &marshal_u256(&item.last_sequence_number),
        &item.encode(),
    )
}

pub fn put_delayed_message(
    tx: &ReadWriteTransaction, index: &U256, message: &Bytes,
) -> Result<()> {
    tx.put(Column::DelayedMessages, &marshal_u256(index), message)
}

/// First batch item at or after `sequence_number`.
pub fn next_batch_item(
    tx: &impl StoreRead, sequence_number: &U256,
) -> Result<SequencerBatchItem> {
    let mut it = tx.iter(Column::SequencerBatchItems);
    it.seek(&marshal_u256(sequence_number));
    if !it.valid() {
        it.status()?;
        return Err(Error::NotFound)
    }
    let last_seq = unmarshal_u256(it.key().ok_or(Error::NotFound)?);
    SequencerBatchItem::decode(last_seq, it.value().ok_or(Error::NotFound)?)
}

/// The newest batch item, if the log is non-empty.
pub fn tip_batch_item(
    tx: &impl StoreRead,
) -> Result<Option<SequencerBatchItem>> {
    let mut it = tx.iter(Column::SequencerBatchItems);
    it.seek_to_last();
    if !it.valid() {
        it.status()?;
        return Ok(None)
    }
    let last_seq = unmarshal_u256(it.key().ok_or(Error::NotFound)?);
    SequencerBatchItem::decode(last_seq, it.value().ok_or(Error::NotFound)?)
        .map(Some)
}

/// Does the log still confirm the machine's inbox progress?
pub fn is_valid(tx: &impl StoreRead, inbox: &InboxState) -> Result<bool> {
    if inbox.count.is_zero() {
        return Ok(true)
    }
    match next_batch_item(tx, &(inbox.count - 1)) {
        Ok(item) => Ok(item.accumulator == inbox.accumulator),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Messages `[index, index + count)` paired with their accumulators.
///
/// When `start_acc` is given, the item covering `index - 1` must carry
/// exactly that accumulator; otherwise the read fails with `NotFound` and
/// the caller treats it as a reorg in progress. A batch item that mixes a
/// sequencer message with delayed advancement, or that references delayed
/// messages the log does not hold, is a fatal format error.
pub fn get_messages_impl(
    tx: &impl StoreRead, index: U256, count: U256, start_acc: Option<&Hash>,
) -> Result<Vec<MachineMessage>> {
    let mut messages = Vec::new();
    if count.is_zero() && index.is_zero() {
        return Ok(messages)
    }
    let count_limit = checked_as_u64(&count).unwrap_or(u64::MAX) as usize;

    let mut start = index;
    let mut needs_consistency_check = false;
    if start > U256::zero() {
        // Check the previous item to ensure the inbox state is valid
        start = start - 1;
        needs_consistency_check = true;
    }

    let mut seq_it = tx.iter(Column::SequencerBatchItems);
    seq_it.seek(&marshal_u256(&start));

    let mut prev_delayed_count = U256::zero();
    let mut delayed_it = None;
    while seq_it.valid() {
        let last_seq = unmarshal_u256(seq_it.key().ok_or(Error::NotFound)?);
        let item = SequencerBatchItem::decode(
            last_seq,
            seq_it.value().ok_or(Error::NotFound)?,
        )?;

        if needs_consistency_check {
            if let Some(acc) = start_acc {
                if &item.accumulator != acc {
                    return Err(Error::NotFound)
                }
            }
            needs_consistency_check = false;
            if count.is_zero() {
                // The caller only wanted the consistency check
                break
            }
            prev_delayed_count = item.total_delayed_count;
            if item.last_sequence_number >= index {
                // We are in the middle of a delayed batch
                if item.sequencer_message.is_some() {
                    return Err(Error::corrupt(
                        "sequencer message item spans several slots",
                    ))
                }
                // Offset by the distance to the end of the batch
                prev_delayed_count = prev_delayed_count -
                    (item.last_sequence_number + 1 - index);
            } else {
                // We are just after this batch item
                seq_it.next();
                continue
            }
        }

        if let Some(msg) = &item.sequencer_message {
            messages.push(MachineMessage {
                message: msg.clone(),
                accumulator: item.accumulator.clone(),
            });
            if prev_delayed_count != item.total_delayed_count {
                return Err(Error::corrupt(
                    "batch item has both sequencer message and delayed \
                     messages",
                ))
            }
        } else if item.total_delayed_count > prev_delayed_count {
            if delayed_it.is_none() {
                let mut it = tx.iter(Column::DelayedMessages);
                it.seek(&marshal_u256(&prev_delayed_count));
                delayed_it = Some(it);
            }
            let d_it = delayed_it.as_mut().unwrap();
            while d_it.valid() &&
                prev_delayed_count < item.total_delayed_count &&
                messages.len() < count_limit
            {
                let delayed_key =
                    unmarshal_u256(d_it.key().ok_or(Error::NotFound)?);
                if delayed_key != prev_delayed_count {
                    return Err(Error::corrupt(
                        "wrong delayed message in database",
                    ))
                }
                messages.push(MachineMessage {
                    message: d_it.value().ok_or(Error::NotFound)?.into(),
                    accumulator: item.accumulator.clone(),
                });
                prev_delayed_count = prev_delayed_count + 1;
                d_it.next();
            }
            d_it.status()?;
            if messages.len() < count_limit &&
                prev_delayed_count != item.total_delayed_count
            {
                return Err(Error::corrupt(
                    "batch item references nonexistent delayed messages",
                ))
            }
        } else {
            return Err(Error::corrupt("batch item advances nothing"))
        }

        if messages.len() >= count_limit {
            break
        }
        seq_it.next();
    }
    seq_it.status()?;
    if needs_consistency_check {
        return Err(Error::NotFound)
    }
    Ok(messages)
}

/// The up-to-`count` messages the machine would consume next, checked
/// against its current inbox accumulator.
pub fn read_next_messages(
    tx: &impl StoreRead, inbox: &InboxState, count: usize,
) -> Result<Vec<MachineMessage>> {
    let start_acc = if inbox.count.is_zero() {
        None
    } else {
        Some(&inbox.accumulator)
    };
    get_messages_impl(tx, inbox.count, count.into(), start_acc)
}

/// Remove every batch item with `last_sequence_number >= sequence_number`.
/// Returns the new message count (one past the kept tip).
pub fn delete_batch_items_from(
    tx: &ReadWriteTransaction, sequence_number: &U256,
) -> Result<U256> {
    let mut doomed = Vec::new();
    {
        let mut it = tx.iter(Column::SequencerBatchItems);
        it.seek(&marshal_u256(sequence_number));
        while it.valid() {
            doomed.push(it.key().ok_or(Error::NotFound)?.to_vec());
            it.next();
        }
        it.status()?;
    }
    for key in doomed {
        tx.delete(Column::SequencerBatchItems, &key)?;
    }
    match tip_batch_item(tx)? {
        Some(tip) => Ok(tip.last_sequence_number + 1),
        None => Ok(U256::zero()),
    }
}

/// Remove every delayed message with index `>= delayed_index`.
pub fn delete_delayed_from(
    tx: &ReadWriteTransaction, delayed_index: &U256,
) -> Result<()> {
    let mut doomed = Vec::new();
    {
        let mut it = tx.iter(Column::DelayedMessages);
        it.seek(&marshal_u256(delayed_index));
        while it.valid() {
            doomed.push(it.key().ok_or(Error::NotFound)?.to_vec());
            it.next();
        }
        it.status()?;
    }
    for key in doomed {
        tx.delete(Column::DelayedMessages, &key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_item_round_trip_with_message() {
        let item = SequencerBatchItem {
            last_sequence_number: 42u64.into(),
            total_delayed_count: 7u64.into(),
            accumulator: Hash::hash(b"acc"),
            sequencer_message: Some(Bytes::from(&b"payload"[..])),
        };
        let back =
            SequencerBatchItem::decode(42u64.into(), &item.encode()).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn batch_item_round_trip_delayed() {
        let item = SequencerBatchItem {
            last_sequence_number: 99u64.into(),
            total_delayed_count: 100u64.into(),
            accumulator: Hash::hash(b"acc2"),
            sequencer_message: None,
        };
        let back =
            SequencerBatchItem::decode(99u64.into(), &item.encode()).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn accumulators_depend_on_content_and_order() {
        let zero = Hash::zero();
        let a = sequencer_item_acc(zero, &Bytes::from(&b"a"[..]));
        let b = sequencer_item_acc(&a, &Bytes::from(&b"b"[..]));
        assert_ne!(a, b);
        assert_eq!(b, sequencer_item_acc(&a, &Bytes::from(&b"b"[..])));
        let run = vec![Bytes::from(&b"x"[..]), Bytes::from(&b"y"[..])];
        let d1 = delayed_item_acc(&b, &2u64.into(), &run);
        let d2 = delayed_item_acc(&b, &3u64.into(), &run);
        assert_ne!(d1, d2);
    }
}
