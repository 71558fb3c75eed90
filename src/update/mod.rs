//! Updates: the blocks one replica has and another lacks.
//!
//! An update is produced against a peer's state vector and carries every
//! block the peer has not seen, grouped per client in clock order, followed
//! by the full delete set.
//!
//! # Wire format
//!
//! All integers are unsigned LEB128.
//!
//! ```text
//! update      := varuint(groups) group* delete_set
//! group       := varuint(block_count) varuint(client) varuint(first_clock) block*
//! block       := u8(info) [id origin] [id right_origin] [string parent] content
//! info        := content tag (low 4 bits) | 0x80 has origin | 0x40 has right origin
//! content     := Deleted: varuint(len) | String: string | Embed/Element/Format: json bytes
//! ```
//!
//! A block's clock is implied by its position in the group. The root name is
//! only written when the block has no origin at all; otherwise the receiver
//! takes it from whichever origin it finds.
//!
//! # Applying
//!
//! Decoding never touches a document. Integration then runs as a fixed
//! point: a block is integrated once its clock is next for its client and
//! both of its origins are present. Whatever remains (blocks waiting on
//! missing history, delete ranges past the known state) is handed back as a
//! smaller update to retry later.

pub mod encoding;

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;

use crate::crdt::block::Attrs;
use crate::crdt::block::Block;
use crate::crdt::block::Content;
use crate::crdt::block::TAG_DELETED;
use crate::crdt::block::TAG_ELEMENT;
use crate::crdt::block::TAG_EMBED;
use crate::crdt::block::TAG_FORMAT;
use crate::crdt::block::TAG_STRING;
use crate::crdt::delete_set::DeleteSet;
use crate::crdt::primitives::ClientId;
use crate::crdt::primitives::Id;
use crate::crdt::primitives::StateVector;
use crate::crdt::store::BlockStore;
use crate::error::DecodeError;
use crate::transaction::ReadTxn;
use crate::transaction::Transaction;
use encoding::Decoder;
use encoding::Encoder;

const HAS_ORIGIN: u8 = 0x80;
const HAS_RIGHT_ORIGIN: u8 = 0x40;
const TAG_MASK: u8 = 0x0f;
const RESERVED_MASK: u8 = 0x30;

// =============================================================================
// Pending blocks
// =============================================================================

/// A decoded block that is not in any store yet.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingBlock {
    pub id: Id,
    pub origin: Option<Id>,
    pub right_origin: Option<Id>,
    /// Root name; only carried when the block has no origin at all.
    pub parent: Option<Arc<str>>,
    pub content: Content,
}

impl PendingBlock {
    #[inline]
    pub fn len(&self) -> u32 {
        return self.content.len();
    }

    /// Clock one past the last tick of this block.
    #[inline]
    pub fn end(&self) -> u32 {
        return self.id.clock + self.len();
    }

    /// Drop the first `offset` ticks, which the receiver already has.
    fn trimmed(self, offset: u32) -> PendingBlock {
        if offset == 0 {
            return self;
        }
        return PendingBlock {
            id: self.id.offset(offset),
            origin: Some(self.id.offset(offset - 1)),
            right_origin: self.right_origin,
            parent: None,
            content: self.content.sliced(offset),
        };
    }

    fn write(&self, encoder: &mut Encoder) {
        let mut info = self.content.tag();
        if self.origin.is_some() {
            info |= HAS_ORIGIN;
        }
        if self.right_origin.is_some() {
            info |= HAS_RIGHT_ORIGIN;
        }
        encoder.write_u8(info);

        if let Some(origin) = self.origin {
            write_id(encoder, origin);
        }
        if let Some(right_origin) = self.right_origin {
            write_id(encoder, right_origin);
        }
        if self.origin.is_none() && self.right_origin.is_none() {
            encoder.write_string(self.parent.as_deref().unwrap_or_default());
        }

        match &self.content {
            Content::Deleted(len) => encoder.write_var(*len as u64),
            Content::String(s) => encoder.write_string(s),
            Content::Embed(value) | Content::Element(value) => encoder.write_string(&value.to_string()),
            Content::Format(attrs) => {
                let object: serde_json::Map<String, Value> =
                    attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                encoder.write_string(&Value::Object(object).to_string());
            }
        }
    }

    fn read(decoder: &mut Decoder<'_>, id: Id) -> Result<PendingBlock, DecodeError> {
        let info = decoder.read_u8()?;
        if info & RESERVED_MASK != 0 {
            return Err(DecodeError::InvalidBlock("reserved info bits set"));
        }

        let origin = match info & HAS_ORIGIN {
            0 => None,
            _ => Some(read_id(decoder)?),
        };
        let right_origin = match info & HAS_RIGHT_ORIGIN {
            0 => None,
            _ => Some(read_id(decoder)?),
        };
        let parent = match (origin, right_origin) {
            (None, None) => Some(Arc::from(decoder.read_string()?)),
            _ => None,
        };

        let content = match info & TAG_MASK {
            TAG_DELETED => Content::Deleted(decoder.read_var_u32()?),
            TAG_STRING => Content::String(decoder.read_string()?.to_string()),
            TAG_EMBED => Content::Embed(read_json(decoder)?),
            TAG_ELEMENT => Content::Element(read_json(decoder)?),
            TAG_FORMAT => match read_json(decoder)? {
                Value::Object(map) => Content::Format(map.into_iter().collect::<Attrs>()),
                _ => return Err(DecodeError::InvalidValue("format marker is not an object".to_string())),
            },
            tag => return Err(DecodeError::UnknownContent(tag)),
        };

        if content.is_empty() {
            return Err(DecodeError::InvalidBlock("empty block"));
        }

        return Ok(PendingBlock {
            id,
            origin,
            right_origin,
            parent,
            content,
        });
    }
}

fn write_id(encoder: &mut Encoder, id: Id) {
    encoder.write_var(id.client);
    encoder.write_var(id.clock as u64);
}

fn read_id(decoder: &mut Decoder<'_>) -> Result<Id, DecodeError> {
    let client = decoder.read_var()?;
    let clock = decoder.read_var_u32()?;
    return Ok(Id::new(client, clock));
}

fn read_json(decoder: &mut Decoder<'_>) -> Result<Value, DecodeError> {
    let bytes = decoder.read_bytes()?;
    return serde_json::from_slice(bytes).map_err(|e| DecodeError::InvalidValue(e.to_string()));
}

// =============================================================================
// Update
// =============================================================================

/// A decoded update, staged outside any document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Update {
    /// Per client, blocks sorted by clock.
    blocks: BTreeMap<ClientId, VecDeque<PendingBlock>>,
    delete_set: DeleteSet,
}

impl Update {
    pub fn new() -> Update {
        return Update::default();
    }

    /// Everything in `store` that a peer at `remote` has not seen.
    pub fn diff(store: &BlockStore, remote: &StateVector) -> Update {
        let mut blocks: BTreeMap<ClientId, VecDeque<PendingBlock>> = BTreeMap::new();

        for client in store.clients() {
            let known = remote.get(client);
            if store.state(client) <= known {
                continue;
            }

            let all = store.blocks(client);
            let first = all.partition_point(|b| b.id.clock + b.len <= known);
            let mut queue = VecDeque::with_capacity(all.len() - first);
            for block in &all[first..] {
                let pending = to_pending(block);
                let offset = known.saturating_sub(block.id.clock);
                queue.push_back(pending.trimmed(offset));
            }
            blocks.insert(client, queue);
        }

        return Update {
            blocks,
            delete_set: DeleteSet::from_store(store),
        };
    }

    /// Decode an update. Fails on any malformed or trailing byte.
    pub fn decode(bytes: &[u8]) -> Result<Update, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let mut update = Update::new();

        let groups = decoder.read_var()?;
        for _ in 0..groups {
            let count = decoder.read_var()?;
            let client = decoder.read_var()?;
            let mut clock = decoder.read_var_u32()?;

            for _ in 0..count {
                let block = PendingBlock::read(&mut decoder, Id::new(client, clock))?;
                let later = |o: Option<Id>| o.is_some_and(|o| o.client == client && o.clock >= clock);
                if later(block.origin) || later(block.right_origin) {
                    return Err(DecodeError::InvalidBlock("origin does not precede block"));
                }
                clock = clock
                    .checked_add(block.len())
                    .ok_or(DecodeError::InvalidBlock("clock overflows"))?;
                update.push(block);
            }
        }

        update.delete_set = DeleteSet::read(&mut decoder)?;
        decoder.finish()?;
        update.normalize();
        return Ok(update);
    }

    /// Encode to bytes. Non-contiguous runs of a client become separate groups.
    pub fn encode(&self) -> Vec<u8> {
        let mut runs: Vec<Vec<&PendingBlock>> = Vec::new();
        for queue in self.blocks.values() {
            let mut run: Vec<&PendingBlock> = Vec::new();
            for block in queue {
                if let Some(last) = run.last() {
                    if last.end() != block.id.clock {
                        runs.push(std::mem::take(&mut run));
                    }
                }
                run.push(block);
            }
            if !run.is_empty() {
                runs.push(run);
            }
        }
        let mut encoder = Encoder::new();
        encoder.write_var(runs.len() as u64);
        for run in &runs {
            let first = run[0].id;
            encoder.write_var(run.len() as u64);
            encoder.write_var(first.client);
            encoder.write_var(first.clock as u64);
            for block in run {
                block.write(&mut encoder);
            }
        }
        self.delete_set.write(&mut encoder);
        return encoder.into_bytes();
    }

    pub fn is_empty(&self) -> bool {
        return self.block_count() == 0 && self.delete_set.is_empty();
    }

    /// Number of blocks carried.
    pub fn block_count(&self) -> usize {
        return self.blocks.values().map(|q| q.len()).sum();
    }

    pub fn delete_set(&self) -> &DeleteSet {
        return &self.delete_set;
    }

    /// Iterate blocks, clients ascending, then clock ascending.
    pub fn blocks(&self) -> impl Iterator<Item = &PendingBlock> + '_ {
        return self.blocks.values().flat_map(|q| q.iter());
    }

    /// Fold another update into this one.
    pub fn merge(&mut self, other: Update) {
        for (_, queue) in other.blocks {
            for block in queue {
                self.push(block);
            }
        }
        self.delete_set.merge(other.delete_set);
        self.normalize();
    }

    fn push(&mut self, block: PendingBlock) {
        self.blocks.entry(block.id.client).or_default().push_back(block);
    }

    /// Sort each client's blocks by clock, keeping the longest of equal starts.
    fn normalize(&mut self) {
        for queue in self.blocks.values_mut() {
            let sorted = queue.make_contiguous();
            sorted.sort_by(|a, b| a.id.clock.cmp(&b.id.clock).then(b.len().cmp(&a.len())));
            let mut deduped: VecDeque<PendingBlock> = VecDeque::with_capacity(queue.len());
            for block in queue.drain(..) {
                match deduped.back() {
                    Some(last) if last.id.clock == block.id.clock => {}
                    _ => deduped.push_back(block),
                }
            }
            *queue = deduped;
        }
        self.blocks.retain(|_, queue| !queue.is_empty());
    }

    /// Integrate as much of this update as possible into the transaction's
    /// document.
    pub(crate) fn integrate(self, txn: &mut Transaction<'_>) -> Integration {
        let Update {
            mut blocks,
            delete_set,
        } = self;

        let local = txn.client_id();
        let mut collision = false;
        let mut integrated = 0usize;
        let mut progress = true;
        while progress {
            progress = false;
            for (client, queue) in blocks.iter_mut() {
                while let Some(front) = queue.front() {
                    let store = txn.store();
                    let state = store.state(*client);
                    if *client == local && front.id.clock < state && !matches_store(store, front) {
                        collision = true;
                    }
                    if front.end() <= state {
                        // Already known
                        queue.pop_front();
                        continue;
                    }
                    if front.id.clock > state {
                        // Waiting on earlier clocks of this client
                        break;
                    }
                    let missing_origin = front.origin.is_some_and(|o| !store.contains(&o))
                        || front.right_origin.is_some_and(|r| !store.contains(&r));
                    if missing_origin {
                        break;
                    }
                    let Some(parent) = resolve_parent(store, front) else {
                        break;
                    };

                    let Some(pending) = queue.pop_front() else {
                        break;
                    };
                    let offset = state - pending.id.clock;
                    let pending = pending.trimmed(offset);
                    let block = Block::new(pending.id, pending.origin, pending.right_origin, parent, pending.content);
                    let root = block.parent.clone();
                    if txn.store_mut().integrate(block) {
                        txn.touch(root);
                        integrated += 1;
                        progress = true;
                    }
                }
            }
        }
        blocks.retain(|_, queue| !queue.is_empty());

        let mut rest = DeleteSet::new();
        let mut deleted = 0usize;
        for (client, range) in delete_set.iter() {
            let state = txn.store().state(client);
            if range.clock < state {
                let len = range.end().min(state) - range.clock;
                let ids = txn.store_mut().delete_id_range(client, range.clock, len);
                deleted += ids.len();
                txn.mark_deleted(&ids);
            }
            if range.end() > state {
                let from = range.clock.max(state);
                rest.insert(Id::new(client, from), range.end() - from);
            }
        }
        rest.squash();

        tracing::trace!(integrated, deleted, collision, "integrated update");

        return Integration {
            rest: Update {
                blocks,
                delete_set: rest,
            },
            collision,
        };
    }
}

/// Outcome of integrating an update.
#[derive(Debug)]
pub(crate) struct Integration {
    /// What could not be integrated yet.
    pub(crate) rest: Update,
    /// The update carries blocks under the local client id that differ from
    /// the ones this replica wrote.
    pub(crate) collision: bool,
}

/// Whether the already integrated prefix of `pending` is the block the store
/// holds under the same ids.
///
/// The origin of the element at a clock never changes: it is the block's
/// origin at the start of an insertion, and the previous clock inside one.
fn matches_store(store: &BlockStore, pending: &PendingBlock) -> bool {
    let Some(block) = store.get(pending.id) else {
        return false;
    };
    let offset = pending.id.clock - block.id.clock;
    let origin = match offset {
        0 => block.origin,
        _ => Some(Id::new(pending.id.client, pending.id.clock - 1)),
    };
    if origin != pending.origin || block.right_origin != pending.right_origin {
        return false;
    }
    if pending.parent.as_ref().is_some_and(|p| *p != block.parent) {
        return false;
    }
    match (&block.content, &pending.content) {
        (Content::Deleted(_), _) | (_, Content::Deleted(_)) => return true,
        (Content::String(ours), Content::String(theirs)) => {
            return ours.chars().skip(offset as usize).zip(theirs.chars()).all(|(a, b)| a == b);
        }
        (ours, theirs) => return ours == theirs,
    }
}

/// The root a pending block belongs to: taken from its origin, then its right
/// origin, then the name it carries.
///
/// Decoding guarantees a name when both origins are absent, so `None` only
/// means an origin is not integrated yet.
fn resolve_parent(store: &BlockStore, block: &PendingBlock) -> Option<Arc<str>> {
    if let Some(origin) = block.origin.and_then(|o| store.get(o)) {
        return Some(origin.parent.clone());
    }
    if let Some(right) = block.right_origin.and_then(|r| store.get(r)) {
        return Some(right.parent.clone());
    }
    return block.parent.clone();
}

fn to_pending(block: &Block) -> PendingBlock {
    let content = match block.deleted {
        true => Content::Deleted(block.len),
        false => block.content.clone(),
    };
    let parent = match (block.origin, block.right_origin) {
        (None, None) => Some(block.parent.clone()),
        _ => None,
    };
    return PendingBlock {
        id: block.id,
        origin: block.origin,
        right_origin: block.right_origin,
        parent,
        content,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::Doc;
    use crate::doc::Options;
    use serde_json::json;

    fn pending(client: ClientId, clock: u32, origin: Option<Id>, content: Content) -> PendingBlock {
        let parent = match origin {
            None => Some(Arc::from("t")),
            Some(_) => None,
        };
        return PendingBlock {
            id: Id::new(client, clock),
            origin,
            right_origin: None,
            parent,
            content,
        };
    }

    fn sample() -> Update {
        let mut update = Update::new();
        update.push(pending(1, 0, None, Content::String("héllo".to_string())));
        update.push(pending(1, 5, Some(Id::new(1, 4)), Content::Element(json!({"a": [1, 2]}))));
        let mut attrs = Attrs::new();
        attrs.insert("bold".to_string(), json!(true));
        attrs.insert("italic".to_string(), Value::Null);
        update.push(pending(1, 6, Some(Id::new(1, 5)), Content::Format(attrs)));
        update.push(pending(2, 0, Some(Id::new(1, 2)), Content::Embed(json!("img"))));
        update.push(pending(2, 1, Some(Id::new(2, 0)), Content::Deleted(3)));
        update.delete_set.insert(Id::new(2, 1), 3);
        return update;
    }

    #[test]
    fn encode_decode_preserves_every_content_kind() {
        let update = sample();
        let bytes = update.encode();
        assert_eq!(Update::decode(&bytes).unwrap(), update);
    }

    #[test]
    fn gaps_become_separate_groups() {
        let mut update = Update::new();
        update.push(pending(1, 0, None, Content::String("ab".to_string())));
        update.push(pending(1, 7, Some(Id::new(1, 6)), Content::String("cd".to_string())));
        let decoded = Update::decode(&update.encode()).unwrap();
        let clocks: Vec<u32> = decoded.blocks().map(|b| b.id.clock).collect();
        assert_eq!(clocks, vec![0, 7]);
    }

    #[test]
    fn unknown_tag_fails() {
        let mut enc = Encoder::new();
        enc.write_var(1);
        enc.write_var(1);
        enc.write_var(1);
        enc.write_var(0);
        enc.write_u8(0x0e);
        enc.write_string("t");
        enc.write_var(1);
        let err = Update::decode(&enc.into_bytes()).unwrap_err();
        assert_eq!(err, DecodeError::UnknownContent(0x0e));
    }

    #[test]
    fn empty_block_fails() {
        let mut enc = Encoder::new();
        enc.write_var(1);
        enc.write_var(1);
        enc.write_var(1);
        enc.write_var(0);
        enc.write_u8(TAG_STRING);
        enc.write_string("t");
        enc.write_string("");
        enc.write_var(0);
        let err = Update::decode(&enc.into_bytes()).unwrap_err();
        assert_eq!(err, DecodeError::InvalidBlock("empty block"));
    }

    #[test]
    fn origin_at_or_after_block_fails() {
        let mut enc = Encoder::new();
        enc.write_var(1);
        enc.write_var(1);
        enc.write_var(1);
        enc.write_var(3);
        enc.write_u8(TAG_STRING | HAS_ORIGIN);
        write_id(&mut enc, Id::new(1, 3));
        enc.write_string("x");
        enc.write_var(0);
        let err = Update::decode(&enc.into_bytes()).unwrap_err();
        assert_eq!(err, DecodeError::InvalidBlock("origin does not precede block"));
    }

    #[test]
    fn partially_known_block_is_trimmed_on_integration() {
        let mut source = Doc::with_options(Options::new().with_client_id(1));
        let text = source.get_text("t");
        text.push(&mut source, "ab").unwrap();
        let mut sink = Doc::with_options(Options::new().with_client_id(2));
        sink.apply_update(&source.encode_state_as_update()).unwrap();

        // Squashed on commit, so the full state ships one block over 0..4.
        text.push(&mut source, "cd").unwrap();
        assert_eq!(source.store.blocks(1).len(), 1);
        sink.apply_update(&source.encode_state_as_update()).unwrap();
        assert_eq!(sink.get_text("t").to_plain_text(&sink), "abcd");
        assert_eq!(sink.state_vector(), source.state_vector());
        assert_eq!(sink.client_id(), 2);
    }

    #[test]
    fn blocks_wait_until_their_root_resolves() {
        let mut source = Doc::with_options(Options::new().with_client_id(1));
        source.get_text("t").push(&mut source, "ab").unwrap();
        let first = source.encode_state_as_update();
        let sv = source.state_vector();
        source.get_text("t").push(&mut source, "c").unwrap();

        let mut other = Doc::with_options(Options::new().with_client_id(2));
        other.apply_update(&first).unwrap();
        other.get_text("t").insert(&mut other, 1, "X").unwrap();

        // Client 2's block hangs off client 1, which is sent second.
        let mut sink = Doc::with_options(Options::new().with_client_id(3));
        sink.apply_update(&other.encode_diff(&sv)).unwrap();
        assert!(sink.has_pending());
        sink.apply_update(&source.encode_diff(&StateVector::new())).unwrap();
        assert!(!sink.has_pending());
        assert_eq!(sink.get_text("t").to_plain_text(&sink), "aXbc");
    }

    #[test]
    fn invalid_json_fails() {
        let mut enc = Encoder::new();
        enc.write_var(1);
        enc.write_var(1);
        enc.write_var(1);
        enc.write_var(0);
        enc.write_u8(TAG_ELEMENT);
        enc.write_string("t");
        enc.write_string("{not json");
        enc.write_var(0);
        let err = Update::decode(&enc.into_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidValue(_)));
    }

    #[test]
    fn truncation_and_trailing_bytes_fail() {
        let bytes = sample().encode();
        for cut in 0..bytes.len() {
            assert!(Update::decode(&bytes[..cut]).is_err(), "prefix of {cut} bytes decoded");
        }
        let mut longer = bytes.clone();
        longer.push(0);
        assert_eq!(Update::decode(&longer), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn clock_overflow_fails() {
        let mut enc = Encoder::new();
        enc.write_var(1);
        enc.write_var(1);
        enc.write_var(1);
        enc.write_var(u32::MAX as u64);
        enc.write_u8(TAG_DELETED);
        enc.write_string("t");
        enc.write_var(2);
        enc.write_var(0);
        let err = Update::decode(&enc.into_bytes()).unwrap_err();
        assert_eq!(err, DecodeError::InvalidBlock("clock overflows"));
    }

    #[test]
    fn merge_drops_duplicates() {
        let mut a = sample();
        a.merge(sample());
        assert_eq!(a, sample());
        assert_eq!(a.block_count(), 5);
    }

    #[test]
    fn trimming_rewrites_origin() {
        let block = pending(1, 0, None, Content::String("hello".to_string()));
        let trimmed = block.trimmed(2);
        assert_eq!(trimmed.id, Id::new(1, 2));
        assert_eq!(trimmed.origin, Some(Id::new(1, 1)));
        assert_eq!(trimmed.parent, None);
        assert_eq!(trimmed.content, Content::String("llo".to_string()));
    }

    #[test]
    fn empty_update_round_trips() {
        let update = Update::new();
        let bytes = update.encode();
        assert_eq!(bytes, vec![0, 0]);
        assert!(Update::decode(&bytes).unwrap().is_empty());
    }
}
