//! Translation-sync side channel.
//!
//! A fork child running under a dynamic binary translator reports every block
//! it had to translate (and every chaining decision) to the primed parent,
//! which mirrors the work so the next fork inherits a warm translation cache.
//! The whole path is best effort: failures only cost performance.

use log::trace;
use std::fs::File;
use std::io::{Read, Write};

/// Size in bytes of each frame on the wire.
pub const FRAME_LEN: usize = 24;

/// Identifies one translated block for a given execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub pc: u64,
    pub cs_base: u64,
    pub flags: u32,
}

impl BlockKey {
    pub fn new(pc: u64, cs_base: u64, flags: u32) -> Self {
        Self { pc, cs_base, flags }
    }

    fn encode_into(&self, frame: &mut [u8; FRAME_LEN], tail: [u8; 4]) {
        frame[0..8].copy_from_slice(&self.pc.to_ne_bytes());
        frame[8..16].copy_from_slice(&self.cs_base.to_ne_bytes());
        frame[16..20].copy_from_slice(&self.flags.to_ne_bytes());
        frame[20..24].copy_from_slice(&tail);
    }

    fn decode_from(frame: &[u8; FRAME_LEN]) -> (Self, [u8; 4]) {
        let mut pc = [0u8; 8];
        let mut cs_base = [0u8; 8];
        let mut flags = [0u8; 4];
        let mut tail = [0u8; 4];
        pc.copy_from_slice(&frame[0..8]);
        cs_base.copy_from_slice(&frame[8..16]);
        flags.copy_from_slice(&frame[16..20]);
        tail.copy_from_slice(&frame[20..24]);
        (
            Self {
                pc: u64::from_ne_bytes(pc),
                cs_base: u64::from_ne_bytes(cs_base),
                flags: u32::from_ne_bytes(flags),
            },
            tail,
        )
    }
}

/// One exit of a translated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainEdge {
    pub source: BlockKey,
    pub exit_slot: u32,
}

/// A message from the fork child to the primed parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRecord {
    /// The child translated `block`.
    Translate(BlockKey),
    /// The child translated (or resolved) `block` and chained `edge` to it.
    Chain { block: BlockKey, edge: ChainEdge },
}

impl SyncRecord {
    pub fn block(&self) -> BlockKey {
        match self {
            SyncRecord::Translate(block) | SyncRecord::Chain { block, .. } => *block,
        }
    }

    /// Encodes the record as one frame, or two back-to-back frames when
    /// chained. The chain flag lives in the first frame.
    pub fn encode(&self) -> Vec<u8> {
        let mut first = [0u8; FRAME_LEN];
        match self {
            SyncRecord::Translate(block) => {
                block.encode_into(&mut first, [0, 0, 0, 0]);
                first.to_vec()
            }
            SyncRecord::Chain { block, edge } => {
                block.encode_into(&mut first, [1, 0, 0, 0]);
                let mut second = [0u8; FRAME_LEN];
                edge.source
                    .encode_into(&mut second, edge.exit_slot.to_ne_bytes());
                let mut out = Vec::with_capacity(2 * FRAME_LEN);
                out.extend_from_slice(&first);
                out.extend_from_slice(&second);
                out
            }
        }
    }
}

/// The translator that owns the cache the parent keeps warm.
///
/// `lookup`, `translate` and `chain` mirror the hooks a dynamic translation
/// engine exposes. Mutating calls are issued from inside [`locked`], which
/// implementors override to take whatever mutual exclusion the engine
/// requires around cache insertion and block patching.
///
/// [`locked`]: TranslationCache::locked
pub trait TranslationCache {
    /// Handle to a translated block.
    type Block;

    fn lookup(&self, key: &BlockKey) -> Option<Self::Block>;

    /// Translates `key`. `None` means translation failed; that is not an error.
    fn translate(&mut self, key: &BlockKey) -> Option<Self::Block>;

    fn is_invalid(&self, block: &Self::Block) -> bool;

    /// Patches exit `exit_slot` of `source` to jump straight into `target`.
    fn chain(&mut self, source: &Self::Block, exit_slot: u32, target: &Self::Block);

    fn locked<R>(&mut self, op: impl FnOnce(&mut Self) -> R) -> R {
        op(self)
    }
}

/// Cache for natively compiled targets: nothing to translate or chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCache;

impl TranslationCache for NullCache {
    type Block = ();

    fn lookup(&self, _key: &BlockKey) -> Option<()> {
        None
    }

    fn translate(&mut self, _key: &BlockKey) -> Option<()> {
        None
    }

    fn is_invalid(&self, _block: &()) -> bool {
        true
    }

    fn chain(&mut self, _source: &(), _exit_slot: u32, _target: &()) {}
}

/// Counters for one servicing session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub records: u64,
    pub translated: u64,
    pub chained: u64,
}

enum Frame {
    Complete([u8; FRAME_LEN]),
    Closed,
}

fn read_frame<R: Read>(reader: &mut R) -> Frame {
    let mut frame = [0u8; FRAME_LEN];
    match reader.read_exact(&mut frame) {
        Ok(()) => Frame::Complete(frame),
        Err(_) => Frame::Closed,
    }
}

/// Services translation requests until the child side closes the channel.
///
/// A chained record is only acted on once both frames have been read in
/// full; if the channel closes between them the pair is discarded.
pub fn service<R, C>(mut reader: R, cache: &mut C) -> SyncStats
where
    R: Read,
    C: TranslationCache,
{
    let mut stats = SyncStats::default();

    loop {
        let first = match read_frame(&mut reader) {
            Frame::Complete(frame) => frame,
            Frame::Closed => break,
        };
        let (block_key, tail) = BlockKey::decode_from(&first);
        let is_chain = match tail[0] {
            0 => false,
            1 => true,
            other => {
                trace!("translation sync: bad chain flag {other}, closing");
                break;
            }
        };
        stats.records += 1;

        let block = match cache.lookup(&block_key) {
            Some(block) => Some(block),
            None => {
                let translated = cache.locked(|c| c.translate(&block_key));
                if translated.is_some() {
                    stats.translated += 1;
                } else {
                    trace!("translation sync: could not translate {block_key:?}");
                }
                translated
            }
        };

        if !is_chain {
            continue;
        }

        let second = match read_frame(&mut reader) {
            Frame::Complete(frame) => frame,
            Frame::Closed => break,
        };
        let (source_key, slot) = BlockKey::decode_from(&second);
        let exit_slot = u32::from_ne_bytes(slot);

        let Some(target) = block else { continue };
        let Some(source) = cache.lookup(&source_key) else {
            continue;
        };
        let patched = cache.locked(|c| {
            if c.is_invalid(&source) || c.is_invalid(&target) {
                false
            } else {
                c.chain(&source, exit_slot, &target);
                true
            }
        });
        if patched {
            stats.chained += 1;
        }
    }

    stats
}

/// Fork-child side of the channel. Writes are fire-and-forget.
#[derive(Debug)]
pub struct TslProducer {
    sink: Option<File>,
}

impl TslProducer {
    pub fn new(sink: File) -> Self {
        Self { sink: Some(sink) }
    }

    /// A producer that never emits, for processes that are not fork children.
    pub fn inactive() -> Self {
        Self { sink: None }
    }

    pub fn is_active(&self) -> bool {
        self.sink.is_some()
    }

    /// Reports a block translation, optionally together with the edge that
    /// was chained to it. Once the parent stops listening, further records
    /// are dropped.
    pub fn request(&mut self, block: BlockKey, preceding: Option<ChainEdge>) {
        let record = match preceding {
            Some(edge) => SyncRecord::Chain { block, edge },
            None => SyncRecord::Translate(block),
        };
        self.send(&record);
    }

    pub fn send(&mut self, record: &SyncRecord) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        // At most two frames, well below PIPE_BUF, so the pair lands atomically.
        if sink.write_all(&record.encode()).is_err() {
            self.sink = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelRole, Pipe};
    use std::collections::HashMap;
    use std::io::Cursor;

    #[derive(Default)]
    struct RecordingCache {
        blocks: HashMap<BlockKey, bool>,
        fail_translation: bool,
        translations: Vec<BlockKey>,
        chains: Vec<(BlockKey, u32, BlockKey)>,
        lock_depth: u32,
        max_lock_depth: u32,
    }

    impl TranslationCache for RecordingCache {
        type Block = (BlockKey, bool);

        fn lookup(&self, key: &BlockKey) -> Option<Self::Block> {
            self.blocks.get(key).map(|invalid| (*key, *invalid))
        }

        fn translate(&mut self, key: &BlockKey) -> Option<Self::Block> {
            assert_eq!(self.lock_depth, 1, "translate outside of the lock");
            if self.fail_translation {
                return None;
            }
            self.translations.push(*key);
            self.blocks.insert(*key, false);
            Some((*key, false))
        }

        fn is_invalid(&self, block: &Self::Block) -> bool {
            block.1
        }

        fn chain(&mut self, source: &Self::Block, exit_slot: u32, target: &Self::Block) {
            assert_eq!(self.lock_depth, 1, "chain outside of the lock");
            self.chains.push((source.0, exit_slot, target.0));
        }

        fn locked<R>(&mut self, op: impl FnOnce(&mut Self) -> R) -> R {
            self.lock_depth += 1;
            self.max_lock_depth = self.max_lock_depth.max(self.lock_depth);
            let out = op(self);
            self.lock_depth -= 1;
            out
        }
    }

    fn key(pc: u64) -> BlockKey {
        BlockKey::new(pc, 0x10, 7)
    }

    #[test]
    fn standalone_records_translate_missing_blocks_once() {
        let mut wire = Vec::new();
        wire.extend(SyncRecord::Translate(key(0x1000)).encode());
        wire.extend(SyncRecord::Translate(key(0x2000)).encode());
        wire.extend(SyncRecord::Translate(key(0x1000)).encode());

        let mut cache = RecordingCache::default();
        let stats = service(Cursor::new(wire), &mut cache);

        assert_eq!(stats.records, 3);
        assert_eq!(stats.translated, 2);
        assert_eq!(cache.translations, vec![key(0x1000), key(0x2000)]);
        assert_eq!(cache.lock_depth, 0);
        assert_eq!(cache.max_lock_depth, 1);
    }

    #[test]
    fn chained_record_patches_the_preceding_block() {
        let mut cache = RecordingCache::default();
        cache.blocks.insert(key(0x1000), false);

        let record = SyncRecord::Chain {
            block: key(0x2000),
            edge: ChainEdge { source: key(0x1000), exit_slot: 1 },
        };
        let stats = service(Cursor::new(record.encode()), &mut cache);

        assert_eq!(stats.chained, 1);
        assert_eq!(cache.chains, vec![(key(0x1000), 1, key(0x2000))]);
    }

    #[test]
    fn truncated_chain_pair_never_patches() {
        let mut cache = RecordingCache::default();
        cache.blocks.insert(key(0x1000), false);

        let record = SyncRecord::Chain {
            block: key(0x2000),
            edge: ChainEdge { source: key(0x1000), exit_slot: 0 },
        };
        let mut wire = record.encode();
        wire.truncate(FRAME_LEN + 10);

        let stats = service(Cursor::new(wire), &mut cache);
        assert!(cache.chains.is_empty());
        assert_eq!(stats.chained, 0);
        // The block itself is still warmed.
        assert_eq!(cache.translations, vec![key(0x2000)]);
    }

    #[test]
    fn invalid_or_unknown_blocks_are_not_chained() {
        let mut cache = RecordingCache::default();
        cache.blocks.insert(key(0x2000), true);

        let mut wire = Vec::new();
        // Target is invalid.
        wire.extend(
            SyncRecord::Chain {
                block: key(0x2000),
                edge: ChainEdge { source: key(0x2000), exit_slot: 0 },
            }
            .encode(),
        );
        // Source is unknown to the parent.
        wire.extend(
            SyncRecord::Chain {
                block: key(0x3000),
                edge: ChainEdge { source: key(0x9000), exit_slot: 1 },
            }
            .encode(),
        );

        let stats = service(Cursor::new(wire), &mut cache);
        assert_eq!(stats.records, 2);
        assert!(cache.chains.is_empty());
    }

    #[test]
    fn failed_translation_keeps_frames_aligned() {
        let mut cache = RecordingCache { fail_translation: true, ..Default::default() };
        cache.blocks.insert(key(0x1000), false);

        let mut wire = Vec::new();
        wire.extend(
            SyncRecord::Chain {
                block: key(0x5000),
                edge: ChainEdge { source: key(0x1000), exit_slot: 0 },
            }
            .encode(),
        );
        wire.extend(SyncRecord::Translate(key(0x1000)).encode());

        let stats = service(Cursor::new(wire), &mut cache);
        assert_eq!(stats.records, 2);
        assert_eq!(stats.translated, 0);
        assert!(cache.chains.is_empty());
    }

    #[test]
    fn producer_feeds_consumer_over_a_real_pipe() {
        // Upstream pipe of a channel: child writes, parent reads.
        let (parent, child) = Channel::open().unwrap().split();
        let mut producer = TslProducer::new(child.write.into_file());
        producer.request(key(0x4000), None);
        producer.request(
            key(0x5000),
            Some(ChainEdge { source: key(0x4000), exit_slot: 1 }),
        );
        drop(producer);
        drop(child.read);
        drop(parent.write);

        let mut cache = RecordingCache::default();
        let stats = service(parent.read.into_file(), &mut cache);
        assert_eq!(stats.records, 2);
        assert_eq!(cache.translations, vec![key(0x4000), key(0x5000)]);
        assert_eq!(cache.chains, vec![(key(0x4000), 1, key(0x5000))]);
    }

    #[test]
    fn producer_drops_records_once_the_parent_is_gone() {
        let pipe = Pipe::open().unwrap();
        let writer = pipe.into_end(ChannelRole::ChildWrite).into_file();
        let mut producer = TslProducer::new(writer);
        producer.request(key(1), None);
        assert!(!producer.is_active());
        producer.request(key(2), None);

        let mut inactive = TslProducer::inactive();
        inactive.request(key(3), None);
        assert!(!inactive.is_active());
    }
}
