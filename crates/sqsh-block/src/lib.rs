#![forbid(unsafe_code)]
//! Parallel block processor for sqsh.
//!
//! Consumes whole-file byte streams, splits them into `block_size` units,
//! compresses full blocks on a worker pool, packs trailing partial blocks
//! into shared fragment blocks, deduplicates identical on-disk content,
//! and emits everything in deterministic order.
//!
//! **Locking strategy:** one `parking_lot::Mutex` protects the work queue,
//! the completion heap, the termination flag, and the error slot. Two
//! condvars hang off it: `queue_cond` wakes workers when work arrives,
//! `done_cond` wakes the producer when a completion lands. The producer
//! drains completions strictly by ascending sequence id, so the bytes
//! written to the sink are a pure function of the inputs and the
//! configuration, independent of worker count. The dedup index and the
//! output sink are touched by the producer only.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use sqsh_compress::Compressor;
use sqsh_error::{Result, SqshError};
use sqsh_types::{BlockDesc, BlockKind, BlockSize, FragmentRef, PackedBlocks};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io::{self, Read};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

mod sink;
pub use sink::BlockSink;

/// Per-file packing controls for `submit_file`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitFlags {
    /// Store the trailing partial block as a data block instead of packing
    /// it into a fragment.
    pub no_fragment: bool,
    /// Store this file's data blocks verbatim.
    pub no_compress: bool,
}

/// Index of a submitted file; results come back in the same order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(pub u32);

/// One emitted fragment block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FragmentBlock {
    /// Absolute byte offset in the image.
    pub start: u64,
    /// Bytes on disk.
    pub disk_size: u32,
    /// Whether the block went through the codec.
    pub compressed: bool,
}

/// Counters reported after packing.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PackStats {
    pub files: u64,
    pub blocks_submitted: u64,
    pub sparse_blocks: u64,
    pub fragment_blocks: u64,
    pub tail_fragments: u64,
    pub files_deduped: u64,
    pub fragment_blocks_deduped: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Processor tuning knobs.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub block_size: BlockSize,
    /// Worker threads; 0 runs every block inline on the producer.
    pub workers: usize,
    /// Bound on in-flight work items; the producer blocks when reached.
    pub max_backlog: usize,
    pub fragments_enabled: bool,
    pub dedup_enabled: bool,
}

impl ProcessorConfig {
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            block_size,
            workers,
            max_backlog: workers * 10,
            fragments_enabled: true,
            dedup_enabled: true,
        }
    }
}

// ── Work items ──────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Target {
    Data { file: u32 },
    Fragment { index: u32 },
}

struct WorkItem {
    seq: u64,
    target: Target,
    data: Vec<u8>,
    no_compress: bool,
}

enum WorkResult {
    /// All-zero data block; nothing to store.
    Sparse { uncompressed: u32 },
    /// Bytes to land on disk, compressed or raw.
    Bytes {
        data: Vec<u8>,
        uncompressed: u32,
        compressed: bool,
    },
}

struct DoneItem {
    seq: u64,
    target: Target,
    result: WorkResult,
}

impl PartialEq for DoneItem {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for DoneItem {}
impl PartialOrd for DoneItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DoneItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.seq.cmp(&other.seq)
    }
}

// ── Shared state ────────────────────────────────────────────────────────────

struct SharedState {
    queue: VecDeque<WorkItem>,
    done: BinaryHeap<Reverse<DoneItem>>,
    terminate: bool,
    error: Option<SqshError>,
}

struct Shared {
    state: Mutex<SharedState>,
    /// Workers sleep here while the queue is empty.
    queue_cond: Condvar,
    /// The producer sleeps here while waiting for completions.
    done_cond: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(SharedState {
                queue: VecDeque::new(),
                done: BinaryHeap::new(),
                terminate: false,
                error: None,
            }),
            queue_cond: Condvar::new(),
            done_cond: Condvar::new(),
        }
    }
}

/// Run one work item: sparse check (data blocks only), then compression.
fn process_item(
    item: WorkItem,
    cmp: &mut dyn Compressor,
    scratch: &mut [u8],
) -> Result<DoneItem> {
    let uncompressed = item.data.len() as u32;

    let is_fragment = matches!(item.target, Target::Fragment { .. });
    if !is_fragment && item.data.iter().all(|b| *b == 0) {
        return Ok(DoneItem {
            seq: item.seq,
            target: item.target,
            result: WorkResult::Sparse { uncompressed },
        });
    }

    if item.no_compress {
        return Ok(DoneItem {
            seq: item.seq,
            target: item.target,
            result: WorkResult::Bytes {
                data: item.data,
                uncompressed,
                compressed: false,
            },
        });
    }

    let result = match cmp.compress(&item.data, scratch)? {
        Some(n) => WorkResult::Bytes {
            data: scratch[..n].to_vec(),
            uncompressed,
            compressed: true,
        },
        None => WorkResult::Bytes {
            data: item.data,
            uncompressed,
            compressed: false,
        },
    };
    Ok(DoneItem {
        seq: item.seq,
        target: item.target,
        result,
    })
}

fn worker_loop(shared: Arc<Shared>, mut cmp: Box<dyn Compressor>, block_size: usize) {
    let mut scratch = vec![0_u8; block_size];
    loop {
        let item = {
            let mut state = shared.state.lock();
            loop {
                if state.terminate {
                    return;
                }
                if let Some(item) = state.queue.pop_front() {
                    break item;
                }
                shared.queue_cond.wait(&mut state);
            }
        };

        match process_item(item, cmp.as_mut(), &mut scratch) {
            Ok(done) => {
                let mut state = shared.state.lock();
                state.done.push(Reverse(done));
                shared.done_cond.notify_one();
            }
            Err(err) => {
                // First error wins; then this worker exits.
                let mut state = shared.state.lock();
                if state.error.is_none() {
                    state.error = Some(err);
                }
                shared.done_cond.notify_all();
                return;
            }
        }
    }
}

// ── Dedup index ─────────────────────────────────────────────────────────────

/// `(on-disk length << 32) | crc32c` over the on-disk bytes.
fn signature(data: &[u8]) -> u64 {
    ((data.len() as u64) << 32) | u64::from(crc32c::crc32c(data))
}

/// Record of one block that landed on disk, in write order. Offsets are
/// contiguous: every entry starts where the previous one ended.
#[derive(Debug, Clone, Copy)]
struct BlockInfo {
    offset: u64,
    signature: u64,
}

// ── Per-file bookkeeping ────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct FileSlot {
    blocks: Vec<BlockDesc>,
    fragment: Option<FragmentRef>,
    start_block: u64,
    size: u64,
    sparse_bytes: u64,
    /// Index into the emitted-block list where this file's run begins.
    first_written: Option<usize>,
    written: usize,
    drained: usize,
    /// Set once `submit_file` has enqueued everything.
    expected: Option<usize>,
    dedup_done: bool,
}

impl FileSlot {
    fn complete(&self) -> bool {
        self.expected == Some(self.drained)
    }
}

// ── The processor ───────────────────────────────────────────────────────────

pub struct BlockProcessor<W: BlockSink> {
    cfg: ProcessorConfig,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    sink: Option<W>,

    enqueue_seq: u64,
    dequeue_seq: u64,
    backlog: usize,
    /// Set once an error surfaced; all further submissions are refused
    /// (a worker may have dropped an item, so the backlog can no longer
    /// drain).
    failed: bool,

    /// Inline execution state, used when `cfg.workers == 0`.
    inline_cmp: Box<dyn Compressor>,
    inline_scratch: Vec<u8>,

    files: Vec<FileSlot>,
    emitted: Vec<BlockInfo>,
    sig_index: HashMap<u64, Vec<usize>>,

    frag_buffer: Vec<u8>,
    frag_pending: Vec<(u32, u32)>,
    next_fragment: u32,
    fragments: Vec<Option<FragmentBlock>>,

    stats: PackStats,
}

/// Everything the processor produced, handed back after `flush`.
pub struct PackOutcome<W> {
    pub sink: W,
    /// Per-file results, indexed by `FileId` submission order.
    pub files: Vec<PackedBlocks>,
    /// Fragment blocks in flush order.
    pub fragments: Vec<FragmentBlock>,
    pub stats: PackStats,
}

impl<W: BlockSink> BlockProcessor<W> {
    /// Spawn the worker pool. `compressor` is forked once per worker; the
    /// original serves inline execution when `cfg.workers == 0`.
    pub fn new(cfg: ProcessorConfig, compressor: Box<dyn Compressor>, sink: W) -> Self {
        let shared = Arc::new(Shared::new());
        let workers = (0..cfg.workers)
            .map(|i| {
                let shared = Arc::clone(&shared);
                let cmp = compressor.fork();
                let block_size = cfg.block_size.as_usize();
                std::thread::Builder::new()
                    .name(format!("sqsh-compress-{i}"))
                    .spawn(move || worker_loop(shared, cmp, block_size))
                    .expect("spawning a named thread cannot fail")
            })
            .collect();

        let block_size = cfg.block_size.as_usize();
        Self {
            cfg,
            shared,
            workers,
            sink: Some(sink),
            enqueue_seq: 0,
            dequeue_seq: 0,
            backlog: 0,
            failed: false,
            inline_cmp: compressor,
            inline_scratch: vec![0_u8; block_size],
            files: Vec::new(),
            emitted: Vec::new(),
            sig_index: HashMap::new(),
            frag_buffer: Vec::new(),
            frag_pending: Vec::new(),
            next_fragment: 0,
            fragments: Vec::new(),
            stats: PackStats::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &PackStats {
        &self.stats
    }

    /// Read `source` to completion and enqueue its blocks.
    ///
    /// Full blocks become compression work items. A trailing partial block
    /// goes to the fragment assembler unless fragments are disabled, the
    /// file opts out, or the tail is all zeros (which packs better as a
    /// sparse block).
    pub fn submit_file(&mut self, source: &mut dyn Read, flags: SubmitFlags) -> Result<FileId> {
        self.check_alive()?;
        let file = self.files.len() as u32;
        self.files.push(FileSlot::default());
        self.stats.files += 1;

        let block_size = self.cfg.block_size.as_usize();
        let mut expected = 0_usize;
        let mut buf = vec![0_u8; block_size];
        loop {
            let n = read_full(source, &mut buf)?;
            self.files[file as usize].size += n as u64;
            self.stats.bytes_read += n as u64;

            if n == block_size {
                self.enqueue(
                    Target::Data { file },
                    buf.clone(),
                    flags.no_compress,
                )?;
                expected += 1;
                continue;
            }

            // Trailing partial block (possibly empty).
            if n > 0 {
                let tail = &buf[..n];
                let tail_is_zero = tail.iter().all(|b| *b == 0);
                if self.cfg.fragments_enabled && !flags.no_fragment && !tail_is_zero {
                    self.add_tail(file, tail.to_vec())?;
                } else {
                    self.enqueue(Target::Data { file }, tail.to_vec(), flags.no_compress)?;
                    expected += 1;
                }
            }
            break;
        }

        self.stats.blocks_submitted += expected as u64;
        self.files[file as usize].expected = Some(expected);
        self.maybe_dedup_file(file)?;
        Ok(FileId(file))
    }

    /// Flush the open fragment, drain every outstanding work item, and
    /// surface the first recorded error.
    pub fn flush(&mut self) -> Result<()> {
        self.check_alive()?;
        if !self.frag_buffer.is_empty() {
            self.flush_fragment()?;
        }
        loop {
            self.drain_ready()?;
            if self.backlog == 0 {
                break;
            }
            self.wait_for_completion()?;
        }
        Ok(())
    }

    /// Flush, stop the workers, and hand back the sink plus all results.
    pub fn into_outcome(mut self) -> Result<PackOutcome<W>> {
        self.flush()?;
        self.shutdown();

        if let Some(err) = self.shared.state.lock().error.take() {
            return Err(err);
        }

        let files = self
            .files
            .drain(..)
            .map(|slot| PackedBlocks {
                start_block: slot.start_block,
                blocks: slot.blocks,
                fragment: slot.fragment,
                size: slot.size,
                sparse_bytes: slot.sparse_bytes,
            })
            .collect();

        let mut fragments = Vec::with_capacity(self.fragments.len());
        for (idx, slot) in self.fragments.drain(..).enumerate() {
            let Some(block) = slot else {
                return Err(SqshError::Internal(format!(
                    "fragment {idx} never completed"
                )));
            };
            fragments.push(block);
        }

        let sink = self
            .sink
            .take()
            .ok_or_else(|| SqshError::Internal("block processor sink already taken".into()))?;

        debug!(
            files = self.stats.files,
            blocks = self.stats.blocks_submitted,
            sparse = self.stats.sparse_blocks,
            fragments = self.stats.fragment_blocks,
            deduped = self.stats.files_deduped,
            "block processing finished"
        );
        Ok(PackOutcome {
            sink,
            files,
            fragments,
            stats: self.stats,
        })
    }

    // ── Fragment assembler ──────────────────────────────────────────────

    /// Place a file tail at the end of the in-flight fragment buffer,
    /// flushing first when it would not fit.
    fn add_tail(&mut self, file: u32, tail: Vec<u8>) -> Result<()> {
        let capacity = self.cfg.block_size.as_usize();
        if self.frag_buffer.len() + tail.len() > capacity {
            self.flush_fragment()?;
        }
        let offset = self.frag_buffer.len() as u32;
        self.frag_pending.push((file, offset));
        self.frag_buffer.extend_from_slice(&tail);
        self.stats.tail_fragments += 1;
        Ok(())
    }

    /// Seal the current fragment buffer: assign the next fragment index,
    /// record every contributor's placement, and queue the block for
    /// compression like any other.
    fn flush_fragment(&mut self) -> Result<()> {
        let index = self.next_fragment;
        self.next_fragment += 1;
        self.fragments.push(None);

        for (file, offset) in self.frag_pending.drain(..) {
            self.files[file as usize].fragment = Some(FragmentRef { index, offset });
        }

        let data = std::mem::take(&mut self.frag_buffer);
        trace!(index, size = data.len(), "fragment block sealed");
        self.enqueue(Target::Fragment { index }, data, false)
    }

    // ── Queue plumbing ──────────────────────────────────────────────────

    fn enqueue(&mut self, target: Target, data: Vec<u8>, no_compress: bool) -> Result<()> {
        let item = WorkItem {
            seq: self.enqueue_seq,
            target,
            data,
            no_compress,
        };
        self.enqueue_seq += 1;

        if self.cfg.workers == 0 {
            // Inline mode: same code path, no threads, already in order.
            let done = match process_item(item, self.inline_cmp.as_mut(), &mut self.inline_scratch)
            {
                Ok(done) => done,
                Err(err) => return Err(self.fail(err)),
            };
            self.dequeue_seq += 1;
            return self.complete_item(done);
        }

        // Backpressure: drain what is ready, sleep until there is room.
        loop {
            self.drain_ready()?;
            if self.backlog < self.cfg.max_backlog {
                break;
            }
            self.wait_for_completion()?;
        }

        let error = {
            let mut state = self.shared.state.lock();
            match state.error.take() {
                Some(err) => Some(err),
                None => {
                    state.queue.push_back(item);
                    None
                }
            }
        };
        if let Some(err) = error {
            return Err(self.fail(err));
        }
        self.shared.queue_cond.notify_one();
        self.backlog += 1;
        Ok(())
    }

    /// Pop and process every completion whose sequence id is next in line.
    fn drain_ready(&mut self) -> Result<()> {
        loop {
            let (done, error) = {
                let mut state = self.shared.state.lock();
                let error = state.error.take();
                let done = if error.is_some() {
                    None
                } else {
                    match state.done.peek() {
                        Some(Reverse(item)) if item.seq == self.dequeue_seq => {
                            state.done.pop().map(|Reverse(item)| item)
                        }
                        _ => None,
                    }
                };
                (done, error)
            };
            if let Some(err) = error {
                return Err(self.fail(err));
            }
            let Some(done) = done else {
                return Ok(());
            };
            self.dequeue_seq += 1;
            self.backlog -= 1;
            self.complete_item(done)?;
        }
    }

    /// Sleep until the next in-order completion is available.
    fn wait_for_completion(&mut self) -> Result<()> {
        let error = {
            let mut state = self.shared.state.lock();
            loop {
                if let Some(err) = state.error.take() {
                    break Some(err);
                }
                let ready = matches!(
                    state.done.peek(),
                    Some(Reverse(item)) if item.seq == self.dequeue_seq
                );
                if ready {
                    break None;
                }
                self.shared.done_cond.wait(&mut state);
            }
        };
        match error {
            Some(err) => Err(self.fail(err)),
            None => Ok(()),
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.failed {
            return Err(SqshError::Internal(
                "block processor used after a failure".into(),
            ));
        }
        Ok(())
    }

    /// Record that an error escaped to the caller and stop accepting work.
    fn fail(&mut self, err: SqshError) -> SqshError {
        self.failed = true;
        err
    }

    fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.terminate = true;
        }
        self.shared.queue_cond.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }

    // ── Completion handling (producer only) ─────────────────────────────

    fn complete_item(&mut self, done: DoneItem) -> Result<()> {
        match done.target {
            Target::Data { file } => self.complete_data(file, done.result),
            Target::Fragment { index } => self.complete_fragment(index, done.result),
        }
    }

    fn complete_data(&mut self, file: u32, result: WorkResult) -> Result<()> {
        match result {
            WorkResult::Sparse { uncompressed } => {
                let slot = &mut self.files[file as usize];
                slot.blocks.push(BlockDesc {
                    uncompressed_size: uncompressed,
                    disk_size: 0,
                    kind: BlockKind::Sparse,
                });
                slot.sparse_bytes += u64::from(uncompressed);
                self.stats.sparse_blocks += 1;
            }
            WorkResult::Bytes {
                data,
                uncompressed,
                compressed,
            } => {
                let offset = self.emit(&data)?;
                let slot = &mut self.files[file as usize];
                if slot.first_written.is_none() {
                    slot.first_written = Some(self.emitted.len() - 1);
                    slot.start_block = offset;
                }
                slot.written += 1;
                slot.blocks.push(BlockDesc {
                    uncompressed_size: uncompressed,
                    disk_size: data.len() as u32,
                    kind: if compressed {
                        BlockKind::Compressed
                    } else {
                        BlockKind::Raw
                    },
                });
            }
        }
        self.files[file as usize].drained += 1;
        self.maybe_dedup_file(file)
    }

    fn complete_fragment(&mut self, index: u32, result: WorkResult) -> Result<()> {
        let WorkResult::Bytes {
            data, compressed, ..
        } = result
        else {
            return Err(SqshError::Internal(
                "fragment block came back sparse".into(),
            ));
        };

        // Fragment blocks are addressed individually, so a single-block
        // signature match is enough to reuse an existing copy.
        if self.cfg.dedup_enabled {
            if let Some(offset) = self.find_identical_block(&data)? {
                self.fragments[index as usize] = Some(FragmentBlock {
                    start: offset,
                    disk_size: data.len() as u32,
                    compressed,
                });
                self.stats.fragment_blocks_deduped += 1;
                self.stats.fragment_blocks += 1;
                return Ok(());
            }
        }

        let offset = self.emit(&data)?;
        self.fragments[index as usize] = Some(FragmentBlock {
            start: offset,
            disk_size: data.len() as u32,
            compressed,
        });
        self.stats.fragment_blocks += 1;
        Ok(())
    }

    /// Append on-disk bytes to the sink and index them for dedup.
    fn emit(&mut self, data: &[u8]) -> Result<u64> {
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| SqshError::Internal("sink gone while emitting".into()))?;
        let offset = sink.append(data)?;
        let sig = signature(data);
        self.sig_index
            .entry(sig)
            .or_default()
            .push(self.emitted.len());
        self.emitted.push(BlockInfo {
            offset,
            signature: sig,
        });
        self.stats.bytes_written += data.len() as u64;
        Ok(offset)
    }

    /// Whole-file dedup: once every block of a file has drained, its run
    /// of emitted blocks is the newest content in the sink. If an earlier,
    /// byte-identical run exists, rewind the sink and point the file at
    /// the old copy. (Individual blocks cannot be redirected: the format
    /// addresses a file's blocks contiguously from `start_block`.)
    fn maybe_dedup_file(&mut self, file: u32) -> Result<()> {
        let slot = &self.files[file as usize];
        if !slot.complete() || slot.dedup_done {
            return Ok(());
        }
        self.files[file as usize].dedup_done = true;
        if !self.cfg.dedup_enabled {
            return Ok(());
        }
        let slot = &self.files[file as usize];
        let Some(first) = slot.first_written else {
            return Ok(());
        };
        let written = slot.written;
        if written == 0 {
            return Ok(());
        }
        debug_assert_eq!(first + written, self.emitted.len());

        let run: Vec<u64> = self.emitted[first..]
            .iter()
            .map(|b| b.signature)
            .collect();
        let run_disk_size: u64 = run.iter().map(|sig| sig >> 32).sum();

        let Some(candidate) = self.find_identical_run(first, &run, run_disk_size)? else {
            return Ok(());
        };

        // Rewind: the file's blocks are the tail of the sink.
        let start = self.files[file as usize].start_block;
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| SqshError::Internal("sink gone while deduplicating".into()))?;
        sink.truncate(start)?;
        self.stats.bytes_written -= run_disk_size;
        for pos in (first..first + written).rev() {
            let sig = self.emitted[pos].signature;
            if let Some(entries) = self.sig_index.get_mut(&sig) {
                if let Some(at) = entries.iter().rposition(|p| *p == pos) {
                    entries.swap_remove(at);
                }
                if entries.is_empty() {
                    self.sig_index.remove(&sig);
                }
            }
        }
        self.emitted.truncate(first);

        let slot = &mut self.files[file as usize];
        slot.start_block = candidate;
        slot.first_written = None;
        self.stats.files_deduped += 1;
        trace!(file, offset = candidate, "file content deduplicated");
        Ok(())
    }

    /// Search for an earlier run of blocks matching `run`, ending before
    /// list position `limit`. Returns the disk offset of the match.
    fn find_identical_run(
        &mut self,
        limit: usize,
        run: &[u64],
        run_disk_size: u64,
    ) -> Result<Option<u64>> {
        let Some(first_sig) = run.first() else {
            return Ok(None);
        };
        let candidates: Vec<usize> = self
            .sig_index
            .get(first_sig)
            .map(|positions| {
                positions
                    .iter()
                    .copied()
                    .filter(|p| p + run.len() <= limit)
                    .collect()
            })
            .unwrap_or_default();

        'candidate: for start in candidates {
            for (i, sig) in run.iter().enumerate() {
                if self.emitted[start + i].signature != *sig {
                    continue 'candidate;
                }
            }
            // Signatures agree; verify bytes before trusting the match.
            let old_offset = self.emitted[start].offset;
            let new_offset = self.emitted[limit].offset;
            if self.regions_equal(old_offset, new_offset, run_disk_size)? {
                return Ok(Some(old_offset));
            }
        }
        Ok(None)
    }

    /// Single-block variant used for fragment blocks, checked before the
    /// bytes are written.
    fn find_identical_block(&mut self, data: &[u8]) -> Result<Option<u64>> {
        let sig = signature(data);
        let candidates: Vec<usize> = self
            .sig_index
            .get(&sig)
            .map(|positions| positions.clone())
            .unwrap_or_default();
        let mut stored = vec![0_u8; data.len()];
        for pos in candidates {
            let offset = self.emitted[pos].offset;
            let sink = self
                .sink
                .as_mut()
                .ok_or_else(|| SqshError::Internal("sink gone while deduplicating".into()))?;
            sink.read_at(offset, &mut stored)?;
            if stored == data {
                return Ok(Some(offset));
            }
        }
        Ok(None)
    }

    fn regions_equal(&mut self, a: u64, b: u64, len: u64) -> Result<bool> {
        const CHUNK: usize = 64 * 1024;
        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| SqshError::Internal("sink gone while comparing".into()))?;
        let mut buf_a = vec![0_u8; CHUNK];
        let mut buf_b = vec![0_u8; CHUNK];
        let mut remaining = len;
        let mut pos = 0_u64;
        while remaining > 0 {
            let step = remaining.min(CHUNK as u64) as usize;
            sink.read_at(a + pos, &mut buf_a[..step])?;
            sink.read_at(b + pos, &mut buf_b[..step])?;
            if buf_a[..step] != buf_b[..step] {
                return Ok(false);
            }
            pos += step as u64;
            remaining -= step as u64;
        }
        Ok(true)
    }
}

impl<W: BlockSink> Drop for BlockProcessor<W> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Read until `buf` is full or the stream ends.
fn read_full(source: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match source.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests;
