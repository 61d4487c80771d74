use super::*;
use sqsh_compress::Codec;
use std::io::Cursor;

const BS: u32 = 4096;

fn config(workers: usize) -> ProcessorConfig {
    ProcessorConfig {
        block_size: BlockSize::new(BS).unwrap(),
        workers,
        max_backlog: 4,
        fragments_enabled: true,
        dedup_enabled: true,
    }
}

fn processor(cfg: ProcessorConfig) -> BlockProcessor<Cursor<Vec<u8>>> {
    BlockProcessor::new(cfg, sqsh_compress::create(Codec::Gzip), Cursor::new(Vec::new()))
}

fn pack_all(cfg: ProcessorConfig, inputs: &[Vec<u8>]) -> PackOutcome<Cursor<Vec<u8>>> {
    pack_with_flags(cfg, inputs, SubmitFlags::default())
}

fn pack_with_flags(
    cfg: ProcessorConfig,
    inputs: &[Vec<u8>],
    flags: SubmitFlags,
) -> PackOutcome<Cursor<Vec<u8>>> {
    let mut proc = processor(cfg);
    for input in inputs {
        proc.submit_file(&mut input.as_slice(), flags).unwrap();
    }
    proc.into_outcome().unwrap()
}

/// Deterministic pseudo-random bytes; no codec shrinks these.
fn noise(len: usize, mut seed: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            (seed & 0xFF) as u8
        })
        .collect()
}

/// Repetitive bytes that compress well.
fn pattern(len: usize, phrase: &str) -> Vec<u8> {
    phrase.bytes().cycle().take(len).collect()
}

/// Rebuild a file's content from the image using its descriptors.
fn reconstruct(image: &[u8], packed: &PackedBlocks) -> Vec<u8> {
    let mut out = Vec::new();
    let mut offset = packed.start_block;
    for desc in &packed.blocks {
        match desc.kind {
            BlockKind::Sparse => {
                out.extend(std::iter::repeat(0_u8).take(desc.uncompressed_size as usize));
            }
            BlockKind::Raw => {
                let start = offset as usize;
                out.extend_from_slice(&image[start..start + desc.disk_size as usize]);
                offset += u64::from(desc.disk_size);
            }
            BlockKind::Compressed => {
                let start = offset as usize;
                let mut buf = vec![0_u8; BS as usize];
                let n = sqsh_compress::decompress(
                    Codec::Gzip,
                    &image[start..start + desc.disk_size as usize],
                    &mut buf,
                )
                .unwrap();
                assert_eq!(n, desc.uncompressed_size as usize);
                out.extend_from_slice(&buf[..n]);
                offset += u64::from(desc.disk_size);
            }
        }
    }
    out
}

#[test]
fn small_file_is_stored_as_a_fragment() {
    let outcome = pack_all(config(0), &[b"hello".to_vec()]);
    let file = &outcome.files[0];
    assert!(file.blocks.is_empty());
    assert_eq!(
        file.fragment,
        Some(FragmentRef {
            index: 0,
            offset: 0
        })
    );
    assert_eq!(file.size, 5);
    assert_eq!(outcome.fragments.len(), 1);
    // Five incompressible bytes are stored raw inside the fragment block.
    let frag = &outcome.fragments[0];
    assert!(!frag.compressed);
    assert_eq!(frag.disk_size, 5);
    let image = outcome.sink.into_inner();
    assert_eq!(&image[frag.start as usize..][..5], b"hello");
}

#[test]
fn block_aligned_file_has_no_fragment() {
    let input = pattern(2 * BS as usize, "block aligned ");
    let outcome = pack_all(config(0), &[input.clone()]);
    let file = &outcome.files[0];
    assert_eq!(file.blocks.len(), 2);
    assert_eq!(file.fragment, None);
    assert_eq!(file.size, input.len() as u64);
}

#[test]
fn trailing_partial_block_goes_to_the_assembler() {
    let input = pattern(BS as usize + 100, "tail ");
    let outcome = pack_all(config(0), &[input]);
    let file = &outcome.files[0];
    assert_eq!(file.blocks.len(), 1);
    assert!(file.fragment.is_some());
    assert_eq!(outcome.stats.tail_fragments, 1);
}

#[test]
fn all_zero_file_writes_no_data_bytes() {
    let outcome = pack_all(config(0), &[vec![0_u8; BS as usize]]);
    let file = &outcome.files[0];
    assert_eq!(file.blocks.len(), 1);
    assert_eq!(
        file.blocks[0],
        BlockDesc {
            uncompressed_size: BS,
            disk_size: 0,
            kind: BlockKind::Sparse,
        }
    );
    assert_eq!(file.sparse_bytes, u64::from(BS));
    assert_eq!(file.fragment, None);
    assert!(outcome.sink.into_inner().is_empty());
}

#[test]
fn zero_tail_becomes_a_sparse_block_not_a_fragment() {
    // 904 zero bytes: under one block, but packing it into a fragment
    // would waste shared space on zeros.
    let outcome = pack_all(config(0), &[vec![0_u8; 904]]);
    let file = &outcome.files[0];
    assert_eq!(file.blocks.len(), 1);
    assert_eq!(file.blocks[0].kind, BlockKind::Sparse);
    assert_eq!(file.blocks[0].uncompressed_size, 904);
    assert_eq!(file.fragment, None);
    assert!(outcome.sink.into_inner().is_empty());
}

#[test]
fn mixed_sparse_and_data_blocks_reconstruct() {
    let mut input = vec![0_u8; BS as usize];
    input.extend(noise(BS as usize, 7));
    input.extend(vec![0_u8; BS as usize]);
    input.extend(pattern(BS as usize, "mid "));

    let outcome = pack_all(config(0), &[input.clone()]);
    let file = &outcome.files[0];
    assert_eq!(file.blocks.len(), 4);
    assert_eq!(file.blocks[0].kind, BlockKind::Sparse);
    assert_eq!(file.blocks[2].kind, BlockKind::Sparse);
    assert_eq!(file.sparse_bytes, 2 * u64::from(BS));

    let image = outcome.sink.into_inner();
    assert_eq!(reconstruct(&image, file), input);
}

#[test]
fn identical_files_share_their_data_blocks() {
    let body = pattern(3 * BS as usize, "shared content ");
    let outcome = pack_all(config(0), &[body.clone(), body.clone()]);

    let (a, b) = (&outcome.files[0], &outcome.files[1]);
    assert_eq!(a.start_block, b.start_block);
    assert_eq!(a.blocks, b.blocks);
    assert_eq!(outcome.stats.files_deduped, 1);

    // The data region holds one copy only.
    let one_copy: u64 = a.blocks.iter().map(|d| u64::from(d.disk_size)).sum();
    assert_eq!(outcome.sink.into_inner().len() as u64, one_copy);
}

#[test]
fn different_files_do_not_dedup() {
    let outcome = pack_all(
        config(0),
        &[noise(2 * BS as usize, 1), noise(2 * BS as usize, 2)],
    );
    assert_eq!(outcome.stats.files_deduped, 0);
    assert_ne!(outcome.files[0].start_block, outcome.files[1].start_block);
}

#[test]
fn dedup_can_be_disabled() {
    let body = pattern(2 * BS as usize, "twice ");
    let mut cfg = config(0);
    cfg.dedup_enabled = false;
    let outcome = pack_all(cfg, &[body.clone(), body]);
    assert_eq!(outcome.stats.files_deduped, 0);
    assert_ne!(outcome.files[0].start_block, outcome.files[1].start_block);
}

#[test]
fn fragment_blocks_dedup_against_each_other() {
    // Two 3000-byte tails cannot share one fragment block (3000 + 3000
    // exceeds the block size), so the second block duplicates the first.
    let tail = pattern(3000, "frag ");
    let outcome = pack_all(config(0), &[tail.clone(), tail]);

    assert_eq!(outcome.fragments.len(), 2);
    assert_eq!(outcome.fragments[0].start, outcome.fragments[1].start);
    assert_eq!(outcome.stats.fragment_blocks_deduped, 1);

    assert_eq!(
        outcome.files[0].fragment,
        Some(FragmentRef {
            index: 0,
            offset: 0
        })
    );
    assert_eq!(
        outcome.files[1].fragment,
        Some(FragmentRef {
            index: 1,
            offset: 0
        })
    );
}

#[test]
fn fragment_buffer_overflow_flushes_in_order() {
    let tails: Vec<Vec<u8>> = (0..3).map(|i| noise(2000, 100 + i)).collect();
    let outcome = pack_all(config(0), &tails);

    // 2000 + 2000 fits in 4096; the third tail forces a flush.
    assert_eq!(outcome.fragments.len(), 2);
    assert_eq!(
        outcome.files[0].fragment,
        Some(FragmentRef {
            index: 0,
            offset: 0
        })
    );
    assert_eq!(
        outcome.files[1].fragment,
        Some(FragmentRef {
            index: 0,
            offset: 2000
        })
    );
    assert_eq!(
        outcome.files[2].fragment,
        Some(FragmentRef {
            index: 1,
            offset: 0
        })
    );
}

#[test]
fn no_fragment_flag_forces_a_short_data_block() {
    let outcome = pack_with_flags(
        config(0),
        &[b"hello".to_vec()],
        SubmitFlags {
            no_fragment: true,
            no_compress: false,
        },
    );
    let file = &outcome.files[0];
    assert_eq!(file.fragment, None);
    assert_eq!(file.blocks.len(), 1);
    assert_eq!(file.blocks[0].uncompressed_size, 5);
}

#[test]
fn no_compress_flag_stores_blocks_raw() {
    let input = pattern(2 * BS as usize, "compressible ");
    let outcome = pack_with_flags(
        config(0),
        &[input.clone()],
        SubmitFlags {
            no_fragment: false,
            no_compress: true,
        },
    );
    let file = &outcome.files[0];
    for desc in &file.blocks {
        assert_eq!(desc.kind, BlockKind::Raw);
        assert_eq!(desc.disk_size, desc.uncompressed_size);
    }
    let image = outcome.sink.into_inner();
    assert_eq!(reconstruct(&image, file), input);
}

#[test]
fn empty_file_produces_nothing() {
    let outcome = pack_all(config(0), &[Vec::new()]);
    let file = &outcome.files[0];
    assert_eq!(file.size, 0);
    assert!(file.blocks.is_empty());
    assert_eq!(file.fragment, None);
}

#[test]
fn descriptors_keep_submission_order() {
    // Three distinct compressible blocks; sizes differ so a shuffle
    // would be visible.
    let mut input = pattern(BS as usize, "aaaa ");
    input.extend(pattern(BS as usize, "bb "));
    input.extend(pattern(BS as usize, "cccccc "));

    let outcome = pack_all(config(4), &[input.clone()]);
    let image = outcome.sink.into_inner();
    assert_eq!(reconstruct(&image, &outcome.files[0]), input);
}

#[test]
fn output_is_identical_for_any_worker_count() {
    let inputs = vec![
        pattern(3 * BS as usize, "alpha "),
        noise(2 * BS as usize + 500, 42),
        vec![0_u8; 2 * BS as usize],
        b"tiny".to_vec(),
        pattern(3 * BS as usize, "alpha "), // dedup candidate
        noise(1500, 43),
    ];

    let baseline = pack_all(config(0), &inputs);
    let baseline_image = baseline.sink.into_inner();

    for workers in [1_usize, 2, 4, 16] {
        let mut cfg = config(workers);
        cfg.max_backlog = 3; // keep backpressure in play
        let outcome = pack_all(cfg, &inputs);
        assert_eq!(outcome.files, baseline.files, "workers={workers}");
        assert_eq!(outcome.fragments, baseline.fragments, "workers={workers}");
        assert_eq!(
            outcome.sink.into_inner(),
            baseline_image,
            "workers={workers}"
        );
    }
}

#[test]
fn read_errors_surface_with_io_kind() {
    struct FailingReader;
    impl std::io::Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        }
    }

    let mut proc = processor(config(0));
    let err = proc
        .submit_file(&mut FailingReader, SubmitFlags::default())
        .unwrap_err();
    assert!(matches!(err, SqshError::Io(_)));
}

#[test]
fn worker_errors_stop_the_build() {
    struct BrokenCompressor;
    impl Compressor for BrokenCompressor {
        fn codec(&self) -> Codec {
            Codec::Gzip
        }
        fn compress(&mut self, _src: &[u8], _dst: &mut [u8]) -> Result<Option<usize>> {
            Err(SqshError::Compress("synthetic failure".into()))
        }
        fn fork(&self) -> Box<dyn Compressor> {
            Box::new(BrokenCompressor)
        }
    }

    let mut cfg = config(1);
    cfg.max_backlog = 2;
    let mut proc = BlockProcessor::new(cfg, Box::new(BrokenCompressor), Cursor::new(Vec::new()));
    let input = pattern(4 * BS as usize, "doomed ");
    let result = proc
        .submit_file(&mut input.as_slice(), SubmitFlags::default())
        .and_then(|_| proc.flush());
    assert!(matches!(result, Err(SqshError::Compress(_))));
}

#[test]
fn stats_add_up() {
    let inputs = vec![
        pattern(2 * BS as usize, "stat "),
        vec![0_u8; BS as usize],
        b"frag-tail".to_vec(),
    ];
    let outcome = pack_all(config(2), &inputs);
    assert_eq!(outcome.stats.files, 3);
    assert_eq!(outcome.stats.blocks_submitted, 3); // 2 data + 1 sparse
    assert_eq!(outcome.stats.sparse_blocks, 1);
    assert_eq!(outcome.stats.fragment_blocks, 1);
    assert_eq!(outcome.stats.tail_fragments, 1);
    let total_in: u64 = inputs.iter().map(|v| v.len() as u64).sum();
    assert_eq!(outcome.stats.bytes_read, total_in);
    assert_eq!(
        outcome.stats.bytes_written,
        outcome.sink.into_inner().len() as u64
    );
}

#[test]
fn file_sink_behaves_like_the_cursor() {
    let file = tempfile::tempfile().unwrap();
    let cfg = config(2);
    let mut proc = BlockProcessor::new(cfg, sqsh_compress::create(Codec::Gzip), file);
    let input = pattern(2 * BS as usize + 99, "on disk ");
    proc.submit_file(&mut input.as_slice(), SubmitFlags::default())
        .unwrap();
    let outcome = proc.into_outcome().unwrap();
    assert_eq!(outcome.files[0].size, input.len() as u64);
    assert_eq!(outcome.files[0].blocks.len(), 2);
    assert!(outcome.files[0].fragment.is_some());
}
