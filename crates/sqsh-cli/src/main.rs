#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use sqsh_block::{BlockProcessor, ProcessorConfig, SubmitFlags};
use sqsh_compress::Codec;
use sqsh_ingest::{
    apply_sort_file, open_for_reading, scan_into, tree_from_pseudo_file, ScanConfig, ScanDefaults,
    ScanFlags,
};
use sqsh_tree::{NodeId, Tree, TreeDefaults};
use sqsh_types::BlockSize;
use sqsh_writer::{write_placeholder, ImageWriter, WriterConfig, XattrWriter};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::info;

/// Build a SquashFS 4.0 image from a directory tree or a description
/// file.
#[derive(Debug, Parser)]
#[command(name = "sqsh-pack", version)]
struct Args {
    /// Image file to create.
    output: PathBuf,

    /// Pack the contents of this directory; with --pseudo it only serves
    /// as the base for relative file sources and glob scans.
    #[arg(long, value_name = "DIR")]
    pack_dir: Option<PathBuf>,

    /// Build the tree from a pseudo-file description instead of scanning.
    #[arg(long, value_name = "FILE")]
    pseudo: Option<PathBuf>,

    /// Reorder file packing by priority; see the sort-file syntax.
    #[arg(long, value_name = "FILE")]
    sort_file: Option<PathBuf>,

    /// Data block size in bytes (power of two, 4 KiB to 1 MiB).
    #[arg(long, default_value_t = sqsh_types::BLOCK_SIZE_DEFAULT)]
    block_size: u32,

    /// Compressor for data and metadata: gzip or zstd.
    #[arg(long, default_value = "gzip")]
    compressor: String,

    /// Compression worker threads (0 = run inline; default: CPU count).
    #[arg(long, short = 'j')]
    jobs: Option<usize>,

    /// Bound on in-flight compression work items.
    #[arg(long)]
    backlog: Option<usize>,

    /// Set every file's owner uid.
    #[arg(long)]
    force_uid: Option<u32>,

    /// Set every file's owner gid.
    #[arg(long)]
    force_gid: Option<u32>,

    /// Keep host modification times when scanning a directory.
    #[arg(long)]
    keep_time: bool,

    /// Do not cross filesystem boundaries when scanning.
    #[arg(long)]
    one_file_system: bool,

    /// Store small files and tails as full blocks, never as fragments.
    #[arg(long)]
    no_fragments: bool,

    /// Do not pack the tail ends of multi-block files into fragments.
    #[arg(long)]
    no_tail_packing: bool,

    /// Do not deduplicate identical blocks.
    #[arg(long)]
    no_dedup: bool,

    /// Store file data unmodified, without compression.
    #[arg(long)]
    no_compress_data: bool,

    /// Image modification time (defaults to $SOURCE_DATE_EPOCH, else 0).
    #[arg(long)]
    mtime: Option<u32>,

    /// Only report errors.
    #[arg(long, short)]
    quiet: bool,
}

fn main() {
    let args = Args::parse();

    let filter = if args.quiet {
        tracing_subscriber::EnvFilter::new("error")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let output = args.output.clone();
    if let Err(err) = run(args) {
        eprintln!("error: {err:#}");
        // Never leave a half-written image behind.
        let _ = std::fs::remove_file(&output);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    if args.pack_dir.is_none() && args.pseudo.is_none() {
        bail!("one of --pack-dir or --pseudo is required");
    }
    let block_size = BlockSize::new(args.block_size)?;
    let codec: Codec = args.compressor.parse()?;
    let mtime = args.mtime.unwrap_or_else(source_date_epoch);

    let mut tree = Tree::new(TreeDefaults { mtime });
    if let Some(pseudo) = &args.pseudo {
        tree_from_pseudo_file(&mut tree, pseudo, args.pack_dir.as_deref())?;
    } else if let Some(dir) = &args.pack_dir {
        let mut flags = ScanFlags::KEEP_UID | ScanFlags::KEEP_GID | ScanFlags::KEEP_MODE;
        if args.keep_time {
            flags |= ScanFlags::KEEP_TIME;
        }
        if args.one_file_system {
            flags |= ScanFlags::ONE_FILESYSTEM;
        }
        let cfg = ScanConfig {
            flags,
            defaults: ScanDefaults {
                mtime,
                uid: 0,
                gid: 0,
                mode: 0o755,
            },
            prefix: String::new(),
            name_pattern: None,
        };
        scan_into(&mut tree, dir, &cfg)?;
    }

    if args.force_uid.is_some() || args.force_gid.is_some() {
        tree.override_owner(args.force_uid, args.force_gid);
    }
    tree.post_process()?;

    if let Some(sort_file) = &args.sort_file {
        apply_sort_file(&mut tree, sort_file)?;
    }

    let out_file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.output)
        .with_context(|| format!("creating {}", args.output.display()))?;

    let summary = pack_image(&args, block_size, codec, mtime, &mut tree, out_file)?;
    if !args.quiet {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}

fn pack_image(
    args: &Args,
    block_size: BlockSize,
    codec: Codec,
    mtime: u32,
    tree: &mut Tree,
    mut out_file: std::fs::File,
) -> Result<sqsh_block::PackStats> {
    write_placeholder(&mut out_file)?;

    let workers = args.jobs.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });
    let pcfg = ProcessorConfig {
        block_size,
        workers,
        max_backlog: args.backlog.unwrap_or(workers.max(1) * 10),
        fragments_enabled: !args.no_fragments,
        dedup_enabled: !args.no_dedup,
    };
    let mut proc = BlockProcessor::new(pcfg, sqsh_compress::create(codec), out_file);

    let work_list: Vec<NodeId> = tree.files().to_vec();
    for id in &work_list {
        let (source, tree_path) = file_source(tree, *id, args.pack_dir.as_deref());
        info!("packing {tree_path}");
        let (mut stream, raw_size) = open_for_reading(&source)?;
        let file_flags = tree.node(*id).as_file().map(|f| f.flags).unwrap_or_default();
        let flags = SubmitFlags {
            no_fragment: file_flags.no_fragment
                || (args.no_tail_packing && raw_size > u64::from(block_size.get())),
            no_compress: file_flags.no_compress || args.no_compress_data,
        };
        proc.submit_file(&mut *stream, flags)
            .with_context(|| format!("packing {tree_path}"))?;
    }

    let outcome = proc.into_outcome()?;
    for (id, packed) in work_list.iter().zip(outcome.files.into_iter()) {
        if let Some(file) = tree.node_mut(*id).as_file_mut() {
            file.packed = Some(packed);
        }
    }

    let mut wcfg = WriterConfig::new(block_size, codec);
    wcfg.mtime = mtime;
    wcfg.fragments_enabled = !args.no_fragments;
    wcfg.dedup_enabled = !args.no_dedup;
    wcfg.uncompressed_data = args.no_compress_data;

    let mut sink = outcome.sink;
    let superblock = ImageWriter::new(wcfg).finish(
        &mut sink,
        tree,
        &outcome.fragments,
        &XattrWriter::new(),
    )?;
    info!(
        inodes = superblock.inode_count,
        bytes = superblock.bytes_used,
        "wrote {}",
        args.output.display()
    );
    Ok(outcome.stats)
}

/// Where a file's bytes come from: an explicit source recorded during
/// ingestion, or the node's own path under the pack directory.
fn file_source(tree: &Tree, id: NodeId, pack_dir: Option<&Path>) -> (PathBuf, String) {
    let tree_path = tree.path_of(id);
    let source = tree
        .node(id)
        .as_file()
        .and_then(|f| f.source.clone())
        .unwrap_or_else(|| {
            let rel = tree_path.trim_start_matches('/');
            match pack_dir {
                Some(dir) => dir.join(rel),
                None => PathBuf::from(rel),
            }
        });
    (source, tree_path)
}

fn source_date_epoch() -> u32 {
    std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn base_args(output: PathBuf) -> Args {
        Args {
            output,
            pack_dir: None,
            pseudo: None,
            sort_file: None,
            block_size: 4096,
            compressor: "gzip".into(),
            jobs: Some(0),
            backlog: None,
            force_uid: None,
            force_gid: None,
            keep_time: false,
            one_file_system: false,
            no_fragments: false,
            no_tail_packing: false,
            no_dedup: false,
            no_compress_data: false,
            mtime: Some(1_700_000_000),
            quiet: true,
        }
    }

    #[test]
    fn packs_a_directory_into_a_valid_image() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("root");
        std::fs::create_dir(&src).unwrap();
        std::fs::write(src.join("hello.txt"), b"hello world").unwrap();
        std::fs::create_dir(src.join("sub")).unwrap();
        std::fs::write(src.join("sub/data"), vec![7_u8; 10_000]).unwrap();

        let output = dir.path().join("image.sqsh");
        let mut args = base_args(output.clone());
        args.pack_dir = Some(src);
        run(args).unwrap();

        let mut image = Vec::new();
        std::fs::File::open(&output)
            .unwrap()
            .read_to_end(&mut image)
            .unwrap();
        assert_eq!(&image[0..4], b"hsqs");
        assert_eq!(image.len() % 4096, 0);
    }

    #[test]
    fn packs_a_pseudo_description() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("payload"), b"from pseudo").unwrap();
        let pseudo = dir.path().join("desc.txt");
        std::fs::write(
            &pseudo,
            "dir /a 0755 0 0\nfile /a/b 0644 1 1 payload\nnod /dev/null 0666 0 0 c 1 3\n",
        )
        .unwrap();

        let output = dir.path().join("image.sqsh");
        let mut args = base_args(output.clone());
        args.pseudo = Some(pseudo);
        args.pack_dir = Some(dir.path().to_path_buf());
        run(args).unwrap();

        assert!(output.exists());
    }

    #[test]
    fn missing_input_selection_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let args = base_args(dir.path().join("image.sqsh"));
        assert!(run(args).is_err());
    }

    #[test]
    fn missing_file_source_fails_the_build() {
        let dir = tempfile::tempdir().unwrap();
        let pseudo = dir.path().join("desc.txt");
        std::fs::write(&pseudo, "file /gone 0644 0 0 /no/such/source\n").unwrap();

        let output = dir.path().join("image.sqsh");
        let mut args = base_args(output.clone());
        args.pseudo = Some(pseudo);
        assert!(run(args).is_err());
    }
}
