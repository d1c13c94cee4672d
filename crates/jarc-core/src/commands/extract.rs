//! Extractor: plan per-block fragment needs, decompress blocks in parallel,
//! scatter fragments to output files at precomputed offsets.
//!
//! Each block is decompressed only up to the last fragment any output file
//! needs. A damaged block loses only its own fragments; extraction
//! continues and the operation reports how many files came up short.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::archive::BlockReader;
use crate::compress;
use crate::config::Options;
use crate::error::{JarcError, Result};
use crate::hash::Sha1Hash;
use crate::index::{FragmentId, Locator};
use crate::journal;
use crate::pipeline::{huge_alloc_guard, HUGE_ALLOC_THRESHOLD};
use crate::platform::fs as pfs;
use crate::platform::paths;
use crate::snapshot::{ArchiveState, FileAttr};

#[derive(Debug, Default)]
pub struct ExtractStats {
    pub files: u64,
    pub dirs: u64,
    pub bytes_written: u64,
    /// Blocks that failed to decompress or verify.
    pub bad_blocks: u64,
    /// Files that ended with fewer fragments than their version lists.
    pub failed_files: u64,
}

impl ExtractStats {
    pub fn ok(&self) -> bool {
        self.failed_files == 0
    }
}

/// One output file in the plan.
struct PlannedFile {
    archive_path: String,
    out_path: PathBuf,
    date: u64,
    attr: FileAttr,
    /// Fragment references in the version; completion requires all of them.
    total_frags: usize,
    /// Unknown logical size: fragments append sequentially instead of
    /// seeking to precomputed offsets.
    sequential: bool,
}

/// One fragment write planned for a block.
struct WriteOp {
    file_idx: usize,
    frag: FragmentId,
    file_offset: u64,
}

struct BlockPlan {
    offset: u64,
    first: FragmentId,
    /// 1 + the highest within-block index any client needs.
    needed: u32,
    streaming: bool,
    writes: Vec<WriteOp>,
}

struct WriteProgress {
    written: Vec<usize>,
    created: Vec<bool>,
    /// Append cursor for sequential (unknown-size) files.
    cursor: Vec<u64>,
}

pub fn run(opts: &Options) -> Result<ExtractStats> {
    let archive_path = Path::new(&opts.archive);
    let read = journal::read_archive(archive_path, opts.until, opts.fragile)?;
    let mut state = read.state;
    state.select(&opts.files, &opts.not, false);

    let mut stats = ExtractStats::default();

    // Map fragments to blocks.
    let mut blocks: Vec<BlockPlan> = Vec::new();
    let mut block_of = vec![usize::MAX; state.fragments.len() as usize];
    for (id, entry) in state.fragments.iter() {
        if let Locator::Block(offset) = entry.locator {
            blocks.push(BlockPlan {
                offset,
                first: id,
                needed: 0,
                streaming: false,
                writes: Vec::new(),
            });
        }
        if let Some(idx) = blocks.len().checked_sub(1) {
            block_of[id as usize] = idx;
            // Unknown sizes make write offsets uncomputable; those blocks
            // are replayed sequentially.
            if entry.size.is_none() {
                blocks[idx].streaming = true;
            }
        }
    }

    // Plan the selected files; refuse clobbering up front.
    let mut files: Vec<PlannedFile> = Vec::new();
    for (path, entry) in state.files.iter() {
        if !entry.selected || path.ends_with('/') {
            continue;
        }
        let Some(version) = entry.latest().filter(|v| !v.is_tombstone()) else {
            continue;
        };

        let out_name = paths::rename(path, &opts.files, &opts.to);
        let out_path = PathBuf::from(&out_name);
        if !opts.force && out_path.exists() {
            return Err(JarcError::Clobber(out_name));
        }

        let file_idx = files.len();
        let sequential = version.size.is_none();
        let mut file_offset = 0u64;
        for &id in &version.fragments {
            let locatable = state
                .fragments
                .get(id)
                .is_some_and(|e| e.locator != Locator::Missing)
                && block_of
                    .get(id as usize)
                    .is_some_and(|&b| b != usize::MAX);
            if !locatable {
                warn!(path = %path, fragment = id, "unlocatable fragment, file will be incomplete");
                continue;
            }
            let b = block_of[id as usize];
            let within = id - blocks[b].first;
            blocks[b].needed = blocks[b].needed.max(within + 1);
            if sequential {
                blocks[b].streaming = true;
            }
            blocks[b].writes.push(WriteOp {
                file_idx,
                frag: id,
                file_offset,
            });
            file_offset += state.fragments.get(id).and_then(|e| e.size).unwrap_or(0) as u64;
        }

        files.push(PlannedFile {
            archive_path: path.clone(),
            out_path,
            date: version.date,
            attr: version.attr,
            total_frags: version.fragments.len(),
            sequential,
        });
    }

    // Zero-fragment files never reach a block worker; create them here.
    for pf in files.iter().filter(|f| f.total_frags == 0) {
        pfs::make_parent_dirs(&pf.out_path)?;
        File::create(&pf.out_path)?;
        pfs::apply_attrs(&pf.out_path, pf.date, &pf.attr);
        stats.files += 1;
    }

    let threads = opts.effective_threads();
    info!(
        blocks = blocks.iter().filter(|b| b.needed > 0).count(),
        files = files.len(),
        threads,
        "starting decompression jobs"
    );

    let bytes_written = AtomicU64::new(0);
    let bad_blocks = AtomicU64::new(0);
    let progress = Mutex::new(WriteProgress {
        written: vec![0; files.len()],
        created: vec![false; files.len()],
        cursor: vec![0; files.len()],
    });

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| JarcError::Other(format!("failed to build thread pool: {e}")))?;

    pool.in_place_scope(|s| {
        for block in blocks.iter().filter(|b| b.needed > 0 && !b.streaming) {
            let state = &state;
            let files = &files;
            let bytes_written = &bytes_written;
            let bad_blocks = &bad_blocks;
            let progress = &progress;
            let archive = opts.archive.as_str();
            let fragile = opts.fragile;
            s.spawn(move |_| {
                if let Err(e) = extract_block(
                    archive, fragile, block, state, files, bytes_written, progress,
                ) {
                    warn!(
                        offset = block.offset,
                        first = block.first,
                        error = %e,
                        "skipping damaged block"
                    );
                    bad_blocks.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        // Streaming blocks carry per-segment state across the run, so they
        // are handled here on the main thread, strictly in order.
        for block in blocks.iter().filter(|b| b.needed > 0 && b.streaming) {
            if let Err(e) =
                extract_streaming_block(opts, block, &files, &bytes_written, &progress)
            {
                warn!(offset = block.offset, error = %e, "skipping damaged streaming block");
                bad_blocks.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    stats.bytes_written = bytes_written.load(Ordering::Relaxed);
    stats.bad_blocks = bad_blocks.load(Ordering::Relaxed);

    // Directories: create the empty ones and stamp dates/attributes after
    // every file inside them has been closed, deepest paths first.
    for (path, entry) in state.files.iter().rev() {
        if !entry.selected || !path.ends_with('/') {
            continue;
        }
        let Some(version) = entry.latest().filter(|v| !v.is_tombstone()) else {
            continue;
        };
        let out_name = paths::rename(path, &opts.files, &opts.to);
        let dir = PathBuf::from(out_name.trim_end_matches('/'));
        if std::fs::create_dir_all(&dir).is_ok() {
            pfs::apply_attrs(&dir, version.date, &version.attr);
            stats.dirs += 1;
        }
    }

    // Accounting: a file is good only if every referenced fragment landed.
    let progress = progress.into_inner().unwrap();
    for (idx, pf) in files.iter().enumerate() {
        if pf.total_frags == 0 {
            continue;
        }
        if progress.written[idx] == pf.total_frags {
            stats.files += 1;
        } else {
            stats.failed_files += 1;
            warn!(
                path = %pf.archive_path,
                written = progress.written[idx],
                planned = pf.total_frags,
                "file incomplete"
            );
        }
    }

    info!(
        files = stats.files,
        failed = stats.failed_files,
        bytes = stats.bytes_written,
        "extraction finished"
    );
    Ok(stats)
}

/// Decompress one journaling block up to its needed prefix, verify the
/// needed fragment hashes, and scatter them to the client files.
fn extract_block(
    archive: &str,
    fragile: bool,
    block: &BlockPlan,
    state: &ArchiveState,
    files: &[PlannedFile],
    bytes_written: &AtomicU64,
    progress: &Mutex<WriteProgress>,
) -> Result<()> {
    // Byte offset of each needed fragment within the decompressed block.
    let mut frag_offsets = Vec::with_capacity(block.needed as usize + 1);
    let mut pos = 0usize;
    for id in block.first..block.first + block.needed {
        frag_offsets.push(pos);
        pos += state.fragments.get(id).and_then(|e| e.size).unwrap_or(0) as usize;
    }
    let needed_bytes = pos;

    let mut reader = BlockReader::new(BufReader::new(File::open(archive)?), fragile);
    reader.seek_to(block.offset);
    let raw = reader
        .next_block()?
        .ok_or_else(|| JarcError::BadArchive("block not found at recorded offset".into()))?;
    if raw.segments.is_empty() {
        return Err(JarcError::BadArchive("block has no segments".into()));
    }

    // Journaling blocks have a single segment; legacy blocks may carry
    // several, whose decompressed outputs concatenate.
    let data = {
        let _guard = (needed_bytes >= HUGE_ALLOC_THRESHOLD).then(huge_alloc_guard);
        let mut data: Vec<u8> = Vec::with_capacity(needed_bytes);
        for seg in &raw.segments {
            if data.len() >= needed_bytes {
                break;
            }
            let part = compress::decompress_prefix(&seg.payload, needed_bytes - data.len())?;
            data.extend_from_slice(&part);
        }
        data
    };
    if data.len() < needed_bytes {
        return Err(JarcError::Decompression(format!(
            "unexpected end of block data: {} of {needed_bytes} bytes",
            data.len()
        )));
    }
    debug!(
        first = block.first,
        count = block.needed,
        bytes = needed_bytes,
        "decompressed block"
    );

    // Verify every needed fragment before any of them is written.
    if !fragile {
        for id in block.first..block.first + block.needed {
            let entry = state.fragments.get(id).unwrap();
            let start = frag_offsets[(id - block.first) as usize];
            let len = entry.size.unwrap_or(0) as usize;
            if !entry.hash.is_zero() {
                let actual = Sha1Hash::compute(&data[start..start + len]);
                if actual != entry.hash {
                    return Err(JarcError::ChecksumMismatch(format!(
                        "fragment {id} hashed {actual}, expected {}",
                        entry.hash
                    )));
                }
            }
        }
    }

    // Single global write mutex: scatter fragments to each client file.
    let mut progress = progress.lock().unwrap();
    let mut handles: HashMap<usize, File> = HashMap::new();
    for op in &block.writes {
        let pf = &files[op.file_idx];
        let start = frag_offsets[(op.frag - block.first) as usize];
        let len = state
            .fragments
            .get(op.frag)
            .and_then(|e| e.size)
            .unwrap_or(0) as usize;

        if !handles.contains_key(&op.file_idx) {
            let handle = open_output(pf, &mut progress.created[op.file_idx])?;
            handles.insert(op.file_idx, handle);
        }
        let handle = handles.get_mut(&op.file_idx).unwrap();
        handle.seek(SeekFrom::Start(op.file_offset))?;
        handle.write_all(&data[start..start + len])?;
        bytes_written.fetch_add(len as u64, Ordering::Relaxed);

        progress.written[op.file_idx] += 1;
        if progress.written[op.file_idx] == pf.total_frags {
            handles.remove(&op.file_idx);
            pfs::apply_attrs(&pf.out_path, pf.date, &pf.attr);
        }
    }
    Ok(())
}

fn open_output(pf: &PlannedFile, created: &mut bool) -> Result<File> {
    if !*created {
        pfs::make_parent_dirs(&pf.out_path)?;
        let f = File::create(&pf.out_path)?;
        *created = true;
        debug!(path = %pf.out_path.display(), "extracting");
        Ok(f)
    } else {
        Ok(OpenOptions::new().write(true).open(&pf.out_path)?)
    }
}

/// Legacy streaming block: decompress its segments fully, in order, and
/// write them to the client files (appending, when sizes were unknown).
fn extract_streaming_block(
    opts: &Options,
    block: &BlockPlan,
    files: &[PlannedFile],
    bytes_written: &AtomicU64,
    progress: &Mutex<WriteProgress>,
) -> Result<()> {
    let mut reader = BlockReader::new(
        BufReader::new(File::open(&opts.archive)?),
        opts.fragile,
    );
    reader.seek_to(block.offset);
    let raw = reader
        .next_block()?
        .ok_or_else(|| JarcError::BadArchive("streaming block not found".into()))?;

    for op in &block.writes {
        let seg_idx = (op.frag - block.first) as usize;
        let seg = raw
            .segments
            .get(seg_idx)
            .ok_or_else(|| JarcError::BadArchive("segment missing from streaming block".into()))?;

        let data = compress::decompress(&seg.payload)?;
        if !opts.fragile {
            if let Some(expected) = seg.hash {
                let actual = Sha1Hash::compute(&data);
                if actual != expected {
                    return Err(JarcError::ChecksumMismatch(format!(
                        "streaming segment {seg_idx} of block at {}",
                        block.offset
                    )));
                }
            }
        }

        let mut progress = progress.lock().unwrap();
        let pf = &files[op.file_idx];
        let mut handle = open_output(pf, &mut progress.created[op.file_idx])?;
        let offset = if pf.sequential {
            progress.cursor[op.file_idx]
        } else {
            op.file_offset
        };
        handle.seek(SeekFrom::Start(offset))?;
        handle.write_all(&data)?;
        progress.cursor[op.file_idx] = offset + data.len() as u64;
        bytes_written.fetch_add(data.len() as u64, Ordering::Relaxed);
        progress.written[op.file_idx] += 1;
        if progress.written[op.file_idx] == pf.total_frags {
            pfs::apply_attrs(&pf.out_path, pf.date, &pf.attr);
        }
    }
    Ok(())
}
