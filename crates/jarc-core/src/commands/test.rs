//! Integrity tester: structural statistics and cross-checks over the
//! reconstructed state, then a full parallel decompression of every block
//! with per-fragment checksum and trailer verification.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::archive::BlockReader;
use crate::compress;
use crate::config::Options;
use crate::error::{JarcError, Result};
use crate::hash::Sha1Hash;
use crate::index::{FragmentId, Locator};
use crate::journal;
use crate::pipeline::{huge_alloc_guard, HUGE_ALLOC_THRESHOLD};
use crate::snapshot::ArchiveState;

#[derive(Debug, Default)]
pub struct TestReport {
    pub archive_size: u64,
    pub index_errors: u64,
    pub recovered: bool,

    // Version statistics.
    pub versions: u64,
    pub updates: u64,
    pub deletes: u64,
    pub undated_versions: u64,
    pub earliest: u64,
    pub latest: u64,
    pub dates_out_of_order: u64,

    // Fragment table statistics.
    pub fragments: u64,
    pub blocks: u64,
    pub known_bytes: u64,
    pub largest_fragment: u64,
    pub largest_block: u64,
    pub unknown_size_fragments: u64,
    pub unhashed_fragments: u64,
    pub bad_locators: u64,

    // File statistics.
    pub file_versions: u64,
    pub current_files: u64,
    pub deleted_files: u64,
    pub fragment_refs: u64,
    pub referenced_bytes: u64,
    pub current_bytes: u64,
    pub unreferenced_fragments: u64,
    pub corrupt_references: u64,

    // Verification results.
    pub bad_blocks: u64,
    pub damaged_files: u64,
    pub tested_versions: u64,
}

impl TestReport {
    pub fn ok(&self) -> bool {
        self.index_errors == 0
            && self.dates_out_of_order == 0
            && self.bad_locators == 0
            && self.corrupt_references == 0
            && self.bad_blocks == 0
            && self.damaged_files == 0
    }

    pub fn compression_ratio(&self) -> Option<f64> {
        (self.current_bytes > 0).then(|| self.archive_size as f64 * 100.0 / self.current_bytes as f64)
    }
}

pub fn run(opts: &Options) -> Result<TestReport> {
    let archive_path = Path::new(&opts.archive);
    let read = journal::read_archive(archive_path, opts.until, opts.fragile)?;
    let state = read.state;

    let mut report = TestReport {
        archive_size: read.end_offset,
        index_errors: read.errors,
        recovered: read.recovered,
        ..Default::default()
    };

    collect_version_stats(&state, &mut report);
    collect_fragment_stats(&state, &mut report);
    let refs = collect_file_stats(&state, &mut report);
    report.unreferenced_fragments = state
        .fragments
        .iter()
        .filter(|(id, _)| refs[*id as usize] == 0)
        .count() as u64;

    verify_blocks(opts, &state, &mut report)?;

    info!(
        versions = report.versions,
        fragments = report.fragments,
        bad_blocks = report.bad_blocks,
        damaged_files = report.damaged_files,
        ok = report.ok(),
        "test finished"
    );
    Ok(report)
}

fn collect_version_stats(state: &ArchiveState, report: &mut TestReport) {
    report.versions = state.snapshots.len() as u64 - 1;
    let mut latest = 0u64;
    for ver in state.snapshots.iter().skip(1) {
        report.updates += ver.updates as u64;
        report.deletes += ver.deletes as u64;
        if ver.date == 0 {
            report.undated_versions += 1;
            continue;
        }
        if report.earliest == 0 {
            report.earliest = ver.date;
        }
        if ver.date <= latest {
            report.dates_out_of_order += 1;
        }
        latest = ver.date;
        report.latest = ver.date;
    }
}

fn collect_fragment_stats(state: &ArchiveState, report: &mut TestReport) {
    report.fragments = state.fragments.len() as u64 - 1;
    let mut block_bytes = 0u64;
    for (id, entry) in state.fragments.iter() {
        match entry.locator {
            Locator::Block(offset) => {
                report.blocks += 1;
                block_bytes = 0;
                if offset > report.archive_size {
                    report.bad_locators += 1;
                }
            }
            Locator::Within(k) => {
                if k >= id {
                    report.bad_locators += 1;
                }
            }
            Locator::Missing => report.bad_locators += 1,
        }
        match entry.size {
            Some(size) => {
                report.known_bytes += size as u64;
                report.largest_fragment = report.largest_fragment.max(size as u64);
                block_bytes += size as u64;
                report.largest_block = report.largest_block.max(block_bytes);
            }
            None => report.unknown_size_fragments += 1,
        }
        if entry.hash.is_zero() {
            report.unhashed_fragments += 1;
        }
    }
}

fn collect_file_stats(state: &ArchiveState, report: &mut TestReport) -> Vec<u64> {
    let mut refs = vec![0u64; state.fragments.len() as usize];
    for (path, entry) in &state.files {
        for (i, version) in entry.versions.iter().enumerate() {
            report.file_versions += 1;
            report.fragment_refs += version.fragments.len() as u64;
            let current = i + 1 == entry.versions.len();
            if current {
                if version.is_tombstone() {
                    report.deleted_files += 1;
                } else {
                    report.current_files += 1;
                }
            }
            for &id in &version.fragments {
                let in_range = id >= 1 && id < state.fragments.len();
                if !in_range {
                    warn!(path = %path, fragment = id, "fragment reference out of range");
                    report.corrupt_references += 1;
                    continue;
                }
                refs[id as usize] += 1;
                if let Some(size) = state.fragments.get(id).and_then(|e| e.size) {
                    report.referenced_bytes += size as u64;
                    if current {
                        report.current_bytes += size as u64;
                    }
                }
            }
        }
    }
    refs
}

/// Decompress every block on the worker pool, feeding each through the
/// size-and-hash verifier.
fn verify_blocks(opts: &Options, state: &ArchiveState, report: &mut TestReport) -> Result<()> {
    struct BlockSpan {
        offset: u64,
        first: FragmentId,
        count: u32,
    }

    let mut spans: Vec<BlockSpan> = Vec::new();
    for (id, entry) in state.fragments.iter() {
        if let Locator::Block(offset) = entry.locator {
            spans.push(BlockSpan {
                offset,
                first: id,
                count: 0,
            });
        }
        if let Some(last) = spans.last_mut() {
            last.count += 1;
        }
    }

    let threads = opts.effective_threads();
    info!(blocks = spans.len(), threads, "verifying blocks");

    let verified: Vec<AtomicBool> = (0..state.fragments.len())
        .map(|_| AtomicBool::new(false))
        .collect();
    let bad_blocks = AtomicU64::new(0);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| JarcError::Other(format!("failed to build thread pool: {e}")))?;

    pool.scope(|s| {
        for span in &spans {
            let verified = &verified;
            let bad_blocks = &bad_blocks;
            s.spawn(move |_| {
                match verify_one_block(opts, state, span.offset, span.first, span.count) {
                    Ok(()) => {
                        for id in span.first..span.first + span.count {
                            verified[id as usize].store(true, Ordering::Release);
                        }
                    }
                    Err(e) => {
                        warn!(
                            offset = span.offset,
                            first = span.first,
                            error = %e,
                            "bad block"
                        );
                        bad_blocks.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });
    report.bad_blocks = bad_blocks.load(Ordering::Relaxed);

    // A file version is damaged when any referenced fragment failed.
    for entry in state.files.values() {
        for version in &entry.versions {
            report.tested_versions += 1;
            let damaged = version.fragments.iter().any(|&id| {
                id < 1
                    || id >= state.fragments.len()
                    || !verified[id as usize].load(Ordering::Acquire)
            });
            if damaged {
                report.damaged_files += 1;
            }
        }
    }
    Ok(())
}

fn verify_one_block(
    opts: &Options,
    state: &ArchiveState,
    offset: u64,
    first: FragmentId,
    count: u32,
) -> Result<()> {
    let mut reader = BlockReader::new(
        BufReader::new(File::open(&opts.archive)?),
        opts.fragile,
    );
    reader.seek_to(offset);
    let raw = reader
        .next_block()?
        .ok_or_else(|| JarcError::BadArchive("block not found at recorded offset".into()))?;
    let seg = raw
        .segments
        .first()
        .ok_or_else(|| JarcError::BadArchive("block has no segments".into()))?;

    let journaling = seg.comment.ends_with(journal::JIDAC_MARKER);
    if !journaling {
        // Streaming block: verify each segment's own checksum.
        for (i, seg) in raw.segments.iter().enumerate() {
            let data = compress::decompress(&seg.payload)?;
            if let Some(expected) = seg.hash {
                let actual = Sha1Hash::compute(&data);
                if actual != expected {
                    return Err(JarcError::ChecksumMismatch(format!(
                        "streaming segment {i} at offset {offset}"
                    )));
                }
            } else {
                debug!(offset, segment = i, "segment not checked (no stored hash)");
            }
        }
        return Ok(());
    }

    // Journaling data block: name must agree with the fragment table.
    let name = journal::parse_jidac_name(&seg.filename)
        .filter(|n| n.kind == b'd')
        .ok_or_else(|| JarcError::BadArchive("bad data block name".into()))?;
    if name.num != first {
        return Err(JarcError::BadArchive(format!(
            "data block named {}, fragment table says {first}",
            name.num
        )));
    }

    let sizes: Vec<u32> = (first..first + count)
        .map(|id| state.fragments.get(id).and_then(|e| e.size).unwrap_or(0))
        .collect();
    let data_len: usize = sizes.iter().map(|&s| s as usize).sum();

    let data = {
        let _guard = (data_len >= HUGE_ALLOC_THRESHOLD).then(huge_alloc_guard);
        compress::decompress(&seg.payload)?
    };

    // The block is fragment bytes plus either a full redundant trailer or
    // the fragile 8-byte stub.
    let with_trailer = data_len + count as usize * 4 + 8;
    let with_stub = data_len + 8;
    if data.len() != with_trailer && data.len() != with_stub {
        return Err(JarcError::SizeMismatch(format!(
            "block at {offset} decompressed to {} bytes, expected {with_trailer} or {with_stub}",
            data.len()
        )));
    }

    // Segment checksum covers the whole uncompressed payload.
    if let Some(expected) = seg.hash {
        let actual = Sha1Hash::compute(&data);
        if actual != expected {
            return Err(JarcError::ChecksumMismatch(format!(
                "block at {offset} fails its segment checksum"
            )));
        }
    }

    // Per-fragment hashes.
    let mut pos = 0usize;
    for (i, &size) in sizes.iter().enumerate() {
        let id = first + i as u32;
        let entry = state.fragments.get(id).unwrap();
        if !entry.hash.is_zero() {
            let actual = Sha1Hash::compute(&data[pos..pos + size as usize]);
            if actual != entry.hash {
                return Err(JarcError::ChecksumMismatch(format!(
                    "fragment {id} hashed {actual}, expected {}",
                    entry.hash
                )));
            }
        }
        pos += size as usize;
    }

    // Trailer cross-checks.
    let mut tail = &data[data.len() - 8..];
    let trailer_first = u32::from_le_bytes(tail[..4].try_into().unwrap());
    tail = &tail[4..];
    let trailer_count = u32::from_le_bytes(tail[..4].try_into().unwrap());
    if trailer_first == 0 && trailer_count == 0 {
        debug!(offset, "no redundant trailer (fragile block)");
        return Ok(());
    }
    if trailer_first != first || trailer_count != count {
        return Err(JarcError::BadArchive(format!(
            "trailer says fragments {trailer_first}+{trailer_count}, table says {first}+{count}"
        )));
    }
    if data.len() != with_trailer {
        return Err(JarcError::SizeMismatch(format!(
            "block at {offset} has a trailer but stub-sized payload"
        )));
    }
    let mut list = &data[data_len..data_len + count as usize * 4];
    for (i, &size) in sizes.iter().enumerate() {
        let stored = u32::from_le_bytes(list[..4].try_into().unwrap());
        list = &list[4..];
        if stored != size {
            return Err(JarcError::SizeMismatch(format!(
                "trailer size {stored} for fragment {} disagrees with table size {size}",
                first + i as u32
            )));
        }
    }
    Ok(())
}
