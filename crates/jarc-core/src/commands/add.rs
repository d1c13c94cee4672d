//! Snapshot writer: `add` and `delete`.
//!
//! A journaling update appends one transaction: a reserved `c` head whose
//! payload is -1 until the update is complete, the deduplicated `d` data
//! blocks (compressed by the pipeline, written FIFO), the `h` fragment
//! tables, the `i` index records, and finally the back-patched `c` head
//! carrying the true size of the data run. A crash at any point leaves the
//! placeholder, which the next reader drops as an incomplete transaction.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::archive::BlockWriter;
use crate::chunker::{Chunker, MAX_FRAGMENT};
use crate::classify::BlockTelemetry;
use crate::compress::{self, Profile};
use crate::config::Options;
use crate::date;
use crate::error::{JarcError, Result};
use crate::hash::Sha1Hash;
use crate::index::{FragmentEntry, FragmentId, HashIndex, Locator};
use crate::journal::{self, jidac_comment, jidac_name};
use crate::pipeline::{self, BlockJob, JobSender};
use crate::platform::fs::{scan_into, ScanFilter};
use crate::platform::paths;
use crate::snapshot::{ArchiveState, ExternalInfo, FileAttr};

/// `delete` is an add that scans nothing, so everything selected becomes a
/// tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Add,
    Delete,
}

#[derive(Debug, Default)]
pub struct AddStats {
    /// False when there was nothing to add or delete.
    pub updated: bool,
    pub date: u64,
    pub added: u32,
    pub deleted: u32,
    pub fragments_added: u32,
    pub blocks_written: usize,
    pub input_bytes: u64,
    pub start_offset: u64,
    pub archive_end: u64,
}

/// Index-record buffers flush at this payload size.
const INDEX_FLUSH: usize = 16_000;

pub fn run(opts: &Options, mode: UpdateMode) -> Result<AddStats> {
    if opts.files.is_empty() {
        return Err(JarcError::BadOption(
            "add and delete need at least one file or directory argument".into(),
        ));
    }

    // Phase 1: read the existing journal up to the cutoff.
    let archive_path = Path::new(&opts.archive);
    let (mut state, header_pos) = if archive_path.exists() {
        let read = journal::read_archive(archive_path, opts.until, opts.fragile)?;
        (read.state, read.end_offset)
    } else {
        info!(archive = %opts.archive, "creating new archive");
        (ArchiveState::new(), 0)
    };

    // Phase 2: mark what the arguments select, then scan external inputs.
    state.select(&opts.files, &opts.not, false);
    if mode == UpdateMode::Add {
        let filter = ScanFilter {
            not: &opts.not,
            files: &opts.files,
            tofiles: &opts.to,
        };
        for arg in &opts.files {
            let external = paths::rename(arg, &opts.files, &opts.to);
            scan_into(&external, &filter, &mut |e| {
                let entry = state.files.entry(e.name).or_default();
                entry.external = Some(ExternalInfo {
                    date: e.date,
                    size: e.size,
                    attr: e.attr,
                    fragments: Vec::new(),
                });
                entry.selected = true;
            });
        }
    }

    // Candidates: external files whose latest stored date differs (or
    // everything external, with --force).
    let mut candidates: Vec<String> = state
        .files
        .iter()
        .filter(|(_, e)| {
            e.external.as_ref().is_some_and(|ext| {
                ext.date != 0
                    && (opts.force || e.latest().is_none_or(|v| v.date != ext.date))
            })
        })
        .map(|(p, _)| p.clone())
        .collect();
    candidates.sort_by(|a, b| extension_of(a).cmp(&extension_of(b)).then(a.cmp(b)));

    let deletions = state
        .files
        .values()
        .filter(|e| e.selected && e.external.is_none() && e.is_live())
        .count();

    if candidates.is_empty() && deletions == 0 {
        info!(archive = %opts.archive, "nothing to add or delete");
        return Ok(AddStats {
            updated: false,
            archive_end: header_pos,
            start_offset: header_pos,
            ..Default::default()
        });
    }

    // Snapshot date, kept strictly increasing.
    let mut snap_date = date::now_decimal();
    if let Some(prev) = state.snapshots.last() {
        if prev.date >= snap_date && prev.date <= date::MAX_DATE {
            let adjusted = date::decimal_from_unix(date::unix_from_decimal(prev.date)? + 1);
            warn!(
                from = date::date_to_string(snap_date),
                to = date::date_to_string(adjusted),
                "clock did not advance; adjusting snapshot date"
            );
            snap_date = adjusted;
        }
    }
    if !date::is_valid(snap_date) {
        return Err(JarcError::Other(format!("system date {snap_date} is incorrect")));
    }

    info!(
        archive = %opts.archive,
        additions = candidates.len(),
        deletions,
        date = date::date_to_string(snap_date),
        "updating archive"
    );

    // Open for append, truncating past the cutoff.
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(archive_path)?;
    let current_len = file.metadata()?.len();
    if current_len != header_pos {
        info!(from = current_len, to = header_pos, "truncating archive");
        file.set_len(header_pos)?;
    }
    let mut writer = BlockWriter::new(file, opts.fragile);

    if opts.method.streaming {
        return stream_add(opts, &mut state, writer, &candidates, header_pos);
    }

    // Phase 3: reserve the transaction head with payload -1.
    let htsize = state.fragments.len();
    write_transaction_head(&mut writer, snap_date, htsize, -1, opts.fragile)?;
    let header_end = writer.position()?;

    // Phases 4-6: chunk, dedup, and compress through the pipeline.
    let mut htinv = HashIndex::new(&state.fragments);
    let threads = opts.effective_threads();
    debug!(threads, "starting compression jobs");

    let mut block_firsts: Vec<FragmentId> = Vec::new();
    let mut input_bytes = 0u64;

    let (mut writer, written) =
        pipeline::compress_blocks(writer, threads, opts.fragile, |tx| {
            let mut producer = Producer {
                state: &mut state,
                htinv: &mut htinv,
                telemetry: BlockTelemetry::new(),
                pending: Vec::new(),
                pending_frags: 0,
                block_size: opts.method.block_size(),
                level: opts.method.level,
                date: snap_date,
                fragile: opts.fragile,
                block_firsts: &mut block_firsts,
            };
            for path in &candidates {
                producer.add_file(path, opts, tx, &mut input_bytes)?;
            }
            producer.flush(tx)?;
            Ok(())
        })?;

    // Phase 7: record where each block landed.
    debug_assert_eq!(written.len(), block_firsts.len());
    for (b, &first) in block_firsts.iter().enumerate() {
        let last = block_firsts
            .get(b + 1)
            .copied()
            .unwrap_or(state.fragments.len());
        for id in first..last {
            let entry = state.fragments.get_mut(id).unwrap();
            entry.locator = if id == first {
                Locator::Block(written[b].offset)
            } else {
                Locator::Within(id - first)
            };
        }
    }
    let cdatasize: u64 = written.iter().map(|w| w.size).sum();

    // Phase 8: fragment tables, one `h` block per data block.
    info!(
        files = candidates.len(),
        blocks = written.len(),
        fragments = state.fragments.len() - htsize,
        "updating index"
    );
    for (b, &first) in block_firsts.iter().enumerate() {
        let last = block_firsts
            .get(b + 1)
            .copied()
            .unwrap_or(state.fragments.len());
        let mut payload = Vec::with_capacity(4 + 24 * (last - first) as usize);
        payload.extend_from_slice(&(written[b].size as u32).to_le_bytes());
        for id in first..last {
            let entry = state.fragments.get(id).unwrap();
            payload.extend_from_slice(&entry.hash.0);
            payload.extend_from_slice(&entry.size.unwrap_or(0).to_le_bytes());
        }
        write_meta_block(
            &mut writer,
            &jidac_name(snap_date, 'h', first),
            &payload,
            Profile::STORE,
            opts.fragile,
        )?;
    }

    // Phase 9: index records.
    let (added, deleted) = write_index_blocks(&mut writer, &state, opts, snap_date)?;

    // Phase 10: back-patch the head with the true data size.
    write_transaction_head_at(
        &mut writer,
        header_pos,
        snap_date,
        htsize,
        cdatasize as i64,
        opts.fragile,
    )?;
    writer.flush()?;
    let archive_end = writer.position()?;

    info!(
        input = input_bytes,
        data = cdatasize,
        index = archive_end - header_end - cdatasize,
        total = archive_end - header_pos,
        "archive updated"
    );

    Ok(AddStats {
        updated: true,
        date: snap_date,
        added,
        deleted,
        fragments_added: state.fragments.len() - htsize,
        blocks_written: written.len(),
        input_bytes,
        start_offset: header_pos,
        archive_end,
    })
}

fn extension_of(name: &str) -> &str {
    name.rfind('.').map(|i| &name[i..]).unwrap_or("")
}

fn write_transaction_head<W: std::io::Write + std::io::Seek>(
    writer: &mut BlockWriter<W>,
    snap_date: u64,
    htsize: FragmentId,
    cdata: i64,
    fragile: bool,
) -> Result<()> {
    let payload = compress::compress(Profile::STORE, &cdata.to_le_bytes())?;
    let hash = (!fragile).then(|| Sha1Hash::compute(&cdata.to_le_bytes()));
    writer.write_block(&jidac_name(snap_date, 'c', htsize), &jidac_comment(8), &payload, hash)?;
    Ok(())
}

fn write_transaction_head_at<W: std::io::Write + std::io::Seek>(
    writer: &mut BlockWriter<W>,
    offset: u64,
    snap_date: u64,
    htsize: FragmentId,
    cdata: i64,
    fragile: bool,
) -> Result<()> {
    let payload = compress::compress(Profile::STORE, &cdata.to_le_bytes())?;
    let hash = (!fragile).then(|| Sha1Hash::compute(&cdata.to_le_bytes()));
    writer.patch_block(
        offset,
        &jidac_name(snap_date, 'c', htsize),
        &jidac_comment(8),
        &payload,
        hash,
    )
}

/// Write an `h` or `i` block from the main thread.
fn write_meta_block<W: std::io::Write + std::io::Seek>(
    writer: &mut BlockWriter<W>,
    name: &str,
    payload: &[u8],
    profile: Profile,
    fragile: bool,
) -> Result<()> {
    let packed = compress::compress(profile, payload)?;
    let hash = (!fragile).then(|| Sha1Hash::compute(payload));
    writer.write_block(name, &jidac_comment(payload.len()), &packed, hash)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Block production
// ---------------------------------------------------------------------------

struct Producer<'a> {
    state: &'a mut ArchiveState,
    htinv: &'a mut HashIndex,
    telemetry: BlockTelemetry,
    pending: Vec<u8>,
    pending_frags: u32,
    block_size: usize,
    level: u8,
    date: u64,
    fragile: bool,
    block_firsts: &'a mut Vec<FragmentId>,
}

impl Producer<'_> {
    fn add_file(
        &mut self,
        path: &str,
        opts: &Options,
        tx: &mut JobSender,
        input_bytes: &mut u64,
    ) -> Result<()> {
        if path.ends_with('/') {
            debug!(path = %path, "adding directory");
            return Ok(());
        }

        // Between files, give up on a pending block that is nearly full or
        // that the classifier judges poorly compressible.
        let next_size = self.state.files[path]
            .external
            .as_ref()
            .map(|e| e.size)
            .unwrap_or(0);
        self.maybe_flush_between_files(next_size as usize, tx)?;

        let external = paths::rename(path, &opts.files, &opts.to);
        let file = match File::open(&external) {
            Ok(f) => f,
            Err(e) => {
                // Vanished since the scan: record as a deletion instead.
                warn!(path = %external, error = %e, "input disappeared, recording deletion");
                self.state.files.get_mut(path).unwrap().external = None;
                return Ok(());
            }
        };

        let is_update = self.state.files[path].is_live();
        debug!(path = %path, update = is_update, first_fragment = self.state.fragments.len(), "adding");

        for fragment in Chunker::new(file) {
            let fragment = fragment?;
            *input_bytes += fragment.data.len() as u64;

            // Flush when the next fragment could overflow the block.
            if self.pending.len() + MAX_FRAGMENT + 80 + self.pending_frags as usize * 4
                > self.block_size
            {
                self.flush(tx)?;
            }

            let id = match self.htinv.find(&self.state.fragments, &fragment.hash) {
                Some(id) => id,
                None => {
                    let id = self.state.fragments.push(FragmentEntry {
                        hash: fragment.hash,
                        size: Some(fragment.data.len() as u32),
                        locator: Locator::Missing,
                    });
                    self.htinv.update(&self.state.fragments);
                    self.telemetry.observe(&fragment);
                    self.pending.extend_from_slice(&fragment.data);
                    self.pending_frags += 1;
                    id
                }
            };
            self.state
                .files
                .get_mut(path)
                .unwrap()
                .external
                .as_mut()
                .unwrap()
                .fragments
                .push(id);
        }
        Ok(())
    }

    fn maybe_flush_between_files(&mut self, next_size: usize, tx: &mut JobSender) -> Result<()> {
        let len = self.pending.len();
        let red = self.telemetry.redundancy() as usize;
        let full_soon = len > self.block_size / 4 * 3
            && len + next_size + MAX_FRAGMENT + 2048 > self.block_size;
        let incompressible = (len > self.block_size / 8 && red < len / 32)
            || (len > self.block_size / 4 && red < len / 16)
            || (len > self.block_size / 2 && red < len / 8);
        if full_soon || incompressible {
            self.flush(tx)?;
        }
        Ok(())
    }

    /// Seal the pending block: append the redundant trailer (unless
    /// fragile), stamp its name, and enqueue it for compression.
    fn flush(&mut self, tx: &mut JobSender) -> Result<()> {
        if self.pending_frags == 0 {
            return Ok(());
        }
        let first = self.state.fragments.len() - self.pending_frags;
        let type_tag = self.telemetry.type_tag(self.pending.len());

        if self.fragile {
            self.pending.extend_from_slice(&[0u8; 8]);
        } else {
            for id in first..self.state.fragments.len() {
                let size = self.state.fragments.get(id).unwrap().size.unwrap_or(0);
                self.pending.extend_from_slice(&size.to_le_bytes());
            }
            self.pending.extend_from_slice(&first.to_le_bytes());
            self.pending.extend_from_slice(&self.pending_frags.to_le_bytes());
        }

        tx.send(BlockJob {
            filename: jidac_name(self.date, 'd', first),
            data: std::mem::take(&mut self.pending),
            level: self.level,
            type_tag,
        })?;

        self.block_firsts.push(first);
        self.pending_frags = 0;
        self.telemetry.reset();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Index records
// ---------------------------------------------------------------------------

fn write_index_blocks<W: std::io::Write + std::io::Seek>(
    writer: &mut BlockWriter<W>,
    state: &ArchiveState,
    opts: &Options,
    snap_date: u64,
) -> Result<(u32, u32)> {
    let mut buf: Vec<u8> = Vec::new();
    let mut count = 0u32;
    let mut added = 0u32;
    let mut deleted = 0u32;

    let flush =
        |writer: &mut BlockWriter<W>, buf: &mut Vec<u8>, count: &mut u32| -> Result<()> {
            if buf.is_empty() {
                return Ok(());
            }
            *count += 1;
            let profile = compress::select_profile(1, compress::TYPE_DEFAULT);
            write_meta_block(
                writer,
                &jidac_name(snap_date, 'i', *count),
                buf,
                profile,
                opts.fragile,
            )?;
            buf.clear();
            Ok(())
        };

    for (path, entry) in &state.files {
        // Tombstone: selected, missing externally, live in the archive.
        if entry.selected && entry.external.is_none() && entry.is_live() {
            buf.extend_from_slice(&0u64.to_le_bytes());
            buf.extend_from_slice(path.as_bytes());
            buf.push(0);
            deleted += 1;
            info!(path = %path, "removing");
        }

        // Update: anything observed externally whose version differs.
        if let Some(ext) = &entry.external {
            let candidate = ext.date != 0
                && (opts.force || entry.latest().is_none_or(|v| v.date != ext.date));
            let changed = entry.latest().is_none_or(|v| {
                v.date != ext.date || v.attr != ext.attr || v.fragments != ext.fragments
            });
            if candidate && changed {
                buf.extend_from_slice(&ext.date.to_le_bytes());
                buf.extend_from_slice(path.as_bytes());
                buf.push(0);
                let attr = ext.attr.encode();
                buf.extend_from_slice(&(attr.len() as u32).to_le_bytes());
                buf.extend_from_slice(&attr);
                buf.extend_from_slice(&(ext.fragments.len() as u32).to_le_bytes());
                for &id in &ext.fragments {
                    buf.extend_from_slice(&id.to_le_bytes());
                }
                added += 1;
            }
        }

        if buf.len() > INDEX_FLUSH {
            flush(writer, &mut buf, &mut count)?;
        }
    }
    flush(writer, &mut buf, &mut count)?;
    Ok((added, deleted))
}

// ---------------------------------------------------------------------------
// Streaming mode
// ---------------------------------------------------------------------------

/// `--method s…`: each file becomes one or more single-segment blocks with
/// no fragments, no dedup, and no journal records. Compression happens on
/// this thread since per-segment state carries across blocks.
fn stream_add<W>(
    opts: &Options,
    state: &mut ArchiveState,
    mut writer: BlockWriter<W>,
    candidates: &[String],
    header_pos: u64,
) -> Result<AddStats>
where
    W: std::io::Write + std::io::Seek,
{
    let block_size = opts.method.block_size();
    let profile = compress::select_profile(opts.method.level, compress::TYPE_DEFAULT);
    let mut input_bytes = 0u64;
    let mut blocks_written = 0usize;
    let mut added = 0u32;

    for path in candidates {
        if path.ends_with('/') {
            continue;
        }
        let Some(ext) = state.files[path].external.clone() else {
            continue;
        };
        let external = paths::rename(path, &opts.files, &opts.to);
        let mut file = match File::open(&external) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %external, error = %e, "skipping unreadable input");
                continue;
            }
        };

        let mut total = 0u64;
        let mut first = true;
        loop {
            let mut chunk = Vec::with_capacity(block_size.min(1 << 20));
            let read = (&mut file)
                .take(block_size as u64)
                .read_to_end(&mut chunk)?;
            total += read as u64;
            if read == 0 && !first {
                break;
            }

            let (filename, comment) = if first {
                let mut comment = format!("{} {}", chunk.len(), ext.date);
                match ext.attr {
                    FileAttr::Unix(mode) => comment.push_str(&format!(" u{mode}")),
                    FileAttr::Windows(word) => comment.push_str(&format!(" w{word}")),
                    FileAttr::None => {}
                }
                (path.clone(), comment)
            } else {
                (String::new(), format!("{}", chunk.len()))
            };

            let packed = compress::compress(profile, &chunk)?;
            let hash = (!opts.fragile).then(|| Sha1Hash::compute(&chunk));
            writer.write_block(&filename, &comment, &packed, hash)?;
            blocks_written += 1;
            first = false;
            if read < block_size {
                break;
            }
        }
        input_bytes += total;
        added += 1;
        debug!(path = %path, bytes = total, "streamed");
    }

    writer.flush()?;
    let archive_end = writer.position()?;
    info!(input = input_bytes, total = archive_end - header_pos, "archive updated (streaming)");
    Ok(AddStats {
        updated: blocks_written > 0,
        added,
        blocks_written,
        input_bytes,
        start_offset: header_pos,
        archive_end,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_sort_by_extension_then_name() {
        let mut names = vec![
            "b/readme.txt".to_string(),
            "a/main.rs".to_string(),
            "z/lib.rs".to_string(),
            "a/noext".to_string(),
        ];
        names.sort_by(|a, b| extension_of(a).cmp(&extension_of(b)).then(a.cmp(b)));
        assert_eq!(names, ["a/noext", "a/main.rs", "z/lib.rs", "b/readme.txt"]);
    }

    #[test]
    fn extension_takes_last_dot() {
        assert_eq!(extension_of("a/b.tar.gz"), ".gz");
        assert_eq!(extension_of("no-dot"), "");
        assert_eq!(extension_of("trailing."), ".");
    }
}
