//! Journal reader: walks the block chain from offset 0, classifies blocks
//! by their name prefix and the JIDAC comment marker, and rebuilds the
//! in-memory [`ArchiveState`]. Damage is contained at block granularity;
//! fragment-table gaps trigger a second, recovery pass that reconstructs
//! entries from the redundant trailers of intact data blocks.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::archive::{Block, BlockReader, Segment};
use crate::compress;
use crate::config::Until;
use crate::error::{JarcError, Result};
use crate::hash::Sha1Hash;
use crate::index::{FragmentEntry, Locator};
use crate::platform::paths;
use crate::snapshot::{ArchiveState, FileAttr, FileVersion, SnapshotInfo, DATE_UNKNOWN};

/// The journaling marker ending every JIDAC segment comment.
pub const JIDAC_MARKER: &str = " jDC\u{1}";

/// Result of reading a journal.
pub struct JournalRead {
    pub state: ArchiveState,
    /// Offset where appending (or truncation for `--until`) should happen.
    pub end_offset: u64,
    /// Malformed or skipped blocks observed.
    pub errors: u64,
    /// Whether the recovery pass ran.
    pub recovered: bool,
}

/// Parsed JIDAC block name `jDC<date14><kind><num10>`.
pub struct JidacName {
    pub date: u64,
    pub kind: u8,
    pub num: u32,
}

pub fn parse_jidac_name(filename: &str) -> Option<JidacName> {
    let b = filename.as_bytes();
    if b.len() != 28 || &b[..3] != b"jDC" || !matches!(b[17], b'c' | b'd' | b'h' | b'i') {
        return None;
    }
    let date: u64 = filename[3..17].parse().ok()?;
    let num: u32 = filename[18..28].parse().ok()?;
    Some(JidacName {
        date,
        kind: b[17],
        num,
    })
}

/// A segment is journaling when its comment is `<usize> jDC\x01`.
fn journaling_usize(comment: &str) -> Option<u64> {
    comment.strip_suffix(JIDAC_MARKER)?.parse().ok()
}

pub fn jidac_comment(uncompressed_len: usize) -> String {
    format!("{uncompressed_len}{JIDAC_MARKER}")
}

pub fn jidac_name(date: u64, kind: char, num: u32) -> String {
    format!("jDC{date:014}{kind}{num:010}")
}

fn get_u32(s: &mut &[u8]) -> Option<u32> {
    let (head, rest) = s.split_first_chunk::<4>()?;
    *s = rest;
    Some(u32::from_le_bytes(*head))
}

fn get_u64(s: &mut &[u8]) -> Option<u64> {
    let (head, rest) = s.split_first_chunk::<8>()?;
    *s = rest;
    Some(u64::from_le_bytes(*head))
}

/// Read the archive at `path` up to the `--until` cutoff.
pub fn read_archive(path: &Path, until: Until, fragile: bool) -> Result<JournalRead> {
    info!(archive = %path.display(), "reading archive");
    let mut pass = Pass {
        state: ArchiveState::new(),
        errors: 0,
        needs_recovery: false,
        stopped_early: false,
        lastfile: default_stream_name(path),
        first_segment: true,
    };

    let end_offset = pass.run(path, until, fragile, false)?;

    let mut recovered = false;
    if pass.needs_recovery && !pass.stopped_early {
        info!("fragment table damaged; attempting recovery from data blocks");
        pass.run(path, until, fragile, true)?;
        pass.recompute_sizes();
        recovered = true;
    }

    Ok(JournalRead {
        state: pass.state,
        end_offset,
        errors: pass.errors,
        recovered,
    })
}

/// Default output name for unnamed streaming segments: the archive name
/// with its `.zpaq` suffix dropped.
fn default_stream_name(path: &Path) -> String {
    let s = paths::normalize(&path.to_string_lossy());
    s.strip_suffix(".zpaq").unwrap_or(&s).to_string()
}

struct Pass {
    state: ArchiveState,
    errors: u64,
    needs_recovery: bool,
    stopped_early: bool,
    lastfile: String,
    first_segment: bool,
}

enum Flow {
    Continue,
    Stop,
}

impl Pass {
    /// Walk every block once; returns the append/truncation offset.
    fn run(&mut self, path: &Path, until: Until, fragile: bool, recover: bool) -> Result<u64> {
        let file = File::open(path)?;
        let mut reader = BlockReader::new(BufReader::new(file), fragile);
        let mut end_offset = 0u64;
        // Offset of the next data block, tracked from the transaction head
        // and advanced by the sizes advertised in fragment-table blocks.
        let mut data_offset = 0u64;
        let mut any_block = false;

        loop {
            let block = match reader.next_block() {
                Ok(Some(b)) => b,
                Ok(None) => break,
                Err(e) => return Err(e),
            };
            any_block = true;

            match self.process_block(&block, until, recover, &mut data_offset, &mut reader) {
                Ok(Flow::Continue) => end_offset = block.offset + block.size,
                Ok(Flow::Stop) => {
                    self.stopped_early = true;
                    self.errors += reader.errors;
                    return Ok(block.offset);
                }
                Err(e) if e.is_block_recoverable() => {
                    warn!(offset = block.offset, error = %e, "skipping block");
                    self.errors += 1;
                    end_offset = block.offset + block.size;
                }
                Err(e) => return Err(e),
            }
        }
        self.errors += reader.errors;

        if !any_block && std::fs::metadata(path).map(|m| m.len()).unwrap_or(0) > 0 {
            return Err(JarcError::BadArchive("archive contains no data".into()));
        }
        Ok(end_offset)
    }

    fn process_block(
        &mut self,
        block: &Block,
        until: Until,
        recover: bool,
        data_offset: &mut u64,
        reader: &mut BlockReader<BufReader<File>>,
    ) -> Result<Flow> {
        for (seg_idx, seg) in block.segments.iter().enumerate() {
            let jidac = journaling_usize(&seg.comment)
                .and_then(|u| parse_jidac_name(&seg.filename).map(|n| (u, n)));

            match jidac {
                Some((usize_hint, name)) => {
                    let flow = self.process_jidac(
                        block, seg, usize_hint, &name, until, recover, data_offset, reader,
                    )?;
                    if matches!(flow, Flow::Stop) {
                        return Ok(Flow::Stop);
                    }
                }
                None if !recover => {
                    if matches!(self.process_streaming(block, seg, seg_idx, until)?, Flow::Stop) {
                        return Ok(Flow::Stop);
                    }
                }
                None => {}
            }
            self.first_segment = false;
        }
        Ok(Flow::Continue)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_jidac(
        &mut self,
        block: &Block,
        seg: &Segment,
        usize_hint: u64,
        name: &JidacName,
        until: Until,
        recover: bool,
        data_offset: &mut u64,
        reader: &mut BlockReader<BufReader<File>>,
    ) -> Result<Flow> {
        match name.kind {
            b'c' if !recover => {
                *data_offset = block.offset + block.size;

                let until_break = match until {
                    Until::None => false,
                    Until::Version(n) => self.state.snapshots.len() as u64 > n as u64,
                    Until::Date(d) => name.date > d,
                };
                if until_break {
                    return Ok(Flow::Stop);
                }

                let payload = decompress_verified(seg, usize_hint)?;
                if payload.len() != 8 {
                    warn!(size = payload.len(), "bad transaction header size");
                    self.errors += 1;
                    return Ok(Flow::Stop);
                }
                let jmp = i64::from_le_bytes(payload[..8].try_into().unwrap());
                if jmp < 0 {
                    warn!(offset = block.offset, "incomplete transaction ignored");
                    return Ok(Flow::Stop);
                }
                if jmp > 0 {
                    reader.seek_to(*data_offset + jmp as u64);
                }

                self.state.snapshots.push(SnapshotInfo {
                    date: name.date,
                    offset: block.offset,
                    first_fragment: self.state.fragments.len(),
                    ..Default::default()
                });
            }

            b'h' if !recover => {
                if name.num == 0 {
                    return Err(JarcError::BadArchive("fragment table with ID 0".into()));
                }
                let payload = decompress_verified(seg, usize_hint)?;
                let mut s = payload.as_slice();
                let Some(bsize) = get_u32(&mut s) else {
                    return Err(JarcError::BadArchive("short fragment table".into()));
                };
                if self.state.fragments.len() != name.num {
                    warn!(
                        expected = self.state.fragments.len(),
                        found = name.num,
                        "unordered fragment table"
                    );
                    self.needs_recovery = true;
                }
                let count = (s.len() / 24) as u32;
                for i in 0..count {
                    let id = name.num + i;
                    let mut hash = [0u8; 20];
                    hash.copy_from_slice(&s[..20]);
                    s = &s[20..];
                    let size = get_u32(&mut s).unwrap();

                    self.state.fragments.grow_to(id);
                    let entry = self.state.fragments.get_mut(id).unwrap();
                    if entry.locator != Locator::Missing {
                        return Err(JarcError::DuplicateFragmentId(id));
                    }
                    *entry = FragmentEntry {
                        hash: Sha1Hash(hash),
                        size: Some(size),
                        locator: if i == 0 {
                            Locator::Block(*data_offset)
                        } else {
                            Locator::Within(i)
                        },
                    };
                }
                *data_offset += bsize as u64;
            }

            b'i' if !recover => {
                let payload = decompress_verified(seg, usize_hint)?;
                self.parse_index_records(&payload)?;
            }

            b'd' if recover => {
                self.recover_data_block(block, seg, usize_hint, name)?;
            }

            b'd' => {
                // Data is addressed via fragment locators; a data block only
                // shows up here when the transaction head advertised no run
                // to skip. Nothing to do in the normal pass.
                debug!(offset = block.offset, "skipping data block payload");
            }

            _ => {
                if !recover {
                    warn!(
                        filename = %seg.filename,
                        offset = block.offset,
                        "bad journaling block ignored"
                    );
                    self.errors += 1;
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn parse_index_records(&mut self, payload: &[u8]) -> Result<()> {
        let mut s = payload;
        while s.len() >= 9 {
            let date = get_u64(&mut s).unwrap();
            let nul = s
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| JarcError::BadArchive("unterminated path in index".into()))?;
            let path = std::str::from_utf8(&s[..nul])
                .map_err(|_| JarcError::BadArchive("non-UTF-8 path in index".into()))?
                .to_string();
            s = &s[nul + 1..];

            let snapshot = self.state.snapshots.len() - 1;
            let mut version = FileVersion {
                date,
                snapshot,
                ..Default::default()
            };
            if date != 0 {
                self.state.snapshots[snapshot].updates += 1;
            } else {
                self.state.snapshots[snapshot].deletes += 1;
            }

            if date != 0 && s.len() >= 4 {
                let na = get_u32(&mut s).unwrap() as usize;
                let take = na.min(s.len());
                version.attr = FileAttr::decode(&s[..take]);
                s = &s[take..];

                if s.len() >= 4 {
                    let ni = get_u32(&mut s).unwrap();
                    let mut size: Option<u64> = Some(0);
                    version.fragments.reserve(ni as usize);
                    for _ in 0..ni {
                        let Some(ptr) = get_u32(&mut s) else { break };
                        if ptr < 1 || ptr >= self.state.fragments.len() + (1 << 24) {
                            return Err(JarcError::BadArchive(format!(
                                "bad fragment ID {ptr} in index record for '{path}'"
                            )));
                        }
                        if ptr >= self.state.fragments.len() {
                            self.needs_recovery = true;
                            self.state.fragments.grow_to(ptr);
                        }
                        version.fragments.push(ptr);
                        match self.state.fragments.get(ptr).and_then(|e| e.size) {
                            Some(fsz) => {
                                size = size.map(|t| t + fsz as u64);
                                self.state.snapshots[snapshot].data_size += fsz as u64;
                            }
                            None => size = None,
                        }
                    }
                    version.size = size;
                }
            }

            self.state.files.entry(path).or_default().versions.push(version);
        }
        Ok(())
    }

    /// In the recovery pass, reconstruct missing fragment entries from a
    /// data block's redundant trailer and re-hash its bytes.
    fn recover_data_block(
        &mut self,
        block: &Block,
        seg: &Segment,
        usize_hint: u64,
        name: &JidacName,
    ) -> Result<()> {
        let num = name.num;
        if num == 0 || num >= self.state.fragments.len() {
            return Ok(());
        }
        let first_missing =
            self.state.fragments.get(num).map(|e| e.locator) == Some(Locator::Missing);
        if first_missing {
            let payload = decompress_verified(seg, usize_hint)?;
            if payload.len() >= 8 {
                let mut tail = &payload[payload.len() - 8..];
                let trailer_first = get_u32(&mut tail).unwrap();
                let count = get_u32(&mut tail).unwrap();
                if trailer_first == 0 && count == 0 {
                    // Written fragile: no redundant trailer, nothing to
                    // recover from. Refuse rather than guess.
                    warn!(
                        offset = block.offset,
                        first = num,
                        "data block has no redundant trailer; cannot recover"
                    );
                    return Ok(());
                }
                if trailer_first == num
                    && count > 0
                    && count as usize * 4 + 8 <= payload.len()
                {
                    info!(first = num, count, offset = block.offset, "recovering fragments");
                    self.state.fragments.grow_to(num + count);
                    let mut sizes = &payload[payload.len() - 8 - count as usize * 4..];
                    let mut sum = 0usize;
                    for i in 0..count {
                        let fsz = get_u32(&mut sizes).unwrap();
                        sum += fsz as usize;
                        let entry = self.state.fragments.get_mut(num + i).unwrap();
                        entry.size = Some(fsz);
                        entry.locator = if i == 0 {
                            Locator::Block(block.offset)
                        } else {
                            Locator::Within(i)
                        };
                    }
                    // The sizes are trustworthy only if they tile the block
                    // exactly; then the bytes can be re-hashed.
                    if sum + count as usize * 4 + 8 == payload.len() {
                        debug!(bytes = sum, "recomputing fragment hashes");
                        let mut pos = 0usize;
                        for i in 0..count {
                            let entry = self.state.fragments.get_mut(num + i).unwrap();
                            let fsz = entry.size.unwrap_or(0) as usize;
                            entry.hash = Sha1Hash::compute(&payload[pos..pos + fsz]);
                            pos += fsz;
                        }
                    }
                }
            }
        }

        // Correct a stale offset even when the entry itself survived.
        if let Some(entry) = self.state.fragments.get_mut(num) {
            if matches!(entry.locator, Locator::Block(o) if o != block.offset) {
                debug!(
                    fragment = num,
                    offset = block.offset,
                    "correcting block offset"
                );
                entry.locator = Locator::Block(block.offset);
            }
        }
        Ok(())
    }

    /// Legacy (non-journaling) segment: named segments start or continue a
    /// logical file; comments may carry `<size> <date> [w|u]<attr>`.
    fn process_streaming(
        &mut self,
        block: &Block,
        seg: &Segment,
        seg_idx: usize,
        until: Until,
    ) -> Result<Flow> {
        if seg_idx == 0
            && (self.state.snapshots.len() == 1
                || self.state.snapshots.last().is_some_and(|v| v.date != 0))
        {
            if let Until::Version(n) = until {
                if self.state.snapshots.len() as u64 > n as u64 {
                    return Ok(Flow::Stop);
                }
            }
            self.state.snapshots.push(SnapshotInfo {
                date: 0,
                offset: block.offset,
                first_fragment: self.state.fragments.len(),
                ..Default::default()
            });
        }

        let (usize_hint, fdate, fattr) = parse_stream_comment(&seg.comment);
        let named = !seg.filename.is_empty();
        if named {
            self.lastfile = paths::normalize(&seg.filename);
        }

        let snapshot = self.state.snapshots.len() - 1;
        let id = self.state.fragments.push(FragmentEntry {
            hash: seg.hash.unwrap_or(Sha1Hash::ZERO),
            size: usize_hint.and_then(|u| u32::try_from(u).ok()),
            locator: if seg_idx == 0 {
                Locator::Block(block.offset)
            } else {
                Locator::Within(seg_idx as u32)
            },
        });

        let entry = self.state.files.entry(self.lastfile.clone()).or_default();
        if named || self.first_segment {
            entry.versions.push(FileVersion {
                date: fdate,
                attr: fattr,
                size: Some(0),
                snapshot,
                ..Default::default()
            });
            self.state.snapshots[snapshot].updates += 1;
        }
        let version = entry
            .versions
            .last_mut()
            .expect("streaming segment always has a version");
        version.fragments.push(id);
        match (usize_hint, version.size) {
            (Some(u), Some(s)) => version.size = Some(s + u),
            _ => version.size = None,
        }
        if let Some(u) = usize_hint {
            self.state.snapshots[snapshot].data_size += u;
        }
        Ok(Flow::Continue)
    }

    /// After recovery, rebuild per-version sizes from the fragment table.
    fn recompute_sizes(&mut self) {
        for entry in self.state.files.values_mut() {
            for version in &mut entry.versions {
                let mut size: Option<u64> = Some(0);
                for &id in &version.fragments {
                    match self.state.fragments.get(id).and_then(|e| e.size) {
                        Some(fsz) => size = size.map(|t| t + fsz as u64),
                        None => size = None,
                    }
                }
                version.size = size;
            }
        }
    }
}

/// Decompress a journaling segment payload, checking the advertised size
/// and the trailing hash when present.
fn decompress_verified(seg: &Segment, usize_hint: u64) -> Result<Vec<u8>> {
    let out = compress::decompress(&seg.payload)?;
    if out.len() as u64 != usize_hint {
        return Err(JarcError::SizeMismatch(format!(
            "'{}' should be {usize_hint} bytes, is {}",
            seg.filename,
            out.len()
        )));
    }
    if let Some(expected) = seg.hash {
        let actual = Sha1Hash::compute(&out);
        if actual != expected {
            return Err(JarcError::ChecksumMismatch(format!(
                "'{}' hashed {actual}, expected {expected}",
                seg.filename
            )));
        }
    }
    Ok(out)
}

/// Parse a streaming comment `<size> <date> [w|u]<attr>`.
fn parse_stream_comment(comment: &str) -> (Option<u64>, u64, FileAttr) {
    let bytes = comment.as_bytes();
    let mut i = 0;

    let mut usize_hint: Option<u64> = None;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        usize_hint = Some(usize_hint.unwrap_or(0) * 10 + (bytes[i] - b'0') as u64);
        i += 1;
    }

    const DATE_SCAN_STOP: u64 = 19_000_000_000_000;
    let mut fdate: u64 = 0;
    while i < bytes.len() && fdate < DATE_SCAN_STOP {
        if bytes[i].is_ascii_digit() {
            fdate = fdate * 10 + (bytes[i] - b'0') as u64;
        }
        i += 1;
    }
    if fdate < DATE_SCAN_STOP || fdate > crate::date::MAX_DATE {
        fdate = DATE_UNKNOWN;
    }

    let mut attr = FileAttr::None;
    let rest = &comment[i.min(comment.len())..];
    for part in rest.split_whitespace() {
        let b = part.as_bytes();
        if b.len() > 1 && (b[0] == b'u' || b[0] == b'w') {
            if let Ok(v) = part[1..].parse::<u64>() {
                attr = FileAttr::from_packed((b[0] as u64) | v.wrapping_shl(8));
            }
        }
    }
    (usize_hint, fdate, attr)
}
