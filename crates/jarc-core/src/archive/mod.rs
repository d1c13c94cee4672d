//! Self-delimiting block framing.
//!
//! An archive is a sequence of blocks. Each block is optionally preceded by
//! an 8-byte locator tag (omitted in fragile mode), then:
//!
//! ```text
//! magic "jAB1"
//! one per segment:
//!   0x01  filename(u16 LE len + bytes)  comment(u16 LE len + bytes)
//!         payload(u32 LE len + bytes)   hash flag(0x00 | 0x01 + sha1[20])
//! 0x00  end of block
//! ```
//!
//! The payload is codec-compressed (see [`crate::compress`]); the trailing
//! SHA-1, when present, is over the uncompressed payload. The locator tag
//! lets a reader resynchronize past a damaged block; without it, discovery
//! is strictly sequential and damage is fatal.

use std::io::{Read, Seek, SeekFrom, Write};

use tracing::warn;

use crate::error::{JarcError, Result};
use crate::hash::Sha1Hash;

pub const BLOCK_TAG: [u8; 8] = [0x6A, 0x52, 0x63, 0x1A, 0xD4, 0x7F, 0x42, 0x31];
pub const BLOCK_MAGIC: [u8; 4] = *b"jAB1";

const SEG_START: u8 = 0x01;
const BLOCK_END: u8 = 0x00;

/// Upper bound on a single compressed payload. Blocks are produced from
/// bounded pending buffers, so anything larger is corruption.
const MAX_PAYLOAD: u32 = 1 << 30;

#[derive(Debug, Clone)]
pub struct Segment {
    pub filename: String,
    pub comment: String,
    pub payload: Vec<u8>,
    pub hash: Option<Sha1Hash>,
}

#[derive(Debug)]
pub struct Block {
    /// Archive offset of the block's first byte (the tag when present).
    pub offset: u64,
    /// Total framed size on disk.
    pub size: u64,
    pub segments: Vec<Segment>,
}

/// Serialize one single-segment block to its on-disk form.
pub fn frame_block(
    filename: &str,
    comment: &str,
    payload: &[u8],
    hash: Option<Sha1Hash>,
    fragile: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + filename.len() + comment.len() + 48);
    if !fragile {
        out.extend_from_slice(&BLOCK_TAG);
    }
    out.extend_from_slice(&BLOCK_MAGIC);
    out.push(SEG_START);
    out.extend_from_slice(&(filename.len() as u16).to_le_bytes());
    out.extend_from_slice(filename.as_bytes());
    out.extend_from_slice(&(comment.len() as u16).to_le_bytes());
    out.extend_from_slice(comment.as_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    match hash {
        Some(h) => {
            out.push(1);
            out.extend_from_slice(&h.0);
        }
        None => out.push(0),
    }
    out.push(BLOCK_END);
    out
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

pub struct BlockReader<R: Read + Seek> {
    inner: R,
    pos: u64,
    fragile: bool,
    /// Number of malformed blocks skipped so far.
    pub errors: u64,
}

impl<R: Read + Seek> BlockReader<R> {
    pub fn new(inner: R, fragile: bool) -> Self {
        Self {
            inner,
            pos: 0,
            fragile,
            errors: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek_to(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Read the next block. Malformed blocks are logged, counted, and
    /// skipped by rescanning for the locator tag; in fragile mode the first
    /// malformed block ends discovery with an error.
    pub fn next_block(&mut self) -> Result<Option<Block>> {
        loop {
            let start = self.pos;
            match self.read_block_at(start) {
                Ok(None) => return Ok(None),
                Ok(Some(block)) => {
                    self.pos = block.offset + block.size;
                    return Ok(Some(block));
                }
                Err(e) if e.is_block_recoverable() && !self.fragile => {
                    warn!(offset = start, error = %e, "skipping malformed block");
                    self.errors += 1;
                    match self.scan_for_tag(start + 1)? {
                        Some(next) => self.pos = next,
                        None => return Ok(None),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn read_block_at(&mut self, offset: u64) -> Result<Option<Block>> {
        self.inner.seek(SeekFrom::Start(offset))?;

        // Locator tag is optional: a fragile-written archive has none.
        let mut head = [0u8; 8];
        let got = read_up_to(&mut self.inner, &mut head)?;
        if got == 0 {
            return Ok(None);
        }
        let seg_start = if got == 8 && head == BLOCK_TAG {
            // Stream is already at offset+8; the magic follows the tag.
            let mut magic = [0u8; 4];
            self.inner
                .read_exact(&mut magic)
                .map_err(|_| JarcError::BadArchive(format!("truncated block at {offset}")))?;
            if magic != BLOCK_MAGIC {
                return Err(JarcError::BadArchive(format!(
                    "bad block magic at offset {offset}"
                )));
            }
            offset + 12
        } else if got >= 4 && head[..4] == BLOCK_MAGIC {
            offset + 4
        } else {
            return Err(JarcError::BadArchive(format!(
                "no block tag or magic at offset {offset}"
            )));
        };
        self.inner.seek(SeekFrom::Start(seg_start))?;

        let mut segments = Vec::new();
        loop {
            match self.read_u8(offset)? {
                BLOCK_END => break,
                SEG_START => segments.push(self.read_segment(offset)?),
                other => {
                    return Err(JarcError::BadArchive(format!(
                        "bad segment marker {other:#04x} in block at {offset}"
                    )))
                }
            }
        }

        let end = self.inner.stream_position()?;
        Ok(Some(Block {
            offset,
            size: end - offset,
            segments,
        }))
    }

    fn read_segment(&mut self, block_offset: u64) -> Result<Segment> {
        let filename = self.read_short_string(block_offset)?;
        let comment = self.read_short_string(block_offset)?;

        let mut len4 = [0u8; 4];
        self.read_exact_in_block(&mut len4, block_offset)?;
        let payload_len = u32::from_le_bytes(len4);
        if payload_len > MAX_PAYLOAD {
            return Err(JarcError::BadArchive(format!(
                "payload length {payload_len} too large in block at {block_offset}"
            )));
        }
        let mut payload = vec![0u8; payload_len as usize];
        self.read_exact_in_block(&mut payload, block_offset)?;

        let hash = match self.read_u8(block_offset)? {
            0 => None,
            1 => {
                let mut h = [0u8; 20];
                self.read_exact_in_block(&mut h, block_offset)?;
                Some(Sha1Hash(h))
            }
            other => {
                return Err(JarcError::BadArchive(format!(
                    "bad hash flag {other:#04x} in block at {block_offset}"
                )))
            }
        };

        Ok(Segment {
            filename,
            comment,
            payload,
            hash,
        })
    }

    fn read_short_string(&mut self, block_offset: u64) -> Result<String> {
        let mut len2 = [0u8; 2];
        self.read_exact_in_block(&mut len2, block_offset)?;
        let mut bytes = vec![0u8; u16::from_le_bytes(len2) as usize];
        self.read_exact_in_block(&mut bytes, block_offset)?;
        String::from_utf8(bytes)
            .map_err(|_| JarcError::BadArchive(format!("non-UTF-8 name in block at {block_offset}")))
    }

    fn read_u8(&mut self, block_offset: u64) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact_in_block(&mut b, block_offset)?;
        Ok(b[0])
    }

    fn read_exact_in_block(&mut self, buf: &mut [u8], block_offset: u64) -> Result<()> {
        self.inner
            .read_exact(buf)
            .map_err(|_| JarcError::BadArchive(format!("truncated block at {block_offset}")))
    }

    /// Scan forward from `from` for the next locator tag. The window keeps a
    /// 7-byte overlap between chunks so a tag straddling a boundary is found.
    fn scan_for_tag(&mut self, from: u64) -> Result<Option<u64>> {
        const CHUNK: usize = 64 * 1024;
        self.inner.seek(SeekFrom::Start(from))?;
        let mut window: Vec<u8> = Vec::with_capacity(CHUNK + BLOCK_TAG.len());
        let mut window_start = from;
        loop {
            let old_len = window.len();
            window.resize(old_len + CHUNK, 0);
            let got = read_up_to(&mut self.inner, &mut window[old_len..])?;
            window.truncate(old_len + got);

            if window.len() >= BLOCK_TAG.len() {
                for i in 0..=window.len() - BLOCK_TAG.len() {
                    if window[i..i + BLOCK_TAG.len()] == BLOCK_TAG {
                        return Ok(Some(window_start + i as u64));
                    }
                }
            }
            if got == 0 {
                return Ok(None);
            }
            let keep = BLOCK_TAG.len() - 1;
            if window.len() > keep {
                let drop_n = window.len() - keep;
                window.drain(..drop_n);
                window_start += drop_n as u64;
            }
        }
    }
}

fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct BlockWriter<W: Write + Seek> {
    out: W,
    fragile: bool,
}

impl<W: Write + Seek> BlockWriter<W> {
    pub fn new(out: W, fragile: bool) -> Self {
        Self { out, fragile }
    }

    /// Append one single-segment block; returns `(offset, framed size)`.
    pub fn write_block(
        &mut self,
        filename: &str,
        comment: &str,
        payload: &[u8],
        hash: Option<Sha1Hash>,
    ) -> Result<(u64, u64)> {
        let offset = self.out.seek(SeekFrom::End(0))?;
        let frame = frame_block(filename, comment, payload, hash, self.fragile);
        self.out.write_all(&frame)?;
        Ok((offset, frame.len() as u64))
    }

    /// Append pre-framed bytes (produced by a pipeline worker).
    pub fn write_raw(&mut self, frame: &[u8]) -> Result<(u64, u64)> {
        let offset = self.out.seek(SeekFrom::End(0))?;
        self.out.write_all(frame)?;
        Ok((offset, frame.len() as u64))
    }

    /// Rewrite a block in place at `offset`. The replacement frame must be
    /// byte-for-byte the same length as the original; used to back-patch the
    /// reserved transaction header.
    pub fn patch_block(
        &mut self,
        offset: u64,
        filename: &str,
        comment: &str,
        payload: &[u8],
        hash: Option<Sha1Hash>,
    ) -> Result<()> {
        let end = self.out.seek(SeekFrom::End(0))?;
        let frame = frame_block(filename, comment, payload, hash, self.fragile);
        self.out.seek(SeekFrom::Start(offset))?;
        self.out.write_all(&frame)?;
        self.out.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.out.seek(SeekFrom::End(0))?)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
