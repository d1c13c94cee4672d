//! The byte-level compression codec, treated as a black box by the rest of
//! the engine: `compress(profile, data)` and `decompress(data)` with a
//! one-byte self-describing tag. Three codecs (store, LZ4 frame, zstd
//! stream) stand in for the original's store/LZ/CM/BWT ladder; the profile
//! expander maps a method level and a content-type tag onto one of them,
//! optionally with the reversible E8E9 transform for executable content.

use std::io::{Read, Write};

use crate::error::{JarcError, Result};

const TAG_STORE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;
const CODEC_MASK: u8 = 0x0F;
const FLAG_E8E9: u8 = 0x10;

/// Decompression output cap. The largest configurable block is well under
/// this; anything bigger is a decompression bomb.
const MAX_DECOMPRESS: u64 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Store,
    Lz4,
    Zstd { level: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profile {
    pub codec: Codec,
    pub e8e9: bool,
}

impl Profile {
    pub const STORE: Profile = Profile {
        codec: Codec::Store,
        e8e9: false,
    };
}

/// Content-type tag for a block whose redundancy is unmeasured.
pub const TYPE_DEFAULT: u32 = 512;

/// Expand a method level and a block type tag (redundancy*4 + exe*2 + text,
/// see [`crate::classify`]) into concrete codec parameters. Low-redundancy
/// blocks are stored; increasingly redundant blocks get increasingly
/// expensive codecs. The exe bit turns on the E8E9 preprocessor.
pub fn select_profile(level: u8, type_tag: u32) -> Profile {
    let exe = type_tag & 2 != 0;
    let codec = match level {
        0 => Codec::Store,
        1 => {
            if type_tag < 40 {
                Codec::Store
            } else {
                Codec::Lz4
            }
        }
        2 => {
            if type_tag < 32 {
                Codec::Store
            } else {
                Codec::Lz4
            }
        }
        3 => {
            if type_tag < 16 {
                Codec::Store
            } else if type_tag < 48 {
                Codec::Lz4
            } else {
                Codec::Zstd { level: 3 }
            }
        }
        4 => {
            if type_tag < 12 {
                Codec::Store
            } else if type_tag < 24 {
                Codec::Lz4
            } else {
                Codec::Zstd { level: 6 }
            }
        }
        5 => {
            if type_tag < 12 {
                Codec::Store
            } else if type_tag < 24 {
                Codec::Lz4
            } else {
                Codec::Zstd { level: 12 }
            }
        }
        _ => Codec::Zstd { level: 19 },
    };
    Profile {
        codec,
        e8e9: exe && level >= 1 && codec != Codec::Store,
    }
}

// ---------------------------------------------------------------------------
// Method grammar
// ---------------------------------------------------------------------------

/// Parsed `--method` argument.
///
/// `0`..`6` select a journaling level; `x<bits>[,<level>]` overrides the
/// block size (2^(20+bits) - 4096); `s[<bits>][,<level>]` selects streaming
/// (non-journaling) mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Method {
    pub level: u8,
    pub streaming: bool,
    block_bits: Option<u8>,
}

/// Room left in a block for fragment bookkeeping.
const BLOCK_SLACK: usize = 4096;
const MAX_BLOCK_BITS: u8 = 11;

impl Default for Method {
    fn default() -> Self {
        Method {
            level: 1,
            streaming: false,
            block_bits: None,
        }
    }
}

impl Method {
    pub fn parse(s: &str) -> Result<Method> {
        let bad = || JarcError::BadOption(format!("bad method '{s}'"));
        let mut chars = s.chars();
        match chars.next() {
            Some(c @ '0'..='6') if chars.as_str().is_empty() => Ok(Method {
                level: c as u8 - b'0',
                streaming: false,
                block_bits: None,
            }),
            Some(kind @ ('x' | 's')) => {
                let rest = chars.as_str();
                let (bits, level) = match rest.split_once(',') {
                    Some((b, l)) => (b, Some(l)),
                    None => (rest, None),
                };
                let block_bits = if bits.is_empty() {
                    None
                } else {
                    let n: u8 = bits.parse().map_err(|_| bad())?;
                    if n > MAX_BLOCK_BITS {
                        return Err(bad());
                    }
                    Some(n)
                };
                let level = match level {
                    None => 1,
                    Some(l) => {
                        let n: u8 = l.parse().map_err(|_| bad())?;
                        if n > 6 {
                            return Err(bad());
                        }
                        n
                    }
                };
                Ok(Method {
                    level,
                    streaming: kind == 's',
                    block_bits,
                })
            }
            _ => Err(bad()),
        }
    }

    /// Pending-block capacity in bytes.
    pub fn block_size(&self) -> usize {
        match self.block_bits {
            Some(bits) => (1usize << (20 + bits)) - BLOCK_SLACK,
            None if self.level >= 2 && !self.streaming => (1 << 26) - BLOCK_SLACK,
            None => (1 << 24) - BLOCK_SLACK,
        }
    }
}

// ---------------------------------------------------------------------------
// Compression / decompression
// ---------------------------------------------------------------------------

/// Compress `data` under `profile`, prepending the codec tag byte.
pub fn compress(profile: Profile, data: &[u8]) -> Result<Vec<u8>> {
    let mut transformed;
    let input: &[u8] = if profile.e8e9 {
        transformed = data.to_vec();
        e8e9_encode(&mut transformed);
        &transformed
    } else {
        data
    };
    let flag = if profile.e8e9 { FLAG_E8E9 } else { 0 };

    match profile.codec {
        Codec::Store => {
            let mut out = Vec::with_capacity(1 + input.len());
            out.push(TAG_STORE | flag);
            out.extend_from_slice(input);
            Ok(out)
        }
        Codec::Lz4 => {
            let mut enc = lz4_flex::frame::FrameEncoder::new(vec![TAG_LZ4 | flag]);
            enc.write_all(input)
                .map_err(|e| JarcError::Other(format!("lz4 compress: {e}")))?;
            enc.finish()
                .map_err(|e| JarcError::Other(format!("lz4 finish: {e}")))
        }
        Codec::Zstd { level } => {
            let mut enc = zstd::stream::Encoder::new(vec![TAG_ZSTD | flag], level)
                .map_err(|e| JarcError::Other(format!("zstd init: {e}")))?;
            enc.write_all(input)
                .map_err(|e| JarcError::Other(format!("zstd compress: {e}")))?;
            enc.finish()
                .map_err(|e| JarcError::Other(format!("zstd finish: {e}")))
        }
    }
}

/// Decompress a tagged payload in full.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    decompress_prefix(data, usize::MAX)
}

/// Decompress at least the first `want` bytes of a tagged payload, stopping
/// early when the rest is not needed. E8E9-flagged payloads are always
/// decoded in full (the inverse transform needs the complete stream) and
/// then truncated.
pub fn decompress_prefix(data: &[u8], want: usize) -> Result<Vec<u8>> {
    let Some((&tag, payload)) = data.split_first() else {
        return Err(JarcError::Decompression("empty payload".into()));
    };
    let e8e9 = tag & FLAG_E8E9 != 0;
    let limit = if e8e9 {
        usize::MAX
    } else {
        want
    };

    let mut out = match tag & CODEC_MASK {
        TAG_STORE => {
            let n = payload.len().min(limit);
            payload[..n].to_vec()
        }
        TAG_LZ4 => {
            let dec = lz4_flex::frame::FrameDecoder::new(payload);
            read_limited(dec, limit, "lz4")?
        }
        TAG_ZSTD => {
            let dec = zstd::stream::Decoder::new(payload)
                .map_err(|e| JarcError::Decompression(format!("zstd init: {e}")))?;
            read_limited(dec, limit, "zstd")?
        }
        other => {
            return Err(JarcError::Decompression(format!(
                "unknown codec tag {other:#04x}"
            )))
        }
    };

    if e8e9 {
        e8e9_decode(&mut out);
        out.truncate(want.min(out.len()));
    }
    Ok(out)
}

fn read_limited<R: Read>(reader: R, want: usize, what: &str) -> Result<Vec<u8>> {
    let cap = (want as u64).min(MAX_DECOMPRESS);
    let mut out = Vec::new();
    reader
        .take(cap.saturating_add(1).min(MAX_DECOMPRESS + 1))
        .read_to_end(&mut out)
        .map_err(|e| JarcError::Decompression(format!("{what}: {e}")))?;
    if out.len() as u64 > MAX_DECOMPRESS {
        return Err(JarcError::Decompression(format!(
            "{what}: output exceeds {MAX_DECOMPRESS} bytes"
        )));
    }
    out.truncate(want.min(out.len()));
    Ok(out)
}

// ---------------------------------------------------------------------------
// E8E9 transform
// ---------------------------------------------------------------------------

/// Rewrite x86 call/jump targets `(E8|E9 xx xx xx 00|FF)` from relative to
/// absolute form, improving compressibility. Scans backward so overlapping
/// patterns invert cleanly.
pub fn e8e9_encode(buf: &mut [u8]) {
    if buf.len() < 5 {
        return;
    }
    for i in (0..=buf.len() - 5).rev() {
        if buf[i] & 0xFE == 0xE8 && buf[i + 4].wrapping_add(1) & 0xFE == 0 {
            let a = (buf[i + 1] as u32 | (buf[i + 2] as u32) << 8 | (buf[i + 3] as u32) << 16)
                .wrapping_add(i as u32);
            buf[i + 1] = a as u8;
            buf[i + 2] = (a >> 8) as u8;
            buf[i + 3] = (a >> 16) as u8;
        }
    }
}

/// Inverse of [`e8e9_encode`]; scans forward.
pub fn e8e9_decode(buf: &mut [u8]) {
    if buf.len() < 5 {
        return;
    }
    for i in 0..=buf.len() - 5 {
        if buf[i] & 0xFE == 0xE8 && buf[i + 4].wrapping_add(1) & 0xFE == 0 {
            let a = (buf[i + 1] as u32 | (buf[i + 2] as u32) << 8 | (buf[i + 3] as u32) << 16)
                .wrapping_sub(i as u32);
            buf[i + 1] = a as u8;
            buf[i + 2] = (a >> 8) as u8;
            buf[i + 3] = (a >> 16) as u8;
        }
    }
}
