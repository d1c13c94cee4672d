//! Content-defined fragmenter.
//!
//! Bytes are split at positions where an order-1 predictive rolling hash
//! drops below 2^16, subject to a 4096-byte minimum and a 520192-byte hard
//! cap. The hash multiplier differs depending on whether the incoming byte
//! was predicted by the 256-entry order-1 table, which biases cuts toward
//! positions with predictable context. Boundaries depend only on content,
//! so an insertion shifts at most the fragments around it.

use std::io::{BufRead, BufReader, Read};

use sha1::{Digest, Sha1};

use crate::error::Result;
use crate::hash::Sha1Hash;

pub const MIN_FRAGMENT: usize = 4096;
pub const MAX_FRAGMENT: usize = 520_192;

const MULT_PREDICTED: u32 = 314_159_265;
const MULT_MISS: u32 = 271_828_182;

/// One fragment of an input stream, with the order-1 table and prediction
/// hit count accumulated while scanning it (consumed by the classifier).
pub struct Fragment {
    pub data: Vec<u8>,
    pub hash: Sha1Hash,
    pub o1: Box<[u8; 256]>,
    pub hits: u32,
}

pub struct Chunker<R: Read> {
    reader: BufReader<R>,
    eof: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::with_capacity(64 * 1024, reader),
            eof: false,
        }
    }

    fn next_fragment(&mut self) -> Result<Option<Fragment>> {
        if self.eof {
            return Ok(None);
        }

        let mut data = Vec::with_capacity(MIN_FRAGMENT * 2);
        let mut o1 = Box::new([0u8; 256]);
        let mut prev: u8 = 0;
        let mut h: u32 = 0;
        let mut hits: u32 = 0;

        'fill: loop {
            let buf = self.reader.fill_buf()?;
            if buf.is_empty() {
                self.eof = true;
                break;
            }
            let mut used = 0;
            for &c in buf {
                used += 1;
                data.push(c);
                if c == o1[prev as usize] {
                    h = h.wrapping_add(c as u32 + 1).wrapping_mul(MULT_PREDICTED);
                    hits += 1;
                } else {
                    h = h.wrapping_add(c as u32 + 1).wrapping_mul(MULT_MISS);
                }
                o1[prev as usize] = c;
                prev = c;
                if (h < 65536 && data.len() >= MIN_FRAGMENT) || data.len() >= MAX_FRAGMENT {
                    self.reader.consume(used);
                    break 'fill;
                }
            }
            self.reader.consume(used);
        }

        if data.is_empty() {
            return Ok(None);
        }
        let mut hasher = Sha1::new();
        hasher.update(&data);
        Ok(Some(Fragment {
            hash: Sha1Hash(hasher.finalize().into()),
            data,
            o1,
            hits,
        }))
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Fragment>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_fragment().transpose()
    }
}
