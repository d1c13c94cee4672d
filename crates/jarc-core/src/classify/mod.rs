//! Pending-block content classification.
//!
//! While a block accumulates new fragments, four redundancy heuristics run
//! over each fragment's order-1 table: prediction hits, entropy deficit of
//! the table's byte frequencies, never-seen-byte count, and similarity to
//! the tables of recent fragments. Together with text-context and
//! x86-opcode counters they produce a type tag in 0..1023 that the profile
//! expander maps to codec parameters.

use crate::chunker::{Fragment, MIN_FRAGMENT};

/// Number of recent order-1 tables kept for the similarity test.
const PREV_TABLES: usize = 4;

/// Entropy decay weights: `max(1, 32768 / ((i+1) * 204))`.
const DECAY: [u8; 256] = decay_table();

const fn decay_table() -> [u8; 256] {
    let mut t = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let v = 32768 / ((i + 1) * 204);
        t[i] = if v < 1 { 1 } else { v as u8 };
        i += 1;
    }
    t
}

#[derive(Default)]
pub struct BlockTelemetry {
    /// Estimated compressible byte count across observed fragments.
    redundancy: u64,
    /// Fragments that looked like text.
    text: u32,
    /// Fragments that looked like x86 code.
    exe: u32,
    /// Fragments observed since the last reset.
    frags: u32,
    o1_prev: Vec<u8>,
}

impl BlockTelemetry {
    pub fn new() -> Self {
        Self {
            o1_prev: vec![0u8; 256 * PREV_TABLES],
            ..Self::default()
        }
    }

    pub fn reset(&mut self) {
        self.redundancy = 0;
        self.text = 0;
        self.exe = 0;
        self.frags = 0;
        // The previous-table ring intentionally survives a reset: similarity
        // across adjacent blocks is part of the fourth test.
    }

    pub fn redundancy(&self) -> u64 {
        self.redundancy
    }

    /// Feed one newly stored (non-duplicate) fragment.
    pub fn observe(&mut self, frag: &Fragment) {
        let sz = frag.data.len() as u64;
        self.frags += 1;

        let mut text_score: i32 = 0;
        let mut exe_score: i32 = 0;
        let mut entropy: i64 = sz as i64;
        let mut counts = [0u8; 256];

        for (ctx, &predicted) in frag.o1.iter().enumerate() {
            let seen = &mut counts[predicted as usize];
            if *seen < 255 {
                entropy -= ((sz * DECAY[*seen as usize] as u64) >> 15) as i64;
                *seen += 1;
            }
            let ctx = ctx as u8;
            if predicted == b' ' && (ctx.is_ascii_alphanumeric() || ctx == b'.' || ctx == b',') {
                text_score += 1;
            }
            if predicted >= 1 && predicted < 32 && predicted != 9 && predicted != 10 && predicted != 13
            {
                text_score -= 1;
            }
            if predicted == 0x8B {
                exe_score += 1;
            }
        }
        if exe_score >= 5 {
            self.exe += 1;
        }
        if text_score >= 5 {
            self.text += 1;
        }

        // Test 1: successful predictions while chunking.
        let mut best = frag.hits as u64;
        // Test 2: entropy deficit, squared and normalized; near 0 if random.
        if sz > 0 {
            let e = entropy.max(0) as u64;
            best = best.max(e.saturating_mul(e) / sz);
        }
        // Test 3: bytes never seen (or predicting 0).
        best = best.max(counts[0] as u64 * sz / 256);
        // Test 4: similarity to the order-1 tables of recent fragments.
        let matches = self
            .o1_prev
            .iter()
            .enumerate()
            .filter(|(i, &b)| b == frag.o1[i & 255])
            .count() as u64;
        best = best.max(matches * sz / (256 * PREV_TABLES) as u64);

        if frag.data.len() >= MIN_FRAGMENT {
            self.o1_prev.copy_within(256.., 0);
            let tail = 256 * (PREV_TABLES - 1);
            self.o1_prev[tail..].copy_from_slice(&frag.o1[..]);
        }

        self.redundancy += best.min(sz);
    }

    /// Final type tag for a pending block of `block_len` bytes:
    /// `redundancy_estimate*4 + exe*2 + text`, clipped to 0..1023.
    pub fn type_tag(&self, block_len: usize) -> u32 {
        let scaled = self.redundancy / (block_len as u64 / 256 + 1);
        let exe_bit = u32::from(self.exe > self.frags / 8) * 2;
        let text_bit = u32::from(self.text > self.frags / 4);
        (scaled.min(255) as u32) * 4 + exe_bit + text_bit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::Chunker;

    fn fragment_of(data: &[u8]) -> Fragment {
        Chunker::new(data).next().unwrap().unwrap()
    }

    #[test]
    fn decay_table_matches_formula() {
        assert_eq!(DECAY[0], 160);
        assert_eq!(DECAY[16], 9);
        assert_eq!(DECAY[52], 3);
        assert_eq!(DECAY[53], 2);
        assert_eq!(DECAY[255], 1);
        assert!(DECAY.iter().all(|&v| v >= 1));
    }

    #[test]
    fn repetitive_data_scores_redundant() {
        let mut t = BlockTelemetry::new();
        let frag = fragment_of(&vec![0u8; 100_000]);
        let len = frag.data.len();
        t.observe(&frag);
        assert!(t.redundancy() > len as u64 / 2, "{}", t.redundancy());
        assert!(t.type_tag(len) / 4 > 100);
    }

    #[test]
    fn random_data_scores_low() {
        let mut state = 1u64;
        let data: Vec<u8> = (0..100_000)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                (state >> 33) as u8
            })
            .collect();
        let mut t = BlockTelemetry::new();
        let mut total = 0usize;
        for frag in Chunker::new(&data[..]) {
            let frag = frag.unwrap();
            total += frag.data.len();
            t.observe(&frag);
        }
        assert!(
            t.redundancy() < total as u64 / 8,
            "random data scored {} of {total}",
            t.redundancy()
        );
    }

    #[test]
    fn text_sets_text_bit() {
        let line = b"the quick. brown fox, jumps over the lazy dog again and again ";
        let data: Vec<u8> = line.iter().copied().cycle().take(100_000).collect();
        let mut t = BlockTelemetry::new();
        for frag in Chunker::new(&data[..]) {
            t.observe(&frag.unwrap());
        }
        assert_eq!(t.type_tag(data.len()) & 1, 1);
        assert_eq!(t.type_tag(data.len()) & 2, 0);
    }

    #[test]
    fn mov_heavy_data_sets_exe_bit() {
        // 0x8B in many distinct contexts.
        let mut data = Vec::with_capacity(100_000);
        for i in 0..50_000u32 {
            data.push((i % 256) as u8);
            data.push(0x8B);
        }
        let mut t = BlockTelemetry::new();
        for frag in Chunker::new(&data[..]) {
            t.observe(&frag.unwrap());
        }
        assert_eq!(t.type_tag(data.len()) & 2, 2);
    }

    #[test]
    fn reset_clears_counters() {
        let mut t = BlockTelemetry::new();
        t.observe(&fragment_of(&vec![3u8; 50_000]));
        assert!(t.redundancy() > 0);
        t.reset();
        assert_eq!(t.redundancy(), 0);
        assert_eq!(t.type_tag(1), 0);
    }

    #[test]
    fn tag_stays_in_range() {
        let mut t = BlockTelemetry::new();
        for _ in 0..8 {
            t.observe(&fragment_of(&vec![7u8; 200_000]));
        }
        assert!(t.type_tag(16) <= 1023);
    }
}
