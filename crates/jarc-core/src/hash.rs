use std::fmt;

use sha1::{Digest, Sha1};

/// A 20-byte SHA-1 content hash identifying one fragment.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1Hash(pub [u8; 20]);

impl Sha1Hash {
    pub const ZERO: Sha1Hash = Sha1Hash([0; 20]);

    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Sha1Hash(hasher.finalize().into())
    }

    /// An all-zero hash marks a fragment whose bytes were never hashed
    /// (damaged table entry awaiting recovery).
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 20]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Bucket key for the dedup index: low 22 bits of the first three bytes.
    pub fn bucket(&self) -> usize {
        (self.0[0] as usize | (self.0[1] as usize) << 8 | (self.0[2] as usize) << 16)
            & ((1 << 22) - 1)
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Hash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_deterministic() {
        let a = Sha1Hash::compute(b"hello world");
        let b = Sha1Hash::compute(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, Sha1Hash::compute(b"hello worle"));
    }

    #[test]
    fn known_vector() {
        // SHA-1("abc")
        let h = Sha1Hash::compute(b"abc");
        assert_eq!(h.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn zero_detection() {
        assert!(Sha1Hash::ZERO.is_zero());
        assert!(!Sha1Hash::compute(b"").is_zero());
    }

    #[test]
    fn bucket_uses_low_22_bits() {
        let mut bytes = [0u8; 20];
        bytes[0] = 0xFF;
        bytes[1] = 0xFF;
        bytes[2] = 0xFF; // 0xFFFFFF masked to 22 bits
        assert_eq!(Sha1Hash(bytes).bucket(), (1 << 22) - 1);
    }
}
