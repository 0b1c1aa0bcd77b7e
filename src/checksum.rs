//! Streaming implementation of the CFDP modular checksum.
//!
//! The modular checksum treats the file as a sequence of big-endian 32 bit
//! words (the trailing partial word zero-padded) and adds them with wrap
//! around. The accumulator below digests arbitrary chunk sizes while only
//! buffering the current 4 byte group, so very large files can be digested
//! incrementally under a per-wakeup byte budget.
//!
//! Note that this is an additive digest, not a CRC polynomial: equality is
//! only meaningful between two modular checksums over the same byte stream.

/// Streaming modular checksum accumulator.
///
/// Chunk boundaries do not influence the result: digesting `A` then `B`
/// yields the same checksum as digesting `A ++ B` in one call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Checksum {
    sum: u32,
    working: u32,
    /// Bytes currently shifted into the working word, 0..=3.
    group_fill: u8,
}

impl Checksum {
    pub const fn new() -> Self {
        Self {
            sum: 0,
            working: 0,
            group_fill: 0,
        }
    }

    /// Digest the next chunk of the byte stream.
    pub fn digest(&mut self, data: &[u8]) {
        for &byte in data {
            self.working = (self.working << 8) | u32::from(byte);
            self.group_fill += 1;
            if self.group_fill == 4 {
                self.sum = self.sum.wrapping_add(self.working);
                self.working = 0;
                self.group_fill = 0;
            }
        }
    }

    /// Flush a partial trailing group as if it were zero-padded to a full
    /// word and return the checksum over everything digested so far.
    ///
    /// Finalizing is idempotent and digestion may validly resume afterwards;
    /// the flushed partial group then counts as padded.
    pub fn finalize(&mut self) -> u32 {
        if self.group_fill != 0 {
            let pad_shift = 8 * (4 - u32::from(self.group_fill));
            self.sum = self.sum.wrapping_add(self.working << pad_shift);
            self.working = 0;
            self.group_fill = 0;
        }
        self.sum
    }

    /// Reset to the empty digest.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Convenience for digesting a complete in-memory byte stream.
pub fn checksum_of(data: &[u8]) -> u32 {
    let mut digest = Checksum::new();
    digest.digest(data);
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stream() {
        assert_eq!(checksum_of(&[]), 0);
    }

    #[test]
    fn single_full_word() {
        assert_eq!(checksum_of(&[0x12, 0x34, 0x56, 0x78]), 0x1234_5678);
    }

    #[test]
    fn trailing_partial_word_is_zero_padded() {
        assert_eq!(checksum_of(&[0xab]), 0xab00_0000);
        assert_eq!(checksum_of(&[0xab, 0xcd]), 0xabcd_0000);
        assert_eq!(checksum_of(&[0xab, 0xcd, 0xef]), 0xabcd_ef00);
    }

    #[test]
    fn word_sum_wraps() {
        let data = [0xff; 8];
        assert_eq!(
            checksum_of(&data),
            0xffff_ffffu32.wrapping_add(0xffff_ffff)
        );
    }

    #[test]
    fn streaming_equals_batch() {
        let data: [u8; 29] = core::array::from_fn(|i| (i * 7 + 3) as u8);
        let batch = checksum_of(&data);
        // Every split point, including ones that leave a partial group
        // buffered across the call boundary.
        for split in 0..data.len() {
            let mut digest = Checksum::new();
            digest.digest(&data[..split]);
            digest.digest(&data[split..]);
            assert_eq!(digest.finalize(), batch, "split at {}", split);
        }
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut digest = Checksum::new();
        digest.digest(&[1, 2, 3]);
        let first = digest.finalize();
        assert_eq!(digest.finalize(), first);
        assert_eq!(digest.finalize(), first);
    }

    #[test]
    fn digestion_may_resume_after_finalize() {
        let mut digest = Checksum::new();
        digest.digest(&[1, 2, 3, 4]);
        digest.finalize();
        digest.digest(&[5, 6, 7, 8]);
        assert_eq!(
            digest.finalize(),
            checksum_of(&[1, 2, 3, 4, 5, 6, 7, 8])
        );
    }

    #[test]
    fn reset_clears_state() {
        let mut digest = Checksum::new();
        digest.digest(&[1, 2, 3, 4, 5]);
        digest.reset();
        assert_eq!(digest.finalize(), 0);
    }
}
