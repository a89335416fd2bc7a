//! Slice geometry: file-level byte ranges, wire fragmentation and reassembly.

use std::collections::BTreeMap;

use sds_protocol::SliceOffset;
use sha2::{Digest, Sha256};

use crate::error::{NodeError, Result};

/// Number of slices a file of `file_size` bytes occupies. An empty file still has one (empty) slice.
pub fn slice_count(file_size: u64, slice_size: u64) -> u64 {
    if slice_size == 0 || file_size == 0 {
        return 1;
    }
    file_size.div_ceil(slice_size)
}

/// Raw byte range of slice `number` (1-indexed). The last slice absorbs the remainder.
pub fn slice_offset(number: u64, count: u64, slice_size: u64, file_size: u64) -> SliceOffset {
    let start = number.saturating_sub(1).saturating_mul(slice_size).min(file_size);
    let end = if number >= count {
        file_size
    } else {
        number.saturating_mul(slice_size).min(file_size)
    };
    SliceOffset::new(start, end)
}

pub fn slice_offsets(file_size: u64, slice_size: u64) -> Vec<SliceOffset> {
    let count = slice_count(file_size, slice_size);
    (1..=count)
        .map(|n| slice_offset(n, count, slice_size, file_size))
        .collect()
}

/// Content address of a slice: hex sha256 of its wire bytes.
pub fn slice_hash(wire: &[u8]) -> String {
    hex::encode(Sha256::digest(wire))
}

pub fn file_hash(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

/// One frame's worth of a slice, carrying both coordinate spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// File-relative raw range.
    pub raw: SliceOffset,
    /// Slice-relative wire range; index into the wire payload with it.
    pub wire: SliceOffset,
    /// Only the final fragment asks for a download report.
    pub last: bool,
}

/// Splits a slice whose wire payload is `wire_len` bytes into frames of at most `max_frame` bytes.
///
/// For plain slices the raw range of each fragment tracks its wire range. Encrypted payloads
/// change length, so every fragment carries the whole raw slice range and the receiver decrypts
/// once the wire payload is complete.
pub fn fragment_slice(raw: SliceOffset, wire_len: u64, max_frame: usize, encrypted: bool) -> Vec<Fragment> {
    let step = (max_frame as u64).max(1);
    let mut fragments = Vec::new();
    let mut start = 0u64;
    loop {
        let end = start.saturating_add(step).min(wire_len);
        let last = end >= wire_len;
        let raw_range = if encrypted {
            raw
        } else if last {
            SliceOffset::new(raw.start + start, raw.end)
        } else {
            SliceOffset::new(raw.start + start, raw.start + end)
        };
        fragments.push(Fragment {
            raw: raw_range,
            wire: SliceOffset::new(start, if last { wire_len } else { end }),
            last,
        });
        if last {
            break;
        }
        start = end;
    }
    fragments
}

/// Rebuilds a wire payload from pieces that may arrive in any order.
#[derive(Debug)]
pub struct SliceAssembler {
    expected_len: u64,
    pieces: BTreeMap<u64, Vec<u8>>,
}

impl SliceAssembler {
    pub fn new(expected_len: u64) -> Self {
        Self {
            expected_len,
            pieces: BTreeMap::new(),
        }
    }

    pub fn expected_len(&self) -> u64 {
        self.expected_len
    }

    pub fn insert(&mut self, offset: u64, data: Vec<u8>) -> Result<()> {
        let end = offset.saturating_add(data.len() as u64);
        if end > self.expected_len {
            return Err(NodeError::InternalData(format!(
                "piece [{offset},{end}) overruns slice of {} bytes",
                self.expected_len
            )));
        }
        self.pieces.insert(offset, data);
        Ok(())
    }

    /// True once the pieces cover `[0, expected_len)` without gaps.
    pub fn is_complete(&self) -> bool {
        let mut covered = 0u64;
        for (start, data) in &self.pieces {
            if *start > covered {
                return false;
            }
            covered = covered.max(start + data.len() as u64);
        }
        covered >= self.expected_len
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if !self.is_complete() {
            return Err(NodeError::InternalData("slice payload is incomplete".into()));
        }
        let mut out = vec![0u8; self.expected_len as usize];
        for (start, data) in &self.pieces {
            let start = *start as usize;
            out[start..start + data.len()].copy_from_slice(data);
        }
        Ok(out)
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        self.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remainder_lands_in_last_slice() {
        let offsets = slice_offsets(2500, 1000);
        assert_eq!(
            offsets,
            vec![
                SliceOffset::new(0, 1000),
                SliceOffset::new(1000, 2000),
                SliceOffset::new(2000, 2500)
            ]
        );
    }

    #[test]
    fn ranges_cover_file_exactly() {
        for (file_size, slice_size) in [(1u64, 1u64), (999, 1000), (1000, 1000), (1001, 1000), (7_340_033, 1 << 20)] {
            let offsets = slice_offsets(file_size, slice_size);
            assert_eq!(offsets.len() as u64, slice_count(file_size, slice_size));
            assert!(offsets.iter().all(|o| o.len() <= slice_size));
            assert_eq!(offsets.last().unwrap().end, file_size);
            assert_eq!(offsets.iter().map(SliceOffset::len).sum::<u64>(), file_size);
        }
    }

    #[test]
    fn empty_file_has_one_empty_slice() {
        assert_eq!(slice_offsets(0, 1000), vec![SliceOffset::new(0, 0)]);
        let frags = fragment_slice(SliceOffset::new(0, 0), 0, 16, false);
        assert_eq!(frags.len(), 1);
        assert!(frags[0].last);
    }

    #[test]
    fn plain_fragments_track_both_spaces() {
        let frags = fragment_slice(SliceOffset::new(1000, 2000), 1000, 400, false);
        assert_eq!(frags.len(), 3);
        assert_eq!(frags[0].raw, SliceOffset::new(1000, 1400));
        assert_eq!(frags[0].wire, SliceOffset::new(0, 400));
        assert_eq!(frags[2].raw, SliceOffset::new(1800, 2000));
        assert_eq!(frags[2].wire, SliceOffset::new(800, 1000));
        assert_eq!(frags.iter().filter(|f| f.last).count(), 1);
        assert!(frags[2].last);
    }

    #[test]
    fn encrypted_fragments_keep_whole_raw_range() {
        let raw = SliceOffset::new(0, 1000);
        let frags = fragment_slice(raw, 1028, 512, true);
        assert_eq!(frags.len(), 3);
        assert!(frags.iter().all(|f| f.raw == raw));
        assert_eq!(frags[2].wire, SliceOffset::new(1024, 1028));
        assert_eq!(frags.iter().filter(|f| f.last).count(), 1);
    }

    #[test]
    fn assembler_accepts_out_of_order_pieces() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut asm = SliceAssembler::new(1000);
        let frags = fragment_slice(SliceOffset::new(0, 1000), 1000, 300, false);
        for frag in frags.iter().rev() {
            assert!(!asm.is_complete());
            let range = frag.wire.start as usize..frag.wire.end as usize;
            asm.insert(frag.wire.start, payload[range].to_vec()).unwrap();
        }
        assert!(asm.is_complete());
        assert_eq!(asm.into_bytes().unwrap(), payload);
    }

    #[test]
    fn assembler_rejects_overrun_and_gaps() {
        let mut asm = SliceAssembler::new(10);
        assert!(asm.insert(8, vec![0; 4]).is_err());
        asm.insert(0, vec![1; 4]).unwrap();
        asm.insert(6, vec![1; 4]).unwrap();
        assert!(!asm.is_complete());
        assert!(asm.into_bytes().is_err());
    }
}
