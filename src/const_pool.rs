//! Deduplicating constant pool.
//!
//! Constants are assigned final offsets as they are added: the cursor is
//! aligned up to the constant's own width, so every constant is naturally
//! aligned and the offset handed back never moves afterwards (callers
//! encode it into instructions immediately). Identical byte patterns share
//! one slot. The pool's alignment is the widest constant added so far.

use std::collections::HashMap;

use smallvec::SmallVec;

/// Widths accepted by the pool.
const WIDTHS: [usize; 6] = [1, 2, 4, 8, 16, 32];

/// A pool of deduplicated constants to be embedded behind a label.
#[derive(Default)]
pub struct ConstPool {
    /// Constants with their assigned offsets, in insertion order.
    entries: Vec<(u32, SmallVec<[u8; 8]>)>,
    /// Dedup index from constant bytes to assigned offset.
    index: HashMap<SmallVec<[u8; 8]>, u32>,
    /// Size of the filled pool.
    size: u32,
    /// Largest constant width added so far.
    alignment: u32,
}

impl ConstPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the pool holds no constants.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a constant, returning its byte offset within the filled pool.
    /// Identical constants share an offset. The width must be one of 1, 2,
    /// 4, 8, 16 or 32 bytes.
    pub fn add(&mut self, data: &[u8]) -> Option<u32> {
        if !WIDTHS.contains(&data.len()) {
            return None;
        }
        let key: SmallVec<[u8; 8]> = SmallVec::from_slice(data);
        if let Some(&offset) = self.index.get(&key) {
            return Some(offset);
        }
        let width = data.len() as u32;
        let offset = (self.size + width - 1) & !(width - 1);
        self.size = offset + width;
        self.alignment = self.alignment.max(width);
        self.entries.push((offset, key.clone()));
        self.index.insert(key, offset);
        Some(offset)
    }

    /// Add an 8-byte constant.
    pub fn add8(&mut self, value: u64) -> Option<u32> {
        self.add(&value.to_le_bytes())
    }

    /// Add a 4-byte constant.
    pub fn add4(&mut self, value: u32) -> Option<u32> {
        self.add(&value.to_le_bytes())
    }

    /// Required alignment of the pool start (at least 1).
    pub fn alignment(&self) -> u32 {
        self.alignment.max(1)
    }

    /// Total size of the filled pool in bytes.
    pub fn size(&self) -> usize {
        self.size as usize
    }

    /// Write the pool image into `dst`, which must be at least
    /// [`ConstPool::size`] bytes; alignment gaps are zero.
    pub fn fill(&self, dst: &mut [u8]) {
        dst[..self.size as usize].fill(0);
        for (offset, bytes) in &self.entries {
            let at = *offset as usize;
            dst[at..at + bytes.len()].copy_from_slice(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deduplicates_identical_constants() {
        let mut pool = ConstPool::new();
        let a = pool.add8(0x1122_3344_5566_7788).unwrap();
        let b = pool.add8(0x1122_3344_5566_7788).unwrap();
        assert_eq!(a, b);
        assert_eq!(pool.size(), 8);
        assert_eq!(pool.alignment(), 8);
    }

    #[test]
    fn offsets_are_stable_and_aligned() {
        let mut pool = ConstPool::new();
        let small = pool.add4(0xDEAD_BEEF).unwrap();
        let big = pool.add(&[0xAA; 16]).unwrap();
        assert_eq!(small, 0);
        assert_eq!(big, 16, "16-byte constant must be 16-aligned");
        assert_eq!(pool.alignment(), 16);
        assert_eq!(pool.size(), 32);

        let mut out = vec![0u8; pool.size()];
        pool.fill(&mut out);
        assert_eq!(&out[..4], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&out[4..16], &[0u8; 12]);
        assert_eq!(&out[16..32], &[0xAA; 16]);
    }

    #[test]
    fn rejects_odd_widths() {
        let mut pool = ConstPool::new();
        assert!(pool.add(&[1, 2, 3]).is_none());
    }
}
