//! Bump arena used for node payloads that have no natural owner: duplicated
//! inline comments, embedded data blobs, constant pool images, virtual
//! register names.
//!
//! The arena allocates from chunks that grow geometrically and never frees
//! an individual allocation; everything lives until [`Zone::reset`]. Instead
//! of handing out raw pointers, allocations are identified by a small index
//! triple ([`ZoneRef`]), the same discipline the rest of the library uses
//! for nodes and labels: cross-references are indices, never self-referential
//! pointers.
//!
//! Allocation failure is modeled by an optional byte budget. A zone with no
//! budget never fails (the global allocator aborts on true OOM); a zone with
//! a budget returns `None` once the budget is exhausted, which the write-API
//! layer reports as [`crate::Error::NoHeapMemory`]. Tests use a small budget
//! to drive the error path deterministically.

use log::trace;

/// Default chunk size for data zones.
pub const DATA_ZONE_CHUNK: usize = 8 * 1024;

/// Upper bound on the geometric chunk growth.
const MAX_CHUNK: usize = 256 * 1024;

/// Handle to a byte range allocated from a [`Zone`].
///
/// Valid until the owning zone is reset. A `ZoneRef` from one zone must not
/// be resolved against another; debug builds catch out-of-range lookups.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ZoneRef {
    chunk: u32,
    offset: u32,
    len: u32,
}

impl ZoneRef {
    /// Length of the referenced byte range.
    pub fn len(self) -> usize {
        self.len as usize
    }

    /// Whether the referenced range is empty.
    pub fn is_empty(self) -> bool {
        self.len == 0
    }
}

/// Handle to a UTF-8 string duplicated into a [`Zone`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ZoneStr(ZoneRef);

/// Chunked bump allocator with geometric growth and O(chunks) reset.
pub struct Zone {
    chunks: Vec<Vec<u8>>,
    /// Capacity of the next chunk to allocate.
    next_chunk: usize,
    /// Total bytes handed out, compared against `limit`.
    allocated: usize,
    limit: Option<usize>,
}

impl Zone {
    /// Create a zone whose first chunk will have `chunk_size` capacity.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunks: Vec::new(),
            next_chunk: chunk_size.max(64),
            allocated: 0,
            limit: None,
        }
    }

    /// Create a zone that fails allocations once `limit` bytes were handed
    /// out. Used to exercise the out-of-memory error path.
    pub fn with_limit(chunk_size: usize, limit: usize) -> Self {
        let mut zone = Self::new(chunk_size);
        zone.limit = Some(limit);
        zone
    }

    /// Total bytes handed out since creation or the last reset.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Change the byte budget; `None` removes it. Existing allocations are
    /// unaffected.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    /// Allocate `len` zeroed bytes, the start aligned to `align` within its
    /// chunk. Returns `None` when the byte budget is exhausted.
    pub fn alloc(&mut self, len: usize, align: usize) -> Option<ZoneRef> {
        debug_assert!(align.is_power_of_two());
        if let Some(limit) = self.limit {
            if self.allocated + len > limit {
                trace!("Zone: allocation of {} bytes exceeds budget", len);
                return None;
            }
        }

        let need_new = match self.chunks.last() {
            Some(chunk) => {
                let offset = align_up(chunk.len(), align);
                offset + len > chunk.capacity()
            }
            None => true,
        };
        if need_new {
            let cap = self.next_chunk.max(len + align);
            self.chunks.push(Vec::with_capacity(cap));
            self.next_chunk = (self.next_chunk * 2).min(MAX_CHUNK);
            trace!("Zone: new chunk of {} bytes", cap);
        }

        let chunk_index = self.chunks.len() - 1;
        let chunk = &mut self.chunks[chunk_index];
        let offset = align_up(chunk.len(), align);
        chunk.resize(offset + len, 0);
        self.allocated += len;

        Some(ZoneRef {
            chunk: chunk_index as u32,
            offset: offset as u32,
            len: len as u32,
        })
    }

    /// Duplicate `data` into the zone.
    pub fn dup(&mut self, data: &[u8]) -> Option<ZoneRef> {
        let r = self.alloc(data.len(), 1)?;
        self.get_mut(r).copy_from_slice(data);
        Some(r)
    }

    /// Duplicate a string into the zone. Empty strings are stored as a
    /// zero-length reference without touching any chunk.
    pub fn dup_str(&mut self, s: &str) -> Option<ZoneStr> {
        self.dup(s.as_bytes()).map(ZoneStr)
    }

    /// Resolve a reference to its bytes.
    pub fn get(&self, r: ZoneRef) -> &[u8] {
        let chunk = &self.chunks[r.chunk as usize];
        &chunk[r.offset as usize..r.offset as usize + r.len as usize]
    }

    /// Resolve a reference to its bytes, mutably.
    pub fn get_mut(&mut self, r: ZoneRef) -> &mut [u8] {
        let chunk = &mut self.chunks[r.chunk as usize];
        &mut chunk[r.offset as usize..r.offset as usize + r.len as usize]
    }

    /// Resolve a duplicated string.
    pub fn get_str(&self, s: ZoneStr) -> &str {
        core::str::from_utf8(self.get(s.0)).unwrap_or_default()
    }

    /// Invalidate all allocations. Keeps the first chunk for reuse unless
    /// `release_memory` is set, in which case all chunks are returned to the
    /// system.
    pub fn reset(&mut self, release_memory: bool) {
        if release_memory {
            self.chunks.clear();
        } else {
            self.chunks.truncate(1);
            if let Some(chunk) = self.chunks.first_mut() {
                chunk.clear();
            }
        }
        self.allocated = 0;
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_read_back() {
        let mut zone = Zone::new(128);
        let a = zone.dup(b"hello").unwrap();
        let b = zone.dup(b"world").unwrap();
        assert_eq!(zone.get(a), b"hello");
        assert_eq!(zone.get(b), b"world");
        assert_eq!(zone.allocated(), 10);
    }

    #[test]
    fn allocations_survive_chunk_growth() {
        let mut zone = Zone::new(64);
        let mut refs = Vec::new();
        for i in 0..64u8 {
            refs.push((i, zone.dup(&[i; 16]).unwrap()));
        }
        for (i, r) in refs {
            assert_eq!(zone.get(r), &[i; 16]);
        }
    }

    #[test]
    fn alignment_is_respected() {
        let mut zone = Zone::new(256);
        zone.alloc(3, 1).unwrap();
        let r = zone.alloc(8, 8).unwrap();
        assert_eq!(r.offset % 8, 0);
    }

    #[test]
    fn budget_exhaustion_returns_none() {
        let mut zone = Zone::with_limit(64, 8);
        assert!(zone.alloc(8, 1).is_some());
        assert!(zone.alloc(1, 1).is_none());
        zone.reset(false);
        assert!(zone.alloc(8, 1).is_some());
    }

    #[test]
    fn reset_reuses_first_chunk() {
        let mut zone = Zone::new(64);
        zone.dup(b"abc").unwrap();
        zone.reset(false);
        assert_eq!(zone.allocated(), 0);
        let r = zone.dup(b"xyz").unwrap();
        assert_eq!(zone.get(r), b"xyz");
        assert_eq!(r.chunk, 0);
        assert_eq!(r.offset, 0);
    }

    #[test]
    fn strings_round_trip() {
        let mut zone = Zone::new(64);
        let s = zone.dup_str("inline comment").unwrap();
        assert_eq!(zone.get_str(s), "inline comment");
        let empty = zone.dup_str("").unwrap();
        assert_eq!(zone.get_str(empty), "");
    }
}
