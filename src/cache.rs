//! Buffer-cache adapter consumed by the tree algorithms.
//!
//! The tree never owns storage directly; it asks a `BufferCache` for a
//! block by offset, works on the returned slice, and tells the cache when
//! the block became dirty. A real deployment's buffer cache lives in the
//! surrounding filesystem and already does pinning/writeback arbitration;
//! `MemCache` and `MmapCache` here are the two collaborators this crate
//! provides standalone (fast in-memory test double, and a real growable
//! file-backed store for integration tests and the CLI tools).
//!
//! Grounded on `examples/chris17453-watos/crates/storage/wfs/src/v3/tree.rs`'s
//! `BlockDevice` trait split, and on this crate's own `extensible_mmap.rs`
//! growth strategy for `MmapCache`.

use std::cmp::max;
use std::fs::File;

use log::{debug, trace};
use memmap::{MmapMut, MmapOptions};

use crate::error::{IndexError, Result};

/// A block store addressed by fixed-size block offset (not byte offset).
/// `offset` throughout this crate is a block index, matching the on-disk
/// node/master header's own `offset` field.
pub trait BufferCache {
    fn block_size(&self) -> usize;

    /// Number of blocks currently backed by storage.
    fn block_count(&self) -> u32;

    /// Grows backing storage so that at least `count` blocks exist,
    /// zero-initialized. A no-op if already large enough.
    fn ensure_blocks(&mut self, count: u32) -> Result<()>;

    /// Borrows the block at `offset` for read/write. Panics-as-error if
    /// `offset >= block_count()`; callers must `ensure_blocks` first.
    fn get_block(&mut self, offset: u32) -> Result<&mut [u8]>;

    /// Marks the block dirty so `flush` will persist it. A no-op for
    /// backends (like `MmapCache`) where every write is already visible
    /// to the backing file and only needs an eventual `flush`.
    fn mark_dirty(&mut self, offset: u32) -> Result<()>;

    /// Explicit pin release. No-op for both provided backends; kept for
    /// parity with the external buffer-cache contract, where release can
    /// carry eviction-priority information a real cache needs.
    fn release(&mut self, offset: u32, dirty: bool) -> Result<()>;

    /// Commits all dirty blocks before an operation is reported complete.
    fn flush(&mut self) -> Result<()>;
}

/// In-memory block store. No file, no persistence; used by unit tests
/// that want tree behavior without I/O.
pub struct MemCache {
    block_size: usize,
    blocks: Vec<Vec<u8>>,
}

impl MemCache {
    pub fn new(block_size: usize) -> Self {
        MemCache {
            block_size,
            blocks: Vec::new(),
        }
    }
}

impl BufferCache for MemCache {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    fn ensure_blocks(&mut self, count: u32) -> Result<()> {
        while self.blocks.len() < count as usize {
            self.blocks.push(vec![0u8; self.block_size]);
        }
        Ok(())
    }

    fn get_block(&mut self, offset: u32) -> Result<&mut [u8]> {
        self.blocks
            .get_mut(offset as usize)
            .map(|b| b.as_mut_slice())
            .ok_or(IndexError::InvalidOffset(offset as u64))
    }

    fn mark_dirty(&mut self, _offset: u32) -> Result<()> {
        Ok(())
    }

    fn release(&mut self, _offset: u32, _dirty: bool) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

const ONE_GIB: u64 = 1024 * 1024 * 1024;

/// Growable memory-mapped block store backed by a real file. Growth
/// doubles up to 1 GiB, then grows by 1 GiB increments, matching this
/// crate's original mmap-growth strategy.
pub struct MmapCache {
    backing: File,
    block_size: usize,
    ram: MmapMut,
}

impl MmapCache {
    pub fn on(backing: File, block_size: usize) -> Result<Self> {
        let len = backing.metadata()?.len();
        let ram = if len == 0 {
            backing.set_len(block_size as u64)?;
            unsafe { MmapOptions::new().map_mut(&backing)? }
        } else {
            unsafe { MmapOptions::new().map_mut(&backing)? }
        };
        Ok(MmapCache {
            backing,
            block_size,
            ram,
        })
    }
}

impl BufferCache for MmapCache {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u32 {
        (self.ram.len() / self.block_size) as u32
    }

    fn ensure_blocks(&mut self, count: u32) -> Result<()> {
        let needed = count as u64 * self.block_size as u64;
        let cur = self.ram.len() as u64;
        if cur >= needed {
            return Ok(());
        }
        let new_len = max(
            needed,
            if cur > ONE_GIB {
                cur + ONE_GIB
            } else {
                max(cur * 2, self.block_size as u64)
            },
        );
        debug!("growing backing file from {} to {} bytes", cur, new_len);
        self.backing.set_len(new_len)?;
        self.ram.flush_async()?;
        let mut new_ram = unsafe { MmapOptions::new().map_mut(&self.backing)? };
        std::mem::swap(&mut self.ram, &mut new_ram);
        Ok(())
    }

    fn get_block(&mut self, offset: u32) -> Result<&mut [u8]> {
        let start = offset as usize * self.block_size;
        let end = start + self.block_size;
        if end > self.ram.len() {
            return Err(IndexError::InvalidOffset(offset as u64));
        }
        trace!("pinning block {}", offset);
        Ok(&mut self.ram[start..end])
    }

    fn mark_dirty(&mut self, _offset: u32) -> Result<()> {
        Ok(())
    }

    fn release(&mut self, _offset: u32, _dirty: bool) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.ram.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    #[test]
    fn mmap_cache_persists_across_reopen() {
        let named = tempfile::NamedTempFile::new().unwrap();
        let path = named.path().to_path_buf();
        {
            let backing = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let mut cache = MmapCache::on(backing, 64).unwrap();
            cache.ensure_blocks(3).unwrap();
            cache.get_block(2).unwrap()[0] = 0xCD;
            cache.mark_dirty(2).unwrap();
            cache.flush().unwrap();
        }
        {
            let backing = OpenOptions::new().read(true).write(true).open(&path).unwrap();
            let mut cache = MmapCache::on(backing, 64).unwrap();
            assert_eq!(3, cache.block_count());
            assert_eq!(0xCD, cache.get_block(2).unwrap()[0]);
        }
    }

    #[test]
    fn mmap_cache_ensure_blocks_grows_across_several_doublings() {
        // A tiny block size keeps the doubling growth inside a file small
        // enough for a test, while still exercising `ensure_blocks`'
        // doubling arithmetic over several growth steps.
        let named = tempfile::NamedTempFile::new().unwrap();
        let backing = OpenOptions::new()
            .read(true)
            .write(true)
            .open(named.path())
            .unwrap();
        let mut cache = MmapCache::on(backing, 16).unwrap();
        assert_eq!(1, cache.block_count());
        cache.ensure_blocks(10).unwrap();
        assert!(cache.block_count() >= 10);
        cache.ensure_blocks(100).unwrap();
        assert!(cache.block_count() >= 100);
    }

    #[test]
    fn mem_cache_grows_and_persists_within_process() {
        let mut cache = MemCache::new(64);
        cache.ensure_blocks(2).unwrap();
        assert_eq!(2, cache.block_count());
        {
            let block = cache.get_block(1).unwrap();
            block[0] = 0xAB;
        }
        assert_eq!(0xAB, cache.get_block(1).unwrap()[0]);
    }

    #[test]
    fn mem_cache_rejects_unallocated_offset() {
        let mut cache = MemCache::new(64);
        assert!(cache.get_block(0).is_err());
    }
}
