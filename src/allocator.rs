//! Two-level bitmap allocator for node blocks.
//!
//! The backing file is a repeating sequence of one master block followed
//! by the node blocks it governs: `master, node, node, ..., master, node,
//! node, ...`. Each master's bitmap covers exactly the node blocks that
//! immediately follow it, so a node's governing master is found by
//! integer division alone, with no separate index structure.
//!
//! Grounded on `examples/original_source/include/nvfuse_bp_tree.h`'s
//! `bp_alloc_bitmap` / `bp_dealloc_bitmap` / `bp_scan_bitmap` /
//! `bp_set_bitmap` / `bp_clear_bitmap` / `bp_test_bitmap`, and on this
//! crate's own `extensible_mmap.rs` for growing the backing file when a
//! new master group is needed.

use byteorder::{ByteOrder, NativeEndian};
use log::{debug, trace};

use crate::cache::BufferCache;
use crate::error::{IndexError, Result};
use crate::layout::*;

/// View over one master block: header fields plus the trailing bitmap.
pub struct MasterView<'a> {
    buf: &'a mut [u8],
}

impl<'a> MasterView<'a> {
    pub fn decode(buf: &'a mut [u8]) -> Self {
        MasterView { buf }
    }

    pub fn init(buf: &'a mut [u8], cluster_size: usize, fanout: u32) -> Self {
        for b in buf.iter_mut() {
            *b = 0;
        }
        let mut view = MasterView { buf };
        view.set_node_size(cluster_size as u32);
        view.set_fanout(fanout);
        // `max_nodes` starts zeroed like `bits_in_use`/`alloc_count`; it's
        // a running total (sum of popcounts across every master),
        // authoritative only in master #0 and kept live by
        // `BitmapAllocator::sync_max_nodes`, the same convention `m_root`
        // uses.
        view
    }

    fn field(&self, offset: usize) -> u32 {
        NativeEndian::read_u32(&self.buf[offset..offset + 4])
    }

    fn set_field(&mut self, offset: usize, val: u32) {
        NativeEndian::write_u32(&mut self.buf[offset..offset + 4], val);
    }

    pub fn root(&self) -> u32 {
        self.field(MASTER_ROOT_OFFSET)
    }
    pub fn set_root(&mut self, val: u32) {
        self.set_field(MASTER_ROOT_OFFSET, val)
    }

    pub fn bitmap_free_hint(&self) -> u32 {
        self.field(MASTER_BITMAP_FREE_OFFSET)
    }
    pub fn set_bitmap_free_hint(&mut self, val: u32) {
        self.set_field(MASTER_BITMAP_FREE_OFFSET, val)
    }

    pub fn bits_in_use(&self) -> u32 {
        self.field(MASTER_BITS_IN_USE_OFFSET)
    }
    pub fn set_bits_in_use(&mut self, val: u32) {
        self.set_field(MASTER_BITS_IN_USE_OFFSET, val)
    }

    pub fn max_nodes(&self) -> u32 {
        self.field(MASTER_MAX_NODES_OFFSET)
    }
    pub fn set_max_nodes(&mut self, val: u32) {
        self.set_field(MASTER_MAX_NODES_OFFSET, val)
    }

    pub fn alloc_count(&self) -> u32 {
        self.field(MASTER_ALLOC_COUNT_OFFSET)
    }
    pub fn set_alloc_count(&mut self, val: u32) {
        self.set_field(MASTER_ALLOC_COUNT_OFFSET, val)
    }

    pub fn dealloc_count(&self) -> u32 {
        self.field(MASTER_DEALLOC_COUNT_OFFSET)
    }
    pub fn set_dealloc_count(&mut self, val: u32) {
        self.set_field(MASTER_DEALLOC_COUNT_OFFSET, val)
    }

    pub fn node_size(&self) -> u32 {
        self.field(MASTER_NODE_SIZE_OFFSET)
    }
    pub fn set_node_size(&mut self, val: u32) {
        self.set_field(MASTER_NODE_SIZE_OFFSET, val)
    }

    pub fn fanout(&self) -> u32 {
        self.field(MASTER_FANOUT_OFFSET)
    }
    pub fn set_fanout(&mut self, val: u32) {
        self.set_field(MASTER_FANOUT_OFFSET, val)
    }

    pub fn last_allocated_sub_master(&self) -> u32 {
        self.field(MASTER_LAST_SUB_MASTER_OFFSET)
    }
    pub fn set_last_allocated_sub_master(&mut self, val: u32) {
        self.set_field(MASTER_LAST_SUB_MASTER_OFFSET, val)
    }

    pub fn last_allocated_sub_offset(&self) -> u32 {
        self.field(MASTER_LAST_SUB_OFFSET_OFFSET)
    }
    pub fn set_last_allocated_sub_offset(&mut self, val: u32) {
        self.set_field(MASTER_LAST_SUB_OFFSET_OFFSET, val)
    }

    fn bitmap(&self) -> &[u8] {
        &self.buf[MASTER_HEADER_SIZE..]
    }

    pub fn test_bit(&self, bit: usize) -> bool {
        let byte = self.bitmap()[bit / 8];
        (byte & (1 << (bit % 8))) != 0
    }

    pub fn set_bit(&mut self, bit: usize) {
        let start = MASTER_HEADER_SIZE;
        self.buf[start + bit / 8] |= 1 << (bit % 8);
    }

    pub fn clear_bit(&mut self, bit: usize) {
        let start = MASTER_HEADER_SIZE;
        self.buf[start + bit / 8] &= !(1 << (bit % 8));
    }

    /// First zero bit at or after `hint`, wrapping once. `None` if the
    /// whole bitmap is set.
    pub fn scan_free_bit(&self, hint: usize) -> Option<usize> {
        let bits = self.bitmap().len() * 8;
        if bits == 0 {
            return None;
        }
        let hint = hint % bits;
        for i in 0..bits {
            let bit = (hint + i) % bits;
            if !self.test_bit(bit) {
                return Some(bit);
            }
        }
        None
    }

    /// Popcount of the bitmap, independent of the `bits_in_use` counter
    /// (used by invariant checks to catch counter drift).
    pub fn count_set_bits(&self) -> u32 {
        self.bitmap().iter().map(|b| b.count_ones()).sum()
    }
}

/// Stateless bitmap allocator: all mutable state lives in the master
/// blocks themselves, reached through the cache.
#[derive(Debug, Clone, Copy)]
pub struct BitmapAllocator {
    cluster_size: usize,
    fanout: u32,
}

impl BitmapAllocator {
    pub fn new(cluster_size: usize, fanout: u32) -> Self {
        BitmapAllocator { cluster_size, fanout }
    }

    fn group_size(&self) -> u32 {
        1 + nodes_per_master(self.cluster_size) as u32
    }

    /// The master block governing `block`, which may be `block` itself.
    pub fn master_block_for(&self, block: u32) -> u32 {
        (block / self.group_size()) * self.group_size()
    }

    fn bit_for(&self, node_offset: u32) -> usize {
        (node_offset - self.master_block_for(node_offset) - 1) as usize
    }

    /// Reads the tree root offset from master #0.
    pub fn read_root<C: BufferCache>(&self, cache: &mut C) -> Result<u32> {
        if cache.block_count() == 0 {
            return Ok(0);
        }
        let buf = cache.get_block(0)?;
        Ok(MasterView::decode(buf).root())
    }

    pub fn write_root<C: BufferCache>(&self, cache: &mut C, root: u32) -> Result<()> {
        let buf = cache.get_block(0)?;
        MasterView::decode(buf).set_root(root);
        cache.mark_dirty(0)
    }

    /// Initializes master #0 and reserves the tree's first leaf.
    pub fn init_tree<C: BufferCache>(&self, cache: &mut C) -> Result<u32> {
        cache.ensure_blocks(1)?;
        {
            let buf = cache.get_block(0)?;
            MasterView::init(buf, self.cluster_size, self.fanout);
        }
        cache.mark_dirty(0)?;
        let root = self.alloc(cache)?;
        self.write_root(cache, root)?;
        Ok(root)
    }

    /// Finds a free node block, marks it used, and returns its offset.
    /// The returned block's content is unspecified; callers must
    /// `NodeView::init` it.
    pub fn alloc<C: BufferCache>(&self, cache: &mut C) -> Result<u32> {
        let group = self.group_size();
        let mut master_block = 0u32;
        loop {
            if master_block >= cache.block_count() {
                cache
                    .ensure_blocks(master_block + 1)
                    .map_err(|_| IndexError::OutOfSpace)?;
                {
                    let buf = cache.get_block(master_block)?;
                    MasterView::init(buf, self.cluster_size, self.fanout);
                }
                cache.mark_dirty(master_block)?;
                debug!("allocated new master block at {}", master_block);
            }

            let hint = {
                let buf = cache.get_block(master_block)?;
                MasterView::decode(buf).bitmap_free_hint() as usize
            };
            let found = {
                let buf = cache.get_block(master_block)?;
                MasterView::decode(buf).scan_free_bit(hint)
            };

            if let Some(bit) = found {
                let node_offset = master_block + 1 + bit as u32;
                cache
                    .ensure_blocks(node_offset + 1)
                    .map_err(|_| IndexError::OutOfSpace)?;
                {
                    let buf = cache.get_block(master_block)?;
                    let mut mv = MasterView::decode(buf);
                    mv.set_bit(bit);
                    mv.set_bits_in_use(mv.bits_in_use() + 1);
                    mv.set_alloc_count(mv.alloc_count() + 1);
                    mv.set_bitmap_free_hint((bit as u32 + 1) % (group - 1).max(1));
                    mv.set_last_allocated_sub_master(master_block);
                    mv.set_last_allocated_sub_offset(bit as u32);
                }
                cache.mark_dirty(master_block)?;
                self.sync_max_nodes(cache)?;
                trace!(
                    "alloc: node {} (master {}, bit {})",
                    node_offset,
                    master_block,
                    bit
                );
                return Ok(node_offset);
            }

            master_block += group;
        }
    }

    pub fn free<C: BufferCache>(&self, cache: &mut C, node_offset: u32) -> Result<()> {
        let master_block = self.master_block_for(node_offset);
        if node_offset == master_block || master_block >= cache.block_count() {
            return Err(IndexError::InvalidOffset(node_offset as u64));
        }
        let bit = self.bit_for(node_offset);
        {
            let buf = cache.get_block(master_block)?;
            let mut mv = MasterView::decode(buf);
            if bit * 8 >= mv.bitmap().len() * 8 || !mv.test_bit(bit) {
                return Err(IndexError::InvalidOffset(node_offset as u64));
            }
            mv.clear_bit(bit);
            mv.set_bits_in_use(mv.bits_in_use().saturating_sub(1));
            mv.set_dealloc_count(mv.dealloc_count() + 1);
        }
        cache.mark_dirty(master_block)?;
        self.sync_max_nodes(cache)?;
        trace!("free: node {} (master {}, bit {})", node_offset, master_block, bit);
        Ok(())
    }

    pub fn test<C: BufferCache>(&self, cache: &mut C, node_offset: u32) -> Result<bool> {
        let master_block = self.master_block_for(node_offset);
        if node_offset == master_block || master_block >= cache.block_count() {
            return Err(IndexError::InvalidOffset(node_offset as u64));
        }
        let bit = self.bit_for(node_offset);
        let buf = cache.get_block(master_block)?;
        Ok(MasterView::decode(buf).test_bit(bit))
    }

    /// Total set bits across every master currently in the file. Used by
    /// invariant checks, not by the hot alloc/free path.
    pub fn count_allocated<C: BufferCache>(&self, cache: &mut C) -> Result<u32> {
        let group = self.group_size();
        let mut total = 0u32;
        let mut master_block = 0u32;
        while master_block < cache.block_count() {
            let buf = cache.get_block(master_block)?;
            total += MasterView::decode(buf).count_set_bits();
            master_block += group;
        }
        Ok(total)
    }

    /// Recomputes the global allocated-node total and writes it into
    /// master #0's `max_nodes` field. Called after every bit flip so the
    /// stored value never drifts from the bitmaps it summarizes.
    fn sync_max_nodes<C: BufferCache>(&self, cache: &mut C) -> Result<()> {
        let total = self.count_allocated(cache)?;
        let buf = cache.get_block(0)?;
        MasterView::decode(buf).set_max_nodes(total);
        cache.mark_dirty(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemCache;

    #[test]
    fn alloc_free_round_trip() {
        let alloc = BitmapAllocator::new(DEFAULT_CLUSTER_SIZE, 337);
        let mut cache = MemCache::new(DEFAULT_CLUSTER_SIZE);
        let root = alloc.init_tree(&mut cache).unwrap();
        assert_eq!(1, root);
        assert!(alloc.test(&mut cache, root).unwrap());

        let second = alloc.alloc(&mut cache).unwrap();
        assert_eq!(2, second);
        assert_eq!(2, alloc.count_allocated(&mut cache).unwrap());

        alloc.free(&mut cache, second).unwrap();
        assert!(!alloc.test(&mut cache, second).unwrap());
        assert_eq!(1, alloc.count_allocated(&mut cache).unwrap());
    }

    #[test]
    fn max_nodes_tracks_live_allocation_total() {
        let alloc = BitmapAllocator::new(DEFAULT_CLUSTER_SIZE, 337);
        let mut cache = MemCache::new(DEFAULT_CLUSTER_SIZE);
        alloc.init_tree(&mut cache).unwrap();

        let read_max_nodes = |cache: &mut MemCache| {
            let buf = cache.get_block(0).unwrap();
            MasterView::decode(buf).max_nodes()
        };

        assert_eq!(1, read_max_nodes(&mut cache));
        assert_eq!(1, alloc.count_allocated(&mut cache).unwrap());

        let second = alloc.alloc(&mut cache).unwrap();
        assert_eq!(2, read_max_nodes(&mut cache));

        alloc.free(&mut cache, second).unwrap();
        assert_eq!(1, read_max_nodes(&mut cache));
        assert_eq!(alloc.count_allocated(&mut cache).unwrap(), read_max_nodes(&mut cache));
    }

    #[test]
    fn free_rejects_master_block() {
        let alloc = BitmapAllocator::new(DEFAULT_CLUSTER_SIZE, 337);
        let mut cache = MemCache::new(DEFAULT_CLUSTER_SIZE);
        alloc.init_tree(&mut cache).unwrap();
        assert!(alloc.free(&mut cache, 0).is_err());
    }

    #[test]
    fn alloc_rolls_over_to_new_master_group() {
        // A tiny cluster size keeps one master's bitmap small enough to
        // fill in a handful of iterations.
        let cluster_size = 48;
        let alloc = BitmapAllocator::new(cluster_size, 3);
        let mut cache = MemCache::new(cluster_size);
        alloc.init_tree(&mut cache).unwrap();
        let nodes_per_group = nodes_per_master(cluster_size);
        // init_tree already took one; fill the rest of the first group.
        for _ in 0..nodes_per_group - 1 {
            alloc.alloc(&mut cache).unwrap();
        }
        let spill = alloc.alloc(&mut cache).unwrap();
        let group_size = alloc.group_size();
        assert_eq!(group_size + 1, spill);
    }
}
