//! In-place node view over a raw block buffer: header fields plus parallel
//! key/item arrays, aliased directly into the buffer with no copying.
//!
//! Generalizes the single-typed-view discipline of this crate's earlier
//! BK-tree node encodings (fixed/variable entry width, `byteorder`-backed
//! field reads) to the B+tree's fixed-width parallel arrays.

use byteorder::{ByteOrder, NativeEndian};
use std::marker::PhantomData;

use crate::error::{IndexError, Result};
use crate::key::Key;
use crate::layout::*;

/// A decoded view over one node-sized block buffer. Borrows the buffer;
/// never outlives the cache pin that owns it.
pub struct NodeView<'a, K: Key> {
    buf: &'a mut [u8],
    fanout: usize,
    _key: PhantomData<K>,
}

impl<'a, K: Key> NodeView<'a, K> {
    /// Interprets `buf` as a node block, validating header invariants
    /// against `self_offset` (the block's own logical offset) and
    /// `fanout`. Does not touch key/item bytes.
    pub fn decode(buf: &'a mut [u8], self_offset: u32, fanout: usize) -> Result<Self> {
        let view = NodeView {
            buf,
            fanout,
            _key: PhantomData,
        };
        let num = view.num();
        if num > fanout {
            return Err(IndexError::CorruptNode {
                offset: self_offset as u64,
                reason: format!("num {} exceeds fanout {}", num, fanout),
            });
        }
        let flag = view.raw_flag();
        if flag != NODE_FLAG_INTERNAL && flag != NODE_FLAG_LEAF {
            return Err(IndexError::CorruptNode {
                offset: self_offset as u64,
                reason: format!("unrecognized flag {}", flag),
            });
        }
        if view.self_offset() != self_offset {
            return Err(IndexError::CorruptNode {
                offset: self_offset as u64,
                reason: format!(
                    "header self-offset {} does not match block offset {}",
                    view.self_offset(),
                    self_offset
                ),
            });
        }
        Ok(view)
    }

    /// Initializes a fresh, zeroed block as an empty node of the given
    /// kind at `self_offset`. Used by the allocator when it hands back a
    /// newly reserved block.
    pub fn init(buf: &'a mut [u8], self_offset: u32, fanout: usize, leaf: bool) -> Self {
        for b in buf.iter_mut() {
            *b = 0;
        }
        let mut view = NodeView {
            buf,
            fanout,
            _key: PhantomData,
        };
        view.set_flag(leaf);
        view.set_num(0);
        view.set_self_offset(self_offset);
        view.set_status(NODE_STATUS_USED);
        view
    }

    fn field_u32(&self, offset: usize) -> u32 {
        NativeEndian::read_u32(&self.buf[offset..offset + 4])
    }

    fn set_field_u32(&mut self, offset: usize, val: u32) {
        NativeEndian::write_u32(&mut self.buf[offset..offset + 4], val);
    }

    pub fn is_root(&self) -> bool {
        self.field_u32(NODE_ROOT_OFFSET) != 0
    }

    pub fn set_root(&mut self, root: bool) {
        self.set_field_u32(NODE_ROOT_OFFSET, if root { 1 } else { 0 });
    }

    fn raw_flag(&self) -> u32 {
        self.field_u32(NODE_FLAG_OFFSET)
    }

    pub fn is_leaf(&self) -> bool {
        self.raw_flag() == NODE_FLAG_LEAF
    }

    fn set_flag(&mut self, leaf: bool) {
        self.set_field_u32(
            NODE_FLAG_OFFSET,
            if leaf { NODE_FLAG_LEAF } else { NODE_FLAG_INTERNAL },
        );
    }

    pub fn num(&self) -> usize {
        self.field_u32(NODE_NUM_OFFSET) as usize
    }

    pub fn set_num(&mut self, num: usize) {
        self.set_field_u32(NODE_NUM_OFFSET, num as u32);
    }

    pub fn self_offset(&self) -> u32 {
        self.field_u32(NODE_SELF_OFFSET_OFFSET)
    }

    fn set_self_offset(&mut self, offset: u32) {
        self.set_field_u32(NODE_SELF_OFFSET_OFFSET, offset);
    }

    pub fn next_node(&self) -> u32 {
        self.field_u32(NODE_NEXT_OFFSET)
    }

    pub fn set_next_node(&mut self, offset: u32) {
        self.set_field_u32(NODE_NEXT_OFFSET, offset);
    }

    pub fn prev_node(&self) -> u32 {
        self.field_u32(NODE_PREV_OFFSET)
    }

    pub fn set_prev_node(&mut self, offset: u32) {
        self.set_field_u32(NODE_PREV_OFFSET, offset);
    }

    pub fn status(&self) -> u32 {
        self.field_u32(NODE_STATUS_OFFSET)
    }

    pub fn set_status(&mut self, status: u32) {
        self.set_field_u32(NODE_STATUS_OFFSET, status);
    }

    fn key_array_start(&self) -> usize {
        NODE_HEADER_SIZE
    }

    fn item_array_start(&self) -> usize {
        NODE_HEADER_SIZE + self.fanout * K::WIDTH
    }

    pub fn key(&self, i: usize) -> K {
        let start = self.key_array_start() + i * K::WIDTH;
        K::read_from(&self.buf[start..start + K::WIDTH])
    }

    pub fn set_key(&mut self, i: usize, key: K) {
        let start = self.key_array_start() + i * K::WIDTH;
        key.write_to(&mut self.buf[start..start + K::WIDTH]);
    }

    pub fn item(&self, i: usize) -> u32 {
        let start = self.item_array_start() + i * 4;
        NativeEndian::read_u32(&self.buf[start..start + 4])
    }

    pub fn set_item(&mut self, i: usize, item: u32) {
        let start = self.item_array_start() + i * 4;
        NativeEndian::write_u32(&mut self.buf[start..start + 4], item);
    }

    /// Binary search for `key`. `Ok(i)` means `key(i) == key`; `Err(i)`
    /// means `key` belongs at index `i` (the first index whose key is
    /// greater, or `num()` if `key` is greater than everything present).
    pub fn find(&self, key: K) -> std::result::Result<usize, usize> {
        let mut lo = 0usize;
        let mut hi = self.num();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key(mid).cmp(&key) {
                std::cmp::Ordering::Equal => return Ok(mid),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Err(lo)
    }

    /// Descent index for an internal node: the first `i` in `[0, num-1)`
    /// whose key is strictly greater than `key`, or `num - 1` (the
    /// catch-all last child) if no such separator exists. Slot `num - 1`
    /// itself holds a dead key never read by this search; only the
    /// first `num - 1` slots are real ascending separators.
    pub fn internal_child_index(&self, key: K) -> usize {
        let n = self.num();
        if n <= 1 {
            return 0;
        }
        let mut lo = 0usize;
        let mut hi = n - 1;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.key(mid) > key {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    /// Inserts a key/item pair at `at`, shifting later entries right.
    /// Caller must ensure `num() < fanout` before calling.
    pub fn insert_at(&mut self, at: usize, key: K, item: u32) {
        let n = self.num();
        for i in (at..n).rev() {
            let k = self.key(i);
            let v = self.item(i);
            self.set_key(i + 1, k);
            self.set_item(i + 1, v);
        }
        self.set_key(at, key);
        self.set_item(at, item);
        self.set_num(n + 1);
    }

    /// Removes the entry at `at`, shifting later entries left.
    pub fn remove_at(&mut self, at: usize) {
        let n = self.num();
        for i in at..n - 1 {
            let k = self.key(i + 1);
            let v = self.item(i + 1);
            self.set_key(i, k);
            self.set_item(i, v);
        }
        self.set_num(n - 1);
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::IntegerKey;

    fn fresh_buf() -> Vec<u8> {
        vec![0u8; DEFAULT_CLUSTER_SIZE]
    }

    #[test]
    fn init_then_insert_and_find() {
        let fanout = fanout_for(DEFAULT_CLUSTER_SIZE, IntegerKey::WIDTH);
        let mut buf = fresh_buf();
        let mut view: NodeView<IntegerKey> = NodeView::init(&mut buf, 4096, fanout, true);
        assert!(view.is_leaf());
        assert_eq!(0, view.num());

        view.insert_at(0, IntegerKey(10), 100);
        view.insert_at(1, IntegerKey(20), 200);
        view.insert_at(1, IntegerKey(15), 150);

        assert_eq!(3, view.num());
        assert_eq!(IntegerKey(10), view.key(0));
        assert_eq!(IntegerKey(15), view.key(1));
        assert_eq!(IntegerKey(20), view.key(2));
        assert_eq!(150, view.item(1));

        assert_eq!(Ok(1), view.find(IntegerKey(15)));
        assert_eq!(Err(3), view.find(IntegerKey(25)));
        assert_eq!(Err(0), view.find(IntegerKey(1)));
    }

    #[test]
    fn remove_compacts() {
        let fanout = fanout_for(DEFAULT_CLUSTER_SIZE, IntegerKey::WIDTH);
        let mut buf = fresh_buf();
        let mut view: NodeView<IntegerKey> = NodeView::init(&mut buf, 0, fanout, true);
        view.insert_at(0, IntegerKey(1), 1);
        view.insert_at(1, IntegerKey(2), 2);
        view.insert_at(2, IntegerKey(3), 3);
        view.remove_at(1);
        assert_eq!(2, view.num());
        assert_eq!(IntegerKey(1), view.key(0));
        assert_eq!(IntegerKey(3), view.key(1));
    }

    #[test]
    fn decode_rejects_offset_mismatch() {
        let fanout = fanout_for(DEFAULT_CLUSTER_SIZE, IntegerKey::WIDTH);
        let mut buf = fresh_buf();
        {
            let _view: NodeView<IntegerKey> = NodeView::init(&mut buf, 4096, fanout, true);
        }
        let result = NodeView::<IntegerKey>::decode(&mut buf, 8192, fanout);
        assert!(result.is_err());
    }
}
