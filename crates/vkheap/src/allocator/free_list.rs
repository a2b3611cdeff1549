//! Free-range bookkeeping for memory blocks.
//!
//! All blocks of an allocator share one [FreeNodePool]. Each block owns a [FreeList] which is only a
//! `first`/`last` handle into the pool. The ranges of a list are sorted by offset and never overlap.
//! After a release they are also never adjacent, since neighbours are merged.
//!
//! Nodes that are not part of any block's list are kept on a spare list. When the spare list runs dry the pool doubles its size.

use crate::error::FreeRangeError;

#[derive(Clone, Copy, Debug, Default)]
struct FreeNode {
    offset: u64,
    size: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

impl FreeNode {
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

///Handle to a doubly linked list of free ranges inside a [FreeNodePool].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FreeList {
    first: Option<usize>,
    last: Option<usize>,
}

impl FreeList {
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

///Node storage shared by all [FreeList]s of an allocator.
pub struct FreeNodePool {
    nodes: Vec<FreeNode>,
    spare: FreeList,
}

impl FreeNodePool {
    ///Creates a pool with `capacity` spare nodes. A capacity of 0 is bumped to 1 so that doubling works.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut pool = FreeNodePool {
            nodes: Vec::new(),
            spare: FreeList::default(),
        };
        let _ = pool.grow_to(capacity.max(1));
        pool
    }

    ///Number of nodes owned by the pool, spare or in use.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    ///Number of nodes on the spare list.
    pub fn spare_count(&self) -> usize {
        self.list_len(&self.spare)
    }

    fn list_len(&self, list: &FreeList) -> usize {
        let mut count = 0;
        let mut cursor = list.first;
        while let Some(idx) = cursor {
            count += 1;
            cursor = self.nodes[idx].next;
        }
        count
    }

    ///Grows the node vector to `new_len` and returns the index of the first new node, which is the new spare head.
    fn grow_to(&mut self, new_len: usize) -> usize {
        let old_len = self.nodes.len();
        debug_assert!(new_len > old_len);
        self.nodes.resize(new_len, FreeNode::default());

        //chain the fresh nodes and prepend them to the spare list
        for idx in old_len..new_len {
            self.nodes[idx].prev = if idx == old_len { None } else { Some(idx - 1) };
            self.nodes[idx].next = if idx + 1 == new_len {
                self.spare.first
            } else {
                Some(idx + 1)
            };
        }
        match self.spare.first {
            Some(first) => self.nodes[first].prev = Some(new_len - 1),
            None => self.spare.last = Some(new_len - 1),
        }
        self.spare.first = Some(old_len);
        old_len
    }

    ///Takes a node from the spare list, doubling the pool if none is left.
    fn acquire(&mut self) -> usize {
        let idx = match self.spare.first {
            Some(idx) => idx,
            None => {
                let len = self.nodes.len();
                self.grow_to(len << 1)
            }
        };
        let mut spare = self.spare;
        self.unlink(&mut spare, idx);
        self.spare = spare;
        idx
    }

    ///Pushes `idx` to the front of the spare list. The node must not be linked into any other list.
    fn release_node(&mut self, idx: usize) {
        self.nodes[idx] = FreeNode {
            offset: 0,
            size: 0,
            prev: None,
            next: self.spare.first,
        };
        match self.spare.first {
            Some(first) => self.nodes[first].prev = Some(idx),
            None => self.spare.last = Some(idx),
        }
        self.spare.first = Some(idx);
    }

    fn unlink(&mut self, list: &mut FreeList, idx: usize) {
        let FreeNode { prev, next, .. } = self.nodes[idx];
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => list.first = next,
        }
        match next {
            Some(n) => self.nodes[n].prev = prev,
            None => list.last = prev,
        }
        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
    }

    ///Links `idx` between `prev` and `next`, which must be neighbours in `list` (or list ends).
    fn link_between(
        &mut self,
        list: &mut FreeList,
        idx: usize,
        prev: Option<usize>,
        next: Option<usize>,
    ) {
        self.nodes[idx].prev = prev;
        self.nodes[idx].next = next;
        match prev {
            Some(p) => self.nodes[p].next = Some(idx),
            None => list.first = Some(idx),
        }
        match next {
            Some(n) => self.nodes[n].prev = Some(idx),
            None => list.last = Some(idx),
        }
    }

    ///Creates a list that holds the single free range `[offset, offset+size)`, or an empty list if `size` is 0.
    pub fn list_with_range(&mut self, offset: u64, size: u64) -> FreeList {
        let mut list = FreeList::default();
        if size > 0 {
            let idx = self.acquire();
            self.nodes[idx].offset = offset;
            self.nodes[idx].size = size;
            self.link_between(&mut list, idx, None, None);
        }
        list
    }

    ///First-fit search for `size` bytes aligned to `alignment`. Returns the aligned offset of the carved range.
    ///
    /// Alignment padding in front of the range stays free, as does any leftover behind it.
    pub fn carve(&mut self, list: &mut FreeList, size: u64, alignment: u64) -> Option<u64> {
        let alignment = alignment.max(1);
        let mut cursor = list.first;

        while let Some(idx) = cursor {
            let node = self.nodes[idx];
            cursor = node.next;

            let Some(aligned) = node.offset.checked_next_multiple_of(alignment) else {
                continue;
            };
            let padding = aligned - node.offset;
            let Some(needed) = padding.checked_add(size) else {
                continue;
            };
            if node.size < needed {
                continue;
            }
            let leftover = node.size - needed;

            match (padding > 0, leftover > 0) {
                (true, true) => {
                    let tail = self.acquire();
                    self.nodes[tail].offset = aligned + size;
                    self.nodes[tail].size = leftover;
                    self.nodes[idx].size = padding;
                    self.link_between(list, tail, Some(idx), node.next);
                }
                (true, false) => {
                    self.nodes[idx].size = padding;
                }
                (false, true) => {
                    self.nodes[idx].offset += size;
                    self.nodes[idx].size = leftover;
                }
                (false, false) => {
                    self.unlink(list, idx);
                    self.release_node(idx);
                }
            }

            return Some(aligned);
        }

        None
    }

    ///Returns `[offset, offset+size)` to `list`, merging it with adjacent free ranges.
    pub fn release_range(
        &mut self,
        list: &mut FreeList,
        offset: u64,
        size: u64,
    ) -> Result<(), FreeRangeError> {
        if size == 0 {
            return Ok(());
        }
        let end = offset
            .checked_add(size)
            .ok_or(FreeRangeError::Overflow { offset, size })?;

        //find the free ranges right before and after the released one
        let mut prev = None;
        let mut next = list.first;
        while let Some(idx) = next {
            if self.nodes[idx].offset >= offset {
                break;
            }
            prev = Some(idx);
            next = self.nodes[idx].next;
        }

        let overlaps_prev = prev.is_some_and(|p| self.nodes[p].end() > offset);
        let overlaps_next = next.is_some_and(|n| self.nodes[n].offset < end);
        if overlaps_prev || overlaps_next {
            return Err(FreeRangeError::Overlap { offset, size });
        }

        let prev_adjacent = prev.filter(|p| self.nodes[*p].end() == offset);
        let next_adjacent = next.filter(|n| self.nodes[*n].offset == end);

        match (prev_adjacent, next_adjacent) {
            (Some(p), Some(n)) => {
                self.nodes[p].size += size + self.nodes[n].size;
                self.unlink(list, n);
                self.release_node(n);
            }
            (Some(p), None) => {
                self.nodes[p].size += size;
            }
            (None, Some(n)) => {
                self.nodes[n].offset = offset;
                self.nodes[n].size += size;
            }
            (None, None) => {
                let idx = self.acquire();
                self.nodes[idx].offset = offset;
                self.nodes[idx].size = size;
                self.link_between(list, idx, prev, next);
            }
        }

        Ok(())
    }

    ///Moves every node of `list` back to the spare list and leaves `list` empty.
    pub fn release_list(&mut self, list: &mut FreeList) {
        let mut cursor = list.first;
        while let Some(idx) = cursor {
            cursor = self.nodes[idx].next;
            self.release_node(idx);
        }
        *list = FreeList::default();
    }

    ///Iterates the `(offset, size)` pairs of `list` in offset order.
    pub fn ranges<'a>(&'a self, list: &FreeList) -> impl Iterator<Item = (u64, u64)> + 'a {
        let mut cursor = list.first;
        std::iter::from_fn(move || {
            let idx = cursor?;
            let node = &self.nodes[idx];
            cursor = node.next;
            Some((node.offset, node.size))
        })
    }

    pub fn free_bytes(&self, list: &FreeList) -> u64 {
        self.ranges(list).map(|(_, size)| size).sum()
    }

    pub fn largest_range(&self, list: &FreeList) -> u64 {
        self.ranges(list).map(|(_, size)| size).max().unwrap_or(0)
    }

    ///True if `list` consists of exactly one range that spans `[0, size)`.
    pub fn covers_whole(&self, list: &FreeList, size: u64) -> bool {
        match (list.first, list.last) {
            (Some(first), Some(last)) if first == last => {
                self.nodes[first].offset == 0 && self.nodes[first].size == size
            }
            _ => false,
        }
    }
}
