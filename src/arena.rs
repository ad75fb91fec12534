//! A single mapped region carved into blocks.
//!
//! ```text
//!   Arena (one mmap)
//!   ┌────────┬──────────┬────────┬──────────────────┬────────┬─────────────┐
//!   │ header │ used     │ header │ free             │ header │ used        │
//!   └────────┴──────────┴────────┴──────────────────┴────────┴─────────────┘
//!   ▲ offset 0           ▲ prev = 0                  ▲ prev = previous header
//! ```
//!
//! The successor of a block is found by offset arithmetic and the
//! predecessor through the stored `prev` offset, so both merges on free are
//! O(1). All chain and free-list mutation happens under the arena mutex;
//! `free_size` and `weight` are mirrored in atomics so the arena set can
//! rank arenas without taking their locks.
//!
//! Nothing in here allocates through the global allocator: the control
//! block lives in a mapping of its own ([`ArenaBox`]) and snapshots are
//! filled into vectors sized beforehand. That keeps a [`crate::Pool`]
//! usable as the process allocator.

use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::block::{BLOCK_MAGIC, BlockHeader, HEADER_SIZE, NIL, Region};
use crate::error::PoolError;
use crate::freelist::FreeLists;
use crate::os;
use crate::stats::{ArenaSnapshot, BlockSnapshot, Counters};

/// Result of handing a pointer back to an arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreeOutcome {
  /// The block was released; `bytes` includes its header.
  Freed { bytes: usize },
  /// Null pointer; nothing to do.
  Null,
  /// The block was already free (or already merged into a neighbor).
  DoubleFree,
  /// The pointer does not name a block of this arena.
  Invalid,
}

struct ArenaState {
  region: Region,
  lists: FreeLists,
}

pub struct Arena {
  id: u32,
  base: usize,
  size: usize,
  free_size: AtomicUsize,
  /// Free block count; a ranking hint only.
  weight: AtomicUsize,
  state: Mutex<ArenaState>,
}

impl Arena {
  /// Maps `size` bytes and files them as one free block.
  pub fn new(id: u32, size: usize) -> Result<Self, PoolError> {
    debug_assert!(size > 2 * HEADER_SIZE && size % HEADER_SIZE == 0);

    let mut region = Region::map(size)?;
    region.set_header(0, BlockHeader::new(size - HEADER_SIZE, NIL, id));
    let mut lists = FreeLists::new();
    lists.insert(&mut region, 0);

    log::debug!("arena #{id} mapped at {:p} ({size} bytes)", region.base());

    Ok(Self {
      id,
      base: region.base().as_ptr() as usize,
      size,
      free_size: AtomicUsize::new(size),
      weight: AtomicUsize::new(1),
      state: Mutex::new(ArenaState { region, lists }),
    })
  }

  #[inline]
  pub fn id(&self) -> u32 {
    self.id
  }

  #[inline]
  pub fn base(&self) -> usize {
    self.base
  }

  #[inline]
  pub fn size(&self) -> usize {
    self.size
  }

  #[inline]
  pub fn free_size(&self) -> usize {
    self.free_size.load(Ordering::Relaxed)
  }

  #[inline]
  pub fn weight(&self) -> usize {
    self.weight.load(Ordering::Relaxed)
  }

  #[inline]
  pub fn contains(&self, ptr: *const u8) -> bool {
    let addr = ptr as usize;
    addr >= self.base && addr < self.base + self.size
  }

  /// Takes a block of `size` payload bytes. `size` must already be rounded
  /// to the header granule. Returns `None` when no free block fits.
  pub fn allocate(&self, size: usize, counters: &Counters) -> Option<NonNull<u8>> {
    debug_assert!(size >= HEADER_SIZE && size % HEADER_SIZE == 0);

    let mut guard = self.state.lock();
    let ArenaState { region, lists } = &mut *guard;
    counters.block_fetch();

    let off = lists.find_first_fit(region, size)?;
    lists.remove(region, off);
    self.weight.fetch_sub(1, Ordering::Relaxed);
    counters.freelist_delete();

    let mut header = region.header(off);
    header.set_in_use(true);

    // Split only when the remainder can stand as a block of its own.
    if header.size - size > 2 * HEADER_SIZE {
      let rest = off + HEADER_SIZE + size;
      if let Some(next) = region.next_of(off, header.size) {
        region.update(next, |h| h.prev = rest);
      }
      region.set_header(
        rest,
        BlockHeader::new(header.size - size - HEADER_SIZE, off, self.id),
      );
      header.size = size;
      region.set_header(off, header);

      lists.insert(region, rest);
      self.weight.fetch_add(1, Ordering::Relaxed);
      counters.freelist_insert();
    } else {
      region.set_header(off, header);
    }

    self.free_size.fetch_sub(header.span(), Ordering::Relaxed);
    counters.allocated(header.span());
    Some(region.payload(off))
  }

  /// Returns the block behind `ptr`, merging it with free neighbors,
  /// predecessor first.
  pub fn free(&self, ptr: *const u8, counters: &Counters) -> FreeOutcome {
    let mut guard = self.state.lock();
    let ArenaState { region, lists } = &mut *guard;

    let Some(mut off) = region.block_of(ptr) else {
      return FreeOutcome::Invalid;
    };
    let mut header = region.header(off);
    if header.magic != BLOCK_MAGIC || header.arena != self.id {
      // A zeroed header was absorbed by a neighbor on an earlier free.
      return if header == BlockHeader::zeroed() {
        FreeOutcome::DoubleFree
      } else {
        FreeOutcome::Invalid
      };
    }
    if !header.in_use() {
      return FreeOutcome::DoubleFree;
    }

    let bytes = header.span();
    header.set_in_use(false);
    region.set_header(off, header);
    self.free_size.fetch_add(bytes, Ordering::Relaxed);
    counters.released(bytes);

    if header.prev != NIL {
      let prev_off = header.prev;
      let mut prev = region.header(prev_off);
      if !prev.in_use() {
        lists.remove(region, prev_off);
        self.weight.fetch_sub(1, Ordering::Relaxed);
        counters.freelist_delete();

        if let Some(next) = region.next_of(off, header.size) {
          region.update(next, |h| h.prev = prev_off);
        }
        prev.size += header.span();
        region.set_header(prev_off, prev);
        region.clear_header(off);

        off = prev_off;
        header = prev;
      }
    }

    if let Some(next_off) = region.next_of(off, header.size) {
      let next = region.header(next_off);
      if !next.in_use() {
        lists.remove(region, next_off);
        self.weight.fetch_sub(1, Ordering::Relaxed);
        counters.freelist_delete();

        if let Some(after) = region.next_of(next_off, next.size) {
          region.update(after, |h| h.prev = off);
        }
        header.size += next.span();
        region.set_header(off, header);
        region.clear_header(next_off);
      }
    }

    lists.insert(region, off);
    self.weight.fetch_add(1, Ordering::Relaxed);
    counters.freelist_insert();

    FreeOutcome::Freed { bytes }
  }

  /// Payload size of the live block behind `ptr`.
  pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
    let guard = self.state.lock();
    let off = guard.region.block_of(ptr)?;
    let header = guard.region.header(off);
    (header.magic == BLOCK_MAGIC && header.arena == self.id && header.in_use())
      .then_some(header.size)
  }

  /// True when every byte of the arena is free. Checked under the lock.
  pub fn is_unused(&self) -> bool {
    let _guard = self.state.lock();
    self.free_size() == self.size
  }

  /// Vector capacities a snapshot needs right now: `(blocks, buckets)`.
  pub fn snapshot_len(&self) -> (usize, usize) {
    let guard = self.state.lock();
    (chain(&guard.region).count(), guard.lists.occupied())
  }

  /// Fills `snap` without growing its vectors, so nothing is allocated
  /// under the arena lock. Returns false when the chain outgrew them.
  pub fn snapshot_into(&self, snap: &mut ArenaSnapshot) -> bool {
    snap.blocks.clear();
    snap.buckets.clear();

    let guard = self.state.lock();
    for (off, header) in chain(&guard.region) {
      if snap.blocks.len() == snap.blocks.capacity() {
        return false;
      }
      snap.blocks.push(BlockSnapshot {
        offset: off,
        prev: (header.prev != NIL).then_some(header.prev),
        size: header.size,
        in_use: header.in_use(),
      });
    }
    for entry in guard.lists.histogram() {
      if snap.buckets.len() == snap.buckets.capacity() {
        return false;
      }
      snap.buckets.push(entry);
    }

    snap.id = self.id;
    snap.base = self.base;
    snap.size = self.size;
    snap.free_size = self.free_size();
    snap.weight = self.weight();
    true
  }

  #[cfg(test)]
  pub fn snapshot(&self) -> ArenaSnapshot {
    loop {
      let (blocks, buckets) = self.snapshot_len();
      let mut snap = ArenaSnapshot::with_capacity(blocks, buckets);
      if self.snapshot_into(&mut snap) {
        return snap;
      }
    }
  }
}

/// Walks the physical block chain from offset 0.
fn chain(region: &Region) -> impl Iterator<Item = (usize, BlockHeader)> + '_ {
  let mut cursor = Some(0);
  core::iter::from_fn(move || {
    let off = cursor?;
    let header = region.header(off);
    cursor = region.next_of(off, header.size);
    Some((off, header))
  })
}

impl Drop for Arena {
  fn drop(&mut self) {
    log::debug!("arena #{} released ({} bytes)", self.id, self.size);
  }
}

// =============================================================================
// ArenaBox
// =============================================================================

/// Owning handle to an [`Arena`] whose control block sits in its own
/// anonymous mapping. The address is stable for the arena's whole life.
pub struct ArenaBox {
  ptr: NonNull<Arena>,
  meta_len: usize,
}

// The pointee is `Arena`, which is `Send + Sync`; the box only owns it.
unsafe impl Send for ArenaBox {}
unsafe impl Sync for ArenaBox {}

impl ArenaBox {
  pub fn new(id: u32, size: usize, page_size: usize) -> Result<Self, PoolError> {
    let arena = Arena::new(id, size)?;
    let meta_len = os::align_up(size_of::<Arena>(), page_size);
    let ptr = os::map(meta_len)?.cast::<Arena>();
    unsafe { ptr.as_ptr().write(arena) };
    Ok(Self { ptr, meta_len })
  }
}

impl Deref for ArenaBox {
  type Target = Arena;

  #[inline]
  fn deref(&self) -> &Arena {
    unsafe { self.ptr.as_ref() }
  }
}

impl Drop for ArenaBox {
  fn drop(&mut self) {
    unsafe {
      ptr::drop_in_place(self.ptr.as_ptr());
      os::unmap(self.ptr.cast(), self.meta_len);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::os;

  fn arena() -> (Arena, Counters) {
    (Arena::new(7, os::page_size() * 4).unwrap(), Counters::default())
  }

  /// Checks the tiling and accounting invariants of a quiescent arena.
  fn assert_consistent(arena: &Arena) {
    let snap = arena.snapshot();
    let mut expected_prev = None;
    let mut span_total = 0;
    let mut free_total = 0;
    let mut free_count = 0;
    for block in &snap.blocks {
      assert_eq!(block.prev, expected_prev, "broken prev link at {}", block.offset);
      assert_eq!(block.offset, span_total);
      span_total += block.size + HEADER_SIZE;
      if !block.in_use {
        free_total += block.size + HEADER_SIZE;
        free_count += 1;
      }
      expected_prev = Some(block.offset);
    }
    assert_eq!(span_total, snap.size);
    assert_eq!(free_total, snap.free_size);
    assert_eq!(free_count, snap.weight);
    assert_eq!(snap.buckets.iter().map(|(_, n)| n).sum::<usize>(), free_count);
  }

  #[test]
  fn fresh_arena_is_one_free_block() {
    let (arena, _) = arena();
    let snap = arena.snapshot();
    assert_eq!(snap.blocks.len(), 1);
    assert_eq!(snap.blocks[0].size, arena.size() - HEADER_SIZE);
    assert_eq!(arena.free_size(), arena.size());
    assert_eq!(arena.weight(), 1);
    assert!(arena.is_unused());
  }

  #[test]
  fn allocate_splits_and_free_restores() {
    let (arena, counters) = arena();
    let ptr = arena.allocate(64, &counters).unwrap();
    assert_eq!(arena.free_size(), arena.size() - 64 - HEADER_SIZE);
    assert_eq!(arena.usable_size(ptr.as_ptr()), Some(64));
    assert_consistent(&arena);

    assert_eq!(
      arena.free(ptr.as_ptr(), &counters),
      FreeOutcome::Freed { bytes: 64 + HEADER_SIZE }
    );
    assert_eq!(arena.free_size(), arena.size());
    assert_eq!(arena.snapshot().blocks.len(), 1);
    assert_consistent(&arena);
  }

  #[test]
  fn small_remainder_stays_attached() {
    let (arena, counters) = arena();
    let whole = arena.size() - HEADER_SIZE;
    // Leaves exactly two headers of slack: too small to split off.
    let ptr = arena.allocate(whole - 2 * HEADER_SIZE, &counters).unwrap();
    assert_eq!(arena.usable_size(ptr.as_ptr()), Some(whole));
    assert_eq!(arena.free_size(), 0);
    assert_eq!(arena.allocate(32, &counters), None);
    assert_consistent(&arena);
  }

  #[test]
  fn neighbors_coalesce_in_either_order() {
    for reverse in [false, true] {
      let (arena, counters) = arena();
      let a = arena.allocate(64, &counters).unwrap();
      let b = arena.allocate(128, &counters).unwrap();
      let c = arena.allocate(32, &counters).unwrap();

      let (first, second) = if reverse { (b, a) } else { (a, b) };
      arena.free(first.as_ptr(), &counters);
      arena.free(second.as_ptr(), &counters);

      let snap = arena.snapshot();
      assert!(!snap.blocks[0].in_use);
      assert_eq!(snap.blocks[0].size, 64 + 128 + HEADER_SIZE);
      assert_eq!(snap.blocks[1].prev, Some(0));
      assert_consistent(&arena);

      arena.free(c.as_ptr(), &counters);
      assert_eq!(arena.snapshot().blocks.len(), 1);
      assert_consistent(&arena);
    }
  }

  #[test]
  fn double_free_is_reported_and_ignored() {
    let (arena, counters) = arena();
    let keep = arena.allocate(32, &counters).unwrap();
    let a = arena.allocate(64, &counters).unwrap();
    let b = arena.allocate(64, &counters).unwrap();

    arena.free(b.as_ptr(), &counters);
    let free_size = arena.free_size();
    assert_eq!(arena.free(b.as_ptr(), &counters), FreeOutcome::DoubleFree);
    assert_eq!(arena.free_size(), free_size);

    // `a` merges forward; `b` was absorbed and its header zeroed earlier.
    arena.free(a.as_ptr(), &counters);
    assert_eq!(arena.free(b.as_ptr(), &counters), FreeOutcome::DoubleFree);
    assert_consistent(&arena);

    arena.free(keep.as_ptr(), &counters);
    assert!(arena.is_unused());
  }

  #[test]
  fn foreign_pointers_are_rejected() {
    let (arena, counters) = arena();
    let ptr = arena.allocate(64, &counters).unwrap();
    let inside = unsafe { ptr.as_ptr().add(1) };
    assert_eq!(arena.free(inside, &counters), FreeOutcome::Invalid);
    let outside = 0x10 as *const u8;
    assert_eq!(arena.free(outside, &counters), FreeOutcome::Invalid);
    assert_eq!(arena.usable_size(outside), None);
  }

  #[test]
  fn counters_track_freelist_traffic() {
    let (arena, counters) = arena();
    let ptr = arena.allocate(64, &counters).unwrap();
    arena.free(ptr.as_ptr(), &counters);
    let snap = counters.snapshot();
    assert_eq!(snap.block_fetch, 1);
    // alloc: remove whole + insert remainder; free: remove remainder + insert merged.
    assert_eq!(snap.freelist_delete, 2);
    assert_eq!(snap.freelist_insert, 2);
    assert_eq!(snap.bytes_allocated, 0);
  }

  #[test]
  fn boxed_arena_keeps_a_stable_address() {
    let page = os::page_size();
    let boxed = ArenaBox::new(3, page * 2, page).unwrap();
    let before: *const Arena = &*boxed;
    let moved = boxed;
    assert_eq!(&*moved as *const Arena, before);
    assert_eq!(moved.id(), 3);
    assert_eq!(moved.free_size(), page * 2);

    let counters = Counters::default();
    let ptr = moved.allocate(64, &counters).unwrap();
    assert!(moved.contains(ptr.as_ptr()));
    assert!(matches!(moved.free(ptr.as_ptr(), &counters), FreeOutcome::Freed { .. }));
    assert!(moved.is_unused());
  }

  #[test]
  fn undersized_snapshot_reports_overflow() {
    let (arena, counters) = arena();
    arena.allocate(64, &counters).unwrap();
    let mut snap = ArenaSnapshot::with_capacity(0, 0);
    assert!(!arena.snapshot_into(&mut snap));
    assert_eq!(arena.snapshot_len(), (2, 1));
    let mut snap = ArenaSnapshot::with_capacity(2, 1);
    assert!(arena.snapshot_into(&mut snap));
    assert_eq!(snap.blocks.len(), 2);
    assert_eq!(snap.id, 7);
  }
}
