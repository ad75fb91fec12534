//! The shared arena table: selection, growth and reclaim.
//!
//! Lock order is always set lock, then one arena lock. Readers of the set
//! lock pick and probe arenas and resolve frees; the write side is taken
//! only to publish a freshly mapped arena or to drop empty ones.
//!
//! No lock is ever held across a call that may allocate, log or unmap. The
//! table itself is a fixed array in its own mapping, so publishing an arena
//! never reallocates.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::arena::{Arena, ArenaBox, FreeOutcome};
use crate::block::HEADER_SIZE;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::os;
use crate::pick::{PickStrategy, WeightTable};
use crate::stats::{ArenaSnapshot, Counters};

/// Extra room given to snapshot vectors for blocks split between sizing
/// and filling.
const SNAPSHOT_SLACK: usize = 16;

// =============================================================================
// Slots
// =============================================================================

/// Fixed-capacity array backed by an anonymous mapping.
struct Slots<T> {
  ptr: NonNull<T>,
  cap: usize,
  len: usize,
  bytes: usize,
}

unsafe impl<T: Send> Send for Slots<T> {}
unsafe impl<T: Sync> Sync for Slots<T> {}

impl<T> Slots<T> {
  fn with_capacity(cap: usize, page_size: usize) -> Result<Self, PoolError> {
    let bytes = cap
      .checked_mul(size_of::<T>())
      .map(|b| os::align_up(b.max(1), page_size))
      .ok_or_else(|| PoolError::InvalidConfig("arena table too large".into()))?;
    let ptr = os::map(bytes)?.cast::<T>();
    Ok(Self {
      ptr,
      cap,
      len: 0,
      bytes,
    })
  }

  #[inline]
  fn as_slice(&self) -> &[T] {
    unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
  }

  /// Shifts `at..` up by one. The caller checks capacity.
  fn insert(&mut self, at: usize, value: T) {
    assert!(self.len < self.cap && at <= self.len);
    unsafe {
      let slot = self.ptr.as_ptr().add(at);
      ptr::copy(slot, slot.add(1), self.len - at);
      slot.write(value);
    }
    self.len += 1;
  }

  fn remove(&mut self, at: usize) -> T {
    assert!(at < self.len);
    self.len -= 1;
    unsafe {
      let slot = self.ptr.as_ptr().add(at);
      let value = slot.read();
      ptr::copy(slot.add(1), slot, self.len - at);
      value
    }
  }
}

impl<T> Drop for Slots<T> {
  fn drop(&mut self) {
    unsafe {
      ptr::drop_in_place(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len));
      os::unmap(self.ptr.cast(), self.bytes);
    }
  }
}

// =============================================================================
// Table
// =============================================================================

/// Borrowed arena address kept in the base-sorted index.
#[derive(Clone, Copy)]
struct ArenaRef(NonNull<Arena>);

unsafe impl Send for ArenaRef {}
unsafe impl Sync for ArenaRef {}

impl ArenaRef {
  #[inline]
  fn get(&self) -> &Arena {
    unsafe { self.0.as_ref() }
  }
}

struct Table {
  /// Creation order. Index 0 is the primary arena and is never reclaimed.
  arenas: Slots<ArenaBox>,
  /// Same arenas sorted by base address, for pointer lookup.
  by_base: Slots<ArenaRef>,
}

impl Table {
  fn len(&self) -> usize {
    self.arenas.len
  }

  fn is_full(&self) -> bool {
    self.arenas.len == self.arenas.cap
  }

  fn push(&mut self, arena: ArenaBox) {
    let base = arena.base();
    let at = self.by_base.as_slice().partition_point(|a| a.get().base() < base);
    self.by_base.insert(at, ArenaRef(NonNull::from(&*arena)));
    let len = self.arenas.len;
    self.arenas.insert(len, arena);
  }

  fn remove(&mut self, idx: usize) -> ArenaBox {
    let arena = self.arenas.remove(idx);
    let base = arena.base();
    let at = self.by_base.as_slice().partition_point(|a| a.get().base() < base);
    self.by_base.remove(at);
    arena
  }

  fn find(&self, ptr: *const u8) -> Option<&Arena> {
    let by_base = self.by_base.as_slice();
    let at = by_base.partition_point(|a| a.get().base() <= ptr as usize);
    let arena = by_base.get(at.checked_sub(1)?)?.get();
    arena.contains(ptr).then_some(arena)
  }

  fn by_id(&self, id: u32) -> Option<&Arena> {
    self.arenas.as_slice().iter().map(|a| &**a).find(|a| a.id() == id)
  }
}

// =============================================================================
// ArenaSet
// =============================================================================

pub struct ArenaSet {
  table: RwLock<Table>,
  next_id: AtomicU32,
  page_size: usize,
  arena_size: usize,
  max_arenas: usize,
  pick: Arc<dyn PickStrategy>,
  counters: Counters,
}

impl ArenaSet {
  /// Builds the set around a freshly mapped primary arena.
  pub fn new(config: &PoolConfig, page_size: usize) -> Result<Self, PoolError> {
    config.validate()?;
    let arena_size = config
      .arena_size(page_size)
      .filter(|&size| size > 2 * HEADER_SIZE)
      .ok_or_else(|| PoolError::InvalidConfig("arena size out of range".into()))?;

    let set = Self {
      table: RwLock::new(Table {
        arenas: Slots::with_capacity(config.max_arenas, page_size)?,
        by_base: Slots::with_capacity(config.max_arenas, page_size)?,
      }),
      next_id: AtomicU32::new(0),
      page_size,
      arena_size,
      max_arenas: config.max_arenas,
      pick: Arc::clone(&config.pick),
      counters: Counters::default(),
    };

    let primary = ArenaBox::new(set.next_id(), arena_size, page_size)?;
    set.counters.arena_mapped(primary.size());
    set.table.write().push(primary);
    Ok(set)
  }

  #[inline]
  pub fn counters(&self) -> &Counters {
    &self.counters
  }

  #[inline]
  pub fn page_size(&self) -> usize {
    self.page_size
  }

  pub fn len(&self) -> usize {
    self.table.read().len()
  }

  fn next_id(&self) -> u32 {
    self.next_id.fetch_add(1, Ordering::Relaxed)
  }

  /// Serves `size` payload bytes (already rounded), growing if needed.
  pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
    if let Some(ptr) = self.probe(size) {
      return Ok(ptr);
    }
    self.grow(size)
  }

  /// Offers the request to every published arena: forward from the picked
  /// start (wrapping), then backward from it.
  fn probe(&self, size: usize) -> Option<NonNull<u8>> {
    let table = self.table.read();
    let arenas = table.arenas.as_slice();
    let len = arenas.len();
    if len == 0 {
      return None;
    }

    let start = self.pick.pick(&WeightTable::new(arenas)).min(len - 1);
    self.counters.arena_pick();

    let need = size.saturating_add(HEADER_SIZE);
    let forward = (0..len).map(|step| (start + step) % len);
    let backward = (0..len).map(|step| (start + len - step) % len);

    forward.chain(backward).find_map(|idx| {
      let arena = &arenas[idx];
      if arena.free_size() < need {
        return None;
      }
      arena.allocate(size, &self.counters)
    })
  }

  /// Maps a new arena outside any lock, serves the request from it, then
  /// publishes it under the write lock.
  fn grow(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
    let limit = PoolError::ArenaLimit {
      max: self.max_arenas,
    };
    if self.len() >= self.max_arenas {
      return Err(limit);
    }

    let span = size
      .checked_add(HEADER_SIZE)
      .filter(|&v| v <= isize::MAX as usize / 2)
      .ok_or(PoolError::Map { size, errno: 0 })?;
    let arena_size = os::align_up(span, self.page_size).max(self.arena_size);

    let arena = ArenaBox::new(self.next_id(), arena_size, self.page_size)?;
    // Sized for the request, so this only fails on a broken arena.
    let ptr = arena
      .allocate(size, &self.counters)
      .ok_or(PoolError::Map {
        size: arena_size,
        errno: 0,
      })?;
    let (id, mapped) = (arena.id(), arena.size());

    let mut table = self.table.write();
    if table.is_full() {
      drop(table);
      // Lost the race for the last slot; the block goes away with the arena.
      self.counters.released(mapped - arena.free_size());
      return Err(limit);
    }
    table.push(arena);
    let published = table.len();
    drop(table);

    self.counters.arena_mapped(mapped);
    log::debug!(
      "arena #{id} published as {published} of {}",
      self.max_arenas
    );
    Ok(ptr)
  }

  /// Hands `ptr` back to the arena that contains it.
  pub fn free(&self, ptr: *const u8) -> FreeOutcome {
    let table = self.table.read();
    match table.find(ptr) {
      Some(arena) => arena.free(ptr, &self.counters),
      None => FreeOutcome::Invalid,
    }
  }

  pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
    let table = self.table.read();
    table.find(ptr)?.usable_size(ptr)
  }

  /// True when `ptr` lies inside one of the mapped arenas.
  pub fn owns(&self, ptr: *const u8) -> bool {
    self.table.read().find(ptr).is_some()
  }

  /// Unmaps every non-primary arena with no live block. Returns how many.
  ///
  /// Arenas are unlinked one per write-lock section and unmapped after the
  /// lock is released.
  pub fn reclaim(&self) -> usize {
    let mut reclaimed = 0;
    let mut from = 1;
    loop {
      let mut table = self.table.write();
      let found = (from..table.len()).find(|&idx| table.arenas.as_slice()[idx].is_unused());
      let Some(idx) = found else {
        break;
      };
      let arena = table.remove(idx);
      drop(table);

      self.counters.arena_unmapped(arena.size());
      log::debug!("reclaimed arena #{} ({} bytes)", arena.id(), arena.size());
      drop(arena);
      reclaimed += 1;
      from = idx;
    }
    reclaimed
  }

  /// Per-arena snapshots. Vectors are sized with no lock held, then filled
  /// under one arena lock at a time.
  pub fn snapshot(&self) -> Vec<ArenaSnapshot> {
    let ids = self.arena_ids();
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
      loop {
        let Some((blocks, buckets)) = self.with_arena(id, Arena::snapshot_len) else {
          break;
        };
        let mut snap =
          ArenaSnapshot::with_capacity(blocks + SNAPSHOT_SLACK, buckets + SNAPSHOT_SLACK);
        match self.with_arena(id, |arena| arena.snapshot_into(&mut snap)) {
          Some(true) => {
            out.push(snap);
            break;
          }
          Some(false) => continue,
          // Reclaimed in the meantime.
          None => break,
        }
      }
    }
    out
  }

  fn arena_ids(&self) -> Vec<u32> {
    loop {
      let mut ids = Vec::with_capacity(self.len() + SNAPSHOT_SLACK);
      let table = self.table.read();
      if table.len() > ids.capacity() {
        continue;
      }
      ids.extend(table.arenas.as_slice().iter().map(|a| a.id()));
      return ids;
    }
  }

  fn with_arena<R>(&self, id: u32, f: impl FnOnce(&Arena) -> R) -> Option<R> {
    let table = self.table.read();
    table.by_id(id).map(f)
  }

  /// Drops every arena, the primary included. Outstanding pointers dangle.
  pub fn release_all(&self) -> usize {
    let mut released = 0;
    loop {
      let mut table = self.table.write();
      let len = table.len();
      if len == 0 {
        break;
      }
      let arena = table.remove(len - 1);
      drop(table);

      self.counters.arena_unmapped(arena.size());
      drop(arena);
      released += 1;
    }
    released
  }
}

impl Drop for ArenaSet {
  fn drop(&mut self) {
    let released = self.release_all();
    if released > 0 {
      log::debug!("arena set dropped with {released} arenas");
    }
  }
}
