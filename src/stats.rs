//! Event counters and the read-only dump snapshot.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "serde")]
use serde::Serialize;

/// Internal event counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct Counters {
  freelist_insert: AtomicU64,
  freelist_delete: AtomicU64,
  arena_pick: AtomicU64,
  block_fetch: AtomicU64,
  total_size: AtomicU64,
  arena_count: AtomicU64,
  bytes_allocated: AtomicU64,
}

impl Counters {
  #[inline]
  pub(crate) fn freelist_insert(&self) {
    self.freelist_insert.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn freelist_delete(&self) {
    self.freelist_delete.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn arena_pick(&self) {
    self.arena_pick.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn block_fetch(&self) {
    self.block_fetch.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn arena_mapped(&self, size: usize) {
    self.total_size.fetch_add(size as u64, Ordering::Relaxed);
    self.arena_count.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn arena_unmapped(&self, size: usize) {
    self.total_size.fetch_sub(size as u64, Ordering::Relaxed);
    self.arena_count.fetch_sub(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn allocated(&self, bytes: usize) {
    self.bytes_allocated.fetch_add(bytes as u64, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn released(&self, bytes: usize) {
    self.bytes_allocated.fetch_sub(bytes as u64, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> CounterSnapshot {
    CounterSnapshot {
      freelist_insert: self.freelist_insert.load(Ordering::Relaxed),
      freelist_delete: self.freelist_delete.load(Ordering::Relaxed),
      arena_pick: self.arena_pick.load(Ordering::Relaxed),
      block_fetch: self.block_fetch.load(Ordering::Relaxed),
      total_size: self.total_size.load(Ordering::Relaxed),
      arena_count: self.arena_count.load(Ordering::Relaxed),
      bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
    }
  }
}

/// Point-in-time copy of [`Counters`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct CounterSnapshot {
  /// Blocks appended to a free list.
  pub freelist_insert: u64,
  /// Blocks unlinked from a free list.
  pub freelist_delete: u64,
  /// Arena selections made by the pick strategy.
  pub arena_pick: u64,
  /// Block searches run against a single arena.
  pub block_fetch: u64,
  /// Bytes currently mapped across all arenas.
  pub total_size: u64,
  /// Arenas currently mapped.
  pub arena_count: u64,
  /// Bytes held by live allocations, headers included.
  pub bytes_allocated: u64,
}

impl fmt::Display for CounterSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "freelist insert : {}", self.freelist_insert)?;
    writeln!(f, "freelist delete : {}", self.freelist_delete)?;
    writeln!(f, "arena pick      : {}", self.arena_pick)?;
    writeln!(f, "block fetch     : {}", self.block_fetch)?;
    writeln!(f, "total size      : {}", self.total_size)?;
    writeln!(f, "arena count     : {}", self.arena_count)?;
    write!(f, "bytes allocated : {}", self.bytes_allocated)
  }
}

/// One entry of an arena's physical block chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct BlockSnapshot {
  pub offset: usize,
  /// Offset of the physical predecessor.
  pub prev: Option<usize>,
  /// Payload bytes.
  pub size: usize,
  pub in_use: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ArenaSnapshot {
  pub id: u32,
  pub base: usize,
  pub size: usize,
  pub free_size: usize,
  pub weight: usize,
  /// `(smallest block size, free blocks)` per non-empty bucket.
  pub buckets: Vec<(usize, usize)>,
  pub blocks: Vec<BlockSnapshot>,
}

impl ArenaSnapshot {
  /// Empty snapshot whose vectors hold the given counts without growing.
  pub(crate) fn with_capacity(blocks: usize, buckets: usize) -> Self {
    Self {
      id: 0,
      base: 0,
      size: 0,
      free_size: 0,
      weight: 0,
      buckets: Vec::with_capacity(buckets),
      blocks: Vec::with_capacity(blocks),
    }
  }

  pub fn free_blocks(&self) -> impl Iterator<Item = &BlockSnapshot> {
    self.blocks.iter().filter(|b| !b.in_use)
  }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PoolSnapshot {
  pub page_size: usize,
  pub arenas: Vec<ArenaSnapshot>,
}

impl fmt::Display for PoolSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "---- pool dump: {} arenas ----", self.arenas.len())?;
    for arena in &self.arenas {
      writeln!(
        f,
        "arena #{} base {:#x} size {} free {} weight {}",
        arena.id, arena.base, arena.size, arena.free_size, arena.weight
      )?;
      write!(f, "  buckets:")?;
      for (size, count) in &arena.buckets {
        write!(f, " [{size}]:{count}")?;
      }
      writeln!(f)?;
      for block in &arena.blocks {
        let prev = match block.prev {
          Some(prev) => format!("{prev:#x}"),
          None => "-".to_owned(),
        };
        writeln!(
          f,
          "  {:#010x}: prev {:>10} size {:>8} {}",
          block.offset,
          prev,
          block.size,
          if block.in_use { "used" } else { "free" }
        )?;
      }
    }
    write!(f, "---- end pool dump ----")
  }
}
