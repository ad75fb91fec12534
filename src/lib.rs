#![allow(clippy::missing_safety_doc)]
//! Multi-arena pool allocator.
//!
//! A [`Pool`] owns a set of anonymous mappings ("arenas"). Each arena is
//! tiled with blocks (a 32-byte header plus payload) and keeps per-size-class
//! free lists; neighbors are split on allocation and coalesced on free.
//! Arenas are added on demand and can be reclaimed once empty. Each arena has
//! its own lock, so threads working in different arenas do not contend.
//!
//! ```rust,ignore
//! let pool = arenapool::Pool::new()?;
//! let ptr = pool.malloc(100);
//! unsafe { pool.free(ptr) };
//! println!("{}", pool.dump());
//! ```

mod arena;
mod block;
mod config;
mod error;
mod freelist;
mod os;
mod pick;
mod set;
mod stats;

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr::null_mut,
};

pub use arena::FreeOutcome;
pub use block::{BUCKET_COUNT, HEADER_SIZE};
pub use config::{
  DEFAULT_ARENA_PAGES, DEFAULT_MAX_ARENAS, MAX_ARENAS_LIMIT, PoolConfig, PoolConfigBuilder,
};
pub use error::PoolError;
pub use pick::{MostFree, PickKind, PickStrategy, RoundRobin, WeightTable, Weighted};
pub use stats::{ArenaSnapshot, BlockSnapshot, CounterSnapshot, PoolSnapshot};

use block::round_size;
use set::ArenaSet;

/// Largest request accepted; keeps every offset computation far from overflow.
const MAX_REQUEST: usize = isize::MAX as usize / 2;

// =============================================================================
// Pool
// =============================================================================

/// An independent allocator instance. Share it across threads by reference
/// (or `Arc`); every method takes `&self`.
pub struct Pool {
  set: ArenaSet,
}

impl Pool {
  /// Creates a pool with the default configuration and maps its first arena.
  pub fn new() -> Result<Self, PoolError> {
    Self::with_config(PoolConfig::default())
  }

  pub fn with_config(config: PoolConfig) -> Result<Self, PoolError> {
    let page_size = os::page_size();
    let set = ArenaSet::new(&config, page_size)?;
    log::debug!(
      "pool ready: page size {page_size}, {} pages per arena, at most {} arenas",
      config.arena_pages,
      config.max_arenas
    );
    Ok(Self { set })
  }

  /// Allocates at least `size` bytes, 32-byte aligned.
  ///
  /// Returns null for `size == 0`, for absurd sizes, and when no arena can
  /// serve the request and a new one cannot be mapped.
  pub fn malloc(&self, size: usize) -> *mut u8 {
    if size == 0 {
      return null_mut();
    }
    let Some(rounded) = round_size(size).filter(|&s| s <= MAX_REQUEST) else {
      log::warn!("malloc({size}): request too large");
      return null_mut();
    };

    match self.set.allocate(rounded) {
      Ok(ptr) => ptr.as_ptr(),
      Err(err) => {
        log::error!("malloc({size}) failed: {err}");
        null_mut()
      }
    }
  }

  /// Returns `ptr` to its arena.
  ///
  /// Null is ignored. A second free of the same pointer is detected (best
  /// effort), logged and ignored, as is a pointer this pool never handed out.
  ///
  /// # Safety
  /// `ptr` must be null or a pointer returned by [`Pool::malloc`] on this
  /// pool, and the caller must be done with the memory behind it.
  pub unsafe fn free(&self, ptr: *mut u8) -> FreeOutcome {
    if ptr.is_null() {
      return FreeOutcome::Null;
    }

    let outcome = self.set.free(ptr);
    match outcome {
      FreeOutcome::DoubleFree => {
        log::warn!("address {ptr:p} has already been freed, double free ignored");
      }
      FreeOutcome::Invalid => {
        log::warn!("address {ptr:p} is not a block of this pool, free ignored");
      }
      FreeOutcome::Freed { .. } | FreeOutcome::Null => {}
    }
    outcome
  }

  /// Payload bytes available behind a live allocation.
  pub fn usable_size(&self, ptr: *const u8) -> Option<usize> {
    if ptr.is_null() {
      return None;
    }
    self.set.usable_size(ptr)
  }

  /// True when `ptr` points into memory mapped by this pool.
  pub fn owns(&self, ptr: *const u8) -> bool {
    !ptr.is_null() && self.set.owns(ptr)
  }

  /// Unmaps arenas (other than the first) that hold no live allocation.
  pub fn reclaim(&self) -> usize {
    self.set.reclaim()
  }

  pub fn arena_count(&self) -> usize {
    self.set.len()
  }

  pub fn page_size(&self) -> usize {
    self.set.page_size()
  }

  /// Read-only snapshot of every arena: sizes, bucket histogram and the
  /// physical block chain.
  pub fn dump(&self) -> PoolSnapshot {
    PoolSnapshot {
      page_size: self.set.page_size(),
      arenas: self.set.snapshot(),
    }
  }

  pub fn dump_counters(&self) -> CounterSnapshot {
    self.set.counters().snapshot()
  }

  /// Unmaps every arena. Pointers obtained from this pool become invalid.
  pub fn destroy(self) {
    let released = self.set.release_all();
    log::debug!("pool destroyed, {released} arenas unmapped");
  }
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// Serves layouts aligned up to [`HEADER_SIZE`]. Stricter alignment gets null.
///
/// `malloc` and `free` never allocate themselves, so a pool can back a
/// `#[global_allocator]`. Constructing the pool does allocate (the pick
/// strategy `Arc`), so build it before routing allocations to it.
unsafe impl GlobalAlloc for Pool {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > HEADER_SIZE {
      return null_mut();
    }
    self.malloc(layout.size().max(1))
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { self.free(ptr) };
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub extern "C" fn arenapool_init() -> *mut Pool {
  match Pool::new() {
    Ok(pool) => Box::into_raw(Box::new(pool)),
    Err(err) => {
      log::error!("arenapool_init failed: {err}");
      null_mut()
    }
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arenapool_malloc(pool: *const Pool, size: usize) -> *mut u8 {
  match unsafe { pool.as_ref() } {
    Some(pool) => pool.malloc(size),
    None => null_mut(),
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arenapool_free(pool: *const Pool, ptr: *mut u8) {
  if let Some(pool) = unsafe { pool.as_ref() } {
    unsafe { pool.free(ptr) };
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arenapool_destroy(pool: *mut Pool) {
  if !pool.is_null() {
    unsafe { Box::from_raw(pool) }.destroy();
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arenapool_dump(pool: *const Pool) {
  if let Some(pool) = unsafe { pool.as_ref() } {
    eprintln!("{}", pool.dump());
  }
}

/// Copies the counters into `out`. Returns 0 on success, 22 (EINVAL) on null.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn arenapool_dump_counters(
  pool: *const Pool,
  out: *mut CounterSnapshot,
) -> i32 {
  let Some(pool) = (unsafe { pool.as_ref() }) else {
    return 22;
  };
  if out.is_null() {
    return 22;
  }
  unsafe { out.write(pool.dump_counters()) };
  0
}
