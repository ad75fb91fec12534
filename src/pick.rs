//! Arena selection strategies.
//!
//! A strategy only chooses where the arena scan starts. Every arena is still
//! probed before the set grows, so a poor choice costs time, never memory.

use core::cell::Cell;
use core::fmt;
use core::str::FromStr;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::arena::ArenaBox;

/// Read-only view of the per-arena hints a strategy may rank by.
pub struct WeightTable<'a> {
  arenas: &'a [ArenaBox],
}

impl<'a> WeightTable<'a> {
  pub(crate) fn new(arenas: &'a [ArenaBox]) -> Self {
    Self { arenas }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.arenas.len()
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.arenas.is_empty()
  }

  /// Approximate free block count of arena `idx`.
  #[inline]
  pub fn weight(&self, idx: usize) -> usize {
    self.arenas[idx].weight()
  }

  /// Free bytes of arena `idx`, as last published.
  #[inline]
  pub fn free_size(&self, idx: usize) -> usize {
    self.arenas[idx].free_size()
  }
}

/// Chooses the arena index a scan starts from.
pub trait PickStrategy: fmt::Debug + Send + Sync {
  /// Called with a non-empty table; must return an index below `table.len()`.
  fn pick(&self, table: &WeightTable<'_>) -> usize;
}

/// Weighted random start: arenas with more free blocks are favored.
///
/// Draws uniformly in `[0, total)` and takes the first arena whose prefix
/// weight reaches the draw. With no weight at all it starts in the middle.
#[derive(Debug, Default, Clone, Copy)]
pub struct Weighted;

impl PickStrategy for Weighted {
  fn pick(&self, table: &WeightTable<'_>) -> usize {
    let len = table.len();
    let total: usize = (0..len).map(|i| table.weight(i)).sum();
    if total == 0 {
      return len / 2;
    }

    let draw = (next_random() % total as u64) as usize;
    let mut prefix = 0;
    for i in 0..len {
      prefix += table.weight(i);
      if prefix >= draw {
        return i;
      }
    }
    // Weights moved under us; any index will do.
    len - 1
  }
}

/// Rotates the start over all arenas.
#[derive(Debug, Default)]
pub struct RoundRobin {
  cursor: AtomicUsize,
}

impl PickStrategy for RoundRobin {
  fn pick(&self, table: &WeightTable<'_>) -> usize {
    self.cursor.fetch_add(1, Ordering::Relaxed) % table.len()
  }
}

/// Starts at the arena with the most free bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct MostFree;

impl PickStrategy for MostFree {
  fn pick(&self, table: &WeightTable<'_>) -> usize {
    (0..table.len())
      .max_by_key(|&i| table.free_size(i))
      .unwrap_or(0)
  }
}

/// Names of the built-in strategies, as accepted by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PickKind {
  #[default]
  Weighted,
  RoundRobin,
  MostFree,
}

impl PickKind {
  pub fn build(self) -> Arc<dyn PickStrategy> {
    match self {
      PickKind::Weighted => Arc::new(Weighted),
      PickKind::RoundRobin => Arc::new(RoundRobin::default()),
      PickKind::MostFree => Arc::new(MostFree),
    }
  }
}

impl FromStr for PickKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "weighted" | "random" => Ok(PickKind::Weighted),
      "round-robin" | "roundrobin" | "rr" => Ok(PickKind::RoundRobin),
      "most-free" | "mostfree" => Ok(PickKind::MostFree),
      other => Err(format!("unknown pick strategy `{other}`")),
    }
  }
}

// =============================================================================
// Per-thread random source
// =============================================================================

fn seed() -> u64 {
  static CTR: AtomicU64 = AtomicU64::new(1);
  // splitmix64 of a per-thread counter; never zero.
  let mut z = CTR
    .fetch_add(1, Ordering::Relaxed)
    .wrapping_mul(0x9E37_79B9_7F4A_7C15);
  z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
  z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
  (z ^ (z >> 31)) | 1
}

/// xorshift64* over thread-local state.
fn next_random() -> u64 {
  thread_local! {
    static STATE: Cell<u64> = Cell::new(seed());
  }
  STATE.with(|state| {
    let mut x = state.get();
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    state.set(x);
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
  })
}
