use thiserror::Error;

/// Failures surfaced by pool construction and arena growth.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
  /// The anonymous mapping for a new arena could not be created.
  #[error("mmap of {size} bytes failed (errno {errno})")]
  Map { size: usize, errno: i32 },
  /// Every arena slot is taken.
  #[error("arena limit of {max} reached")]
  ArenaLimit { max: usize },
  #[error("invalid pool configuration: {0}")]
  InvalidConfig(String),
}
