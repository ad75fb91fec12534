//! Pool configuration.
//!
//! Settings can be built programmatically or loaded from the environment:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `ARENAPOOL_ARENA_PAGES` | Pages mapped for a default-sized arena | 1024 (4 MB on 4 KB pages) |
//! | `ARENAPOOL_MAX_ARENAS` | Upper bound on simultaneously mapped arenas (at most 2^20) | 1024 |
//! | `ARENAPOOL_PICK` | Arena selection (`weighted`/`round-robin`/`most-free`) | `weighted` |
//!
//! ```rust,ignore
//! use arenapool::{PickKind, PoolConfig};
//!
//! let config = PoolConfig::builder()
//!   .arena_pages(256)
//!   .pick(PickKind::MostFree)
//!   .build();
//! ```

use std::env;
use std::sync::Arc;

use crate::error::PoolError;
use crate::pick::{PickKind, PickStrategy};

pub const DEFAULT_ARENA_PAGES: usize = 1024;
pub const DEFAULT_MAX_ARENAS: usize = 1024;
/// Largest accepted `max_arenas`. The arena table is mapped at full size up
/// front.
pub const MAX_ARENAS_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone)]
pub struct PoolConfig {
  /// Pages per default-sized arena. Oversized requests get bigger arenas.
  pub arena_pages: usize,
  /// Arena table capacity. Growth past it fails.
  pub max_arenas: usize,
  pub pick: Arc<dyn PickStrategy>,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      arena_pages: DEFAULT_ARENA_PAGES,
      max_arenas: DEFAULT_MAX_ARENAS,
      pick: PickKind::default().build(),
    }
  }
}

impl PoolConfig {
  pub fn builder() -> PoolConfigBuilder {
    PoolConfigBuilder::default()
  }

  /// Defaults overridden by any valid `ARENAPOOL_*` variable.
  pub fn from_env() -> Self {
    let mut config = Self::default();

    if let Some(val) = parse_env_usize("ARENAPOOL_ARENA_PAGES") {
      if val > 0 {
        config.arena_pages = val;
      }
    }

    if let Some(val) = parse_env_usize("ARENAPOOL_MAX_ARENAS") {
      if val > 0 && val <= MAX_ARENAS_LIMIT {
        config.max_arenas = val;
      }
    }

    if let Ok(val) = env::var("ARENAPOOL_PICK") {
      match val.parse::<PickKind>() {
        Ok(kind) => config.pick = kind.build(),
        Err(err) => log::warn!("ignoring ARENAPOOL_PICK: {err}"),
      }
    }

    config
  }

  pub fn validate(&self) -> Result<(), PoolError> {
    if self.arena_pages == 0 {
      return Err(PoolError::InvalidConfig("arena_pages must be positive".into()));
    }
    if self.max_arenas == 0 || self.max_arenas > MAX_ARENAS_LIMIT {
      return Err(PoolError::InvalidConfig(format!(
        "max_arenas must be in 1..={MAX_ARENAS_LIMIT}"
      )));
    }
    Ok(())
  }

  /// Byte size of a default arena for the given page size.
  pub fn arena_size(&self, page_size: usize) -> Option<usize> {
    self.arena_pages.checked_mul(page_size)
  }
}

#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
  config: PoolConfig,
}

impl PoolConfigBuilder {
  pub fn arena_pages(mut self, pages: usize) -> Self {
    self.config.arena_pages = pages;
    self
  }

  pub fn max_arenas(mut self, max: usize) -> Self {
    self.config.max_arenas = max;
    self
  }

  pub fn pick(mut self, kind: PickKind) -> Self {
    self.config.pick = kind.build();
    self
  }

  /// Installs a custom selection strategy.
  pub fn pick_strategy(mut self, strategy: Arc<dyn PickStrategy>) -> Self {
    self.config.pick = strategy;
    self
  }

  pub fn build(self) -> PoolConfig {
    self.config
  }
}

fn parse_env_usize(name: &str) -> Option<usize> {
  env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
