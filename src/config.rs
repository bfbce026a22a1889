//! Tunables for an [`AddressSpace`](crate::AddressSpace).

use crate::error::{MemsError, Result};

/// Default backing granularity for new chunks.
pub const PAGE_SIZE: usize = 4096;

/// Default first simulated address handed out by a fresh address space.
pub const VIRTUAL_BASE: usize = 1000;

/// Address space configuration.
///
/// The page size must stay the same across a run for the stats report to be
/// reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  page_size: usize,
  virtual_base: usize,
}

impl Config {
  /// Builds a validated configuration. The page size must be a non-zero
  /// power of two.
  pub fn new(
    page_size: usize,
    virtual_base: usize,
  ) -> Result<Self> {
    if page_size == 0 {
      return Err(MemsError::InvalidConfig("page size must be non-zero"));
    }
    if !page_size.is_power_of_two() {
      return Err(MemsError::InvalidConfig("page size must be a power of two"));
    }

    Ok(Self {
      page_size,
      virtual_base,
    })
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  pub fn virtual_base(&self) -> usize {
    self.virtual_base
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      page_size: PAGE_SIZE,
      virtual_base: VIRTUAL_BASE,
    }
  }
}
