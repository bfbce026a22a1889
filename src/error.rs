//! Error types for the address space

use std::io;

use thiserror::Error;

use crate::space::VirtualAddress;

pub type Result<T> = std::result::Result<T, MemsError>;

/// Errors reported by [`AddressSpace`](crate::AddressSpace) operations.
///
/// None of the operations mutate state before returning one of these.
#[derive(Debug, Error)]
pub enum MemsError {
  /// Zero-byte allocation request
  #[error("cannot allocate zero bytes")]
  InvalidSize,

  /// Address is not the start of a live allocation
  #[error("{0} is not the start of a live allocation")]
  InvalidFree(VirtualAddress),

  /// Address lies outside every chunk
  #[error("{0} is not mapped")]
  NotMapped(VirtualAddress),

  /// The backing store could not provide memory
  #[error("backing store refused {size} bytes")]
  ResourceExhausted {
    size: usize,
    #[source]
    source: io::Error,
  },

  /// The backing store could not take memory back
  #[error("failed to release {size} bytes")]
  ReleaseFailed {
    size: usize,
    #[source]
    source: io::Error,
  },

  #[error("invalid configuration: {0}")]
  InvalidConfig(&'static str),
}

impl MemsError {
  /// Whether the address space can no longer be trusted to make progress.
  ///
  /// Running out of backing memory is unrecoverable; everything else is a
  /// caller mistake that left the state untouched.
  pub fn is_fatal(&self) -> bool {
    matches!(
      self,
      Self::ResourceExhausted { .. } | Self::ReleaseFailed { .. }
    )
  }

  pub(crate) fn exhausted(
    size: usize,
    source: io::Error,
  ) -> Self {
    Self::ResourceExhausted { size, source }
  }
}
