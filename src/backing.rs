//! Sources of real memory for chunks.
//!
//! ```text
//!   AddressSpace ──acquire(size)──▶ BackingStore ──▶ mmap(2) / std::alloc
//!                ◀──release(base)──
//! ```

use std::{alloc, io, ptr::NonNull};

use log::{error, trace};

use crate::{
  align::round_up,
  config::PAGE_SIZE,
  error::{MemsError, Result},
};

/// Hands out and takes back fixed-size blocks of real memory.
///
/// Every successful [`acquire`](BackingStore::acquire) must be matched by
/// exactly one [`release`](BackingStore::release) with the same size and
/// alignment.
pub trait BackingStore {
  /// Obtains `size` bytes of readable and writable memory whose start is a
  /// multiple of `align`, a power of two.
  fn acquire(
    &mut self,
    size: usize,
    align: usize,
  ) -> Result<NonNull<u8>>;

  /// Returns memory obtained from [`acquire`](BackingStore::acquire).
  ///
  /// # Safety
  ///
  /// `base`, `size` and `align` must come from a single earlier `acquire`
  /// on this store, the block must not have been released already, and no
  /// references into it may be used afterwards.
  unsafe fn release(
    &mut self,
    base: NonNull<u8>,
    size: usize,
    align: usize,
  ) -> Result<()>;
}

impl<B: BackingStore + ?Sized> BackingStore for &mut B {
  fn acquire(
    &mut self,
    size: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    (**self).acquire(size, align)
  }

  unsafe fn release(
    &mut self,
    base: NonNull<u8>,
    size: usize,
    align: usize,
  ) -> Result<()> {
    unsafe { (**self).release(base, size, align) }
  }
}

/// Anonymous private mappings straight from the OS.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct MmapBacking;

#[cfg(unix)]
impl MmapBacking {
  pub fn new() -> Self {
    Self
  }

  /// Granularity the OS maps at.
  pub fn os_page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
      size if size > 0 => size as usize,
      _ => PAGE_SIZE,
    }
  }

  fn map(size: usize) -> Result<NonNull<u8>> {
    use std::ptr;

    let address = unsafe {
      libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if address == libc::MAP_FAILED {
      let source = io::Error::last_os_error();
      error!("mmap of {} bytes failed: {}", size, source);
      return Err(MemsError::exhausted(size, source));
    }

    trace!("mapped {} bytes at {:?}", size, address);

    NonNull::new(address as *mut u8)
      .ok_or_else(|| MemsError::exhausted(size, io::Error::other("mmap returned null")))
  }

  unsafe fn unmap(
    base: NonNull<u8>,
    size: usize,
  ) -> Result<()> {
    if unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, size) } == -1 {
      let source = io::Error::last_os_error();
      error!("munmap of {} bytes at {:?} failed: {}", size, base, source);
      return Err(MemsError::ReleaseFailed { size, source });
    }

    trace!("unmapped {} bytes at {:?}", size, base);
    Ok(())
  }
}

#[cfg(unix)]
impl BackingStore for MmapBacking {
  fn acquire(
    &mut self,
    size: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    if align <= Self::os_page_size() {
      return Self::map(size);
    }

    // Over-map by one alignment unit, then trim both ends so the kept
    // range starts on an `align` boundary. Both trimmed pieces are whole
    // OS pages.
    let overflow = || MemsError::exhausted(size, io::Error::other("size overflows with alignment"));
    let total = size.checked_add(align).ok_or_else(overflow)?;
    let keep = round_up(size, Self::os_page_size()).ok_or_else(overflow)?;
    let raw = Self::map(total)?;

    let start = raw.as_ptr() as usize;
    let head = start.next_multiple_of(align) - start;
    let tail = total - head - keep;

    unsafe {
      let base = raw.add(head);
      if head > 0 {
        Self::unmap(raw, head)?;
      }
      if tail > 0 {
        Self::unmap(base.add(keep), tail)?;
      }
      Ok(base)
    }
  }

  unsafe fn release(
    &mut self,
    base: NonNull<u8>,
    size: usize,
    _align: usize,
  ) -> Result<()> {
    unsafe { Self::unmap(base, size) }
  }
}

/// Aligned blocks from the global allocator.
///
/// Portable stand-in for [`MmapBacking`] that keeps count of what is still
/// outstanding, and can be capped to make exhaustion reproducible.
#[derive(Debug)]
pub struct HeapBacking {
  limit: Option<usize>,
  live_blocks: usize,
  live_bytes: usize,
  total_acquired: usize,
}

impl HeapBacking {
  pub fn new() -> Self {
    Self {
      limit: None,
      live_blocks: 0,
      live_bytes: 0,
      total_acquired: 0,
    }
  }

  /// Refuses any `acquire` that would push outstanding bytes past `limit`.
  pub fn with_limit(
    mut self,
    limit: usize,
  ) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Blocks acquired and not yet released.
  pub fn live_blocks(&self) -> usize {
    self.live_blocks
  }

  /// Bytes acquired and not yet released.
  pub fn live_bytes(&self) -> usize {
    self.live_bytes
  }

  /// Successful acquisitions over the store's lifetime.
  pub fn total_acquired(&self) -> usize {
    self.total_acquired
  }

  fn layout(
    size: usize,
    align: usize,
  ) -> Result<alloc::Layout> {
    alloc::Layout::from_size_align(size, align)
      .map_err(|e| MemsError::exhausted(size, io::Error::new(io::ErrorKind::InvalidInput, e)))
  }
}

impl Default for HeapBacking {
  fn default() -> Self {
    Self::new()
  }
}

impl BackingStore for HeapBacking {
  fn acquire(
    &mut self,
    size: usize,
    align: usize,
  ) -> Result<NonNull<u8>> {
    if size == 0 {
      return Err(MemsError::exhausted(
        size,
        io::Error::new(io::ErrorKind::InvalidInput, "zero-sized block"),
      ));
    }

    if let Some(limit) = self.limit {
      if self.live_bytes.saturating_add(size) > limit {
        error!(
          "heap backing limit reached: {} live + {} requested > {}",
          self.live_bytes, size, limit
        );
        return Err(MemsError::exhausted(size, io::Error::from(io::ErrorKind::OutOfMemory)));
      }
    }

    let layout = Self::layout(size, align)?;
    let address = unsafe { alloc::alloc_zeroed(layout) };

    let Some(base) = NonNull::new(address) else {
      error!("global allocator refused {} bytes", size);
      return Err(MemsError::exhausted(size, io::Error::from(io::ErrorKind::OutOfMemory)));
    };

    self.live_blocks += 1;
    self.live_bytes += size;
    self.total_acquired += 1;

    Ok(base)
  }

  unsafe fn release(
    &mut self,
    base: NonNull<u8>,
    size: usize,
    align: usize,
  ) -> Result<()> {
    let layout = Self::layout(size, align)?;
    unsafe { alloc::dealloc(base.as_ptr(), layout) };

    self.live_blocks -= 1;
    self.live_bytes -= size;

    Ok(())
  }
}
