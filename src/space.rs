use std::{fmt, io, mem, ops::Add, ptr::NonNull};

use log::{debug, warn};

#[cfg(unix)]
use crate::backing::MmapBacking;
use crate::{
  align::round_up,
  backing::BackingStore,
  chunk::Chunk,
  config::Config,
  error::{MemsError, Result},
  segment::ChunkId,
  stats::Stats,
};

/// Address in the simulated space. Only meaningful to the
/// [`AddressSpace`] that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
  pub const fn new(address: usize) -> Self {
    Self(address)
  }

  pub const fn as_usize(self) -> usize {
    self.0
  }

  /// `self + offset`, or `None` past the end of the address range.
  pub const fn checked_add(
    self,
    offset: usize,
  ) -> Option<Self> {
    match self.0.checked_add(offset) {
      Some(address) => Some(Self(address)),
      None => None,
    }
  }
}

impl From<usize> for VirtualAddress {
  fn from(address: usize) -> Self {
    Self(address)
  }
}

/// # Panics
///
/// Panics if the sum does not fit in a `usize`. Use
/// [`VirtualAddress::checked_add`] for untrusted offsets.
impl Add<usize> for VirtualAddress {
  type Output = Self;

  fn add(
    self,
    offset: usize,
  ) -> Self {
    match self.checked_add(offset) {
      Some(address) => address,
      None => panic!("virtual address {} + {} overflows", self.0, offset),
    }
  }
}

impl fmt::Display for VirtualAddress {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// A private virtual address space carved out of page-granular backing
/// memory.
///
/// Chunks are kept in creation order, which is also ascending virtual
/// base order since the cursor only moves forward.
pub struct AddressSpace<B: BackingStore> {
  config: Config,
  backing: B,
  chunks: Vec<Chunk>,
  cursor: usize,
}

#[cfg(unix)]
impl AddressSpace<MmapBacking> {
  /// Address space backed by anonymous mappings, with the default
  /// configuration.
  pub fn new() -> Self {
    Self::init(Config::default(), MmapBacking::new())
  }
}

#[cfg(unix)]
impl Default for AddressSpace<MmapBacking> {
  fn default() -> Self {
    Self::new()
  }
}

impl<B: BackingStore> AddressSpace<B> {
  /// Creates an empty address space whose first chunk will start at
  /// `config.virtual_base()`.
  pub fn init(
    config: Config,
    backing: B,
  ) -> Self {
    Self {
      config,
      backing,
      chunks: Vec::new(),
      cursor: config.virtual_base(),
    }
  }

  pub fn with_backing(backing: B) -> Self {
    Self::init(Config::default(), backing)
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn page_size(&self) -> usize {
    self.config.page_size()
  }

  pub fn backing(&self) -> &B {
    &self.backing
  }

  /// Where the next chunk will be placed.
  pub fn cursor(&self) -> VirtualAddress {
    VirtualAddress(self.cursor)
  }

  pub fn chunks(&self) -> &[Chunk] {
    &self.chunks
  }

  pub fn chunk_count(&self) -> usize {
    self.chunks.len()
  }

  /// Hands out `size` bytes from the first free segment that fits,
  /// growing the space by a fresh page-rounded chunk when none does.
  pub fn malloc(
    &mut self,
    size: usize,
  ) -> Result<VirtualAddress> {
    if size == 0 {
      return Err(MemsError::InvalidSize);
    }

    for chunk in &mut self.chunks {
      if let Some(index) = chunk.first_fit(size) {
        let offset = chunk.carve(index, size);
        debug!(
          "reused hole in chunk {} for {} bytes at offset {}",
          chunk.id().index(),
          size,
          offset
        );
        return Ok(VirtualAddress(chunk.virtual_base() + offset));
      }
    }

    let index = self.grow(size)?;
    let chunk = &mut self.chunks[index];
    let offset = chunk.carve(0, size);

    Ok(VirtualAddress(chunk.virtual_base() + offset))
  }

  /// Returns the allocation starting at `address` to the free list and
  /// merges it with neighbouring holes.
  pub fn free(
    &mut self,
    address: VirtualAddress,
  ) -> Result<()> {
    let Some(chunk_index) = self.chunk_index(address.0) else {
      warn!("free of unmapped address {}", address);
      return Err(MemsError::InvalidFree(address));
    };

    let chunk = &mut self.chunks[chunk_index];
    let offset = address.0 - chunk.virtual_base();

    match chunk.segment_at(offset) {
      Some(index) if !chunk.segments()[index].is_free() => {
        chunk.release(index);
        Ok(())
      }
      Some(_) => {
        warn!("double free at {}", address);
        Err(MemsError::InvalidFree(address))
      }
      None => {
        warn!("free of {} which is not a segment start", address);
        Err(MemsError::InvalidFree(address))
      }
    }
  }

  /// Translates any address inside a chunk to its backing location,
  /// regardless of whether it is currently allocated.
  pub fn get(
    &self,
    address: VirtualAddress,
  ) -> Result<NonNull<u8>> {
    let Some(index) = self.chunk_index(address.0) else {
      warn!("translation of unmapped address {}", address);
      return Err(MemsError::NotMapped(address));
    };

    let chunk = &self.chunks[index];
    let offset = address.0 - chunk.virtual_base();

    // `offset < chunk.size()`, so this stays inside the backing block.
    Ok(unsafe { chunk.physical_base().add(offset) })
  }

  pub fn stats(&self) -> Stats {
    Stats::collect(&self.chunks, self.page_size())
  }

  /// Writes the [`stats`](Self::stats) report to stdout.
  pub fn print_stats(&self) {
    println!("{}", self.stats());
  }

  /// Gives every chunk back to the backing store and resets to the
  /// freshly initialised state.
  ///
  /// All chunks are released even if one of them fails; the first failure
  /// is returned.
  pub fn finish(&mut self) -> Result<()> {
    let mut result = Ok(());
    let align = self.page_size();

    for chunk in mem::take(&mut self.chunks) {
      let (base, size) = (chunk.physical_base(), chunk.size());
      debug!(
        "releasing chunk {} [{}:{})",
        chunk.id().index(),
        chunk.virtual_base(),
        chunk.virtual_base() + size
      );

      // Data first, then the record describing it.
      let released = unsafe { self.backing.release(base, size, align) };
      drop(chunk);

      if let Err(e) = released {
        if result.is_ok() {
          result = Err(e);
        }
      }
    }

    self.cursor = self.config.virtual_base();

    result
  }

  /// Maps a new chunk big enough for `size` bytes at the cursor, aligned
  /// to the configured page size, and returns its index. Nothing changes if the backing store refuses.
  fn grow(
    &mut self,
    size: usize,
  ) -> Result<usize> {
    let overflow = || MemsError::exhausted(size, io::Error::other("size overflows the address space"));

    let chunk_size = round_up(size, self.page_size()).ok_or_else(overflow)?;
    let next_cursor = self.cursor.checked_add(chunk_size).ok_or_else(overflow)?;

    let physical_base = self.backing.acquire(chunk_size, self.page_size())?;

    let id = ChunkId(self.chunks.len());
    debug!(
      "new chunk {} [{}:{}) of {} pages",
      id.index(),
      self.cursor,
      next_cursor,
      chunk_size / self.page_size()
    );

    self
      .chunks
      .push(Chunk::new(id, self.cursor, chunk_size, physical_base));
    self.cursor = next_cursor;

    Ok(id.index())
  }

  fn chunk_index(
    &self,
    address: usize,
  ) -> Option<usize> {
    let after = self
      .chunks
      .partition_point(|chunk| chunk.virtual_base() <= address);

    let index = after.checked_sub(1)?;
    self.chunks[index].contains(address).then_some(index)
  }
}

impl<B: BackingStore> Drop for AddressSpace<B> {
  fn drop(&mut self) {
    if self.chunks.is_empty() {
      return;
    }

    if let Err(e) = self.finish() {
      warn!("address space dropped with unreleased memory: {}", e);
    }
  }
}

impl<B: BackingStore> fmt::Debug for AddressSpace<B> {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    f.debug_struct("AddressSpace")
      .field("config", &self.config)
      .field("cursor", &self.cursor)
      .field("chunks", &self.chunks)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{backing::HeapBacking, segment::SegmentState};

  fn space() -> AddressSpace<HeapBacking> {
    AddressSpace::with_backing(HeapBacking::new())
  }

  fn check_invariants(
    space: &AddressSpace<HeapBacking>,
    live: &[(VirtualAddress, usize)],
  ) {
    for chunk in space.chunks() {
      assert!(chunk.is_partitioned());
      assert!(chunk.has_no_adjacent_holes());
    }

    let mut ranges: Vec<(usize, usize)> = space
      .chunks()
      .iter()
      .flat_map(|chunk| {
        chunk
          .segments()
          .iter()
          .filter(|s| s.state == SegmentState::Allocated)
          .map(move |s| (chunk.virtual_base() + s.offset, chunk.virtual_base() + s.end()))
      })
      .collect();
    ranges.sort();
    for pair in ranges.windows(2) {
      assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
    }
    assert_eq!(ranges.len(), live.len());

    for &(address, size) in live {
      let chunk = space
        .chunks()
        .iter()
        .find(|c| c.contains(address.as_usize()))
        .unwrap();
      let expected = chunk.physical_base().as_ptr() as usize + (address.as_usize() - chunk.virtual_base());

      assert_eq!(space.get(address).unwrap().as_ptr() as usize, expected);
      assert!(ranges.contains(&(address.as_usize(), address.as_usize() + size)));
    }
  }

  #[test]
  fn test_first_allocation_starts_at_base() {
    let mut space = space();

    let a = space.malloc(100).unwrap();

    assert_eq!(a, VirtualAddress::new(1000));
    assert_eq!(space.chunk_count(), 1);
    assert_eq!(space.cursor(), VirtualAddress::new(1000 + 4096));
  }

  #[test]
  fn test_zero_size() {
    let mut space = space();

    assert!(matches!(space.malloc(0), Err(MemsError::InvalidSize)));
    assert_eq!(space.chunk_count(), 0);
    assert_eq!(space.backing().total_acquired(), 0);
  }

  #[test]
  fn test_reuse_over_growth() {
    let mut space = space();

    let a = space.malloc(100).unwrap();
    let b = space.malloc(200).unwrap();
    space.free(a).unwrap();
    let c = space.malloc(50).unwrap();

    assert_eq!(b, a + 100);
    assert_eq!(c, a);
    assert_eq!(space.chunk_count(), 1);

    let hole = space.chunks()[0].segments()[1];
    assert_eq!((hole.offset, hole.size, hole.state), (50, 50, SegmentState::Free));

    let stats = space.stats();
    assert_eq!(stats.space_unused, 50 + (4096 - 300));
    assert_eq!(stats.live_bytes, 250);
  }

  #[test]
  fn test_growth_rounding() {
    let mut space = space();

    let a = space.malloc(4096 + 1).unwrap();

    assert_eq!(space.chunk_count(), 1);
    let chunk = &space.chunks()[0];
    assert_eq!(chunk.size(), 8192);
    assert_eq!(chunk.virtual_base(), a.as_usize());

    let tail = chunk.segments()[1];
    assert_eq!((tail.offset, tail.size, tail.state), (4097, 4095, SegmentState::Free));
    assert_eq!(space.stats().pages_used, 2);
  }

  #[test]
  fn test_growth_on_miss_appends_chunk() {
    let mut space = space();

    let a = space.malloc(4000).unwrap();
    let b = space.malloc(200).unwrap();
    let c = space.malloc(96).unwrap();

    assert_eq!(space.chunk_count(), 2);
    assert_eq!(b, VirtualAddress::new(1000 + 4096));
    assert_eq!(c, a + 4000);
    assert_eq!(space.cursor(), VirtualAddress::new(1000 + 8192));
  }

  #[test]
  fn test_coalescing() {
    let mut space = space();

    let a = space.malloc(50).unwrap();
    let b = space.malloc(50).unwrap();
    let c = space.malloc(50).unwrap();

    space.free(a).unwrap();
    space.free(c).unwrap();
    assert_eq!(space.chunks()[0].segments().len(), 3);

    space.free(b).unwrap();

    let layout: Vec<_> = space.chunks()[0]
      .segments()
      .iter()
      .map(|s| (s.offset, s.size, s.state))
      .collect();
    assert_eq!(layout, vec![(0, 4096, SegmentState::Free)]);
    assert_eq!(space.stats().space_unused, 4096);
  }

  #[test]
  fn test_invalid_free_leaves_state() {
    let mut space = space();

    let a = space.malloc(100).unwrap();
    let before = space.stats();

    assert!(matches!(space.free(a + 10), Err(MemsError::InvalidFree(_))));
    assert!(matches!(space.free(a + 100), Err(MemsError::InvalidFree(_))));
    assert!(matches!(
      space.free(VirtualAddress::new(10)),
      Err(MemsError::InvalidFree(_))
    ));
    assert!(matches!(
      space.free(VirtualAddress::new(1000 + 4096)),
      Err(MemsError::InvalidFree(_))
    ));
    assert_eq!(space.stats(), before);

    space.free(a).unwrap();
    assert!(matches!(space.free(a), Err(MemsError::InvalidFree(_))));
  }

  #[test]
  fn test_get_translates_any_mapped_address() {
    let mut space = space();

    let a = space.malloc(10).unwrap();
    let base = space.chunks()[0].physical_base().as_ptr() as usize;

    assert_eq!(space.get(a).unwrap().as_ptr() as usize, base);
    assert_eq!(space.get(a + 4095).unwrap().as_ptr() as usize, base + 4095);
    assert!(matches!(space.get(a + 4096), Err(MemsError::NotMapped(_))));
    assert!(matches!(
      space.get(VirtualAddress::new(999)),
      Err(MemsError::NotMapped(_))
    ));
  }

  #[test]
  fn test_memory_is_usable() {
    let mut space = space();

    let a = space.malloc(64).unwrap();
    let b = space.malloc(64).unwrap();

    unsafe {
      space.get(a).unwrap().as_ptr().write_bytes(0xAA, 64);
      space.get(b).unwrap().as_ptr().write_bytes(0xBB, 64);

      assert_eq!(*space.get(a + 63).unwrap().as_ptr(), 0xAA);
      assert_eq!(*space.get(b).unwrap().as_ptr(), 0xBB);
    }
  }

  #[test]
  fn test_exhaustion_is_atomic() {
    let mut space = AddressSpace::with_backing(HeapBacking::new().with_limit(4096));

    let a = space.malloc(100).unwrap();
    let before = space.stats();
    let cursor = space.cursor();

    let err = space.malloc(5000).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(space.stats(), before);
    assert_eq!(space.cursor(), cursor);

    assert_eq!(space.malloc(3996).unwrap(), a + 100);
  }

  #[test]
  fn test_size_overflow() {
    let mut space = space();

    assert!(matches!(
      space.malloc(usize::MAX),
      Err(MemsError::ResourceExhausted { .. })
    ));
    assert_eq!(space.chunk_count(), 0);
  }

  #[test]
  fn test_finish_resets() {
    let mut space = space();

    let a = space.malloc(100).unwrap();
    space.malloc(5000).unwrap();
    space.malloc(10).unwrap();
    assert_eq!(space.backing().live_blocks(), 2);

    space.finish().unwrap();

    let stats = space.stats();
    assert_eq!(stats.chunk_count, 0);
    assert_eq!(stats.segment_count, 0);
    assert_eq!(stats.pages_used, 0);
    assert_eq!(space.backing().live_blocks(), 0);
    assert_eq!(space.backing().live_bytes(), 0);
    assert_eq!(space.cursor(), VirtualAddress::new(1000));
    assert!(matches!(space.get(a), Err(MemsError::NotMapped(_))));

    assert_eq!(space.malloc(100).unwrap(), a);
    space.finish().unwrap();
  }

  #[test]
  fn test_custom_config() {
    let config = Config::new(256, 0).unwrap();
    let mut space = AddressSpace::init(config, HeapBacking::new());

    let a = space.malloc(300).unwrap();

    assert_eq!(a, VirtualAddress::new(0));
    assert_eq!(space.chunks()[0].size(), 512);
    assert_eq!(space.stats().pages_used, 2);
  }

  #[test]
  fn test_chunks_aligned_to_large_page() {
    let page = 1 << 20;
    let config = Config::new(page, 0).unwrap();
    let mut space = AddressSpace::init(config, HeapBacking::new());

    for _ in 0..8 {
      space.malloc(page).unwrap();
    }

    assert_eq!(space.chunk_count(), 8);
    for chunk in space.chunks() {
      assert_eq!(chunk.size(), page);
      assert_eq!(chunk.physical_base().as_ptr() as usize % page, 0);
    }

    space.finish().unwrap();
    assert_eq!(space.backing().live_blocks(), 0);
  }

  #[cfg(unix)]
  #[test]
  fn test_mmap_chunks_aligned_to_large_page() {
    let page = 1 << 16;
    let config = Config::new(page, 0).unwrap();
    let mut space = AddressSpace::init(config, MmapBacking::new());

    let a = space.malloc(10).unwrap();
    let b = space.malloc(page).unwrap();

    for chunk in space.chunks() {
      assert_eq!(chunk.physical_base().as_ptr() as usize % page, 0);
    }
    unsafe {
      space.get(b).unwrap().as_ptr().write_bytes(0x11, page);
      assert_eq!(*space.get(b + (page - 1)).unwrap().as_ptr(), 0x11);
    }

    space.free(a).unwrap();
    space.finish().unwrap();
  }

  #[test]
  fn test_virtual_address_overflow() {
    let top = VirtualAddress::new(usize::MAX - 1);

    assert_eq!(top.checked_add(1), Some(VirtualAddress::new(usize::MAX)));
    assert_eq!(top.checked_add(2), None);
    assert_eq!(top + 1, VirtualAddress::new(usize::MAX));
  }

  #[test]
  #[should_panic(expected = "overflows")]
  fn test_virtual_address_add_overflow_panics() {
    let _ = VirtualAddress::new(usize::MAX) + 1;
  }

  #[test]
  fn test_invariants_under_churn() {
    let mut space = space();
    let mut live: Vec<(VirtualAddress, usize)> = Vec::new();
    let mut seed: u64 = 0x2545F4914F6CDD1D;

    for _ in 0..500 {
      seed ^= seed << 13;
      seed ^= seed >> 7;
      seed ^= seed << 17;

      if live.is_empty() || seed % 3 != 0 {
        let size = (seed % 6000) as usize + 1;
        let address = space.malloc(size).unwrap();
        live.push((address, size));
      } else {
        let (address, _) = live.swap_remove((seed as usize / 3) % live.len());
        space.free(address).unwrap();
      }

      check_invariants(&space, &live);
    }

    for (address, _) in live.drain(..) {
      space.free(address).unwrap();
    }
    check_invariants(&space, &live);
    assert_eq!(space.stats().live_bytes, 0);
  }

  #[test]
  fn test_drop_releases_backing() {
    let mut backing = HeapBacking::new();

    {
      let mut space = AddressSpace::with_backing(&mut backing);
      space.malloc(10).unwrap();
      space.malloc(10_000).unwrap();
      assert_eq!(space.chunk_count(), 2);
    }

    assert_eq!(backing.live_blocks(), 0);
    assert_eq!(backing.total_acquired(), 2);
  }

  #[cfg(unix)]
  #[test]
  fn test_mmap_backed_space() {
    let mut space = AddressSpace::new();

    let a = space.malloc(4096 * 3).unwrap();
    let b = space.malloc(10).unwrap();

    unsafe {
      let physical = space.get(a).unwrap().as_ptr();
      physical.write_bytes(0x5A, 4096 * 3);
      assert_eq!(*space.get(a + (4096 * 3 - 1)).unwrap().as_ptr(), 0x5A);
    }
    assert_eq!(space.chunk_count(), 2);

    space.free(a).unwrap();
    space.free(b).unwrap();
    space.finish().unwrap();
    assert_eq!(space.stats().chunk_count, 0);
  }
}
