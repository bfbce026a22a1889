use std::ptr::NonNull;

use log::trace;

use crate::segment::{ChunkId, Segment, SegmentState};

/// A page-aligned block of backing memory mapped at a fixed slice of the
/// simulated address space.
///
/// ```text
///   virtual_base                                    virtual_base + size
///   ▼                                                                 ▼
///   ┌─────────────┬─────────────┬─────────────┬────────────────────────┐
///   │ P [0:100)   │ H [100:150) │ P [150:300) │ H [300:size)           │
///   └─────────────┴─────────────┴─────────────┴────────────────────────┘
/// ```
///
/// The segments always partition `[0, size)` in offset order, and no two
/// neighbours are both free once a free has completed.
#[derive(Debug)]
pub struct Chunk {
  id: ChunkId,
  virtual_base: usize,
  size: usize,
  physical_base: NonNull<u8>,
  segments: Vec<Segment>,
}

impl Chunk {
  pub(crate) fn new(
    id: ChunkId,
    virtual_base: usize,
    size: usize,
    physical_base: NonNull<u8>,
  ) -> Self {
    let chunk = Self {
      id,
      virtual_base,
      size,
      physical_base,
      segments: vec![Segment::new(0, size, SegmentState::Free, id)],
    };

    debug_assert!(chunk.is_partitioned());
    chunk
  }

  pub fn id(&self) -> ChunkId {
    self.id
  }

  pub fn virtual_base(&self) -> usize {
    self.virtual_base
  }

  pub fn size(&self) -> usize {
    self.size
  }

  pub fn physical_base(&self) -> NonNull<u8> {
    self.physical_base
  }

  pub fn segments(&self) -> &[Segment] {
    &self.segments
  }

  /// Whether `address` falls inside `[virtual_base, virtual_base + size)`.
  pub fn contains(
    &self,
    address: usize,
  ) -> bool {
    address >= self.virtual_base && address - self.virtual_base < self.size
  }

  pub fn free_bytes(&self) -> usize {
    self
      .segments
      .iter()
      .filter(|segment| segment.is_free())
      .map(|segment| segment.size)
      .sum()
  }

  /// Index of the first free segment that can hold `size` bytes.
  pub(crate) fn first_fit(
    &self,
    size: usize,
  ) -> Option<usize> {
    self
      .segments
      .iter()
      .position(|segment| segment.is_free() && segment.size >= size)
  }

  /// Index of the segment starting exactly at `offset`.
  pub(crate) fn segment_at(
    &self,
    offset: usize,
  ) -> Option<usize> {
    self
      .segments
      .binary_search_by_key(&offset, |segment| segment.offset)
      .ok()
  }

  /// Allocates the first `size` bytes of the free segment at `index` and
  /// returns their offset. Any remainder stays behind as a free segment.
  pub(crate) fn carve(
    &mut self,
    index: usize,
    size: usize,
  ) -> usize {
    let segment = self.segments[index];
    debug_assert!(segment.is_free() && segment.size >= size && size > 0);

    self.segments[index] = Segment::new(segment.offset, size, SegmentState::Allocated, self.id);

    if segment.size > size {
      let remainder = Segment::new(
        segment.offset + size,
        segment.size - size,
        SegmentState::Free,
        self.id,
      );
      trace!(
        "chunk {}: split [{}:{}) at {}",
        self.id.0,
        segment.offset,
        segment.end(),
        remainder.offset
      );
      self.segments.insert(index + 1, remainder);
    }

    debug_assert!(self.is_partitioned());
    segment.offset
  }

  /// Marks the allocated segment at `index` free and merges it with free
  /// neighbours on both sides. Returns the index of the resulting segment.
  pub(crate) fn release(
    &mut self,
    index: usize,
  ) -> usize {
    debug_assert!(!self.segments[index].is_free());

    let mut index = index;
    self.segments[index].state = SegmentState::Free;

    if index > 0 && self.segments[index - 1].is_free() {
      let merged = self.segments.remove(index);
      index -= 1;
      self.segments[index].size += merged.size;
      trace!("chunk {}: merged {} into previous hole", self.id.0, merged.offset);
    }

    if index + 1 < self.segments.len() && self.segments[index + 1].is_free() {
      let merged = self.segments.remove(index + 1);
      self.segments[index].size += merged.size;
      trace!("chunk {}: merged next hole {} in", self.id.0, merged.offset);
    }

    debug_assert!(self.is_partitioned());
    debug_assert!(self.has_no_adjacent_holes());
    index
  }

  /// Segments start at 0, follow each other without gaps, and add up to
  /// the chunk size.
  pub fn is_partitioned(&self) -> bool {
    let mut expected = 0;

    for segment in &self.segments {
      if segment.offset != expected || segment.size == 0 || segment.chunk != self.id {
        return false;
      }
      expected += segment.size;
    }

    expected == self.size
  }

  pub fn has_no_adjacent_holes(&self) -> bool {
    self
      .segments
      .windows(2)
      .all(|pair| !(pair[0].is_free() && pair[1].is_free()))
  }
}
