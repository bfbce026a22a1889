use std::fmt;

/// Index of a chunk inside its address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub(crate) usize);

impl ChunkId {
  pub fn index(self) -> usize {
    self.0
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
  Allocated,
  Free,
}

impl SegmentState {
  /// Single-letter tag used in the stats report: `P` for a process
  /// allocation, `H` for a hole.
  pub fn tag(self) -> char {
    match self {
      Self::Allocated => 'P',
      Self::Free => 'H',
    }
  }
}

impl fmt::Display for SegmentState {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match self {
      Self::Allocated => write!(f, "allocated"),
      Self::Free => write!(f, "free"),
    }
  }
}

/// A contiguous byte run inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
  pub offset: usize,
  pub size: usize,
  pub state: SegmentState,
  pub chunk: ChunkId,
}

impl Segment {
  pub fn new(
    offset: usize,
    size: usize,
    state: SegmentState,
    chunk: ChunkId,
  ) -> Self {
    Self {
      offset,
      size,
      state,
      chunk,
    }
  }

  pub fn is_free(&self) -> bool {
    self.state == SegmentState::Free
  }

  /// Offset one past the last byte.
  pub fn end(&self) -> usize {
    self.offset + self.size
  }
}
