//! Read-only utilization reports.

use std::fmt;

use crate::{chunk::Chunk, segment::SegmentState};

/// One segment as seen from the simulated address space. `end` is
/// exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
  pub start: usize,
  pub end: usize,
  pub state: SegmentState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkLayout {
  pub start: usize,
  pub end: usize,
  pub segments: Vec<SegmentLayout>,
}

/// Snapshot of an address space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
  /// Pages backing every chunk
  pub pages_used: usize,
  /// Bytes sitting in free segments
  pub space_unused: usize,
  /// Bytes handed out and not yet freed
  pub live_bytes: usize,
  pub chunk_count: usize,
  pub segment_count: usize,
  pub chunks: Vec<ChunkLayout>,
}

impl Stats {
  pub(crate) fn collect<'a>(
    chunks: impl IntoIterator<Item = &'a Chunk>,
    page_size: usize,
  ) -> Self {
    let mut stats = Self::default();

    for chunk in chunks {
      let base = chunk.virtual_base();

      let segments: Vec<SegmentLayout> = chunk
        .segments()
        .iter()
        .map(|segment| SegmentLayout {
          start: base + segment.offset,
          end: base + segment.end(),
          state: segment.state,
        })
        .collect();

      let free = chunk.free_bytes();

      stats.pages_used += chunk.size() / page_size;
      stats.space_unused += free;
      stats.live_bytes += chunk.size() - free;
      stats.chunk_count += 1;
      stats.segment_count += segments.len();
      stats.chunks.push(ChunkLayout {
        start: base,
        end: base + chunk.size(),
        segments,
      });
    }

    stats
  }

  /// Number of segments in each chunk, in chunk order.
  pub fn sub_chain_lengths(&self) -> Vec<usize> {
    self.chunks.iter().map(|chunk| chunk.segments.len()).collect()
  }
}

impl fmt::Display for Stats {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    writeln!(f, "----- MeMS SYSTEM STATS -----")?;

    for chunk in &self.chunks {
      write!(f, "MAIN[{}:{}]-> ", chunk.start, chunk.end - 1)?;
      for segment in &chunk.segments {
        write!(
          f,
          "{}[{}:{}] <-> ",
          segment.state.tag(),
          segment.start,
          segment.end - 1
        )?;
      }
      writeln!(f, "NULL")?;
    }

    writeln!(f, "Pages used: {}", self.pages_used)?;
    writeln!(f, "Space unused: {}", self.space_unused)?;
    writeln!(f, "Main Chain Length: {}", self.chunk_count)?;
    writeln!(f, "Segments: {}", self.segment_count)?;
    writeln!(f, "Sub-chain Length array: {:?}", self.sub_chain_lengths())?;
    write!(f, "-----------------------------")
  }
}
