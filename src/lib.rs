//! # mems - A Simulated Virtual Memory System
//!
//! This crate provides **MeMS**, a private virtual address space layered on
//! top of page-granular memory obtained from the operating system with
//! `mmap(2)`. Clients ask for blocks of any byte size and get back addresses
//! in MeMS's own simulated space, which can be translated back to the real
//! backing memory at any time.
//!
//! ## Overview
//!
//! The free list has two levels: a main chain of chunks, each backed by a
//! page-aligned mapping, and for every chunk a sub-chain of segments that
//! partitions it into allocated ("process") and free ("hole") runs.
//!
//! ```text
//!   Free List:
//!
//!   ┌─────────┐    ┌───────────┐    ┌───────────┐    ┌───────────────────┐
//!   │ MAIN 0  │───▶│ P 100 B   │───▶│ H 50 B    │───▶│ H ... (rest)      │
//!   │ 1 page  │    └───────────┘    └───────────┘    └───────────────────┘
//!   └────┬────┘
//!        │
//!        ▼
//!   ┌─────────┐    ┌───────────┐    ┌───────────────────┐
//!   │ MAIN 1  │───▶│ P 5000 B  │───▶│ H 3192 B          │
//!   │ 2 pages │    └───────────┘    └───────────────────┘
//!   └─────────┘
//! ```
//!
//! (Holes are never adjacent after a free; the picture above shows the
//! layout right after a split, before any coalescing.)
//!
//! Each chunk owns a slice of the simulated address space that is assigned
//! once and never reused:
//!
//! ```text
//!   Simulated Address Space:
//!
//!   1000               5096                         13288
//!   ├──── MAIN 0 ──────┼────────── MAIN 1 ───────────┤ ◀── cursor
//!   │                  │                             │
//!   ▼                  ▼                             ▼
//!   mmap'd block A     mmap'd block B                next chunk goes here
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   mems
//!   ├── align      - Page rounding (page_align!, round_up)
//!   ├── backing    - BackingStore trait, MmapBacking, HeapBacking
//!   ├── chunk      - Chunk and its segment list transformations
//!   ├── config     - PAGE_SIZE, VIRTUAL_BASE, Config
//!   ├── error      - MemsError
//!   ├── segment    - Segment, SegmentState, ChunkId
//!   ├── space      - AddressSpace (malloc, free, get, finish)
//!   └── stats      - Stats report
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use mems::{AddressSpace, HeapBacking};
//!
//! let mut space = AddressSpace::with_backing(HeapBacking::new());
//!
//! let a = space.malloc(100).unwrap();
//! let b = space.malloc(200).unwrap();
//! space.free(a).unwrap();
//!
//! // The hole left by `a` is reused before the space grows.
//! let c = space.malloc(50).unwrap();
//! assert_eq!(c, a);
//! assert_eq!(space.chunk_count(), 1);
//!
//! unsafe { space.get(b).unwrap().as_ptr().write(42) };
//!
//! space.print_stats();
//! space.finish().unwrap();
//! ```
//!
//! ## How It Works
//!
//! - **malloc** walks chunks in creation order and their segments in offset
//!   order, taking the first hole large enough. The hole is split into the
//!   allocation and a trailing hole. When nothing fits, a new chunk of
//!   `size` rounded up to whole pages is mapped at the cursor.
//! - **free** needs the exact start of a live allocation. The segment turns
//!   into a hole and merges with holes on either side.
//! - **get** translates any address inside a chunk, allocated or not, as
//!   `physical_base + (address - virtual_base)`.
//! - **finish** unmaps every chunk and resets to the initial state.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: wrap the whole address space in one lock if
//!   it has to be shared
//! - **No alignment below page granularity**: allocations inside a chunk are
//!   packed byte-for-byte
//! - **No address reuse**: a chunk's simulated range is never handed out
//!   again until `finish`
//!
//! ## Safety
//!
//! Addresses returned by [`AddressSpace::get`] point into memory owned by
//! the address space. Dereferencing them is `unsafe` and only valid until
//! [`AddressSpace::finish`] or drop.

pub mod align;
mod backing;
mod chunk;
pub mod config;
mod error;
mod segment;
mod space;
mod stats;

#[cfg(unix)]
pub use backing::MmapBacking;
pub use backing::{BackingStore, HeapBacking};
pub use chunk::Chunk;
pub use config::{Config, PAGE_SIZE, VIRTUAL_BASE};
pub use error::{MemsError, Result};
pub use segment::{ChunkId, Segment, SegmentState};
pub use space::{AddressSpace, VirtualAddress};
pub use stats::{ChunkLayout, SegmentLayout, Stats};
