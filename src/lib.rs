//! # tagalloc - A Boundary-Tag Heap Allocator
//!
//! This crate provides a user-space heap that takes memory straight from the
//! OS with anonymous `mmap(2)` mappings and keeps all of its bookkeeping inside
//! those mappings, using **boundary tags**.
//!
//! ## Overview
//!
//! Memory is organised in pages. Each page is one mapping, a multiple of the
//! OS page size, and holds a run of variable-size blocks:
//!
//! ```text
//!   Heap:
//!
//!   head ─► ┌──────────┐ next ┌──────────┐ next ┌──────────┐
//!           │  page 3  │ ───► │  page 2  │ ───► │  page 1  │ ───► none
//!   none ◄─ │ (newest) │ ◄─── │          │ ◄─── │ (oldest) │
//!           └──────────┘ prev └──────────┘ prev └──────────┘
//!
//!   One page:
//!
//!   ┌──────┬──────┬───┬───────────┬──────────────────┬─────────┬───┬──────┬──────┐
//!   │ prev │ size │ 0 │  A (used) │     B (free)     │ C (used)│ 0 │ size │ next │
//!   └──────┴──────┴───┴───────────┴──────────────────┴─────────┴───┴──────┴──────┘
//!                   ▲                                            ▲
//!                   └──────── sentinels stop traversal ──────────┘
//! ```
//!
//! Every block carries its size at both ends, with bit 0 of the size word set
//! while the block is allocated:
//!
//! ```text
//!   ┌──────────┬──────────────────────────────┬──────────┐
//!   │ size | A │           payload            │ size | A │
//!   └──────────┴──────────────────────────────┴──────────┘
//!              ▲
//!              └── pointer returned to the caller
//! ```
//!
//! so both neighbours of a block are found with address arithmetic alone.
//!
//! ## Crate Structure
//!
//! ```text
//!   tagalloc
//!   ├── align      - Rounding macros (align!, align_to!)
//!   ├── tag        - Boundary-tag word layout
//!   ├── block      - Block view, splitting and coalescing (internal)
//!   ├── page       - Page Manager: mmap/munmap, page header, page list
//!   ├── heap       - Heap: search, allocate, free
//!   ├── config     - HeapConfig and SearchMode
//!   ├── error      - HeapError
//!   └── snapshot   - Structured heap dump
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use tagalloc::Heap;
//!
//! let mut heap = Heap::new();
//!
//! let ptr = heap.allocate(64).unwrap();
//! unsafe {
//!   ptr.as_ptr().write_bytes(0xAB, 64);
//!   heap.free(ptr).unwrap();
//! }
//!
//! assert!(heap.is_empty());
//! ```
//!
//! ## How It Works
//!
//! - **allocate**: the best-fitting free block across all pages is chosen
//!   (first fit with [`SearchMode::FirstFit`]). When nothing fits, a new page
//!   just large enough for the request is mapped and becomes the head. The
//!   chosen block is split when the remainder can stand as a block of its own.
//! - **free**: the block is marked free. If its page holds no other live
//!   allocation, the page is unmapped right away; otherwise the block merges
//!   with any free neighbour.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: `Heap` is neither `Send` nor `Sync`
//! - **Word alignment only**: payloads are aligned to [`tag::WORD_SIZE`]
//! - **Linear search**: allocation scans every block of every page
//! - **Unix-only**: Requires `libc` and `mmap` (POSIX systems)
//!
//! ## Logging
//!
//! Page traffic is reported through the [`log`] facade at `debug` level and
//! individual allocations at `trace` level. No logger is installed here.

pub mod align;
mod block;
mod config;
mod error;
mod heap;
pub mod page;
mod snapshot;
pub mod tag;

pub use config::{HeapConfig, SearchMode, os_page_size};
pub use error::HeapError;
pub use heap::Heap;
pub use snapshot::{BlockSnapshot, HeapSnapshot, PageSnapshot};
