//! # compalloc - A Compacting Heap Allocator
//!
//! This crate provides an allocator that grows and shrinks a single contiguous
//! memory region on demand and never leaves a gap in it: every free slides the
//! bytes above the released block down and gives the freed amount back.
//!
//! ## Overview
//!
//! ```text
//!   Region Layout:
//!
//!   bottom                                                              top
//!     │                                                                  │
//!     ▼                                                                  ▼
//!     ┌────────┬──────────┬────────┬────┬────────┬───────────┬──────────┐
//!     │ Block  │ payload  │ Block  │ pl │ Block  │  payload  │ Sentinel │
//!     │ size 8 │ 8 bytes  │ size 2 │    │ size 9 │  9 bytes  │ size 0   │
//!     │ id 1   │          │ id 4   │    │ id 5   │           │ id 0     │
//!     └────────┴──────────┴────────┴────┴────────┴───────────┴──────────┘
//!
//!   Region size = live headers + live payloads + one sentinel, always.
//! ```
//!
//! Blocks are addressed by [`BlockId`] instead of pointers, because a free
//! moves every block above the freed one:
//!
//! ```text
//!   free(#4):
//!
//!     ┌────────┬──────────┬────────┬────┬────────┬───────────┬──────────┐
//!     │ #1     │          │ #4     │    │ #5     │           │ Sentinel │
//!     └────────┴──────────┴────────┴────┴────────┴───────────┴──────────┘
//!                         ◄─────────────┘◄─── copied down ───────────────
//!     ┌────────┬──────────┬────────┬───────────┬──────────┐
//!     │ #1     │          │ #5     │           │ Sentinel │ ◄── region shrinks
//!     └────────┴──────────┴────────┴───────────┴──────────┘
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   compalloc
//!   ├── align      - Word alignment macro (align!)
//!   ├── block      - Block header, BlockId, BlockInfo
//!   ├── compact    - CompactingAllocator implementation
//!   ├── config     - Config
//!   ├── error      - Error, RegionError
//!   └── region     - Region trait, BrkRegion (sbrk), ReservedRegion (mmap)
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use compalloc::{CompactingAllocator, Config, Error};
//!
//! let mut allocator = CompactingAllocator::reserved(Config::default());
//!
//! let number = allocator.allocate(4)?;
//! allocator.lookup_mut(number)?.copy_from_slice(&10000i32.to_ne_bytes());
//!
//! let text = allocator.allocate(12)?;
//! allocator.lookup_mut(text)?.copy_from_slice(b"HELLO WORLD\0");
//!
//! allocator.free(number)?;
//!
//! assert_eq!(allocator.lookup(text)?, b"HELLO WORLD\0");
//! assert!(matches!(allocator.lookup(number), Err(Error::NotFound(_))));
//! # Ok::<(), compalloc::Error>(())
//! ```
//!
//! ## Costs
//!
//! - **Allocation**: O(1), one region grow.
//! - **Lookup**: O(blocks), linear walk from the bottom.
//! - **Free**: O(blocks + live bytes above the block), walk then copy.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: no synchronization primitives
//! - **No variable alignment**: payloads are byte or (optionally) word aligned
//! - **Unix-only**: regions are backed by `sbrk(2)` or `mmap(2)` through `libc`
//!
//! ## Logging
//!
//! Region and block operations are reported through [`tracing`] at `trace`
//! and `debug` level. The crate never installs a subscriber.

pub mod align;
mod block;
mod compact;
mod config;
mod error;
mod region;

pub use block::{BLOCK_SIZE, BlockId, BlockInfo};
pub use compact::{Blocks, CompactingAllocator};
pub use config::{Config, DEFAULT_CAPACITY};
pub use error::{Error, RegionError, Result};
pub use region::{BrkRegion, Region, ReservedRegion};
