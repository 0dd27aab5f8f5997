//! Growable, contiguous memory at the top of one span.
//!
//! ```text
//!   bottom                                   current_top
//!     │                                           │
//!     ▼                                           ▼
//!     ┌───────────────────────────────────────────┐
//!     │            owned by the region            │  grow_by(n) ──►
//!     └───────────────────────────────────────────┘  ◄── shrink_by(n)
//! ```
//!
//! Two backends are provided: [`BrkRegion`] moves the process program break
//! with `sbrk(2)`, [`ReservedRegion`] reserves a fixed span of address space
//! with `mmap(2)` once and moves a top pointer inside it.

use std::ptr::NonNull;

use crate::error::RegionError;

mod brk;
mod reserved;

pub use brk::BrkRegion;
pub use reserved::ReservedRegion;

/// Capability to grow and shrink one contiguous span of memory at its top.
///
/// # Safety
///
/// Implementors guarantee that, once [`Region::bottom`] returns `Some`, the
/// address never changes for the lifetime of the value and that every byte in
/// `[bottom, current_top)` is readable, writable and not aliased by anything
/// outside the region. Bytes keep their contents across grows and across
/// shrinks that do not release them.
pub unsafe trait Region {
  /// Lowest address of the region, `None` until the first successful grow.
  fn bottom(&self) -> Option<NonNull<u8>>;

  /// Number of bytes in `[bottom, current_top)`.
  fn len(&self) -> usize;

  /// Extends the region by `n` bytes and returns the old top, which is where
  /// the new bytes start. On failure the region is left untouched.
  fn grow_by(
    &mut self,
    n: usize,
  ) -> Result<NonNull<u8>, RegionError>;

  /// Gives the topmost `n` bytes back.
  ///
  /// # Panics
  ///
  /// If `n` is larger than [`Region::len`].
  fn shrink_by(
    &mut self,
    n: usize,
  );

  /// Address right after the last byte of the region.
  fn current_top(&self) -> Option<NonNull<u8>> {
    // In bounds: it is one past the end of the owned span.
    self.bottom().map(|bottom| unsafe { bottom.add(self.len()) })
  }

  fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Virtual memory page size, queried once through `sysconf`.
pub(crate) fn page_size() -> usize {
  use std::sync::OnceLock;

  static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

  *PAGE_SIZE.get_or_init(|| match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
    size if size > 0 => size as usize,
    _ => 4096,
  })
}
