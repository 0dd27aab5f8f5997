use std::{
  io,
  ptr::{self, NonNull},
};

use tracing::{trace, warn};

use super::{Region, page_size};
use crate::error::RegionError;

/// Fixed reservation of address space with a movable top.
///
/// The whole `capacity` is mapped on the first grow with `MAP_NORESERVE`, so
/// the kernel only backs the pages that are actually touched. Shrinking hands
/// every whole page above the new top back with `madvise(MADV_DONTNEED)`,
/// which keeps the resident footprint in step with [`Region::len`].
pub struct ReservedRegion {
  capacity: usize,
  base: Option<NonNull<u8>>,
  len: usize,
  /// Highest `len` since pages were last released.
  high_water: usize,
}

// The mapping is private to this value.
unsafe impl Send for ReservedRegion {}

impl ReservedRegion {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      base: None,
      len: 0,
      high_water: 0,
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  fn reserve(&mut self) -> Result<NonNull<u8>, RegionError> {
    if let Some(base) = self.base {
      return Ok(base);
    }

    let protection = libc::PROT_READ | libc::PROT_WRITE;
    let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

    let address = unsafe { libc::mmap(ptr::null_mut(), self.capacity, protection, flags, -1, 0) };

    if address == libc::MAP_FAILED {
      return Err(io::Error::last_os_error().into());
    }

    let base = NonNull::new(address.cast::<u8>())
      .ok_or_else(|| RegionError::Os(io::Error::other("mmap returned a null mapping")))?;

    trace!(capacity = self.capacity, base = ?base, "reserved region");
    self.base = Some(base);

    Ok(base)
  }

  fn release_pages(
    &mut self,
    base: NonNull<u8>,
  ) {
    let page = page_size();
    let keep = align_up(self.len, page);
    let touched = align_up(self.high_water, page).min(self.capacity);

    if touched > keep {
      let start = unsafe { base.as_ptr().add(keep) };
      match discard(start, touched - keep) {
        Ok(()) => trace!(offset = keep, bytes = touched - keep, "released pages"),
        Err(error) => warn!(%error, offset = keep, bytes = touched - keep, "could not release pages"),
      }
    }

    self.high_water = self.len;
  }
}

/// Hands `len` bytes at page-aligned `start` back to the kernel.
fn discard(
  start: *mut u8,
  len: usize,
) -> io::Result<()> {
  match unsafe { libc::madvise(start.cast(), len, libc::MADV_DONTNEED) } {
    0 => Ok(()),
    _ => Err(io::Error::last_os_error()),
  }
}

fn align_up(
  value: usize,
  to: usize,
) -> usize {
  value.div_ceil(to) * to
}

unsafe impl Region for ReservedRegion {
  fn bottom(&self) -> Option<NonNull<u8>> {
    self.base
  }

  fn len(&self) -> usize {
    self.len
  }

  fn grow_by(
    &mut self,
    n: usize,
  ) -> Result<NonNull<u8>, RegionError> {
    let available = self.capacity - self.len;
    if n > available {
      return Err(RegionError::Exhausted {
        requested: n,
        available,
      });
    }

    let base = self.reserve()?;
    let old_top = unsafe { base.add(self.len) };

    self.len += n;
    self.high_water = self.high_water.max(self.len);
    trace!(grow = n, len = self.len, "grew reserved region");

    Ok(old_top)
  }

  fn shrink_by(
    &mut self,
    n: usize,
  ) {
    assert!(
      n <= self.len,
      "cannot shrink region of {} bytes by {n} bytes",
      self.len
    );

    self.len -= n;
    trace!(shrink = n, len = self.len, "shrank reserved region");

    if let Some(base) = self.base {
      self.release_pages(base);
    }
  }
}

impl Drop for ReservedRegion {
  fn drop(&mut self) {
    if let Some(base) = self.base.take() {
      unsafe { libc::munmap(base.as_ptr().cast(), self.capacity) };
    }
  }
}
