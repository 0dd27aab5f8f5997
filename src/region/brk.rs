use std::{io, ptr::NonNull};

use libc::{c_void, intptr_t, sbrk};
use tracing::{trace, warn};

use super::Region;
use crate::error::RegionError;

/// Region living at the end of the data segment, moved with `sbrk(2)`.
///
/// ```text
///   bottom              top            break
///     │                  │               │
///     ▼                  ▼               ▼
///     ┌──────────────────┬───────────────┐
///     │      in use      │     slack     │
///     └──────────────────┴───────────────┘
/// ```
///
/// The program break is process wide. If anything else (`malloc` included)
/// moves it while this region is alive, the region can no longer extend in
/// place: grows past the slack fail with [`RegionError::BreakMoved`] and
/// shrinks keep the released tail mapped as slack instead of cutting into
/// memory that is no longer ours.
pub struct BrkRegion {
  bottom: Option<NonNull<u8>>,
  len: usize,
  /// Bytes from `bottom` this region obtained from `sbrk`.
  mapped: usize,
}

impl Default for BrkRegion {
  fn default() -> Self {
    Self::new()
  }
}

fn program_break() -> *mut u8 {
  unsafe { sbrk(0) }.cast()
}

/// Moves the break by `delta` and returns the old break.
fn move_break(delta: intptr_t) -> Result<*mut u8, RegionError> {
  let address = unsafe { sbrk(delta) };

  if address == usize::MAX as *mut c_void {
    return Err(io::Error::last_os_error().into());
  }

  Ok(address.cast())
}

/// Lowers the break by `n` bytes previously obtained through [`delta`].
fn lower_break(n: usize) -> Result<(), RegionError> {
  move_break(-(n as intptr_t)).map(|_| ())
}

fn delta(n: usize) -> Result<intptr_t, RegionError> {
  intptr_t::try_from(n).map_err(|_| RegionError::Exhausted {
    requested: n,
    available: intptr_t::MAX as usize,
  })
}

impl BrkRegion {
  pub fn new() -> Self {
    Self {
      bottom: None,
      len: 0,
      mapped: 0,
    }
  }

  /// Bytes mapped past the top that could not be given back yet.
  pub fn slack(&self) -> usize {
    self.mapped - self.len
  }

  fn release_slack(
    &mut self,
    bottom: NonNull<u8>,
  ) {
    let slack = self.slack();
    if slack == 0 {
      return;
    }

    let end = unsafe { bottom.as_ptr().add(self.mapped) };
    if program_break() != end {
      warn!(slack, "program break moved, keeping released bytes mapped");
      return;
    }

    // `slack <= mapped`, which already went through `delta`.
    match lower_break(slack) {
      Ok(_) => self.mapped = self.len,
      Err(error) => warn!(%error, slack, "could not lower program break"),
    }
  }
}

unsafe impl Region for BrkRegion {
  fn bottom(&self) -> Option<NonNull<u8>> {
    self.bottom
  }

  fn len(&self) -> usize {
    self.len
  }

  fn grow_by(
    &mut self,
    n: usize,
  ) -> Result<NonNull<u8>, RegionError> {
    let Some(bottom) = self.bottom else {
      let start = move_break(delta(n)?)?;
      let start = NonNull::new(start)
        .ok_or_else(|| RegionError::Os(io::Error::other("sbrk returned a null break")))?;

      self.bottom = Some(start);
      self.len = n;
      self.mapped = n;
      trace!(grow = n, bottom = ?start, "initialized break region");

      return Ok(start);
    };

    let old_top = unsafe { bottom.add(self.len) };

    let wanted = self.len.checked_add(n).ok_or(RegionError::Exhausted {
      requested: n,
      available: usize::MAX - self.len,
    })?;

    if wanted <= self.mapped {
      self.len = wanted;
      trace!(grow = n, len = self.len, "grew break region from slack");
      return Ok(old_top);
    }

    let extra = wanted - self.mapped;
    let end = unsafe { bottom.as_ptr().add(self.mapped) };

    if program_break() != end {
      return Err(RegionError::BreakMoved);
    }

    let previous = move_break(delta(extra)?)?;

    if previous != end {
      // Someone moved the break between the check and the call. Undo only if
      // the bytes we just got are still at the very top.
      if program_break() == unsafe { previous.add(extra) } {
        if let Err(error) = lower_break(extra) {
          warn!(%error, extra, "could not undo program break move, leaking span");
        }
      } else {
        warn!(extra, "lost a race on the program break, leaking span");
      }

      return Err(RegionError::BreakMoved);
    }

    self.mapped += extra;
    self.len = wanted;
    trace!(grow = n, len = self.len, "grew break region");

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
    trace!(shrink = n, len = self.len, "shrank break region");

    if let Some(bottom) = self.bottom {
      self.release_slack(bottom);
    }
  }
}

impl Drop for BrkRegion {
  fn drop(&mut self) {
    if let Some(bottom) = self.bottom {
      self.len = 0;
      self.release_slack(bottom);
    }
  }
}
