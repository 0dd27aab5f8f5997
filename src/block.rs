use std::{fmt, mem, ptr::NonNull};

/// Opaque handle for one live allocation.
///
/// Ids are issued by [`CompactingAllocator::allocate`](crate::CompactingAllocator::allocate)
/// from a counter that starts at 1 and is never rolled back, so an id is never
/// handed out twice. The raw value 0 belongs to the sentinel and never names a
/// live block.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(usize);

impl BlockId {
  pub(crate) const SENTINEL: BlockId = BlockId(0);

  pub const fn new(raw: usize) -> Self {
    Self(raw)
  }

  pub const fn get(self) -> usize {
    self.0
  }

  pub const fn is_sentinel(self) -> bool {
    self.0 == 0
  }
}

impl From<usize> for BlockId {
  fn from(raw: usize) -> Self {
    Self(raw)
  }
}

impl fmt::Display for BlockId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// In-band header written right before every payload.
///
/// The region is nothing but a run of these headers, each followed by `size`
/// payload bytes, closed by a sentinel header (`size = 0, id = 0`). Payload
/// sizes are arbitrary, so headers are only ever accessed unaligned.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Block {
  pub size: usize,
  pub id: BlockId,
}

/// Size in bytes of one [`Block`] header.
pub const BLOCK_SIZE: usize = mem::size_of::<Block>();

impl Block {
  pub const SENTINEL: Block = Block::new(0, BlockId::SENTINEL);

  pub const fn new(
    size: usize,
    id: BlockId,
  ) -> Self {
    Self { size, id }
  }

  pub fn is_sentinel(&self) -> bool {
    self.id.is_sentinel()
  }

  /// Header plus payload.
  pub fn total_size(&self) -> usize {
    BLOCK_SIZE + self.size
  }

  /// # Safety
  ///
  /// `at` must point to `BLOCK_SIZE` readable bytes.
  pub unsafe fn read(at: NonNull<u8>) -> Self {
    unsafe { at.cast::<Block>().as_ptr().read_unaligned() }
  }

  /// # Safety
  ///
  /// `at` must point to `BLOCK_SIZE` writable bytes.
  pub unsafe fn write(
    self,
    at: NonNull<u8>,
  ) {
    unsafe { at.cast::<Block>().as_ptr().write_unaligned(self) }
  }
}

/// Snapshot of one live block, as reported by
/// [`CompactingAllocator::blocks`](crate::CompactingAllocator::blocks).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  pub id: BlockId,
  /// Payload length in bytes.
  pub size: usize,
  /// Offset of the header from the bottom of the region.
  pub offset: usize,
}

impl BlockInfo {
  /// Offset of the first payload byte from the bottom of the region.
  pub fn payload_offset(&self) -> usize {
    self.offset + BLOCK_SIZE
  }
}
