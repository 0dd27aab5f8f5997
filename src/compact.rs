use std::{
  marker::PhantomData,
  ptr::{self, NonNull},
  slice,
};

use tracing::debug;

use crate::{
  Config,
  align::checked_word_align,
  block::{BLOCK_SIZE, Block, BlockId, BlockInfo},
  error::{Error, Result},
  region::{BrkRegion, Region, ReservedRegion},
};

/// Allocator that keeps its region free of gaps.
///
/// Every block is a header followed by its payload, packed back to back from
/// the bottom of the region and closed by a sentinel header. Freeing a block
/// slides everything above it down by the block's total size and shrinks the
/// region by the same amount, so the region always holds exactly the live
/// blocks plus one sentinel.
///
/// Callers refer to blocks by [`BlockId`]. Addresses move on every
/// [`free`](Self::free); payload slices borrow the allocator, so they cannot
/// outlive the next mutating call.
pub struct CompactingAllocator<R: Region> {
  region: R,
  config: Config,
  /// Set by the first allocation and never moved afterwards.
  bottom: Option<NonNull<u8>>,
  /// Offset of the sentinel header from `bottom`.
  sentinel: usize,
  next_id: usize,
}

impl CompactingAllocator<ReservedRegion> {
  /// Allocator over a fresh [`ReservedRegion`] of `config.capacity` bytes.
  pub fn reserved(config: Config) -> Self {
    Self::with_config(ReservedRegion::new(config.capacity), config)
  }
}

impl CompactingAllocator<BrkRegion> {
  /// Allocator over the process program break.
  pub fn brk(config: Config) -> Self {
    Self::with_config(BrkRegion::new(), config)
  }
}

impl<R: Region> CompactingAllocator<R> {
  pub fn new(region: R) -> Self {
    Self::with_config(region, Config::default())
  }

  pub fn with_config(
    region: R,
    config: Config,
  ) -> Self {
    Self {
      region,
      config,
      bottom: None,
      sentinel: 0,
      next_id: 1,
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn region(&self) -> &R {
    &self.region
  }

  /// Address `offset` bytes above the bottom.
  ///
  /// # Safety
  ///
  /// `bottom` must be set and `offset` at most `sentinel + BLOCK_SIZE`.
  unsafe fn at(
    bottom: NonNull<u8>,
    offset: usize,
  ) -> NonNull<u8> {
    unsafe { bottom.add(offset) }
  }

  /// Payload size recorded in the header for a request of `size` bytes.
  fn payload_size(
    &self,
    size: usize,
  ) -> Result<usize> {
    let padded = if self.config.word_align {
      checked_word_align(size)
    } else {
      Some(size)
    };

    padded
      .filter(|&padded| {
        padded
          .checked_add(2 * BLOCK_SIZE)
          .is_some_and(|total| total <= isize::MAX as usize)
      })
      .ok_or(Error::InvalidSize(size))
  }

  /// Reserves `size` payload bytes and returns the id of the new block.
  ///
  /// The new header takes the place of the current sentinel and a fresh
  /// sentinel is written after the payload. A zero sized block is valid: it
  /// differs from the sentinel only by its id. On failure the region and the
  /// id counter are left exactly as they were.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<BlockId> {
    let size = self.payload_size(size)?;
    let total = BLOCK_SIZE + size;

    // The first allocation also creates the region, so header, payload and
    // sentinel come from one grow and a failure leaves nothing behind.
    let (bottom, offset) = match self.bottom {
      Some(bottom) => {
        let grown = self
          .region
          .grow_by(total)
          .map_err(|source| Error::out_of_memory(total, source))?;
        debug_assert_eq!(grown, unsafe { Self::at(bottom, self.sentinel + BLOCK_SIZE) });

        (bottom, self.sentinel)
      }
      None => {
        let bottom = self
          .region
          .grow_by(total + BLOCK_SIZE)
          .map_err(|source| Error::out_of_memory(total + BLOCK_SIZE, source))?;
        debug!(bottom = ?bottom, "initialized region");

        (bottom, 0)
      }
    };

    let id = BlockId::new(self.next_id);

    unsafe {
      Block::new(size, id).write(Self::at(bottom, offset));
      Block::SENTINEL.write(Self::at(bottom, offset + total));
    }

    self.bottom = Some(bottom);
    self.sentinel = offset + total;
    self.next_id += 1;
    debug!(%id, size, offset, region = self.region_len(), "allocated block");

    Ok(id)
  }

  /// Iterates over live blocks from the bottom of the region up.
  pub fn blocks(&self) -> Blocks<'_> {
    Blocks {
      bottom: self.bottom,
      offset: 0,
      _allocator: PhantomData,
    }
  }

  fn find(
    &self,
    id: BlockId,
  ) -> Result<BlockInfo> {
    if id.is_sentinel() {
      return Err(Error::NotFound(id));
    }

    self
      .blocks()
      .find(|block| block.id == id)
      .ok_or(Error::NotFound(id))
  }

  /// Payload address and length of block `id`.
  fn payload(
    &self,
    id: BlockId,
  ) -> Result<(NonNull<u8>, usize)> {
    let block = self.find(id)?;
    // `find` only succeeds once `bottom` is set.
    let bottom = self.bottom.ok_or(Error::NotFound(id))?;

    Ok((unsafe { Self::at(bottom, block.payload_offset()) }, block.size))
  }

  /// Address of the payload of block `id`.
  ///
  /// The address is only valid until the next [`allocate`](Self::allocate)
  /// or [`free`](Self::free) on this allocator. Prefer [`lookup`](Self::lookup)
  /// and [`lookup_mut`](Self::lookup_mut), which enforce that through the
  /// borrow.
  pub fn payload_ptr(
    &self,
    id: BlockId,
  ) -> Result<NonNull<u8>> {
    self.payload(id).map(|(payload, _)| payload)
  }

  pub fn lookup(
    &self,
    id: BlockId,
  ) -> Result<&[u8]> {
    let (payload, size) = self.payload(id)?;

    Ok(unsafe { slice::from_raw_parts(payload.as_ptr(), size) })
  }

  pub fn lookup_mut(
    &mut self,
    id: BlockId,
  ) -> Result<&mut [u8]> {
    let (payload, size) = self.payload(id)?;

    Ok(unsafe { slice::from_raw_parts_mut(payload.as_ptr(), size) })
  }

  /// Releases block `id`.
  ///
  /// ```text
  ///   before:  ┌────┬─────┬────┬──────┬────┬────┐
  ///            │ H1 │ P1  │ H2 │  P2  │ H3 │ S  │
  ///            └────┴─────┴────┴──────┴────┴────┘
  ///                       ◄────total──►
  ///   after:   ┌────┬─────┬────┬────┐
  ///            │ H1 │ P1  │ H3 │ S  │
  ///            └────┴─────┴────┴────┘
  /// ```
  ///
  /// Everything above the block, sentinel included, moves down by the block's
  /// total size and the region shrinks by the same amount. Payload addresses
  /// of every block above the freed one change.
  pub fn free(
    &mut self,
    id: BlockId,
  ) -> Result<()> {
    let block = self.find(id)?;
    let bottom = self.bottom.ok_or(Error::NotFound(id))?;

    let total = BLOCK_SIZE + block.size;
    let above = block.offset + total;
    let tail = self.sentinel + BLOCK_SIZE - above;

    unsafe {
      ptr::copy(
        Self::at(bottom, above).as_ptr(),
        Self::at(bottom, block.offset).as_ptr(),
        tail,
      );
    }

    self.sentinel -= total;
    self.region.shrink_by(total);
    debug!(%id, size = block.size, moved = tail, region = self.region_len(), "freed block");

    Ok(())
  }

  /// Payload length of block `id`.
  pub fn size_of(
    &self,
    id: BlockId,
  ) -> Result<usize> {
    self.find(id).map(|block| block.size)
  }

  pub fn contains(
    &self,
    id: BlockId,
  ) -> bool {
    self.find(id).is_ok()
  }

  /// Number of live blocks.
  pub fn len(&self) -> usize {
    self.blocks().count()
  }

  pub fn is_empty(&self) -> bool {
    self.blocks().next().is_none()
  }

  /// Bytes between the bottom of the region and the end of the sentinel, 0
  /// before the first allocation.
  pub fn region_len(&self) -> usize {
    self.bottom.map_or(0, |_| self.sentinel + BLOCK_SIZE)
  }

  /// Id the next allocation will receive.
  pub fn next_id(&self) -> BlockId {
    BlockId::new(self.next_id)
  }

  /// Walks the whole region and verifies its layout: records are back to
  /// back with no gaps, ids increase strictly from the bottom up and stay
  /// below the id counter, and the only sentinel sits exactly at the top of
  /// the region.
  pub fn check(&self) -> Result<()> {
    let Some(bottom) = self.bottom else {
      if self.region.is_empty() {
        return Ok(());
      }
      return Err(Error::Corrupted(format!(
        "region holds {} bytes before the first allocation",
        self.region.len()
      )));
    };

    let end = self.region.len();
    if end != self.sentinel + BLOCK_SIZE {
      return Err(Error::Corrupted(format!(
        "region is {end} bytes but the sentinel ends at {}",
        self.sentinel + BLOCK_SIZE
      )));
    }

    let mut offset = 0;
    let mut last = 0;

    loop {
      if end - offset < BLOCK_SIZE {
        return Err(Error::Corrupted(format!(
          "header at offset {offset} overruns the region"
        )));
      }

      let block = unsafe { Block::read(Self::at(bottom, offset)) };

      if block.is_sentinel() {
        if block.size != 0 {
          return Err(Error::Corrupted(format!(
            "sentinel at offset {offset} has size {}",
            block.size
          )));
        }
        if offset != self.sentinel {
          return Err(Error::Corrupted(format!(
            "sentinel found at offset {offset}, expected {}",
            self.sentinel
          )));
        }
        return Ok(());
      }

      let id = block.id.get();
      if id <= last || id >= self.next_id {
        return Err(Error::Corrupted(format!(
          "block id {id} at offset {offset} out of order"
        )));
      }

      offset = match offset.checked_add(block.total_size()) {
        Some(next) if next <= end => next,
        _ => {
          return Err(Error::Corrupted(format!(
            "block {id} at offset {offset} with size {} overruns the region",
            block.size
          )));
        }
      };
      last = id;
    }
  }
}

/// Iterator over live blocks, see [`CompactingAllocator::blocks`].
pub struct Blocks<'a> {
  bottom: Option<NonNull<u8>>,
  offset: usize,
  _allocator: PhantomData<&'a ()>,
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<Self::Item> {
    let bottom = self.bottom?;
    let block = unsafe { Block::read(bottom.add(self.offset)) };

    if block.is_sentinel() {
      self.bottom = None;
      return None;
    }

    let info = BlockInfo {
      id: block.id,
      size: block.size,
      offset: self.offset,
    };
    self.offset += block.total_size();

    Some(info)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::RegionError;

  fn allocator() -> CompactingAllocator<ReservedRegion> {
    CompactingAllocator::reserved(Config::default().capacity(1 << 20))
  }

  fn store(
    allocator: &mut CompactingAllocator<ReservedRegion>,
    bytes: &[u8],
  ) -> BlockId {
    let id = allocator.allocate(bytes.len()).unwrap();
    allocator.lookup_mut(id).unwrap().copy_from_slice(bytes);
    id
  }

  fn read_i32(
    allocator: &CompactingAllocator<ReservedRegion>,
    id: BlockId,
  ) -> i32 {
    i32::from_ne_bytes(allocator.lookup(id).unwrap().try_into().unwrap())
  }

  /// Small deterministic generator so sequences are reproducible.
  struct XorShift(u64);

  impl XorShift {
    fn next(&mut self) -> u64 {
      self.0 ^= self.0 << 13;
      self.0 ^= self.0 >> 7;
      self.0 ^= self.0 << 17;
      self.0
    }

    fn below(
      &mut self,
      bound: u64,
    ) -> usize {
      (self.next() % bound) as usize
    }
  }

  #[test]
  fn test_scenario() {
    let mut allocator = allocator();

    let first = store(&mut allocator, &1i32.to_ne_bytes());
    let second = store(&mut allocator, &10000i32.to_ne_bytes());
    let text = store(&mut allocator, b"HELLO WORLD\0");

    assert_eq!(first, BlockId::new(1));
    assert_eq!(second, BlockId::new(2));
    assert_eq!(text, BlockId::new(3));

    assert_eq!(read_i32(&allocator, first), 1);
    assert_eq!(allocator.lookup(text).unwrap(), b"HELLO WORLD\0");

    allocator.free(first).unwrap();

    assert_eq!(read_i32(&allocator, second), 10000);
    assert_eq!(allocator.lookup(text).unwrap(), b"HELLO WORLD\0");
    assert!(matches!(allocator.lookup(first), Err(Error::NotFound(id)) if id == first));
    allocator.check().unwrap();
  }

  #[test]
  fn test_generic_region_constructor() {
    let mut allocator = CompactingAllocator::new(ReservedRegion::new(4096));
    assert_eq!(allocator.config(), &Config::default());
    assert_eq!(allocator.region().capacity(), 4096);

    let id = allocator.allocate(3).unwrap();
    allocator.lookup_mut(id).unwrap().copy_from_slice(b"abc");

    let info: Vec<_> = allocator.blocks().collect();
    assert_eq!(info, vec![BlockInfo { id, size: 3, offset: 0 }]);
    assert_eq!(info[0].payload_offset(), BLOCK_SIZE);
    assert_eq!(allocator.lookup(id).unwrap(), b"abc");
  }

  #[test]
  fn test_first_allocation_creates_sentinel() {
    let mut allocator = allocator();
    assert_eq!(allocator.region_len(), 0);
    assert!(allocator.region().bottom().is_none());
    allocator.check().unwrap();

    allocator.allocate(4).unwrap();

    assert_eq!(allocator.region_len(), 2 * BLOCK_SIZE + 4);
    assert_eq!(allocator.region().len(), allocator.region_len());
  }

  #[test]
  fn test_shrink_to_empty() {
    let mut allocator = allocator();

    let id = allocator.allocate(100).unwrap();
    let bottom = allocator.region().bottom();
    allocator.free(id).unwrap();

    assert!(allocator.is_empty());
    assert_eq!(allocator.region_len(), BLOCK_SIZE);
    assert_eq!(allocator.region().len(), BLOCK_SIZE);
    // The bottom stays put once the region exists.
    assert_eq!(allocator.region().bottom(), bottom);
    allocator.check().unwrap();
  }

  #[test]
  fn test_ids_are_never_reused() {
    let mut allocator = allocator();
    let mut previous = BlockId::SENTINEL;

    for round in 0..50 {
      let id = allocator.allocate(round % 7).unwrap();
      assert!(id > previous);
      previous = id;

      if round % 3 == 0 {
        allocator.free(id).unwrap();
      }
    }

    assert_eq!(allocator.next_id(), BlockId::new(51));
  }

  #[test]
  fn test_unknown_ids_are_rejected() {
    let mut allocator = allocator();

    assert!(matches!(allocator.lookup(BlockId::new(0)), Err(Error::NotFound(_))));
    assert!(matches!(allocator.free(BlockId::new(1)), Err(Error::NotFound(_))));

    let id = allocator.allocate(8).unwrap();
    let before = allocator.region_len();

    assert!(matches!(allocator.lookup(BlockId::new(0)), Err(Error::NotFound(_))));
    assert!(matches!(allocator.free(BlockId::new(0)), Err(Error::NotFound(_))));
    assert!(matches!(allocator.free(BlockId::new(99)), Err(Error::NotFound(_))));

    allocator.free(id).unwrap();
    assert!(matches!(allocator.free(id), Err(Error::NotFound(_))));
    assert!(!allocator.contains(id));
    assert_eq!(allocator.region_len(), before - BLOCK_SIZE - 8);
  }

  #[test]
  fn test_zero_sized_blocks() {
    let mut allocator = allocator();

    let empty = allocator.allocate(0).unwrap();
    let value = store(&mut allocator, &7i32.to_ne_bytes());

    assert!(allocator.lookup(empty).unwrap().is_empty());
    assert_eq!(allocator.size_of(empty).unwrap(), 0);
    assert_eq!(allocator.len(), 2);
    assert_eq!(read_i32(&allocator, value), 7);
    allocator.check().unwrap();

    allocator.free(empty).unwrap();
    assert_eq!(read_i32(&allocator, value), 7);
    assert_eq!(allocator.region_len(), 2 * BLOCK_SIZE + 4);
  }

  #[test]
  fn test_free_preserves_order() {
    let mut allocator = allocator();
    let ids: Vec<_> = (1..=5).map(|size| allocator.allocate(size).unwrap()).collect();

    allocator.free(ids[1]).unwrap();

    let blocks: Vec<_> = allocator.blocks().collect();
    let order: Vec<_> = blocks.iter().map(|block| block.id).collect();
    assert_eq!(order, vec![ids[0], ids[2], ids[3], ids[4]]);

    let mut offset = 0;
    for block in &blocks {
      assert_eq!(block.offset, offset);
      offset += BLOCK_SIZE + block.size;
    }
    assert_eq!(offset + BLOCK_SIZE, allocator.region_len());
  }

  #[test]
  fn test_random_sequences_keep_invariants() {
    let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
    let mut allocator = allocator();
    let mut live: Vec<(BlockId, Vec<u8>)> = Vec::new();

    for step in 0..1500 {
      if live.is_empty() || rng.below(3) != 0 {
        let size = rng.below(96);
        let fill: Vec<u8> = (0..size).map(|_| rng.next() as u8).collect();
        let id = store(&mut allocator, &fill);
        live.push((id, fill));
      } else {
        let (id, _) = live.remove(rng.below(live.len() as u64));
        allocator.free(id).unwrap();
        assert!(matches!(allocator.lookup(id), Err(Error::NotFound(_))));
      }

      let expected = live.iter().map(|(_, bytes)| BLOCK_SIZE + bytes.len()).sum::<usize>() + BLOCK_SIZE;
      assert_eq!(allocator.region_len(), expected);
      assert_eq!(allocator.region().len(), expected);
      allocator.check().unwrap();

      // Live blocks stay in allocation order.
      let order: Vec<_> = allocator.blocks().map(|block| block.id).collect();
      assert!(order.iter().eq(live.iter().map(|(id, _)| id)));

      if step % 25 == 0 {
        for (id, bytes) in &live {
          assert_eq!(allocator.lookup(*id).unwrap(), bytes.as_slice());
        }
      }
    }
  }

  #[test]
  fn test_out_of_memory_leaves_region_untouched() {
    let capacity = 4 * BLOCK_SIZE + 16;
    let mut allocator = CompactingAllocator::reserved(Config::default().capacity(capacity));

    let kept = store(&mut allocator, &42i32.to_ne_bytes());
    let region = allocator.region_len();
    let next = allocator.next_id();

    match allocator.allocate(capacity) {
      Err(Error::OutOfMemory {
        source: RegionError::Exhausted { .. },
        ..
      }) => {}
      other => panic!("expected exhaustion, got {other:?}"),
    }

    assert_eq!(allocator.region_len(), region);
    assert_eq!(allocator.region().len(), region);
    assert_eq!(allocator.next_id(), next);
    assert_eq!(read_i32(&allocator, kept), 42);
    allocator.check().unwrap();

    assert_eq!(allocator.allocate(4).unwrap(), next);
  }

  #[test]
  fn test_out_of_memory_on_first_allocation() {
    let mut allocator = CompactingAllocator::reserved(Config::default().capacity(BLOCK_SIZE - 1));

    assert!(matches!(allocator.allocate(0), Err(Error::OutOfMemory { .. })));
    assert_eq!(allocator.region_len(), 0);
    allocator.check().unwrap();
  }

  #[test]
  fn test_failed_first_allocation_commits_nothing() {
    let mut allocator = CompactingAllocator::reserved(Config::default().capacity(2 * BLOCK_SIZE));

    // Room for the sentinel alone, not for the block on top of it.
    assert!(matches!(
      allocator.allocate(2 * BLOCK_SIZE),
      Err(Error::OutOfMemory { .. })
    ));
    assert_eq!(allocator.region_len(), 0);
    assert_eq!(allocator.region().len(), 0);
    assert_eq!(allocator.next_id(), BlockId::new(1));
    assert!(allocator.is_empty());
    allocator.check().unwrap();

    let id = allocator.allocate(0).unwrap();
    assert_eq!(id, BlockId::new(1));
    assert_eq!(allocator.region_len(), 2 * BLOCK_SIZE);
    allocator.check().unwrap();
  }

  #[test]
  fn test_invalid_size() {
    let mut allocator = allocator();
    assert!(matches!(allocator.allocate(usize::MAX), Err(Error::InvalidSize(usize::MAX))));
    assert!(matches!(allocator.allocate(isize::MAX as usize), Err(Error::InvalidSize(_))));

    let mut aligned = CompactingAllocator::reserved(Config::default().word_align(true).capacity(1 << 16));
    assert!(matches!(aligned.allocate(usize::MAX - 3), Err(Error::InvalidSize(_))));

    // Nothing was created by the rejected calls.
    assert_eq!(allocator.region_len(), 0);
    assert_eq!(allocator.next_id(), BlockId::new(1));
  }

  #[test]
  fn test_word_aligned_payloads() {
    let word = std::mem::size_of::<usize>();
    let mut allocator = CompactingAllocator::reserved(Config::default().word_align(true).capacity(1 << 16));

    let ids: Vec<_> = [1, 4, 13, 0, 7]
      .into_iter()
      .map(|size| allocator.allocate(size).unwrap())
      .collect();
    allocator.free(ids[1]).unwrap();

    for &id in &ids[2..] {
      let payload = allocator.payload_ptr(id).unwrap();
      assert_eq!(payload.as_ptr() as usize % word, 0);
      assert_eq!(allocator.size_of(id).unwrap() % word, 0);
    }
    allocator.check().unwrap();
  }

  #[test]
  fn test_check_detects_corrupted_header() {
    let mut allocator = allocator();
    let first = allocator.allocate(4).unwrap();
    allocator.allocate(4).unwrap();
    allocator.check().unwrap();

    unsafe {
      let second_header = allocator.payload_ptr(first).unwrap().add(4);
      Block::new(1 << 20, BlockId::new(2)).write(second_header);
    }

    assert!(matches!(allocator.check(), Err(Error::Corrupted(_))));
  }
}
