use std::io;

use thiserror::Error;

use crate::block::BlockId;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a [`Region`](crate::Region) could not grow.
#[derive(Debug, Error)]
pub enum RegionError {
  #[error("region exhausted: requested {requested} bytes, {available} available")]
  Exhausted { requested: usize, available: usize },

  #[error("program break was moved outside of this region")]
  BreakMoved,

  #[error("platform memory call failed: {0}")]
  Os(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("out of memory: could not grow region by {requested} bytes")]
  OutOfMemory {
    requested: usize,
    #[source]
    source: RegionError,
  },

  #[error("no live block with id {0}")]
  NotFound(BlockId),

  #[error("allocation size {0} overflows region arithmetic")]
  InvalidSize(usize),

  #[error("region corrupted: {0}")]
  Corrupted(String),
}

impl Error {
  pub(crate) fn out_of_memory(
    requested: usize,
    source: RegionError,
  ) -> Self {
    Error::OutOfMemory { requested, source }
  }
}
