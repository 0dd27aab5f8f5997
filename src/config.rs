/// Reservation size used by [`Config::default`]: 64 MiB.
pub const DEFAULT_CAPACITY: usize = 64 << 20;

/// Allocator tuning.
///
/// ```rust
/// use compalloc::Config;
///
/// let config = Config::default().word_align(true).capacity(1 << 20);
/// assert!(config.word_align);
/// assert_eq!(config.capacity, 1 << 20);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
  /// Round every payload up to the machine word so headers and payloads stay
  /// word-aligned. Off by default: the region then holds exactly the
  /// requested bytes.
  pub word_align: bool,
  /// Bytes reserved up front by [`ReservedRegion`](crate::ReservedRegion).
  /// Ignored by the program break backend.
  pub capacity: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      word_align: false,
      capacity: DEFAULT_CAPACITY,
    }
  }
}

impl Config {
  pub fn word_align(
    mut self,
    word_align: bool,
  ) -> Self {
    self.word_align = word_align;
    self
  }

  pub fn capacity(
    mut self,
    capacity: usize,
  ) -> Self {
    self.capacity = capacity;
    self
  }
}
