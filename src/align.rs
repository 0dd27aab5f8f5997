/// Rounds a byte count up to the machine word.
///
/// Used when [`Config::word_align`](crate::Config) is on, so that every block
/// header and payload in the region starts on a word boundary.
///
/// # Examples
///
/// ```rust
/// use compalloc::align;
///
/// match std::mem::size_of::<usize>() {
///     8 => assert_eq!(align!(13), 16), // 64 bit machine.
///     4 => assert_eq!(align!(11), 12), // 32 bit machine.
///     _ => {},
/// };
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    ($value + ::core::mem::size_of::<usize>() - 1) & !(::core::mem::size_of::<usize>() - 1)
  };
}

/// Same as [`align!`] but returns `None` instead of wrapping around when
/// `value` is within one word of `usize::MAX`.
pub const fn checked_word_align(value: usize) -> Option<usize> {
  let word = core::mem::size_of::<usize>();
  match value.checked_add(word - 1) {
    Some(padded) => Some(padded & !(word - 1)),
    None => None,
  }
}
