/// Rounds the given size up to the boundary-tag word size.
///
/// Every block payload is a multiple of [`WORD_SIZE`](crate::tag::WORD_SIZE),
/// which keeps the low bit of a size word free for the allocation flag.
///
/// # Examples
///
/// ```rust
/// use tagalloc::align;
///
/// assert_eq!(align!(1), 4);
/// assert_eq!(align!(11), 12);
/// assert_eq!(align!(13), 16);
/// assert_eq!(align!(16), 16);
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align_to!($value, $crate::tag::WORD_SIZE)
  };
}

/// Rounds `value` up to the next multiple of `align`, which must be a power of two.
///
/// # Examples
///
/// ```rust
/// use tagalloc::align_to;
///
/// assert_eq!(align_to!(40, 4096), 4096);
/// assert_eq!(align_to!(4097, 4096), 8192);
/// assert_eq!(align_to!(8192, 4096), 8192);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $align:expr) => {
    ($value + $align - 1) & !($align - 1)
  };
}
