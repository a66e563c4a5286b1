//! Boundary-tag words.
//!
//! A tag is one [`Word`] holding a block's payload size with the allocation
//! flag packed into bit 0:
//!
//! ```text
//!   31                                     2   1   0
//!   ┌─────────────────────────────────────┬───┬───┐
//!   │          payload size / 4           │ 0 │ A │
//!   └─────────────────────────────────────┴───┴───┘
//!                                               └── 1 = allocated, 0 = free
//! ```
//!
//! Sizes are always multiples of [`WORD_SIZE`], so the low bits of the size are
//! otherwise unused. A tag of zero is the page sentinel.

use std::{fmt, mem};

/// Storage type of a boundary tag and of the page size fields.
pub type Word = u32;

/// Size in bytes of one [`Word`]; also the payload granularity.
pub const WORD_SIZE: usize = mem::size_of::<Word>();

const ALLOCATED: Word = 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(Word);

impl Tag {
  /// Zero-size marker flanking a page's block sequence.
  pub const SENTINEL: Tag = Tag(0);

  /// Largest payload a tag can describe.
  pub const MAX_SIZE: usize = (Word::MAX & !(WORD_SIZE as Word - 1)) as usize;

  pub fn new(
    size: usize,
    allocated: bool,
  ) -> Self {
    assert!(
      size % WORD_SIZE == 0 && size <= Self::MAX_SIZE,
      "block size {size} is not representable in a boundary tag"
    );

    let flag = if allocated { ALLOCATED } else { 0 };
    Self(size as Word | flag)
  }

  pub const fn from_raw(raw: Word) -> Self {
    Self(raw)
  }

  pub const fn raw(self) -> Word {
    self.0
  }

  pub const fn size(self) -> usize {
    (self.0 & !ALLOCATED) as usize
  }

  pub const fn is_allocated(self) -> bool {
    self.0 & ALLOCATED != 0
  }

  pub const fn is_sentinel(self) -> bool {
    self.0 == 0
  }

  pub fn with_allocated(
    self,
    allocated: bool,
  ) -> Self {
    Self::new(self.size(), allocated)
  }
}

impl fmt::Debug for Tag {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    if self.is_sentinel() {
      return f.write_str("Tag(sentinel)");
    }

    f.debug_struct("Tag")
      .field("size", &self.size())
      .field("allocated", &self.is_allocated())
      .finish()
  }
}
