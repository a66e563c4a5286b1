use std::ptr::NonNull;

use crate::{
  align,
  tag::{Tag, WORD_SIZE, Word},
};

/// Typed view over one block inside a page.
///
/// The handle points at the block's leading tag:
///
/// ```text
///   ┌───────────┬──────────────────────────┬───────────┐
///   │  tag (4)  │     payload (size)       │  tag (4)  │
///   └───────────┴──────────────────────────┴───────────┘
///   ▲           ▲
///   handle      payload pointer handed to the caller
/// ```
///
/// Neighbours are found from the tags alone: the next block starts right after
/// the trailing tag, the previous block's trailing tag sits right before the
/// leading one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Block {
  tag: NonNull<u8>,
}

impl Block {
  /// Bytes of tag overhead per block.
  pub const OVERHEAD: usize = 2 * WORD_SIZE;

  /// A split only happens when the remainder can hold its own tags plus a
  /// payload at least as large as them.
  pub const MIN_REMAINDER: usize = 2 * Self::OVERHEAD;

  /// # Safety
  ///
  /// `tag` must point at the leading tag of a formatted block (or a sentinel)
  /// inside a live page.
  pub unsafe fn from_raw(tag: NonNull<u8>) -> Self {
    Self { tag }
  }

  /// # Safety
  ///
  /// `payload` must be a pointer previously returned for a block that is still
  /// part of a live page.
  pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
    Self {
      tag: unsafe { payload.sub(WORD_SIZE) },
    }
  }

  pub fn addr(self) -> NonNull<u8> {
    self.tag
  }

  pub fn payload(self) -> NonNull<u8> {
    unsafe { self.tag.add(WORD_SIZE) }
  }

  pub fn tag(self) -> Tag {
    read_tag(self.tag)
  }

  pub fn trailer(self) -> Tag {
    read_tag(self.trailer_addr())
  }

  pub fn size(self) -> usize {
    self.tag().size()
  }

  /// Bytes the block occupies in its page, tags included.
  pub fn span(self) -> usize {
    self.size() + Self::OVERHEAD
  }

  pub fn is_allocated(self) -> bool {
    self.tag().is_allocated()
  }

  /// True when this position holds a page sentinel rather than a block.
  pub fn is_end_of_page(self) -> bool {
    self.tag().is_sentinel()
  }

  pub fn next(self) -> Option<Block> {
    let next = Block {
      tag: unsafe { self.tag.add(self.span()) },
    };

    if next.is_end_of_page() { None } else { Some(next) }
  }

  pub fn prev(self) -> Option<Block> {
    let prev_trailer = unsafe { self.tag.sub(WORD_SIZE) };
    let prev_tag = read_tag(prev_trailer);

    if prev_tag.is_sentinel() {
      return None;
    }

    Some(Block {
      tag: unsafe { prev_trailer.sub(prev_tag.size() + WORD_SIZE) },
    })
  }

  /// Writes both tags for a block of `size` payload bytes at this position.
  pub fn format(
    self,
    size: usize,
    allocated: bool,
  ) {
    let tag = Tag::new(size, allocated);
    write_tag(self.tag, tag);
    write_tag(self.trailer_addr(), tag);
  }

  pub fn mark_allocated(self) {
    self.set_allocated(true);
  }

  pub fn mark_free(self) {
    self.set_allocated(false);
  }

  fn set_allocated(
    self,
    allocated: bool,
  ) {
    let tag = self.tag().with_allocated(allocated);
    write_tag(self.tag, tag);
    write_tag(self.trailer_addr(), tag);
  }

  /// Carves `requested` bytes (rounded up to a word) off the front of this
  /// free block. The tail becomes a new free block only when it is at least
  /// [`MIN_REMAINDER`](Self::MIN_REMAINDER) bytes; otherwise the whole block is
  /// kept. The returned block is still free.
  pub fn split(
    self,
    requested: usize,
  ) -> Block {
    let size = self.size();
    let left = align!(requested.max(1));

    debug_assert!(!self.is_allocated(), "split of allocated block at {:?}", self.tag);
    debug_assert!(size >= left, "block of {size} bytes cannot hold {requested}");

    if size - left < Self::MIN_REMAINDER {
      return self;
    }

    self.format(left, false);

    let rest = Block {
      tag: unsafe { self.tag.add(left + Self::OVERHEAD) },
    };
    rest.format(size - left - Self::OVERHEAD, false);

    self
  }

  /// Merges this free block with free neighbours on either side and returns
  /// the resulting block. Sentinels are never crossed.
  pub fn coalesce(self) -> Block {
    let mut block = self;

    if let Some(next) = block.next() {
      if !next.is_allocated() {
        block.format(block.size() + next.span(), false);
      }
    }

    if let Some(prev) = block.prev() {
      if !prev.is_allocated() {
        prev.format(prev.size() + block.span(), false);
        block = prev;
      }
    }

    block
  }

  fn trailer_addr(self) -> NonNull<u8> {
    unsafe { self.tag.add(WORD_SIZE + self.size()) }
  }
}

fn read_tag(at: NonNull<u8>) -> Tag {
  Tag::from_raw(unsafe { at.cast::<Word>().read() })
}

fn write_tag(
  at: NonNull<u8>,
  tag: Tag,
) {
  unsafe { at.cast::<Word>().write(tag.raw()) }
}
