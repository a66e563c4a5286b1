//! Page Manager: OS mappings, page headers and the page list.
//!
//! ```text
//!   offset 0                                                        page_size
//!   ┌──────┬──────┬───┬──────────────────────────────────┬───┬──────┬──────┐
//!   │ prev │ size │ 0 │  blocks: [tag|payload|tag] ...   │ 0 │ size │ next │
//!   └──────┴──────┴───┴──────────────────────────────────┴───┴──────┴──────┘
//!    link   word  word                                   word  word   link
//! ```
//!
//! The zero words are the sentinels that stop block traversal at either end.
//! `prev` points at the newer neighbour in the list, `next` at the older one.

use std::{marker::PhantomData, mem, ptr, ptr::NonNull};

use log::{debug, error};

use crate::{
  block::Block,
  error::{HeapError, last_errno},
  tag::{WORD_SIZE, Word},
};

const LINK_SIZE: usize = mem::size_of::<*mut u8>();

const PREV_LINK: usize = 0;
const SIZE_FIELD: usize = PREV_LINK + LINK_SIZE;
const LEADING_SENTINEL: usize = SIZE_FIELD + WORD_SIZE;
const FIRST_BLOCK: usize = LEADING_SENTINEL + WORD_SIZE;

/// Bytes per page not available to blocks: both links, both size words,
/// both sentinels, and the tag pair of the page's initial block.
pub const PAGE_OVERHEAD: usize = 6 * WORD_SIZE + 2 * LINK_SIZE;

/// Handle to one mapped page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Page {
  base: NonNull<u8>,
}

impl Page {
  /// Smallest multiple of `granularity` holding `requested` payload bytes plus
  /// [`PAGE_OVERHEAD`]. `None` when the result would not fit a size word.
  pub fn size_for_request(
    requested: usize,
    granularity: usize,
  ) -> Option<usize> {
    debug_assert!(granularity.is_power_of_two());

    let padded = requested
      .checked_add(PAGE_OVERHEAD)?
      .checked_add(granularity - 1)?;
    let page_size = padded & !(granularity - 1);

    if page_size > Word::MAX as usize {
      return None;
    }

    Some(page_size)
  }

  /// Maps `page_size` bytes of zeroed, private, read/write memory.
  pub fn acquire(page_size: usize) -> Result<Page, HeapError> {
    debug!("requesting a new heap page of {page_size} bytes");

    let raw = unsafe {
      libc::mmap(
        ptr::null_mut(),
        page_size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if raw == libc::MAP_FAILED {
      let errno = last_errno();
      error!("mmap of {page_size} bytes failed (errno {errno})");
      return Err(HeapError::OutOfMemory { page_size, errno });
    }

    let base = NonNull::new(raw.cast::<u8>()).ok_or(HeapError::OutOfMemory {
      page_size,
      errno: 0,
    })?;
    debug!("got page at {base:p}");

    Ok(Page { base })
  }

  /// Returns the mapping to the OS.
  ///
  /// # Safety
  ///
  /// The page must be detached from every list and nothing may touch it again.
  pub unsafe fn unmap(self) -> Result<(), HeapError> {
    let page_size = self.size();

    if unsafe { libc::munmap(self.base.as_ptr().cast(), page_size) } == -1 {
      let errno = last_errno();
      error!(
        "munmap of {page_size} bytes at {:p} failed (errno {errno}), leaking it",
        self.base
      );
      return Err(HeapError::UnmapFailed {
        address: self.addr(),
        page_size,
        errno,
      });
    }

    Ok(())
  }

  /// The page a block lives in, found by walking left to the leading sentinel.
  pub fn containing(block: Block) -> Page {
    let mut first = block;
    while let Some(prev) = first.prev() {
      first = prev;
    }

    Page {
      base: unsafe { first.addr().sub(FIRST_BLOCK) },
    }
  }

  pub fn base(self) -> NonNull<u8> {
    self.base
  }

  pub fn addr(self) -> usize {
    self.base.as_ptr() as usize
  }

  pub fn size(self) -> usize {
    self.read_word(SIZE_FIELD) as usize
  }

  /// Bytes between the two sentinels; block spans add up to exactly this.
  pub fn usable_len(self) -> usize {
    self.size() - PAGE_OVERHEAD + Block::OVERHEAD
  }

  pub fn contains(
    self,
    addr: usize,
  ) -> bool {
    (self.addr()..self.addr() + self.size()).contains(&addr)
  }

  pub fn prev(self) -> Option<Page> {
    self.read_link(PREV_LINK)
  }

  pub fn next(self) -> Option<Page> {
    self.read_link(self.next_link())
  }

  pub fn set_prev(
    self,
    prev: Option<Page>,
  ) {
    self.write_link(PREV_LINK, prev);
  }

  pub fn set_next(
    self,
    next: Option<Page>,
  ) {
    self.write_link(self.next_link(), next);
  }

  pub fn first_block(self) -> Block {
    unsafe { Block::from_raw(self.base.add(FIRST_BLOCK)) }
  }

  pub fn blocks(self) -> Blocks {
    Blocks {
      next: Some(self.first_block()),
    }
  }

  /// Writes the page header and trailer and formats the whole interior as one
  /// free block. Links are cleared.
  pub fn format(
    self,
    page_size: usize,
  ) {
    self.write_word(SIZE_FIELD, page_size as Word);
    self.write_word(LEADING_SENTINEL, 0);
    self.first_block().format(page_size - PAGE_OVERHEAD, false);
    self.write_word(self.trailing_sentinel(), 0);
    self.write_word(self.trailing_sentinel() + WORD_SIZE, page_size as Word);
    self.set_prev(None);
    self.set_next(None);
  }

  /// Linear scan for any allocated block.
  pub fn has_live_allocations(self) -> bool {
    self.blocks().any(Block::is_allocated)
  }

  /// Free block with the least slack over `size`; an exact fit ends the scan.
  /// Ties go to the leftmost block.
  pub fn best_fit(
    self,
    size: usize,
  ) -> Option<Block> {
    let mut best: Option<(Block, usize)> = None;

    for block in self.blocks() {
      if block.is_allocated() || block.size() < size {
        continue;
      }

      let slack = block.size() - size;
      if slack == 0 {
        return Some(block);
      }
      if best.is_none_or(|(_, least)| slack < least) {
        best = Some((block, slack));
      }
    }

    best.map(|(block, _)| block)
  }

  pub fn first_fit(
    self,
    size: usize,
  ) -> Option<Block> {
    self
      .blocks()
      .find(|block| !block.is_allocated() && block.size() >= size)
  }

  /// Panics if the page header or any block tag is inconsistent.
  pub fn verify(self) {
    let page_size = self.size();
    let trailing_sentinel = self.trailing_sentinel();

    assert_eq!(
      self.read_word(trailing_sentinel + WORD_SIZE) as usize,
      page_size,
      "page {:p}: size words disagree",
      self.base
    );
    assert_eq!(
      self.read_word(LEADING_SENTINEL),
      0,
      "page {:p}: leading sentinel overwritten",
      self.base
    );
    assert_eq!(
      self.read_word(trailing_sentinel),
      0,
      "page {:p}: trailing sentinel overwritten",
      self.base
    );

    let mut spans = 0;
    for block in self.blocks() {
      assert_eq!(
        block.tag(),
        block.trailer(),
        "page {:p}: block at {:p} has mismatched tags",
        self.base,
        block.addr()
      );
      spans += block.span();
      assert!(
        spans <= self.usable_len(),
        "page {:p}: blocks run past the trailing sentinel",
        self.base
      );
    }

    assert_eq!(
      spans,
      self.usable_len(),
      "page {:p}: block spans do not cover the page",
      self.base
    );
  }

  fn next_link(self) -> usize {
    self.size() - LINK_SIZE
  }

  fn trailing_sentinel(self) -> usize {
    self.size() - LINK_SIZE - 2 * WORD_SIZE
  }

  fn read_word(
    self,
    offset: usize,
  ) -> Word {
    unsafe { self.base.add(offset).cast::<Word>().read() }
  }

  fn write_word(
    self,
    offset: usize,
    value: Word,
  ) {
    unsafe { self.base.add(offset).cast::<Word>().write(value) }
  }

  fn read_link(
    self,
    offset: usize,
  ) -> Option<Page> {
    let raw = unsafe { self.base.add(offset).cast::<*mut u8>().read() };
    NonNull::new(raw).map(|base| Page { base })
  }

  fn write_link(
    self,
    offset: usize,
    page: Option<Page>,
  ) {
    let raw = page.map_or(ptr::null_mut(), |page| page.base.as_ptr());
    unsafe { self.base.add(offset).cast::<*mut u8>().write(raw) }
  }
}

/// Blocks of one page, leading to trailing.
pub(crate) struct Blocks {
  next: Option<Block>,
}

impl Iterator for Blocks {
  type Item = Block;

  fn next(&mut self) -> Option<Block> {
    let current = self.next?;
    self.next = current.next();
    Some(current)
  }
}

/// Doubly linked list of pages; the head is the most recently created page.
#[derive(Debug, Default)]
pub(crate) struct PageList {
  head: Option<Page>,
  len: usize,
}

impl PageList {
  pub fn new() -> Self {
    Self { head: None, len: 0 }
  }

  pub fn head(&self) -> Option<Page> {
    self.head
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn iter(&self) -> Pages<'_> {
    Pages {
      next: self.head,
      _list: PhantomData,
    }
  }

  /// Formats a freshly acquired page and links it in as the new head.
  pub fn initialize(
    &mut self,
    page: Page,
    page_size: usize,
  ) {
    page.format(page_size);
    page.set_next(self.head);

    if let Some(old_head) = self.head {
      old_head.set_prev(Some(page));
    }

    self.head = Some(page);
    self.len += 1;
  }

  /// Unlinks `page` and unmaps it. The list is updated before the unmap, so a
  /// failed unmap leaks the mapping without corrupting the list.
  ///
  /// # Safety
  ///
  /// `page` must belong to this list and hold no live allocations.
  pub unsafe fn release(
    &mut self,
    page: Page,
  ) -> Result<(), HeapError> {
    let prev = page.prev();
    let next = page.next();

    debug!("freeing page {:p}", page.base);

    match prev {
      Some(prev) => prev.set_next(next),
      None => {
        debug!(
          "replacing head page {:p} with {:?}",
          page.base,
          next.map(Page::base)
        );
        self.head = next;
      }
    }

    if let Some(next) = next {
      next.set_prev(prev);
    }

    self.len -= 1;

    unsafe { page.unmap() }
  }

  /// Unmaps every page. Failures are logged and the rest still get released.
  pub fn release_all(&mut self) {
    while let Some(page) = self.head {
      let _ = unsafe { self.release(page) };
    }
  }
}

pub(crate) struct Pages<'a> {
  next: Option<Page>,
  _list: PhantomData<&'a PageList>,
}

impl Iterator for Pages<'_> {
  type Item = Page;

  fn next(&mut self) -> Option<Page> {
    let current = self.next?;
    self.next = current.next();
    Some(current)
  }
}
