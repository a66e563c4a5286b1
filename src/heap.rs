use std::ptr::NonNull;

use log::trace;

use crate::{
  block::Block,
  config::{HeapConfig, SearchMode},
  error::HeapError,
  page::{Page, PageList},
  snapshot::{BlockSnapshot, HeapSnapshot, PageSnapshot},
};

/// A heap of OS-mapped pages carved into boundary-tagged blocks.
///
/// Each `Heap` owns its pages; dropping it returns every page to the OS,
/// including pages that still hold live allocations.
pub struct Heap {
  pages: PageList,
  config: HeapConfig,
}

impl Heap {
  pub fn new() -> Self {
    Self {
      pages: PageList::new(),
      config: HeapConfig::default(),
    }
  }

  pub fn with_config(config: HeapConfig) -> Result<Self, HeapError> {
    config.validate()?;

    Ok(Self {
      pages: PageList::new(),
      config,
    })
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  /// Number of pages currently mapped.
  pub fn page_count(&self) -> usize {
    self.pages.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pages.head().is_none()
  }

  /// Start address of the most recently created page still mapped.
  pub fn head(&self) -> Option<NonNull<u8>> {
    self.pages.head().map(Page::base)
  }

  /// Returns a pointer to at least `size` bytes, aligned to the tag word.
  ///
  /// Existing pages are searched first (see [`SearchMode`]); on a miss a new
  /// page sized for the request becomes the head and serves it. A zero-size
  /// request is served as a one-byte request.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    let size = size.max(1);

    let block = match self.search(size) {
      Some(block) => block,
      None => {
        let page = self.grow(size)?;
        page.first_fit(size).unwrap_or_else(|| {
          unreachable!("fresh page of {} bytes cannot hold {size} bytes", page.size())
        })
      }
    };

    let block = block.split(size);
    block.mark_allocated();

    trace!(
      "allocated {size} bytes at {:p} (block of {} bytes)",
      block.payload(),
      block.size()
    );

    Ok(block.payload())
  }

  /// Releases an allocation.
  ///
  /// The block is coalesced with free neighbours unless its page no longer
  /// holds any allocation, in which case the whole page goes back to the OS.
  ///
  /// With free validation enabled (the default) a pointer that does not name
  /// a live block of this heap is reported as [`HeapError::InvalidPointer`] or
  /// [`HeapError::DoubleFree`] and the heap is left untouched.
  ///
  /// # Safety
  ///
  /// With free validation disabled, `ptr` must have been returned by
  /// [`allocate`](Self::allocate) on this heap and not freed since. In every
  /// mode the caller must not use the memory after this call.
  pub unsafe fn free(
    &mut self,
    ptr: NonNull<u8>,
  ) -> Result<(), HeapError> {
    let block = if self.config.validate_frees {
      self.locate(ptr)?
    } else {
      unsafe { Block::from_payload(ptr) }
    };

    block.mark_free();
    trace!("freed {:p} (block of {} bytes)", ptr, block.size());

    let page = Page::containing(block);
    if page.has_live_allocations() {
      block.coalesce();
      return Ok(());
    }

    unsafe { self.pages.release(page) }
  }

  /// Payload bytes available behind `ptr`, at least what was requested.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this heap.
  pub unsafe fn usable_size(
    &self,
    ptr: NonNull<u8>,
  ) -> usize {
    unsafe { Block::from_payload(ptr) }.size()
  }

  /// Free block with the least slack over `size` across all pages. An exact
  /// fit ends the scan; ties go to the page nearer the head, then to the
  /// leftmost block.
  pub(crate) fn find_best_fit(
    &self,
    size: usize,
  ) -> Option<Block> {
    let mut best: Option<(Block, usize)> = None;

    for page in self.pages.iter() {
      let Some(block) = page.best_fit(size) else {
        continue;
      };

      let slack = block.size() - size;
      if best.is_none_or(|(_, least)| slack < least) {
        best = Some((block, slack));
      }
      if slack == 0 {
        break;
      }
    }

    best.map(|(block, _)| block)
  }

  /// First free block of at least `size` bytes, head page first.
  pub(crate) fn find_first_fit(
    &self,
    size: usize,
  ) -> Option<Block> {
    self.pages.iter().find_map(|page| page.first_fit(size))
  }

  pub fn snapshot(&self) -> HeapSnapshot {
    let pages = self
      .pages
      .iter()
      .map(|page| PageSnapshot {
        address: page.addr(),
        size: page.size(),
        blocks: page
          .blocks()
          .map(|block| BlockSnapshot {
            offset: block.addr().as_ptr() as usize - page.addr(),
            size: block.size(),
            allocated: block.is_allocated(),
          })
          .collect(),
      })
      .collect();

    HeapSnapshot { pages }
  }

  /// Checks every page and block invariant, panicking on the first violation.
  pub fn verify(&self) {
    let mut prev: Option<Page> = None;
    let mut count = 0;

    for page in self.pages.iter() {
      assert_eq!(page.prev(), prev, "page {:p}: broken back link", page.base());
      assert!(
        page.size() % self.config.page_size == 0,
        "page {:p}: size {} is not a multiple of {}",
        page.base(),
        page.size(),
        self.config.page_size
      );
      assert!(
        page.has_live_allocations(),
        "page {:p}: fully free page still mapped",
        page.base()
      );
      page.verify();

      prev = Some(page);
      count += 1;
    }

    assert_eq!(count, self.pages.len(), "page list length out of sync");
  }

  fn search(
    &self,
    size: usize,
  ) -> Option<Block> {
    match self.config.search {
      SearchMode::BestFit => self.find_best_fit(size),
      SearchMode::FirstFit => self.find_first_fit(size),
    }
  }

  fn grow(
    &mut self,
    size: usize,
  ) -> Result<Page, HeapError> {
    let page_size = Page::size_for_request(size, self.config.page_size)
      .ok_or(HeapError::RequestTooLarge { requested: size })?;

    let page = Page::acquire(page_size)?;
    self.pages.initialize(page, page_size);

    Ok(page)
  }

  fn locate(
    &self,
    ptr: NonNull<u8>,
  ) -> Result<Block, HeapError> {
    let address = ptr.as_ptr() as usize;

    let block = self
      .pages
      .iter()
      .find(|page| page.contains(address))
      .and_then(|page| page.blocks().find(|block| block.payload() == ptr))
      .ok_or(HeapError::InvalidPointer { address })?;

    if !block.is_allocated() {
      return Err(HeapError::DoubleFree { address });
    }

    Ok(block)
  }
}

impl Default for Heap {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for Heap {
  fn drop(&mut self) {
    self.pages.release_all();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::page::PAGE_OVERHEAD;

  use test_env_log::test;

  const PAGE: usize = 4096;
  const CAPACITY: usize = PAGE - PAGE_OVERHEAD;

  fn heap() -> Heap {
    Heap::with_config(HeapConfig::default().with_page_size(PAGE)).unwrap()
  }

  fn heap_with(search: SearchMode) -> Heap {
    Heap::with_config(
      HeapConfig::default()
        .with_page_size(PAGE)
        .with_search_mode(search),
    )
    .unwrap()
  }

  fn addr(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize
  }

  fn blocks(heap: &Heap) -> Vec<Vec<BlockSnapshot>> {
    heap.snapshot().pages.into_iter().map(|page| page.blocks).collect()
  }

  /// Minimal LCG so the workload is reproducible without extra dependencies.
  struct Lcg(u64);

  impl Lcg {
    fn next(&mut self) -> u64 {
      self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
      self.0 >> 33
    }
  }

  #[test]
  fn test_reference_scenario() {
    let mut heap = heap();
    assert!(heap.is_empty());

    let small = heap.allocate(40).unwrap();
    assert_eq!(heap.page_count(), 1);
    let first_page = heap.head().unwrap();
    assert!(addr(small) > addr(first_page) && addr(small) < addr(first_page) + PAGE);

    let medium = heap.allocate(900).unwrap();
    assert_eq!(heap.page_count(), 1);
    assert_eq!(addr(medium), addr(small) + 40 + 8);

    let large = heap.allocate(3888).unwrap();
    assert_eq!(heap.page_count(), 2);
    assert_ne!(heap.head(), Some(first_page));
    assert_eq!(heap.snapshot().pages[0].size, PAGE);
    heap.verify();

    unsafe { heap.free(large) }.unwrap();
    assert_eq!(heap.page_count(), 1);
    assert_eq!(heap.head(), Some(first_page));
    heap.verify();

    let snapshot = heap.snapshot();
    let live: Vec<_> = snapshot.pages[0].blocks.iter().filter(|b| b.allocated).collect();
    assert_eq!(live.len(), 2);
    assert_eq!(live[0].size, 40);
    assert_eq!(live[1].size, 900);
    assert_eq!(snapshot.pages[0].blocks.last().unwrap().size, 3100);

    unsafe {
      heap.free(small).unwrap();
      heap.free(medium).unwrap();
    }
    assert!(heap.is_empty());
  }

  #[test]
  fn test_round_trip_on_empty_heap() {
    for size in [1, 3, CAPACITY, CAPACITY + 1] {
      let mut heap = heap();

      let ptr = heap.allocate(size).unwrap();
      assert!(unsafe { heap.usable_size(ptr) } >= size);
      unsafe { heap.free(ptr) }.unwrap();

      assert_eq!(heap.page_count(), 0);
      assert_eq!(heap.head(), None);
    }
  }

  #[test]
  fn test_round_trip_next_to_live_allocation() {
    for size in [1, 3, CAPACITY, CAPACITY + 1] {
      let mut heap = heap();
      let keeper = heap.allocate(64).unwrap();

      let head = heap.head();
      let before = heap.snapshot();

      let ptr = heap.allocate(size).unwrap();
      unsafe { heap.free(ptr) }.unwrap();

      assert_eq!(heap.head(), head);
      assert_eq!(heap.page_count(), 1);
      assert_eq!(heap.snapshot(), before);
      heap.verify();

      unsafe { heap.free(keeper) }.unwrap();
    }
  }

  #[test]
  fn test_allocations_do_not_overlap() {
    let mut heap = heap();
    let sizes = [1, 7, 8, 40, 900, 3888, 4000, 4, 150, 12, 5000, 33, 2048, 2048];

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    for (i, &size) in sizes.iter().enumerate() {
      let ptr = heap.allocate(size).unwrap();
      unsafe { ptr.as_ptr().write_bytes(i as u8, size) };
      ranges.push((addr(ptr), size));
    }
    heap.verify();

    for (i, &(start, size)) in ranges.iter().enumerate() {
      let bytes = unsafe { std::slice::from_raw_parts(start as *const u8, size) };
      assert!(bytes.iter().all(|&b| b == i as u8), "allocation {i} was overwritten");
    }

    ranges.sort();
    for pair in ranges.windows(2) {
      let (start, size) = pair[0];
      assert!(start + size <= pair[1].0, "{:#x}+{} overlaps {:#x}", start, size, pair[1].0);
    }
  }

  #[test]
  fn test_coalescing_is_order_independent() {
    let merged_in = |order: [usize; 2]| {
      let mut heap = heap();
      let ptrs = [
        heap.allocate(64).unwrap(),
        heap.allocate(64).unwrap(),
        heap.allocate(64).unwrap(),
      ];
      unsafe {
        heap.free(ptrs[order[0]]).unwrap();
        heap.free(ptrs[order[1]]).unwrap();
      }
      heap.verify();
      blocks(&heap)
    };

    let combined = {
      let mut heap = heap();
      let joint = heap.allocate(64 + 8 + 64).unwrap();
      heap.allocate(64).unwrap();
      unsafe { heap.free(joint) }.unwrap();
      blocks(&heap)
    };

    let a_then_b = merged_in([0, 1]);
    let b_then_a = merged_in([1, 0]);

    assert_eq!(a_then_b, b_then_a);
    assert_eq!(a_then_b, combined);
    assert_eq!(
      a_then_b[0][0],
      BlockSnapshot {
        offset: 16,
        size: 136,
        allocated: false,
      }
    );
  }

  #[test]
  fn test_coalescing_merges_both_neighbours() {
    let mut heap = heap();
    let a = heap.allocate(24).unwrap();
    let b = heap.allocate(24).unwrap();
    let c = heap.allocate(24).unwrap();
    let _d = heap.allocate(24).unwrap();

    unsafe {
      heap.free(a).unwrap();
      heap.free(c).unwrap();
      heap.free(b).unwrap();
    }
    heap.verify();

    let page = &blocks(&heap)[0];
    assert_eq!(
      page[0],
      BlockSnapshot {
        offset: 16,
        size: 24 * 3 + 16,
        allocated: false,
      }
    );
    assert!(page[1].allocated);
  }

  #[test]
  fn test_fully_free_page_is_released() {
    let mut heap = heap();
    let third = CAPACITY / 3 / 4 * 4 - 8;

    let ptrs: Vec<_> = (0..3).map(|_| heap.allocate(third).unwrap()).collect();
    assert_eq!(heap.page_count(), 1);
    let page = heap.head();

    for ptr in ptrs {
      assert_eq!(heap.head(), page);
      unsafe { heap.free(ptr) }.unwrap();
    }

    assert_eq!(heap.page_count(), 0);
    assert_eq!(heap.head(), None);
  }

  #[test]
  fn test_best_fit_prefers_tightest_block() {
    let mut heap = heap();
    let hundred = heap.allocate(100).unwrap();
    let _guard = heap.allocate(8).unwrap();
    let forty = heap.allocate(40).unwrap();
    let _guard = heap.allocate(8).unwrap();

    unsafe {
      heap.free(hundred).unwrap();
      heap.free(forty).unwrap();
    }

    assert_eq!(heap.allocate(30).unwrap(), forty);
    assert_eq!(heap.allocate(30).unwrap(), hundred);
    heap.verify();
  }

  #[test]
  fn test_best_fit_spans_pages() {
    let mut heap = heap();

    // Older page: a 40-byte block that will be freed, then filled up.
    let tight = heap.allocate(40).unwrap();
    let _fill = heap.allocate(CAPACITY - 48).unwrap();
    assert_eq!(heap.page_count(), 1);

    // Head page: a looser 100-byte block.
    let loose = heap.allocate(100).unwrap();
    let _guard = heap.allocate(8).unwrap();
    assert_eq!(heap.page_count(), 2);

    unsafe {
      heap.free(tight).unwrap();
      heap.free(loose).unwrap();
    }

    assert_eq!(heap.allocate(36).unwrap(), tight);
    assert_eq!(heap.page_count(), 2);
    heap.verify();
  }

  #[test]
  fn test_best_fit_tie_prefers_head_page() {
    let mut heap = heap();

    let older = heap.allocate(40).unwrap();
    let _fill = heap.allocate(CAPACITY - 48).unwrap();
    let newer = heap.allocate(40).unwrap();
    let _fill = heap.allocate(CAPACITY - 48).unwrap();
    assert_eq!(heap.page_count(), 2);

    unsafe {
      heap.free(older).unwrap();
      heap.free(newer).unwrap();
    }

    assert_eq!(heap.allocate(32).unwrap(), newer);
    assert_eq!(heap.allocate(32).unwrap(), older);
    heap.verify();
  }

  #[test]
  fn test_first_fit_prefers_head_page() {
    let mut heap = heap_with(SearchMode::FirstFit);

    // Older page: a tight 40-byte block.
    let tight = heap.allocate(40).unwrap();
    let _fill = heap.allocate(CAPACITY - 48).unwrap();

    // Head page: a looser 100-byte block.
    let loose = heap.allocate(100).unwrap();
    let _guard = heap.allocate(8).unwrap();
    assert_eq!(heap.page_count(), 2);

    unsafe {
      heap.free(tight).unwrap();
      heap.free(loose).unwrap();
    }

    assert_eq!(heap.allocate(36).unwrap(), loose);
    heap.verify();
  }

  #[test]
  fn test_first_fit_takes_leftmost_block() {
    let mut heap = heap_with(SearchMode::FirstFit);
    let hundred = heap.allocate(100).unwrap();
    let _guard = heap.allocate(8).unwrap();
    let forty = heap.allocate(40).unwrap();
    let _guard = heap.allocate(8).unwrap();

    unsafe {
      heap.free(hundred).unwrap();
      heap.free(forty).unwrap();
    }

    assert_eq!(heap.allocate(30).unwrap(), hundred);
    heap.verify();
  }

  #[test]
  fn test_small_remainder_is_not_split() {
    let mut heap = heap();
    let a = heap.allocate(40).unwrap();
    let _guard = heap.allocate(8).unwrap();
    unsafe { heap.free(a) }.unwrap();

    let b = heap.allocate(30).unwrap();
    assert_eq!(b, a);
    assert_eq!(unsafe { heap.usable_size(b) }, 40);
  }

  #[test]
  fn test_zero_size_allocations_are_distinct() {
    let mut heap = heap();
    let a = heap.allocate(0).unwrap();
    let b = heap.allocate(0).unwrap();

    assert_ne!(a, b);
    assert_eq!(unsafe { heap.usable_size(a) }, 4);
    heap.verify();
  }

  #[test]
  fn test_payloads_are_word_aligned() {
    let mut heap = heap();
    for size in [1, 2, 3, 5, 9, 17] {
      let ptr = heap.allocate(size).unwrap();
      assert_eq!(addr(ptr) % crate::tag::WORD_SIZE, 0);
    }
  }

  #[test]
  fn test_mixed_workload_keeps_invariants() {
    let mut heap = heap();
    let mut rng = Lcg(0x5eed);
    let mut live: Vec<NonNull<u8>> = Vec::new();

    for _ in 0..2000 {
      if live.is_empty() || rng.next() % 3 != 0 {
        let size = (rng.next() % 1500) as usize;
        live.push(heap.allocate(size).unwrap());
      } else {
        let victim = live.swap_remove(rng.next() as usize % live.len());
        unsafe { heap.free(victim) }.unwrap();
      }
      heap.verify();
    }

    for ptr in live.drain(..) {
      unsafe { heap.free(ptr) }.unwrap();
      heap.verify();
    }
    assert!(heap.is_empty());
  }

  #[test]
  fn test_free_rejects_foreign_pointer() {
    let mut heap = heap();
    let ptr = heap.allocate(64).unwrap();
    let before = heap.snapshot();

    let mut local = 0u64;
    let foreign = NonNull::from(&mut local).cast::<u8>();
    assert_eq!(
      unsafe { heap.free(foreign) },
      Err(HeapError::InvalidPointer { address: addr(foreign) })
    );

    let inside = unsafe { ptr.add(4) };
    assert_eq!(
      unsafe { heap.free(inside) },
      Err(HeapError::InvalidPointer { address: addr(inside) })
    );
    assert_eq!(heap.snapshot(), before);
  }

  #[test]
  fn test_free_detects_double_free() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap();
    let _b = heap.allocate(64).unwrap();

    unsafe { heap.free(a) }.unwrap();
    assert_eq!(
      unsafe { heap.free(a) },
      Err(HeapError::DoubleFree { address: addr(a) })
    );
    heap.verify();
  }

  #[test]
  fn test_free_after_merge_is_rejected() {
    let mut heap = heap();
    let a = heap.allocate(64).unwrap();
    let b = heap.allocate(64).unwrap();
    let _c = heap.allocate(64).unwrap();

    unsafe {
      heap.free(a).unwrap();
      heap.free(b).unwrap();
    }
    let before = heap.snapshot();

    assert_eq!(
      unsafe { heap.free(b) },
      Err(HeapError::InvalidPointer { address: addr(b) })
    );
    assert_eq!(heap.snapshot(), before);
    heap.verify();
  }

  #[test]
  fn test_unchecked_free() {
    let mut heap = Heap::with_config(
      HeapConfig::default()
        .with_page_size(PAGE)
        .with_free_validation(false),
    )
    .unwrap();

    let a = heap.allocate(10).unwrap();
    let b = heap.allocate(20).unwrap();
    unsafe { heap.free(a) }.unwrap();
    heap.verify();
    unsafe { heap.free(b) }.unwrap();
    assert!(heap.is_empty());
  }

  #[test]
  fn test_oversized_request() {
    let mut heap = heap();

    assert_eq!(
      heap.allocate(usize::MAX),
      Err(HeapError::RequestTooLarge { requested: usize::MAX })
    );
    assert!(heap.is_empty());
  }

  #[test]
  fn test_larger_page_granularity() {
    let mut heap = Heap::with_config(HeapConfig::default().with_page_size(16 * 1024)).unwrap();

    let ptr = heap.allocate(20_000).unwrap();
    assert_eq!(heap.snapshot().pages[0].size, 32 * 1024);
    heap.verify();
    unsafe { heap.free(ptr) }.unwrap();
  }

  #[test]
  fn test_invalid_config() {
    let config = HeapConfig::default().with_page_size(1000);

    assert_eq!(
      Heap::with_config(config).err(),
      Some(HeapError::InvalidConfig { page_size: 1000 })
    );
  }

  #[test]
  fn test_drop_with_live_allocations() {
    let mut heap = Heap::new();
    heap.allocate(100).unwrap();
    heap.allocate(100_000).unwrap();
    assert_eq!(heap.page_count(), 2);
  }
}
