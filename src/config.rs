use crate::error::HeapError;

const FALLBACK_PAGE_SIZE: usize = 4096;
const MIN_PAGE_SIZE: usize = 256;
const MAX_PAGE_SIZE: usize = 1 << 30;

/// How [`Heap::allocate`](crate::Heap::allocate) picks among existing free blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchMode {
  /// Smallest free block that fits, across every page.
  #[default]
  BestFit,
  /// First free block that fits, head page first.
  FirstFit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
  /// Granularity of every page request; pages are multiples of it.
  pub page_size: usize,
  pub search: SearchMode,
  /// Check pointers passed to `free` against the heap's blocks.
  pub validate_frees: bool,
}

impl HeapConfig {
  pub fn with_page_size(
    mut self,
    page_size: usize,
  ) -> Self {
    self.page_size = page_size;
    self
  }

  pub fn with_search_mode(
    mut self,
    search: SearchMode,
  ) -> Self {
    self.search = search;
    self
  }

  pub fn with_free_validation(
    mut self,
    validate_frees: bool,
  ) -> Self {
    self.validate_frees = validate_frees;
    self
  }

  pub fn validate(&self) -> Result<(), HeapError> {
    let page_size = self.page_size;

    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
      return Err(HeapError::InvalidConfig { page_size });
    }

    Ok(())
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      page_size: os_page_size(),
      search: SearchMode::default(),
      validate_frees: true,
    }
  }
}

/// The OS page size, or 4096 when it cannot be queried.
pub fn os_page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

  if size <= 0 {
    FALLBACK_PAGE_SIZE
  } else {
    size as usize
  }
}
