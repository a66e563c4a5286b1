use std::fmt;

/// Point-in-time dump of a [`Heap`](crate::Heap), head page first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeapSnapshot {
  pub pages: Vec<PageSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSnapshot {
  pub address: usize,
  pub size: usize,
  pub blocks: Vec<BlockSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSnapshot {
  /// Offset of the block's leading tag from the start of its page.
  pub offset: usize,
  /// Payload bytes, tags excluded.
  pub size: usize,
  pub allocated: bool,
}

impl HeapSnapshot {
  pub fn page_count(&self) -> usize {
    self.pages.len()
  }

  pub fn allocated_bytes(&self) -> usize {
    self.blocks().filter(|block| block.allocated).map(|block| block.size).sum()
  }

  pub fn free_bytes(&self) -> usize {
    self.blocks().filter(|block| !block.allocated).map(|block| block.size).sum()
  }

  fn blocks(&self) -> impl Iterator<Item = &BlockSnapshot> {
    self.pages.iter().flat_map(|page| page.blocks.iter())
  }
}

impl fmt::Display for HeapSnapshot {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    if self.pages.is_empty() {
      return writeln!(f, "heap: no pages");
    }

    for page in &self.pages {
      write!(f, "{page}")?;
    }

    Ok(())
  }
}

impl fmt::Display for PageSnapshot {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    writeln!(f, "page {:#x} ({} bytes)", self.address, self.size)?;

    for block in &self.blocks {
      writeln!(
        f,
        "  +{:<6} {:>8} bytes  {}",
        block.offset,
        block.size,
        if block.allocated { "used" } else { "free" }
      )?;
    }

    Ok(())
  }
}
