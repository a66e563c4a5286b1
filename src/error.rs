use std::{error, fmt, io};

/// Failures surfaced by [`Heap`](crate::Heap) operations.
///
/// OS failures carry the `errno` reported at the time of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
  /// The OS refused to map a new page.
  OutOfMemory { page_size: usize, errno: i32 },
  /// The OS refused to unmap a released page. The page is already detached
  /// from the heap, so its mapping is leaked.
  UnmapFailed {
    address: usize,
    page_size: usize,
    errno: i32,
  },
  /// The request cannot be described by a page size word.
  RequestTooLarge { requested: usize },
  /// The pointer passed to `free` is not the payload of any block in this heap.
  InvalidPointer { address: usize },
  /// The pointer names a block that is already free. Once that block has
  /// merged into a free left neighbour its payload no longer starts a block,
  /// and a repeated free reports [`HeapError::InvalidPointer`] instead.
  DoubleFree { address: usize },
  InvalidConfig { page_size: usize },
}

impl fmt::Display for HeapError {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match *self {
      HeapError::OutOfMemory { page_size, errno } => write!(
        f,
        "mmap of {page_size} bytes failed: {}",
        io::Error::from_raw_os_error(errno)
      ),
      HeapError::UnmapFailed {
        address,
        page_size,
        errno,
      } => write!(
        f,
        "munmap of {page_size} bytes at {address:#x} failed: {}",
        io::Error::from_raw_os_error(errno)
      ),
      HeapError::RequestTooLarge { requested } => {
        write!(f, "request of {requested} bytes exceeds the largest page")
      }
      HeapError::InvalidPointer { address } => {
        write!(f, "{address:#x} was not returned by this heap")
      }
      HeapError::DoubleFree { address } => write!(f, "{address:#x} is already free"),
      HeapError::InvalidConfig { page_size } => write!(
        f,
        "page size {page_size} must be a power of two between 256 bytes and 1 GiB"
      ),
    }
  }
}

impl error::Error for HeapError {}

pub(crate) fn last_errno() -> i32 {
  io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
