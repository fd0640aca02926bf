use std::{error, fmt};

/// Everything the allocator can report.
///
/// Only [`HeapError::OutOfMemory`], [`HeapError::RequestTooLarge`] and
/// [`HeapError::Discontiguous`] come out of the allocation path, and the
/// C-style entry points turn them into a null pointer. [`HeapError::Corrupted`]
/// is produced by the heap checker alone: freeing a foreign pointer or
/// freeing twice is never detected by the allocator itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
  /// The heap source refused to grow by `requested` bytes.
  OutOfMemory { requested: usize },
  /// A request of `size` bytes cannot be described by a block tag.
  RequestTooLarge { size: usize },
  /// Somebody else moved the break between two extensions.
  Discontiguous,
  /// The heap has not been laid out yet.
  Uninitialized,
  /// The heap checker found a broken invariant at `offset`.
  Corrupted { offset: usize, reason: &'static str },
  /// The backing region could not be reserved.
  Region { capacity: usize },
}

impl fmt::Display for HeapError {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match self {
      Self::OutOfMemory { requested } => {
        write!(f, "heap source refused to grow by {requested} bytes")
      }
      Self::RequestTooLarge { size } => {
        write!(f, "request of {size} bytes exceeds the largest block")
      }
      Self::Discontiguous => f.write_str("program break moved outside of the allocator"),
      Self::Uninitialized => f.write_str("heap is not initialized"),
      Self::Corrupted { offset, reason } => {
        write!(f, "heap corrupted at offset {offset}: {reason}")
      }
      Self::Region { capacity } => write!(f, "could not reserve a region of {capacity} bytes"),
    }
  }
}

impl error::Error for HeapError {}
