//! Where the heap's bytes come from.
//!
//! ```text
//!   low_address                      high_address
//!        │                                 │
//!        ▼                                 ▼
//!        ┌─────────────────────────────────┬──────────────────┐
//!        │         managed heap            │    unreserved    │
//!        └─────────────────────────────────┴──────────────────┘
//!                                          ▲
//!                                        break  ── grow(+n) ──▶
//! ```

use std::{
  alloc::{self, Layout},
  ptr::NonNull,
};

#[cfg(unix)]
use libc::{c_void, intptr_t, sbrk};

use crate::error::HeapError;

/// Default reservation of a [`MemoryRegion`], 20 MiB.
pub const DEFAULT_CAPACITY: usize = 20 * (1 << 20);

const REGION_ALIGN: usize = 4096;

/// A growable, contiguous range of memory moved by a break pointer.
///
/// # Safety
///
/// Implementors guarantee that every byte between [`low_address`] and
/// [`high_address`] is valid for reads and writes, that successive growths
/// extend the same range in place, and that nothing else writes into it.
///
/// [`low_address`]: HeapSource::low_address
/// [`high_address`]: HeapSource::high_address
pub unsafe trait HeapSource {
  /// Moves the break by `delta` bytes and returns the previous break, or
  /// `None` if the request is refused. A refused request changes nothing.
  fn grow(
    &mut self,
    delta: isize,
  ) -> Option<NonNull<u8>>;

  /// First byte of the range.
  fn low_address(&self) -> *mut u8;

  /// Last valid byte of the range.
  fn high_address(&self) -> *mut u8;

  /// Bytes between the low address and the break.
  fn current_size(&self) -> usize;
}

/// A simulated break over a buffer reserved up front.
///
/// The whole capacity is reserved on construction, so addresses stay stable
/// while the break moves. Requests past the capacity are refused, which makes
/// exhaustion easy to reproduce.
pub struct MemoryRegion {
  start: NonNull<u8>,
  capacity: usize,
  brk: usize,
}

impl MemoryRegion {
  pub fn new() -> Result<Self, HeapError> {
    Self::with_capacity(DEFAULT_CAPACITY)
  }

  pub fn with_capacity(capacity: usize) -> Result<Self, HeapError> {
    let layout = Self::layout(capacity).ok_or(HeapError::Region { capacity })?;
    let start = NonNull::new(unsafe { alloc::alloc(layout) })
      .ok_or(HeapError::Region { capacity })?;

    Ok(Self {
      start,
      capacity,
      brk: 0,
    })
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Moves the break back to the start, forgetting everything above it.
  pub fn reset(&mut self) {
    self.brk = 0;
  }

  fn layout(capacity: usize) -> Option<Layout> {
    Layout::from_size_align(capacity.max(1), REGION_ALIGN).ok()
  }
}

unsafe impl HeapSource for MemoryRegion {
  fn grow(
    &mut self,
    delta: isize,
  ) -> Option<NonNull<u8>> {
    let previous = self.brk;
    let next = previous.checked_add_signed(delta)?;

    if next > self.capacity {
      return None;
    }

    self.brk = next;
    Some(unsafe { self.start.add(previous) })
  }

  fn low_address(&self) -> *mut u8 {
    self.start.as_ptr()
  }

  fn high_address(&self) -> *mut u8 {
    self.start.as_ptr().wrapping_add(self.brk).wrapping_sub(1)
  }

  fn current_size(&self) -> usize {
    self.brk
  }
}

impl Drop for MemoryRegion {
  fn drop(&mut self) {
    if let Some(layout) = Self::layout(self.capacity) {
      unsafe { alloc::dealloc(self.start.as_ptr(), layout) };
    }
  }
}

/// The process data segment, moved with `sbrk(2)`.
///
/// Only sound while nothing else in the process moves the break; the
/// allocator notices a foreign move on its next extension and refuses to
/// grow past it.
#[cfg(unix)]
pub struct ProgramBreak {
  low: *mut u8,
}

#[cfg(unix)]
impl ProgramBreak {
  pub fn new() -> Self {
    Self {
      low: Self::current(),
    }
  }

  fn current() -> *mut u8 {
    unsafe { sbrk(0) as *mut u8 }
  }
}

#[cfg(unix)]
impl Default for ProgramBreak {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(unix)]
unsafe impl HeapSource for ProgramBreak {
  fn grow(
    &mut self,
    delta: isize,
  ) -> Option<NonNull<u8>> {
    let previous = unsafe { sbrk(delta as intptr_t) };

    if previous == usize::MAX as *mut c_void {
      return None;
    }

    NonNull::new(previous as *mut u8)
  }

  fn low_address(&self) -> *mut u8 {
    self.low
  }

  fn high_address(&self) -> *mut u8 {
    Self::current().wrapping_sub(1)
  }

  fn current_size(&self) -> usize {
    Self::current() as usize - self.low as usize
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_region_grow() {
    let mut region = MemoryRegion::with_capacity(4096).unwrap();
    let low = region.low_address();

    assert_eq!(low as usize % REGION_ALIGN, 0);
    assert_eq!(region.current_size(), 0);

    let first = region.grow(16).unwrap();
    assert_eq!(first.as_ptr(), low);

    let second = region.grow(80).unwrap();
    assert_eq!(second.as_ptr(), low.wrapping_add(16));
    assert_eq!(region.current_size(), 96);
    assert_eq!(region.high_address(), low.wrapping_add(95));
  }

  #[test]
  fn test_region_refuses_past_capacity() {
    let mut region = MemoryRegion::with_capacity(64).unwrap();

    assert!(region.grow(48).is_some());
    assert!(region.grow(32).is_none());
    assert_eq!(region.current_size(), 48);
    assert!(region.grow(16).is_some());
    assert_eq!(region.current_size(), 64);
  }

  #[test]
  fn test_region_shrink_and_reset() {
    let mut region = MemoryRegion::with_capacity(256).unwrap();

    region.grow(128).unwrap();
    assert!(region.grow(-200).is_none());
    region.grow(-28).unwrap();
    assert_eq!(region.current_size(), 100);

    region.reset();
    assert_eq!(region.current_size(), 0);
    assert_eq!(region.grow(8).unwrap().as_ptr(), region.low_address());
  }

  #[test]
  fn test_region_bytes_are_writable() {
    let mut region = MemoryRegion::with_capacity(1024).unwrap();
    let start = region.grow(1024).unwrap();

    unsafe {
      std::ptr::write_bytes(start.as_ptr(), 0xAB, 1024);
      assert_eq!(*start.as_ptr().add(1023), 0xAB);
    }
  }
}
