use std::{marker::PhantomData, ptr, ptr::NonNull};

use log::{debug, warn};

use crate::{
  align::words_for,
  block::{Block, DWORD_SIZE, MIN_BLOCK_WORDS, Tag, Tags, WORD_SIZE},
  error::HeapError,
  source::HeapSource,
};

/// Size of the first free block carved out by [`ImplicitAllocator::init`].
pub const INITIAL_WORDS: u32 = 10;

/// Padding word, begin sentinel footer and first block header.
const PROLOGUE_BYTES: usize = DWORD_SIZE;

/// Largest heap, in words, whose blocks can all be described by a tag.
const MAX_HEAP_WORDS: usize = (u32::MAX & !1) as usize;

/// One block of the chain as seen by the diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  /// Payload offset from the heap start.
  pub offset: usize,
  pub words: u32,
  pub allocated: bool,
}

impl BlockInfo {
  pub fn bytes(&self) -> usize {
    self.words as usize * WORD_SIZE
  }

  /// Bytes a caller may use, everything but the tags.
  pub fn payload_bytes(&self) -> usize {
    self.bytes() - WORD_SIZE
  }
}

/// Totals over the whole chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub heap_bytes: usize,
  pub allocated_blocks: usize,
  pub free_blocks: usize,
  pub allocated_bytes: usize,
  pub free_bytes: usize,
  pub largest_free: usize,
}

/// Walks the chain from the first real block up to the end sentinel.
pub struct Blocks<'a> {
  tags: Option<Tags>,
  next: Block,
  _heap: PhantomData<&'a ()>,
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<Self::Item> {
    let tags = self.tags?;

    if self.next.offset() > tags.len() {
      self.tags = None;
      return None;
    }

    let tag = unsafe { tags.header(self.next) };

    if tag.is_sentinel() {
      self.tags = None;
      return None;
    }

    let info = BlockInfo {
      offset: self.next.offset(),
      words: tag.words(),
      allocated: tag.is_allocated(),
    };
    self.next = self.next.advance(tag.words());

    Some(info)
  }
}

/// First-fit allocator over an implicit list of boundary-tagged blocks.
///
/// ```text
///   base
///    │ pad  begin  hdr                                      end
///    ▼ word footer  │                                      sentinel
///    ┌─────┬──┬──┬──▼─────────┬─────────────────────┬──┬──┬──┐
///    │     │0a│ h│  block     │  block              │ f│ f│0a│
///    └─────┴──┴──┴────────────┴─────────────────────┴──┴──┴──┘
///                 ▲
///               first
/// ```
///
/// Not thread safe and not reentrant: tag updates leave the heap inconsistent
/// between the header and the footer write.
pub struct ImplicitAllocator<S: HeapSource> {
  source: S,
  base: Option<NonNull<u8>>,
  first: Option<Block>,
  end: usize,
}

impl<S: HeapSource> ImplicitAllocator<S> {
  /// Wraps `source` without touching it. The heap is laid out by
  /// [`init`](Self::init) or by the first allocation.
  pub fn new(source: S) -> Self {
    Self {
      source,
      base: None,
      first: None,
      end: 0,
    }
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  pub fn is_initialized(&self) -> bool {
    self.first.is_some()
  }

  /// Bytes of the heap, sentinels and padding included.
  pub fn heap_size(&self) -> usize {
    self.end
  }

  /// Places the begin sentinel, the first free block and the end sentinel.
  ///
  /// Fails if the source refuses either growth request. Calling it again on
  /// an initialized heap does nothing.
  pub fn init(&mut self) -> Result<(), HeapError> {
    if self.first.is_some() {
      return Ok(());
    }

    if self.base.is_none() {
      self.lay_prologue()?;
    }

    let block = self.extend(INITIAL_WORDS)?;
    let tags = self.tags().ok_or(HeapError::Uninitialized)?;
    unsafe { tags.write(block.prev_footer_offset(), Tag::SENTINEL) };
    self.first = Some(block);

    debug!("heap initialized at {:?}, first block at offset {}", self.base, block.offset());
    Ok(())
  }

  /// Allocates `size` bytes, returning null when the heap cannot grow.
  pub fn malloc(
    &mut self,
    size: usize,
  ) -> *mut u8 {
    match self.try_allocate(size) {
      Ok(payload) => payload.as_ptr(),
      Err(err) => {
        warn!("malloc({size}) failed: {err}");
        ptr::null_mut()
      }
    }
  }

  /// Allocates `size` bytes from the first free block large enough, growing
  /// the heap by exactly the block size when none fits.
  ///
  /// A zero-size request gets the minimum block. On failure nothing has been
  /// written to the heap.
  pub fn try_allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    self.init()?;

    let words = words_for(size).ok_or(HeapError::RequestTooLarge { size })?;

    let block = match self.find_fit(words) {
      Some(block) => block,
      None => self.extend(words)?,
    };

    let tags = self.tags().ok_or(HeapError::Uninitialized)?;
    unsafe { Self::place(tags, block, words) };

    Ok(tags.payload(block))
  }

  /// Releases a block previously returned by this allocator and merges it
  /// with any free neighbour. Null and already free blocks are ignored.
  ///
  /// # Safety
  ///
  /// `payload` must be null or a pointer returned by [`malloc`](Self::malloc)
  /// or [`realloc`](Self::realloc) on this allocator. Nothing checks this:
  /// freeing a foreign pointer corrupts the heap.
  pub unsafe fn free(
    &mut self,
    payload: *mut u8,
  ) {
    if payload.is_null() {
      return;
    }

    let Some(tags) = self.tags() else {
      return;
    };

    let block = tags.block_of(payload);

    unsafe {
      if tags.is_allocated(block) {
        Self::coalesce(tags, block);
      }
    }
  }

  /// Moves an allocation into a block of `size` bytes.
  ///
  /// A null `payload` allocates, a zero `size` frees and returns null. A
  /// request that rounds to the current block size returns `payload` as is;
  /// anything else allocates a new block, copies the smaller of the two
  /// payloads and frees the old block, even when a free neighbour could have
  /// absorbed the growth. On failure the old block is left untouched.
  ///
  /// # Safety
  ///
  /// Same contract as [`free`](Self::free).
  pub unsafe fn realloc(
    &mut self,
    payload: *mut u8,
    size: usize,
  ) -> *mut u8 {
    if payload.is_null() {
      return self.malloc(size);
    }

    if size == 0 {
      unsafe { self.free(payload) };
      return ptr::null_mut();
    }

    let Some(tags) = self.tags() else {
      return ptr::null_mut();
    };

    let Some(words) = words_for(size) else {
      warn!("realloc({payload:?}, {size}) failed: {}", HeapError::RequestTooLarge { size });
      return ptr::null_mut();
    };

    let old_words = unsafe { tags.size_of(tags.block_of(payload)) };

    if old_words == words {
      return payload;
    }

    let moved = self.malloc(size);

    if moved.is_null() {
      return moved;
    }

    let copied = old_words.min(words) as usize * WORD_SIZE - WORD_SIZE;

    unsafe {
      ptr::copy_nonoverlapping(payload, moved, copied);
      self.free(payload);
    }

    moved
  }

  /// Usable bytes of the block behind `payload`.
  ///
  /// # Safety
  ///
  /// `payload` must point to a live allocation of this allocator.
  pub unsafe fn payload_size(
    &self,
    payload: *const u8,
  ) -> usize {
    match self.tags() {
      Some(tags) => unsafe { tags.header(tags.block_of(payload)).bytes() - WORD_SIZE },
      None => 0,
    }
  }

  pub fn blocks(&self) -> Blocks<'_> {
    Blocks {
      tags: self.tags().filter(|_| self.first.is_some()),
      next: self.first.unwrap_or(Block::new(PROLOGUE_BYTES)),
      _heap: PhantomData,
    }
  }

  pub fn stats(&self) -> HeapStats {
    self.blocks().fold(
      HeapStats {
        heap_bytes: self.end,
        ..HeapStats::default()
      },
      |mut stats, block| {
        if block.allocated {
          stats.allocated_blocks += 1;
          stats.allocated_bytes += block.bytes();
        } else {
          stats.free_blocks += 1;
          stats.free_bytes += block.bytes();
          stats.largest_free = stats.largest_free.max(block.bytes());
        }
        stats
      },
    )
  }

  /// Walks the whole heap and verifies every structural invariant: sentinels
  /// in place, payloads aligned, header and footer identical, no two free
  /// blocks adjacent, and the chain ending exactly at the break.
  pub fn check(&self) -> Result<(), HeapError> {
    let (Some(tags), Some(first)) = (self.tags(), self.first) else {
      return Err(HeapError::Uninitialized);
    };

    let corrupted = |block: Block, reason| HeapError::Corrupted {
      offset: block.offset(),
      reason,
    };

    unsafe {
      if tags.prev_tag(first) != Tag::SENTINEL {
        return Err(corrupted(first, "begin sentinel overwritten"));
      }

      let mut block = first;
      let mut prev_free = false;

      loop {
        if block.offset() > self.end {
          return Err(corrupted(block, "chain runs past the break"));
        }

        let header = tags.header(block);

        if header.is_sentinel() {
          if header != Tag::SENTINEL {
            return Err(corrupted(block, "end sentinel is not allocated"));
          }
          if block.offset() != self.end {
            return Err(corrupted(block, "end sentinel before the break"));
          }
          return Ok(());
        }

        if block.offset() % DWORD_SIZE != 0 {
          return Err(corrupted(block, "misaligned payload"));
        }
        if header.words() < MIN_BLOCK_WORDS {
          return Err(corrupted(block, "block smaller than the minimum"));
        }
        if block.advance(header.words()).offset() > self.end {
          return Err(corrupted(block, "block runs past the break"));
        }
        if tags.footer(block) != header {
          return Err(corrupted(block, "header and footer disagree"));
        }
        if prev_free && !header.is_allocated() {
          return Err(corrupted(block, "adjacent free blocks"));
        }

        prev_free = !header.is_allocated();
        block = block.advance(header.words());
      }
    }
  }

  /// Prints every block with its tag offsets relative to the heap's low address.
  pub fn dump(&self) {
    let low = self.source.low_address();

    println!(
      "Heap {:?}..={:?} ({} bytes)",
      low,
      self.source.high_address(),
      self.source.current_size()
    );

    let Some(tags) = self.tags() else {
      return;
    };

    let base = tags.payload(Block::new(0)).as_ptr() as usize;
    let relative = |offset: usize| base + offset - low as usize;

    for info in self.blocks() {
      let block = Block::new(info.offset);
      println!(
        "Block Addr {:?}; Size {}; Alloc {}",
        tags.payload(block),
        info.words,
        info.allocated
      );
      println!("  header: {}", relative(block.header_offset()));
      println!("  footer: {}", relative(block.footer_offset(info.words)));
      println!("  nextHeader: {}", relative(block.advance(info.words).header_offset()));
      println!("  prevFooter: {}", relative(block.prev_footer_offset()));
    }
  }

  fn tags(&self) -> Option<Tags> {
    self.base.map(|base| unsafe { Tags::new(base, self.end) })
  }

  /// Grows the source by the padding word and the begin sentinel footer, plus
  /// whatever it takes to put the first payload on a 16-byte boundary.
  fn lay_prologue(&mut self) -> Result<(), HeapError> {
    let start = self
      .source
      .grow(PROLOGUE_BYTES as isize)
      .ok_or(HeapError::OutOfMemory {
        requested: PROLOGUE_BYTES,
      })?;

    let padding = start.as_ptr().align_offset(DWORD_SIZE);

    if padding != 0 {
      match self.source.grow(padding as isize) {
        Some(previous) if previous.as_ptr() == start.as_ptr().wrapping_add(PROLOGUE_BYTES) => {}
        Some(_) => return Err(HeapError::Discontiguous),
        None => return Err(HeapError::OutOfMemory { requested: padding }),
      }
    }

    self.base = Some(unsafe { start.add(padding) });
    self.end = PROLOGUE_BYTES;

    Ok(())
  }

  /// Grows the heap by `words` and formats the new bytes as a free block
  /// followed by a fresh end sentinel. Once the heap is initialized, a free
  /// block right before the new one is merged into it.
  fn extend(
    &mut self,
    words: u32,
  ) -> Result<Block, HeapError> {
    let base = self.base.ok_or(HeapError::Uninitialized)?;
    let bytes = words as usize * WORD_SIZE;
    let requested = HeapError::OutOfMemory { requested: bytes };

    let end = self
      .end
      .checked_add(bytes)
      .filter(|end| end / WORD_SIZE <= MAX_HEAP_WORDS)
      .ok_or(requested)?;
    let delta = isize::try_from(bytes).map_err(|_| requested)?;

    let Some(previous) = self.source.grow(delta) else {
      warn!("heap source refused {bytes} more bytes at {end} bytes of heap");
      return Err(requested);
    };

    if previous.as_ptr() != base.as_ptr().wrapping_add(self.end) {
      warn!(
        "program break moved from {:?} to {:?} behind the allocator",
        base.as_ptr().wrapping_add(self.end),
        previous
      );

      if self.source.grow(-delta).is_none() {
        warn!("heap source refused to take back {bytes} bytes at {previous:?}");
      }

      return Err(HeapError::Discontiguous);
    }

    let block = Block::new(self.end);
    self.end = end;

    let tags = self.tags().ok_or(HeapError::Uninitialized)?;

    unsafe {
      tags.write_tags(block, words, false);
      tags.write(tags.next_block(block).header_offset(), Tag::SENTINEL);
    }

    debug!("heap extended by {words} words at offset {}", block.offset());

    if self.first.is_none() {
      return Ok(block);
    }

    let prev = unsafe { tags.prev_tag(block) };

    if prev.is_allocated() {
      return Ok(block);
    }

    let merged = block.retreat(prev.words());
    unsafe { tags.write_tags(merged, prev.words() + words, false) };

    debug!("extension merged with free block at offset {}", merged.offset());
    Ok(merged)
  }

  fn find_fit(
    &self,
    words: u32,
  ) -> Option<Block> {
    self
      .blocks()
      .find(|block| !block.allocated && block.words >= words)
      .map(|block| Block::new(block.offset))
  }

  /// Marks `block` allocated, splitting off the excess as a free block.
  ///
  /// # Safety
  ///
  /// `block` must be a free block of at least `words` words.
  unsafe fn place(
    tags: Tags,
    block: Block,
    words: u32,
  ) {
    let size = unsafe { tags.size_of(block) };

    if size == words {
      unsafe { tags.flip_allocated(block) };
      return;
    }

    unsafe { Self::split(tags, block, words) };
  }

  /// # Safety
  ///
  /// `block` must be a free block larger than `words`.
  unsafe fn split(
    tags: Tags,
    block: Block,
    words: u32,
  ) {
    let remainder = unsafe { tags.size_of(block) } - words;
    debug_assert!(remainder >= MIN_BLOCK_WORDS, "split remainder of {remainder} words");

    unsafe {
      tags.write_tags(block, words, true);
      tags.write_tags(block.advance(words), remainder, false);
    }

    debug!("split block at offset {} into {words} + {remainder} words", block.offset());
  }

  /// Frees `block` and merges it with its free neighbours, returning the
  /// block that now holds the space.
  ///
  /// ```text
  ///   prev  next   result
  ///   used  used   block
  ///   used  free   block + next
  ///   free  used   prev + block
  ///   free  free   prev + block + next
  /// ```
  ///
  /// # Safety
  ///
  /// `block` must be an allocated real block.
  unsafe fn coalesce(
    tags: Tags,
    block: Block,
  ) -> Block {
    unsafe {
      let words = tags.size_of(block);
      let prev = tags.prev_tag(block);
      let next = tags.header(tags.next_block(block));

      let merged = match (prev.is_allocated(), next.is_allocated()) {
        (true, true) => {
          tags.flip_allocated(block);
          return block;
        }
        (true, false) => {
          tags.write_tags(block, words + next.words(), false);
          block
        }
        (false, true) => {
          let start = block.retreat(prev.words());
          tags.write_tags(start, prev.words() + words, false);
          start
        }
        (false, false) => {
          let start = block.retreat(prev.words());
          tags.write_tags(start, prev.words() + words + next.words(), false);
          start
        }
      };

      debug!(
        "coalesced block at offset {} into {} words at offset {}",
        block.offset(),
        tags.size_of(merged),
        merged.offset()
      );
      merged
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::source::MemoryRegion;

  fn allocator() -> ImplicitAllocator<MemoryRegion> {
    let mut allocator = ImplicitAllocator::new(MemoryRegion::with_capacity(1 << 16).unwrap());
    allocator.init().unwrap();
    allocator
  }

  fn layout(allocator: &ImplicitAllocator<MemoryRegion>) -> Vec<(usize, u32, bool)> {
    allocator
      .blocks()
      .map(|block| (block.offset, block.words, block.allocated))
      .collect()
  }

  fn offset(
    allocator: &ImplicitAllocator<MemoryRegion>,
    payload: *mut u8,
  ) -> usize {
    payload as usize - allocator.source().low_address() as usize
  }

  #[test]
  fn test_init_layout() {
    let allocator = allocator();

    assert_eq!(allocator.heap_size(), 96);
    assert_eq!(allocator.source().current_size(), 96);
    assert_eq!(layout(&allocator), vec![(16, 10, false)]);
    allocator.check().unwrap();
  }

  #[test]
  fn test_init_twice_is_noop() {
    let mut allocator = allocator();

    allocator.init().unwrap();

    assert_eq!(allocator.heap_size(), 96);
    assert_eq!(layout(&allocator), vec![(16, 10, false)]);
  }

  #[test]
  fn test_init_fails_without_room() {
    let mut allocator = ImplicitAllocator::new(MemoryRegion::with_capacity(64).unwrap());

    assert_eq!(allocator.init(), Err(HeapError::OutOfMemory { requested: 80 }));
    assert!(!allocator.is_initialized());
    assert_eq!(allocator.check(), Err(HeapError::Uninitialized));
    assert_eq!(allocator.blocks().count(), 0);
  }

  #[test]
  fn test_malloc_initializes_lazily() {
    let mut allocator = ImplicitAllocator::new(MemoryRegion::with_capacity(4096).unwrap());

    let payload = allocator.malloc(8);

    assert!(!payload.is_null());
    assert_eq!(offset(&allocator, payload), 16);
    assert_eq!(layout(&allocator), vec![(16, 2, true), (32, 8, false)]);
    allocator.check().unwrap();
  }

  #[test]
  fn test_split_leaves_free_remainder() {
    let mut allocator = allocator();

    let a = allocator.malloc(22);

    assert_eq!(offset(&allocator, a), 16);
    assert_eq!(layout(&allocator), vec![(16, 4, true), (48, 6, false)]);
    allocator.check().unwrap();
  }

  #[test]
  fn test_exact_fit_flips_in_place() {
    let mut allocator = allocator();

    let a = allocator.malloc(72);

    assert_eq!(offset(&allocator, a), 16);
    assert_eq!(layout(&allocator), vec![(16, 10, true)]);
    assert_eq!(allocator.heap_size(), 96);
    allocator.check().unwrap();
  }

  #[test]
  fn test_extend_merges_with_trailing_free_block() {
    let mut allocator = allocator();

    let a = allocator.malloc(100);

    assert_eq!(offset(&allocator, a), 16);
    assert_eq!(allocator.heap_size(), 96 + 14 * WORD_SIZE);
    assert_eq!(layout(&allocator), vec![(16, 14, true), (128, 10, false)]);
    allocator.check().unwrap();
  }

  #[test]
  fn test_extend_without_free_tail() {
    let mut allocator = allocator();

    allocator.malloc(72);
    let b = allocator.malloc(24);

    assert_eq!(offset(&allocator, b), 96);
    assert_eq!(layout(&allocator), vec![(16, 10, true), (96, 4, true)]);
    allocator.check().unwrap();
  }

  #[test]
  fn test_free_coalesce_cases() {
    let mut allocator = allocator();

    let a = allocator.malloc(8);
    let b = allocator.malloc(8);
    let c = allocator.malloc(8);
    let d = allocator.malloc(8);
    let e = allocator.malloc(8);
    assert_eq!(layout(&allocator), vec![
      (16, 2, true),
      (32, 2, true),
      (48, 2, true),
      (64, 2, true),
      (80, 2, true),
    ]);

    unsafe {
      // both neighbours allocated
      allocator.free(b);
      assert_eq!(layout(&allocator)[1], (32, 2, false));
      allocator.check().unwrap();

      // previous free
      allocator.free(c);
      assert_eq!(layout(&allocator)[1], (32, 4, false));
      allocator.check().unwrap();

      // next free
      allocator.free(a);
      assert_eq!(layout(&allocator)[0], (16, 6, false));
      allocator.check().unwrap();

      // both free
      allocator.free(e);
      allocator.free(d);
      assert_eq!(layout(&allocator), vec![(16, 10, false)]);
      allocator.check().unwrap();
    }
  }

  #[test]
  fn test_free_ignores_null_and_free_blocks() {
    let mut allocator = allocator();

    let a = allocator.malloc(8);
    let _b = allocator.malloc(8);

    unsafe {
      allocator.free(ptr::null_mut());
      allocator.free(a);
      let before = layout(&allocator);
      allocator.free(a);
      assert_eq!(layout(&allocator), before);
    }
    allocator.check().unwrap();
  }

  #[test]
  fn test_realloc_same_words_is_noop() {
    let mut allocator = allocator();

    let a = allocator.malloc(20);

    unsafe {
      assert_eq!(allocator.realloc(a, 24), a);
      assert_eq!(allocator.realloc(a, 9), a);
    }
  }

  #[test]
  fn test_realloc_moves_even_with_free_neighbour() {
    let mut allocator = allocator();

    let a = allocator.malloc(8);

    unsafe {
      ptr::write_bytes(a, 0x5A, 8);

      let b = allocator.realloc(a, 40);

      assert_ne!(a, b);
      assert_eq!(offset(&allocator, b), 32);
      assert_eq!(std::slice::from_raw_parts(b, 8), &[0x5A; 8]);
      assert_eq!(layout(&allocator), vec![(16, 2, false), (32, 6, true), (80, 2, false)]);
    }
    allocator.check().unwrap();
  }

  #[test]
  fn test_realloc_null_and_zero() {
    let mut allocator = allocator();

    unsafe {
      let a = allocator.realloc(ptr::null_mut(), 16);
      assert_eq!(offset(&allocator, a), 16);

      assert!(allocator.realloc(a, 0).is_null());
    }
    assert_eq!(layout(&allocator), vec![(16, 10, false)]);
  }

  #[test]
  fn test_payload_size() {
    let mut allocator = allocator();

    let a = allocator.malloc(0);
    let b = allocator.malloc(30);

    unsafe {
      assert_eq!(allocator.payload_size(a), 8);
      assert_eq!(allocator.payload_size(b), 40);
    }
  }

  #[test]
  fn test_request_too_large() {
    let mut allocator = allocator();

    assert_eq!(
      allocator.try_allocate(usize::MAX),
      Err(HeapError::RequestTooLarge { size: usize::MAX })
    );
    assert!(allocator.malloc(usize::MAX).is_null());
    allocator.check().unwrap();
  }

  #[test]
  fn test_stats() {
    let mut allocator = allocator();

    allocator.malloc(22);

    assert_eq!(allocator.stats(), HeapStats {
      heap_bytes: 96,
      allocated_blocks: 1,
      free_blocks: 1,
      allocated_bytes: 32,
      free_bytes: 48,
      largest_free: 48,
    });
  }

  #[test]
  fn test_check_detects_corruption() {
    let mut allocator = allocator();

    let a = allocator.malloc(8);
    allocator.malloc(8);

    unsafe {
      // clobber the footer of `a` as an overflowing write would
      ptr::write_bytes(a, 0xFF, 12);
    }

    assert_eq!(
      allocator.check(),
      Err(HeapError::Corrupted {
        offset: 16,
        reason: "header and footer disagree",
      })
    );
  }
}
