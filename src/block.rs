//! Boundary tags and the address arithmetic of the implicit block chain.
//!
//! ```text
//!            header                                 footer
//!              │                                      │
//!   ... ───┬───▼───┬──────────────────────────────┬───▼───┬───┬─── ...
//!          │ size|a│          payload             │ size|a│ h │
//!   ... ───┴───────┴──────────────────────────────┴───────┴───┴─── ...
//!          4 bytes ▲                               4 bytes  ▲
//!                  │                                        │
//!                block                                 next block
//!                  └────────── size * WORD_SIZE ────────────┘
//! ```
//!
//! A [`Block`] is the byte offset of its payload from the heap base. Header and
//! footer together take one word, the payload is always 16-byte aligned.

use std::{fmt, ptr::NonNull};

/// Unit of size accounting.
pub const WORD_SIZE: usize = 8;

/// Alignment of every payload.
pub const DWORD_SIZE: usize = 2 * WORD_SIZE;

/// Width of a header or footer tag.
pub const TAG_SIZE: usize = 4;

/// Smallest legal block: one word of tags plus one word of payload.
pub const MIN_BLOCK_WORDS: u32 = 2;

/// A block size in words with the allocated flag packed into the low bit.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(u32);

impl Tag {
  /// Header of the end sentinel and footer of the begin sentinel.
  pub const SENTINEL: Tag = Tag(1);

  pub fn new(
    words: u32,
    allocated: bool,
  ) -> Self {
    debug_assert!(words % 2 == 0, "block size {words} is not a whole number of double words");
    Self(words | allocated as u32)
  }

  pub const fn from_bits(bits: u32) -> Self {
    Self(bits)
  }

  pub const fn bits(self) -> u32 {
    self.0
  }

  pub const fn words(self) -> u32 {
    self.0 & !1
  }

  pub const fn bytes(self) -> usize {
    self.words() as usize * WORD_SIZE
  }

  pub const fn is_allocated(self) -> bool {
    self.0 & 1 == 1
  }

  /// Zero-size tags only appear on the sentinels.
  pub const fn is_sentinel(self) -> bool {
    self.words() == 0
  }

  pub const fn toggled(self) -> Self {
    Self(self.0 ^ 1)
  }
}

impl fmt::Debug for Tag {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "Tag({}{})", self.words(), if self.is_allocated() { "|a" } else { "" })
  }
}

/// Offset of a block's payload from the heap base.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(usize);

impl Block {
  pub const fn new(offset: usize) -> Self {
    Self(offset)
  }

  pub const fn offset(self) -> usize {
    self.0
  }

  pub const fn header_offset(self) -> usize {
    self.0 - TAG_SIZE
  }

  /// The footer of whatever block precedes this one.
  pub const fn prev_footer_offset(self) -> usize {
    self.0 - WORD_SIZE
  }

  pub const fn footer_offset(
    self,
    words: u32,
  ) -> usize {
    self.0 + words as usize * WORD_SIZE - WORD_SIZE
  }

  pub const fn advance(
    self,
    words: u32,
  ) -> Self {
    Self(self.0 + words as usize * WORD_SIZE)
  }

  pub const fn retreat(
    self,
    words: u32,
  ) -> Self {
    Self(self.0 - words as usize * WORD_SIZE)
  }
}

/// Reads and writes tags of a heap whose first byte is `base`.
///
/// None of the traversal helpers check that a block is well formed: calling
/// them on an offset that is not a block payload yields garbage.
#[derive(Clone, Copy)]
pub struct Tags {
  base: NonNull<u8>,
  len: usize,
}

impl Tags {
  /// # Safety
  ///
  /// `base` must be 16-byte aligned and the `len` bytes following it must be
  /// valid for reads and writes for as long as the returned value is used.
  pub unsafe fn new(
    base: NonNull<u8>,
    len: usize,
  ) -> Self {
    debug_assert!(base.as_ptr() as usize % DWORD_SIZE == 0, "heap base {base:?} is misaligned");
    Self { base, len }
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn payload(
    &self,
    block: Block,
  ) -> NonNull<u8> {
    debug_assert!(block.offset() <= self.len, "block {block:?} out of bounds");
    unsafe { self.base.add(block.offset()) }
  }

  /// Maps a payload pointer handed out earlier back to its block.
  pub fn block_of(
    &self,
    payload: *const u8,
  ) -> Block {
    Block::new(payload as usize - self.base.as_ptr() as usize)
  }

  /// # Safety
  ///
  /// `offset` must be tag aligned and inside the heap.
  pub unsafe fn read(
    &self,
    offset: usize,
  ) -> Tag {
    debug_assert!(
      offset % TAG_SIZE == 0 && offset + TAG_SIZE <= self.len,
      "tag offset {offset} out of bounds"
    );
    unsafe { Tag::from_bits(self.base.as_ptr().add(offset).cast::<u32>().read()) }
  }

  /// # Safety
  ///
  /// `offset` must be tag aligned and inside the heap.
  pub unsafe fn write(
    &self,
    offset: usize,
    tag: Tag,
  ) {
    debug_assert!(
      offset % TAG_SIZE == 0 && offset + TAG_SIZE <= self.len,
      "tag offset {offset} out of bounds"
    );
    unsafe { self.base.as_ptr().add(offset).cast::<u32>().write(tag.bits()) }
  }

  /// # Safety
  ///
  /// `block` must have a well-formed header.
  pub unsafe fn header(
    &self,
    block: Block,
  ) -> Tag {
    unsafe { self.read(block.header_offset()) }
  }

  /// # Safety
  ///
  /// `block` must have a well-formed header and must not be a sentinel.
  pub unsafe fn footer(
    &self,
    block: Block,
  ) -> Tag {
    unsafe { self.read(block.footer_offset(self.size_of(block))) }
  }

  /// # Safety
  ///
  /// `block` must have a well-formed header.
  pub unsafe fn size_of(
    &self,
    block: Block,
  ) -> u32 {
    unsafe { self.header(block).words() }
  }

  /// # Safety
  ///
  /// `block` must have a well-formed header.
  pub unsafe fn is_allocated(
    &self,
    block: Block,
  ) -> bool {
    unsafe { self.header(block).is_allocated() }
  }

  /// The footer tag sitting right before `block`'s header.
  ///
  /// # Safety
  ///
  /// `block` must be a real block, so that its predecessor is a block or the
  /// begin sentinel.
  pub unsafe fn prev_tag(
    &self,
    block: Block,
  ) -> Tag {
    unsafe { self.read(block.prev_footer_offset()) }
  }

  /// # Safety
  ///
  /// `block` must have a well-formed header.
  pub unsafe fn next_block(
    &self,
    block: Block,
  ) -> Block {
    unsafe { block.advance(self.size_of(block)) }
  }

  /// # Safety
  ///
  /// `block` must be a real block preceded by a real block.
  pub unsafe fn prev_block(
    &self,
    block: Block,
  ) -> Block {
    unsafe { block.retreat(self.prev_tag(block).words()) }
  }

  /// Writes the same tag into the header and footer of a `words` sized block.
  ///
  /// # Safety
  ///
  /// The whole span of the block must be inside the heap.
  pub unsafe fn write_tags(
    &self,
    block: Block,
    words: u32,
    allocated: bool,
  ) {
    let tag = Tag::new(words, allocated);
    unsafe {
      self.write(block.header_offset(), tag);
      self.write(block.footer_offset(words), tag);
    }
  }

  /// Toggles the allocated flag of both tags without touching the size.
  ///
  /// # Safety
  ///
  /// `block` must have well-formed tags.
  pub unsafe fn flip_allocated(
    &self,
    block: Block,
  ) {
    unsafe {
      let tag = self.header(block).toggled();
      self.write(block.header_offset(), tag);
      self.write(block.footer_offset(tag.words()), tag);
    }
  }
}
