use crate::block::{DWORD_SIZE, WORD_SIZE};

/// Rounds `value` up to the next multiple of `align`, which must be a power of two.
///
/// # Examples
///
/// ```rust
/// use implicit_alloc::align_to;
///
/// assert_eq!(align_to!(13, 8), 16);
/// assert_eq!(align_to!(16, 16), 16);
/// assert_eq!(align_to!(0, 4096), 0);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $align:expr) => {
    ($value + $align - 1) & !($align - 1)
  };
}

/// Rounds `value` up to the allocator's double-word granularity (16 bytes).
///
/// # Examples
///
/// ```rust
/// use implicit_alloc::align;
///
/// assert_eq!(align!(1), 16);
/// assert_eq!(align!(30), 32);
/// assert_eq!(align!(32), 32);
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align_to!($value, $crate::block::DWORD_SIZE)
  };
}

/// Converts a request of `size` payload bytes into a block size in words.
///
/// One word of tag overhead (header and footer, four bytes each) is added and
/// the total is rounded up to an even number of words, so `words_for(0)` is
/// the minimum block of 2 words. Returns `None` when the result cannot be
/// encoded in a tag.
///
/// ```text
///   size  0..=8   -> 2 words
///   size  9..=24  -> 4 words
///   size 25..=40  -> 6 words
/// ```
pub fn words_for(size: usize) -> Option<u32> {
  let total = size
    .checked_add(WORD_SIZE)
    .filter(|total| *total <= usize::MAX - (DWORD_SIZE - 1))?;
  let bytes = align!(total);

  u32::try_from(bytes / WORD_SIZE).ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_align_matches_block_rounding() {
    for words in (2..40u32).step_by(2) {
      let largest = words as usize * WORD_SIZE;
      let smallest = largest - DWORD_SIZE + 1;

      for total in smallest..=largest {
        assert_eq!(align!(total), largest);
      }

      for total in smallest.max(WORD_SIZE)..=largest {
        assert_eq!(words_for(total - WORD_SIZE), Some(words));
      }
    }
  }

  #[test]
  fn test_align_to_page() {
    assert_eq!(align_to!(1usize, 4096usize), 4096);
    assert_eq!(align_to!(4097usize, 4096usize), 8192);
  }

  #[test]
  fn test_words_for() {
    assert_eq!(words_for(0), Some(2));
    assert_eq!(words_for(8), Some(2));
    assert_eq!(words_for(9), Some(4));
    assert_eq!(words_for(10), Some(4));
    assert_eq!(words_for(22), Some(4));
    assert_eq!(words_for(26), Some(6));
    assert_eq!(words_for(4 * DWORD_SIZE), Some(10));
  }

  #[test]
  fn test_words_for_is_always_even() {
    for size in 0..512 {
      let words = words_for(size).unwrap();
      assert_eq!(words % 2, 0);
      assert!(words as usize * WORD_SIZE >= size + WORD_SIZE);
    }
  }

  #[test]
  fn test_words_for_overflow() {
    assert_eq!(words_for(usize::MAX), None);
    assert_eq!(words_for(usize::MAX - WORD_SIZE), None);
  }
}
