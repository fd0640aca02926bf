//! # implicit_alloc - An Implicit Free List Allocator
//!
//! This crate provides a classic **implicit free list** allocator: every block,
//! free or allocated, lives in one contiguous heap and carries its own size
//! and status in a pair of *boundary tags*. There is no separate index of free
//! blocks; the chain is walked by address arithmetic alone.
//!
//! ## Overview
//!
//! ```text
//!   Implicit Free List:
//!
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │                           HEAP MEMORY                                │
//!   │                                                                      │
//!   │  ┌──┬───────┬──────────┬────┬──────────────┬─────────────────┬──┐    │
//!   │  │S │  A1   │   free   │ A2 │      A3      │      free       │S │    │
//!   │  └──┴───────┴──────────┴────┴──────────────┴─────────────────┴──┘    │
//!   │   ▲                                                             ▲    │
//!   │   │                                                             │    │
//!   │ begin sentinel                                        end sentinel   │
//!   │                                                        (size 0)      │
//!   └──────────────────────────────────────────────────────────────────────┘
//!
//!   next block     = payload + size
//!   previous block = payload - size read from the footer just before us
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   implicit_alloc
//!   ├── align      - Rounding macros (align!, align_to!) and words_for()
//!   ├── block      - Tags, block offsets and boundary tag arithmetic
//!   ├── error      - HeapError
//!   ├── implicit   - ImplicitAllocator: init, malloc, free, realloc, check
//!   └── source     - HeapSource trait, MemoryRegion and ProgramBreak
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use implicit_alloc::{ImplicitAllocator, MemoryRegion};
//!
//! let mut allocator = ImplicitAllocator::new(MemoryRegion::new().unwrap());
//! allocator.init().unwrap();
//!
//! let ptr = allocator.malloc(8) as *mut u64;
//! assert_eq!(ptr as usize % 16, 0);
//!
//! unsafe {
//!     *ptr = 42;
//!     assert_eq!(*ptr, 42);
//!     allocator.free(ptr as *mut u8);
//! }
//!
//! allocator.check().unwrap();
//! ```
//!
//! ## How It Works
//!
//! Sizes are counted in 8-byte words. A tag is a `u32` holding the block size
//! in words with the allocated flag in the low bit, which is always free
//! because sizes are even:
//!
//! ```text
//!   Single Block (4 words = 32 bytes):
//!
//!        header                                   footer
//!   ┌───────────┬───────────────────────────────┬───────────┐
//!   │  4 | 1    │        24 bytes usable        │  4 | 1    │
//!   └───────────┴───────────────────────────────┴───────────┘
//!     4 bytes   ▲                                  4 bytes
//!               └── Pointer returned to user (16-byte aligned)
//! ```
//!
//! * **Allocation** rounds the request up to an even word count including one
//!   word of tags, scans the chain from the first block and takes the first
//!   free block that is large enough. Excess space is split off as a new free
//!   block. When nothing fits, the heap grows by exactly the request, merging
//!   with a free block at the tail of the heap.
//! * **Deallocation** flips the block to free and immediately coalesces it
//!   with a free predecessor, successor, or both, so no two free blocks are
//!   ever adjacent.
//! * **Reallocation** allocates, copies the smaller payload and frees. It never
//!   grows a block in place, even into a free neighbour.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: no synchronization, not reentrant
//! - **No misuse detection**: double free is ignored, foreign pointers corrupt the heap
//! - **Linear search**: allocation is O(blocks)
//! - **Never shrinks**: freed memory is kept for reuse, not returned to the source
//!
//! ## Safety
//!
//! The allocator writes tags directly into the memory its [`HeapSource`]
//! provides. `free` and `realloc` are `unsafe`: they trust that the pointer
//! came from the same allocator and is still live.

pub mod align;
pub mod block;
mod error;
mod implicit;
pub mod source;

pub use error::HeapError;
pub use implicit::{BlockInfo, Blocks, HeapStats, INITIAL_WORDS, ImplicitAllocator};
#[cfg(unix)]
pub use source::ProgramBreak;
pub use source::{DEFAULT_CAPACITY, HeapSource, MemoryRegion};
