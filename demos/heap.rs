use std::{io::Read, ptr};

use implicit_alloc::{HeapSource, ImplicitAllocator, ProgramBreak};

/// Waits until the user presses ENTER.
/// Useful when you want to inspect memory state with tools like `pmap`, `gdb`,
/// or just visually track how the program break moves.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

fn print_program_break(
  label: &str,
  allocator: &ImplicitAllocator<ProgramBreak>,
) {
  println!(
    "[{}] PID = {}, heap = {} bytes, program break = {:?}",
    label,
    std::process::id(),
    allocator.source().current_size(),
    allocator.source().high_address().wrapping_add(1),
  );
}

fn report(
  step: &str,
  payload: *mut u8,
  allocator: &ImplicitAllocator<ProgramBreak>,
) {
  if payload.is_null() {
    // the Rust runtime's own allocator may have moved the break meanwhile
    println!("{step}: allocation failed");
  } else {
    println!(
      "{step}: payload at {payload:?}, {} usable bytes",
      unsafe { allocator.payload_size(payload) }
    );
  }
}

fn main() {
  let mut allocator = ImplicitAllocator::new(ProgramBreak::new());

  if let Err(err) = allocator.init() {
    eprintln!("could not lay out the heap: {err}");
    return;
  }

  print_program_break("start", &allocator);
  allocator.dump();
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 1) Two small allocations carved out of the initial free block.
  // --------------------------------------------------------------------
  let first = allocator.malloc(22);
  report("[1] malloc(22)", first, &allocator);
  let second = allocator.malloc(26);
  report("[1] malloc(26)", second, &allocator);
  allocator.dump();
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 2) Free the first block and ask for less: first fit lands on it again.
  // --------------------------------------------------------------------
  unsafe { allocator.free(first) };
  let third = allocator.malloc(10);
  report("[2] malloc(10)", third, &allocator);
  println!(
    "[2] third == first? {}",
    if third == first { "Yes, reused the freed block" } else { "No" }
  );
  allocator.dump();
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 3) Grow through realloc: the payload moves and keeps its bytes.
  // --------------------------------------------------------------------
  if !third.is_null() {
    unsafe {
      ptr::write_bytes(third, 0xAB, 10);
      let moved = allocator.realloc(third, 200);
      report("[3] realloc(third, 200)", moved, &allocator);
      if !moved.is_null() {
        println!("[3] first byte after move = 0x{:X}", *moved);
      }
    }
  }
  print_program_break("after realloc", &allocator);
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 4) A large request extends the heap.
  // --------------------------------------------------------------------
  let big = allocator.malloc(64 * 1024);
  report("[4] malloc(64 KiB)", big, &allocator);
  print_program_break("after large alloc", &allocator);

  match allocator.check() {
    Ok(()) => println!("\n[5] heap consistent: {:?}", allocator.stats()),
    Err(err) => println!("\n[5] heap check failed: {err}"),
  }
}
