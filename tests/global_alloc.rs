//! The whole test binary, harness included, runs on `Allocator`.

use std::{collections::BTreeMap, thread};

use bucket_malloc::{Allocator, PAGE_SIZE};

#[global_allocator]
static GLOBAL: Allocator = Allocator;

#[test]
fn collections_grow_and_shrink() {
  let mut numbers: Vec<u64> = Vec::new();
  for i in 0..100_000 {
    numbers.push(i);
  }
  assert_eq!(numbers.iter().sum::<u64>(), 99_999 * 100_000 / 2);
  numbers.truncate(10);
  numbers.shrink_to_fit();
  assert_eq!(numbers, (0..10).collect::<Vec<_>>());

  let mut text = String::new();
  for word in ["bucket", "page", "cache"].iter().cycle().take(3_000) {
    text.push_str(word);
    text.push(' ');
  }
  assert_eq!(text.split_whitespace().count(), 3_000);

  let map: BTreeMap<String, Vec<u8>> = (0..2_000)
    .map(|i| (format!("key-{i}"), vec![i as u8; i % 97]))
    .collect();
  assert_eq!(map["key-1500"].len(), 1500 % 97);
}

#[repr(align(4096))]
struct PageAligned([u8; PAGE_SIZE]);

#[repr(align(64))]
struct LineAligned(#[allow(dead_code)] [u8; 48]);

#[test]
fn over_aligned_types_land_on_their_boundary() {
  let lines: Vec<Box<LineAligned>> = (0..500).map(|_| Box::new(LineAligned([7; 48]))).collect();
  assert!(lines.iter().all(|b| &**b as *const LineAligned as usize % 64 == 0));

  let pages: Vec<Box<PageAligned>> = (0..8).map(|_| Box::new(PageAligned([1; PAGE_SIZE]))).collect();
  for page in &pages {
    assert_eq!(page.0.as_ptr() as usize % 4096, 0);
    assert!(page.0.iter().all(|&b| b == 1));
  }
}

#[test]
fn boxes_cross_threads() {
  let handles: Vec<_> = (0..8)
    .map(|t| {
      thread::spawn(move || {
        (0..1_000)
          .map(|i| Box::new(format!("{t}:{i}")))
          .collect::<Vec<_>>()
      })
    })
    .collect();

  // Dropped on this thread, allocated on eight others.
  let total: usize = handles
    .into_iter()
    .map(|h| h.join().unwrap().len())
    .sum();
  assert_eq!(total, 8_000);
}

#[test]
fn zeroed_vectors_read_zero() {
  for len in [1, 100, PAGE_SIZE, 10 * PAGE_SIZE] {
    let mut scratch = vec![0xFFu8; len];
    scratch.iter_mut().for_each(|b| *b = 0xFF);
    drop(scratch);

    let zeroed = vec![0u8; len];
    assert!(zeroed.iter().all(|&b| b == 0));
  }
}
