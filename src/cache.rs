//! Per-thread cache of disposed bucket pages.
//!
//! Pages are not reused from here. The cache only defers `unmap` so that
//! physically adjacent pages can be returned to the OS in a single call. It is
//! a plain binary min-heap keyed by address: draining it through repeated
//! `pop` visits pages in ascending order, which is all coalescing needs.

use core::ptr::{NonNull, null_mut};

use crate::{CACHE_CAPACITY, PAGE_SIZE, diag, platform::PageMapper};

pub(crate) struct PageCache {
  pages: [*mut u8; CACHE_CAPACITY],
  fill: usize,
}

impl PageCache {
  pub(crate) const fn new() -> Self {
    Self {
      pages: [null_mut(); CACHE_CAPACITY],
      fill: 0,
    }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.fill
  }

  /// Adds a disposed page. Evicts down to half capacity first when full.
  pub(crate) fn push<M: PageMapper>(&mut self, mapper: &M, page: NonNull<u8>) {
    debug_assert!(page.as_ptr() as usize % PAGE_SIZE == 0);
    debug_assert!(
      !self.pages[..self.fill].contains(&page.as_ptr()),
      "page {:p} pushed twice",
      page
    );

    if self.fill == CACHE_CAPACITY {
      self.reduce(mapper, CACHE_CAPACITY / 2);
    }

    self.pages[self.fill] = page.as_ptr();
    self.fill += 1;
    self.sift_up(self.fill - 1);
    debug_assert!(self.is_heap());
  }

  /// Removes the lowest address.
  fn pop(&mut self) -> Option<*mut u8> {
    if self.fill == 0 {
      return None;
    }
    let min = self.pages[0];
    self.fill -= 1;
    self.pages[0] = self.pages[self.fill];
    self.pages[self.fill] = null_mut();
    self.sift_down(0);
    debug_assert!(self.is_heap());
    Some(min)
  }

  /// Unmaps pages, lowest addresses first, until at most `target` remain.
  /// Consecutive pages are merged into one `unmap` call.
  pub(crate) fn reduce<M: PageMapper>(&mut self, mapper: &M, target: usize) {
    if self.fill <= target {
      return;
    }
    let Some(first) = self.pop() else {
      return;
    };

    let mut run_start = first;
    let mut run_len = PAGE_SIZE;

    while self.fill > target {
      let Some(page) = self.pop() else {
        break;
      };
      if page as usize == run_start as usize + run_len {
        run_len += PAGE_SIZE;
      } else {
        release(mapper, run_start, run_len);
        run_start = page;
        run_len = PAGE_SIZE;
      }
    }

    release(mapper, run_start, run_len);
  }

  fn sift_up(&mut self, mut i: usize) {
    while i > 0 {
      let parent = (i - 1) / 2;
      if self.pages[i] >= self.pages[parent] {
        break;
      }
      self.pages.swap(i, parent);
      i = parent;
    }
  }

  fn sift_down(&mut self, mut i: usize) {
    loop {
      let left = 2 * i + 1;
      let right = left + 1;
      let mut smallest = i;

      if left < self.fill && self.pages[left] < self.pages[smallest] {
        smallest = left;
      }
      if right < self.fill && self.pages[right] < self.pages[smallest] {
        smallest = right;
      }
      if smallest == i {
        return;
      }
      self.pages.swap(i, smallest);
      i = smallest;
    }
  }

  fn is_heap(&self) -> bool {
    (1..self.fill).all(|i| self.pages[(i - 1) / 2] <= self.pages[i])
  }
}

fn release<M: PageMapper>(mapper: &M, start: *mut u8, len: usize) {
  let Some(start) = NonNull::new(start) else {
    return;
  };
  if let Err(err) = unsafe { mapper.unmap(start, len) } {
    diag::fatal(format_args!(
      "cache release of {len} bytes at {:p}: {err}",
      start
    ));
  }
}
