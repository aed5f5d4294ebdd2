//! Per-thread allocator state: the open bucket and the free-page cache.
//!
//! Nothing here knows about thread-locals. `crate::tls` parks one
//! `ThreadState<OsMapper>` per thread; tests build as many as they like over
//! a recording mapper.

use core::ptr::{self, NonNull};

use crate::{
  AllocError, GRANULARITY, HALF_PAGE_SIZE, PAGE_SIZE, PREALLOC_PAGES, align_up,
  bucket::{BucketHeader, Bump, page_offset},
  cache::PageCache,
  large,
  platform::PageMapper,
};

pub struct ThreadState<M: PageMapper> {
  open_bucket: Option<NonNull<BucketHeader>>,
  cache: PageCache,
  mapper: M,
}

impl<M: PageMapper> ThreadState<M> {
  pub const fn new(mapper: M) -> Self {
    Self {
      open_bucket: None,
      cache: PageCache::new(),
      mapper,
    }
  }

  pub fn mapper(&self) -> &M {
    &self.mapper
  }

  /// Pages waiting in this thread's cache for a batched `unmap`.
  pub fn cached_pages(&self) -> usize {
    self.cache.len()
  }

  pub fn malloc(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    if size < HALF_PAGE_SIZE {
      self.alloc_small(align_up(size.max(1), GRANULARITY))
    } else {
      large::alloc(&self.mapper, size)
    }
  }

  /// Overflow-checked `n * size`. Fresh mappings are zero-filled and bucket
  /// space is never handed out twice, so no clearing is needed.
  pub fn calloc(&mut self, n: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    let total = n.checked_mul(size).ok_or(AllocError::OutOfMemory)?;
    self.malloc(total)
  }

  /// # Safety
  ///
  /// `ptr` must be null or a live pointer returned by this allocator, on any
  /// thread.
  pub unsafe fn free(&mut self, ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
      return;
    };
    if page_offset(ptr) == 0 {
      unsafe { large::free(&self.mapper, ptr) };
      return;
    }

    let bucket = unsafe { BucketHeader::containing(ptr) };
    if bucket.release_object() {
      self.cache.push(&self.mapper, bucket.page());
    }
  }

  /// C `realloc`. `Ok(None)` means the block was freed (`size == 0`).
  ///
  /// # Safety
  ///
  /// Same contract as [`ThreadState::free`].
  pub unsafe fn realloc(
    &mut self,
    ptr: *mut u8,
    size: usize,
  ) -> Result<Option<NonNull<u8>>, AllocError> {
    let Some(old) = NonNull::new(ptr) else {
      return self.malloc(size).map(Some);
    };
    if size == 0 {
      unsafe { self.free(ptr) };
      return Ok(None);
    }
    // The smallest bucket slot already holds this much.
    if size <= GRANULARITY {
      return Ok(Some(old));
    }

    let copy_len = unsafe { copy_bound(old) }.min(size);
    let new = self.malloc(size)?;
    unsafe {
      ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), copy_len);
      self.free(ptr);
    }
    Ok(Some(new))
  }

  /// Backs `posix_memalign`, `aligned_alloc` and `memalign`.
  pub fn memalign(&mut self, alignment: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    if !alignment.is_power_of_two() || alignment % size_of::<*mut u8>() != 0 {
      return Err(AllocError::InvalidAlignment);
    }
    if alignment <= GRANULARITY {
      return self.malloc(size);
    }

    let size = size.max(1);
    if let Some(padded) = alignment.checked_add(size)
      && padded < HALF_PAGE_SIZE
      && let Ok(block) = self.malloc(padded)
    {
      // Stays inside the block, hence inside the bucket page and never
      // page-aligned.
      let offset = align_up(block.as_ptr() as usize, alignment) - block.as_ptr() as usize;
      return Ok(unsafe { block.add(offset) });
    }

    large::alloc_aligned(&self.mapper, size, alignment)
  }

  /// Bump-allocates `size` bytes (already a multiple of `GRANULARITY`),
  /// opening a new bucket when the current one is full.
  fn alloc_small(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let mut prealloc_count = 0;
    let mut next_page = None;

    if let Some(bucket) = self.open_bucket {
      let header = unsafe { bucket.as_ref() };
      match header.bump_or_close(size) {
        Bump::Fit(ptr) => return Ok(ptr),
        Bump::Closed {
          prealloc_count: remaining,
          disposed,
        } => {
          self.open_bucket = None;
          prealloc_count = remaining;
          next_page = Some(unsafe { header.page().add(PAGE_SIZE) });
          if disposed {
            self.cache.push(&self.mapper, header.page());
          }
        }
      }
    }

    let page = match next_page {
      Some(page) if prealloc_count > 0 => {
        prealloc_count -= 1;
        page
      }
      _ => {
        let batch = self
          .mapper
          .map(PREALLOC_PAGES * PAGE_SIZE)
          .map_err(|_| AllocError::OutOfMemory)?;
        prealloc_count = PREALLOC_PAGES as u32 - 1;
        batch
      }
    };

    let (bucket, ptr) = unsafe { BucketHeader::init(page, prealloc_count, size) };
    self.open_bucket = Some(bucket);
    Ok(ptr)
  }

  /// Thread-exit teardown: close the open bucket, hand its untouched batch
  /// pages to the cache and drain the cache to the OS.
  ///
  /// A bucket that still has live objects stays mapped; whichever thread frees
  /// its last object disposes it.
  pub fn teardown(&mut self) {
    if let Some(bucket) = self.open_bucket.take() {
      let header = unsafe { bucket.as_ref() };
      let page = header.page();
      let (prealloc_count, disposed) = header.close();
      if disposed {
        self.cache.push(&self.mapper, page);
      }
      for i in 1..=prealloc_count as usize {
        self
          .cache
          .push(&self.mapper, unsafe { page.add(i * PAGE_SIZE) });
      }
    }
    self.cache.reduce(&self.mapper, 0);
  }
}

impl<M: PageMapper> Drop for ThreadState<M> {
  fn drop(&mut self) {
    self.teardown();
  }
}

/// Bytes of `ptr`'s object that are safe to carry over on `realloc`.
///
/// # Safety
///
/// `ptr` must be a live pointer returned by this allocator.
unsafe fn copy_bound(ptr: NonNull<u8>) -> usize {
  let offset = page_offset(ptr);
  if offset == 0 {
    unsafe { large::mapped_size(ptr) - PAGE_SIZE }
  } else {
    unsafe { BucketHeader::containing(ptr) }.copy_bound(offset)
  }
}
