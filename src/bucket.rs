//! Bucket: one page of bump-allocated small objects.
//!
//! The header sits at offset 0 of its page and is followed by objects packed
//! in allocation order. Because the header takes the leading bytes, no object
//! pointer is ever page-aligned; `free` relies on that to tell bucket objects
//! from large ones.
//!
//! Lifecycle is `Open -> Closed -> Disposed`, tracked entirely by
//! `object_count`: it starts at 2 (the open reference plus the first object),
//! every further object adds one, every `free` and the close itself subtract
//! one. Whoever drives it to 0 disposes the page.

use core::{
  cell::UnsafeCell,
  mem::size_of,
  ptr::{self, NonNull},
};

use crate::{BUCKET_HEADER_SIZE, GRANULARITY, PAGE_SIZE, lock::SpinLock};

/// Mutable header fields, only touched with `BucketHeader::lock` held.
struct BucketState {
  /// Untouched pages following this one in the same OS mapping.
  prealloc_count: u32,
  /// Offset of the next free byte in the page.
  bytes_dirty: u32,
  /// Live references: objects plus one while open.
  object_count: u32,
}

#[repr(C)]
pub(crate) struct BucketHeader {
  lock: SpinLock,
  state: UnsafeCell<BucketState>,
}

// Every access to `state` goes through `with_locked`.
unsafe impl Sync for BucketHeader {}

const _: () = assert!(size_of::<BucketHeader>() <= BUCKET_HEADER_SIZE);

/// Outcome of an allocation attempt against the open bucket.
pub(crate) enum Bump {
  Fit(NonNull<u8>),
  /// The request did not fit and the bucket is now closed.
  Closed { prealloc_count: u32, disposed: bool },
}

impl BucketHeader {
  /// Writes a fresh header at `page` and hands out its first object of
  /// `size` bytes.
  ///
  /// # Safety
  ///
  /// `page` must be a writable, page-aligned page no one else references.
  pub(crate) unsafe fn init(
    page: NonNull<u8>,
    prealloc_count: u32,
    size: usize,
  ) -> (NonNull<BucketHeader>, NonNull<u8>) {
    debug_assert!(BUCKET_HEADER_SIZE + size <= PAGE_SIZE);
    let header = page.cast::<BucketHeader>();
    unsafe {
      ptr::write(
        header.as_ptr(),
        BucketHeader {
          lock: SpinLock::new(),
          state: UnsafeCell::new(BucketState {
            prealloc_count,
            bytes_dirty: (BUCKET_HEADER_SIZE + size) as u32,
            object_count: 2,
          }),
        },
      );
      (header, page.add(BUCKET_HEADER_SIZE))
    }
  }

  /// Header of the bucket holding `ptr`, found by masking the page offset.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live object handed out by some bucket.
  #[inline]
  pub(crate) unsafe fn containing<'a>(ptr: NonNull<u8>) -> &'a BucketHeader {
    debug_assert!(page_offset(ptr) != 0, "{ptr:p} is not a bucket object");
    let page = ptr.as_ptr() as usize & !(PAGE_SIZE - 1);
    unsafe { &*(page as *const BucketHeader) }
  }

  #[inline]
  pub(crate) fn page(&self) -> NonNull<u8> {
    NonNull::from(self).cast()
  }

  #[inline]
  fn with_locked<R>(&self, f: impl FnOnce(&mut BucketState) -> R) -> R {
    self.lock.lock();
    let result = f(unsafe { &mut *self.state.get() });
    self.lock.unlock();
    result
  }

  /// Bump-allocates `size` bytes, or closes the bucket when they do not fit.
  pub(crate) fn bump_or_close(&self, size: usize) -> Bump {
    let page = self.page();
    self.with_locked(|state| {
      let offset = state.bytes_dirty as usize;
      if offset + size <= PAGE_SIZE {
        state.bytes_dirty += size as u32;
        state.object_count += 1;
        return Bump::Fit(unsafe { page.add(offset) });
      }
      state.object_count -= 1;
      Bump::Closed {
        prealloc_count: state.prealloc_count,
        disposed: state.object_count == 0,
      }
    })
  }

  /// Drops the open reference. Returns the preallocated page count and
  /// whether the bucket can be disposed.
  pub(crate) fn close(&self) -> (u32, bool) {
    self.with_locked(|state| {
      debug_assert!(state.object_count > 0);
      state.object_count -= 1;
      (state.prealloc_count, state.object_count == 0)
    })
  }

  /// Drops one object reference. Returns `true` when the bucket can be
  /// disposed.
  pub(crate) fn release_object(&self) -> bool {
    self.with_locked(|state| {
      debug_assert!(state.object_count > 0, "bucket {:p}: object_count underflow", self);
      state.object_count -= 1;
      state.object_count == 0
    })
  }

  /// Upper bound on the size of the object at `offset`.
  ///
  /// Object sizes are not recorded. The object cannot extend past the dirty
  /// region, and every other live object takes at least `GRANULARITY` bytes of
  /// it, as does the header. The `- 1` keeps the bound safe whether or not the
  /// open reference is still counted.
  pub(crate) fn copy_bound(&self, offset: usize) -> usize {
    self.with_locked(|state| {
      let dirty = state.bytes_dirty as usize;
      let to_end = dirty.saturating_sub(offset);
      let spread = dirty.saturating_sub((state.object_count.saturating_sub(1) as usize) * GRANULARITY);
      to_end.min(spread)
    })
  }
}

/// Offset of `ptr` inside its page. Zero only for large objects.
#[inline(always)]
pub(crate) fn page_offset(ptr: NonNull<u8>) -> usize {
  ptr.as_ptr() as usize & (PAGE_SIZE - 1)
}
