#![allow(clippy::missing_safety_doc)]
//! Drop-in C heap allocator.
//!
//! Small requests are bump-allocated from a per-thread page ("bucket");
//! requests of half a page or more get their own mapping. `free` tells the two
//! apart by page offset alone: bucket objects never sit at offset 0, large
//! objects always do. Build with `--features c_api` to export the C symbols.

use core::{
  alloc::{GlobalAlloc, Layout},
  ffi::{c_int, c_void},
  fmt,
  mem::{align_of, size_of},
  ptr::{self, NonNull, null_mut},
};

mod bucket;
mod cache;
mod diag;
mod heap;
mod large;
mod lock;
mod platform;
mod stats;
mod tls;

pub use heap::ThreadState;
pub use platform::{MapError, OsMapper, PageMapper};
pub use stats::{MapCounters, MapStats};

use diag::trace;

// =============================================================================
// Constants
// =============================================================================

/// Minimum object size and alignment: two words, or the widest scalar
/// alignment if that is larger.
pub const GRANULARITY: usize = granularity();

#[cfg(all(target_vendor = "apple", target_arch = "aarch64"))]
pub const PAGE_SIZE: usize = 16 * 1024;
#[cfg(not(all(target_vendor = "apple", target_arch = "aarch64")))]
pub const PAGE_SIZE: usize = 4 * 1024;

/// Requests at or above this size bypass buckets.
pub const HALF_PAGE_SIZE: usize = PAGE_SIZE / 2;

/// Pages mapped per syscall when a new bucket is needed.
pub const PREALLOC_PAGES: usize = 16;

/// Disposed pages a thread holds before unmapping.
pub const CACHE_CAPACITY: usize = 2 * PREALLOC_PAGES - 1;

/// Bytes at the start of each bucket page reserved for its header.
pub const BUCKET_HEADER_SIZE: usize = align_up(size_of::<bucket::BucketHeader>(), GRANULARITY);

const fn granularity() -> usize {
  let pair = 2 * size_of::<usize>();
  let scalar = align_of::<u128>();
  if scalar > pair { scalar } else { pair }
}

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(GRANULARITY.is_power_of_two());
const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(BUCKET_HEADER_SIZE > 0);
const _: () = assert!(BUCKET_HEADER_SIZE + HALF_PAGE_SIZE <= PAGE_SIZE);
const _: () = assert!(PAGE_SIZE <= u32::MAX as usize);
const _: () = assert!(PREALLOC_PAGES >= 1 && PREALLOC_PAGES <= u32::MAX as usize);
const _: () = assert!(CACHE_CAPACITY >= 1);
const _: () = assert!(size_of::<usize>() <= PAGE_SIZE);

// =============================================================================
// Errors
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
  /// The page mapper failed, or the request size overflowed.
  OutOfMemory,
  /// Alignment not a power of two or not a multiple of the pointer size.
  InvalidAlignment,
}

impl AllocError {
  /// `errno` value reported through the C interface.
  pub const fn errno(self) -> c_int {
    match self {
      AllocError::OutOfMemory => libc::ENOMEM,
      AllocError::InvalidAlignment => libc::EINVAL,
    }
  }
}

impl fmt::Display for AllocError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      AllocError::OutOfMemory => f.write_str("out of memory"),
      AllocError::InvalidAlignment => f.write_str("invalid alignment"),
    }
  }
}

impl std::error::Error for AllocError {}

/// Snapshot of everything mapped through [`OsMapper`], process-wide.
pub fn os_stats() -> MapStats {
  stats::OS_COUNTERS.snapshot()
}

// =============================================================================
// GlobalAlloc
// =============================================================================

pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let (size, align) = (layout.size(), layout.align());
    tls::with_state(|state| {
      if align <= GRANULARITY {
        state.malloc(size)
      } else {
        state.memalign(align, size)
      }
    })
    .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    tls::with_state(|state| unsafe { state.free(ptr) })
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let old_size = layout.size();
    if layout.align() <= GRANULARITY && old_size <= GRANULARITY && new_size <= GRANULARITY {
      return ptr;
    }

    let new_ptr =
      unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };

    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(new_size)) };
      unsafe { self.dealloc(ptr, layout) };
    }

    new_ptr
  }

  // Memory comes from fresh zero-filled mappings and bucket space is never
  // handed out twice.
  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    unsafe { self.alloc(layout) }
  }
}

// =============================================================================
// C API (symbols exported with --features c_api)
// =============================================================================

#[inline]
fn into_raw(result: Result<NonNull<u8>, AllocError>) -> *mut c_void {
  match result {
    Ok(ptr) => ptr.as_ptr().cast(),
    Err(err) => {
      platform::set_errno(err.errno());
      null_mut()
    }
  }
}

#[cfg_attr(feature = "c_api", unsafe(no_mangle))]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
  let ptr = into_raw(tls::with_state(|state| state.malloc(size)));
  trace!("malloc({size}) = {ptr:p}");
  ptr
}

#[cfg_attr(feature = "c_api", unsafe(no_mangle))]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
  trace!("free({ptr:p})");
  if ptr.is_null() {
    return;
  }
  tls::with_state(|state| unsafe { state.free(ptr.cast()) })
}

#[cfg_attr(feature = "c_api", unsafe(no_mangle))]
pub unsafe extern "C" fn calloc(n: usize, size: usize) -> *mut c_void {
  let ptr = into_raw(tls::with_state(|state| state.calloc(n, size)));
  trace!("calloc({n}, {size}) = {ptr:p}");
  ptr
}

#[cfg_attr(feature = "c_api", unsafe(no_mangle))]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
  let result = tls::with_state(|state| unsafe { state.realloc(ptr.cast(), size) });
  let new_ptr: *mut c_void = match result {
    Ok(Some(new_ptr)) => new_ptr.as_ptr().cast(),
    Ok(None) => null_mut(),
    Err(err) => {
      platform::set_errno(err.errno());
      null_mut()
    }
  };
  trace!("realloc({ptr:p}, {size}) = {new_ptr:p}");
  new_ptr
}

/// Returns `0`, `EINVAL` or `ENOMEM`. `memptr` is written only on success.
#[cfg_attr(feature = "c_api", unsafe(no_mangle))]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut c_void,
  alignment: usize,
  size: usize,
) -> c_int {
  let result = tls::with_state(|state| state.memalign(alignment, size));
  trace!("posix_memalign({alignment}, {size}) = {result:?}");
  match result {
    Ok(ptr) => {
      unsafe { *memptr = ptr.as_ptr().cast() };
      0
    }
    Err(err) => err.errno(),
  }
}

#[cfg_attr(feature = "c_api", unsafe(no_mangle))]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut c_void {
  let ptr = into_raw(tls::with_state(|state| state.memalign(alignment, size)));
  trace!("aligned_alloc({alignment}, {size}) = {ptr:p}");
  ptr
}

#[cfg_attr(feature = "c_api", unsafe(no_mangle))]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut c_void {
  let ptr = into_raw(tls::with_state(|state| state.memalign(alignment, size)));
  trace!("memalign({alignment}, {size}) = {ptr:p}");
  ptr
}

#[cfg_attr(feature = "c_api", unsafe(no_mangle))]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
  let ptr = into_raw(page_multiple(size).and_then(|size| tls::with_state(|state| state.malloc(size))));
  trace!("valloc({size}) = {ptr:p}");
  ptr
}

#[cfg_attr(feature = "c_api", unsafe(no_mangle))]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
  let ptr = into_raw(page_multiple(size).and_then(|size| tls::with_state(|state| state.malloc(size))));
  trace!("pvalloc({size}) = {ptr:p}");
  ptr
}

/// At least one page, so the result takes the page-aligned large path.
#[inline]
fn page_multiple(size: usize) -> Result<usize, AllocError> {
  let size = size.max(1);
  size
    .checked_add(PAGE_SIZE - 1)
    .map(|_| align_up(size, PAGE_SIZE))
    .ok_or(AllocError::OutOfMemory)
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
