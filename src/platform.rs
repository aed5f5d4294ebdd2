use core::{
  fmt,
  ptr::{NonNull, null_mut},
};

use crate::{PAGE_SIZE, stats::OS_COUNTERS};

/// Raw OS error code reported by a failed `map` or `unmap`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MapError {
  pub code: i32,
}

impl MapError {
  fn last_os_error() -> Self {
    Self {
      code: std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::ENOMEM),
    }
  }
}

impl fmt::Display for MapError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "virtual memory operation failed (os error {})", self.code)
  }
}

/// Source of page-aligned, zero-filled, read-write memory.
///
/// Every address handed out by `map` must be aligned to [`PAGE_SIZE`]; the
/// allocator classifies pointers by their page offset alone.
pub trait PageMapper {
  fn map(&self, size: usize) -> Result<NonNull<u8>, MapError>;

  /// # Safety
  ///
  /// `ptr..ptr + size` must lie inside memory obtained from `map` on this
  /// mapper and not yet unmapped.
  unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize) -> Result<(), MapError>;
}

impl<M: PageMapper + ?Sized> PageMapper for &M {
  #[inline]
  fn map(&self, size: usize) -> Result<NonNull<u8>, MapError> {
    (**self).map(size)
  }

  #[inline]
  unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize) -> Result<(), MapError> {
    unsafe { (**self).unmap(ptr, size) }
  }
}

/// `mmap`/`munmap` backed mapper. Feeds [`crate::os_stats`].
#[derive(Clone, Copy, Debug, Default)]
pub struct OsMapper;

#[cfg(all(target_os = "linux", feature = "populate"))]
const MAP_FLAGS: libc::c_int =
  libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_POPULATE;

#[cfg(not(all(target_os = "linux", feature = "populate")))]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

impl PageMapper for OsMapper {
  fn map(&self, size: usize) -> Result<NonNull<u8>, MapError> {
    let ptr = unsafe {
      libc::mmap(
        null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        MAP_FLAGS,
        -1,
        0,
      )
    };

    if ptr == libc::MAP_FAILED {
      return Err(MapError::last_os_error());
    }

    debug_assert!(
      ptr as usize % PAGE_SIZE == 0,
      "mmap returned {ptr:p}, not aligned to PAGE_SIZE={PAGE_SIZE}"
    );
    OS_COUNTERS.record_map(size);
    NonNull::new(ptr.cast()).ok_or(MapError { code: libc::ENOMEM })
  }

  unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize) -> Result<(), MapError> {
    if unsafe { libc::munmap(ptr.as_ptr().cast(), size) } != 0 {
      return Err(MapError::last_os_error());
    }
    OS_COUNTERS.record_unmap(size);
    Ok(())
  }
}

/// Stores `code` in the calling thread's `errno`.
#[inline]
pub(crate) fn set_errno(code: i32) {
  #[cfg(any(target_os = "linux", target_os = "emscripten", target_os = "redox"))]
  unsafe {
    *libc::__errno_location() = code;
  }

  #[cfg(any(target_vendor = "apple", target_os = "freebsd"))]
  unsafe {
    *libc::__error() = code;
  }

  #[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))]
  unsafe {
    *libc::__errno() = code;
  }

  #[cfg(any(target_os = "illumos", target_os = "solaris"))]
  unsafe {
    *libc::___errno() = code;
  }
}

// A null return without errno breaks the C contract, so unknown targets do
// not build.
#[cfg(not(any(
  target_os = "linux",
  target_os = "emscripten",
  target_os = "redox",
  target_vendor = "apple",
  target_os = "freebsd",
  target_os = "android",
  target_os = "netbsd",
  target_os = "openbsd",
  target_os = "illumos",
  target_os = "solaris"
)))]
compile_error!("bucket-malloc: no errno accessor for this target");


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn os_mapper_returns_zeroed_page_aligned_memory() {
    let ptr = OsMapper.map(PAGE_SIZE * 2).unwrap();
    assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, 0);
    let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), PAGE_SIZE * 2) };
    assert!(bytes.iter().all(|&b| b == 0));
    unsafe { OsMapper.unmap(ptr, PAGE_SIZE * 2).unwrap() };
  }

  #[test]
  fn error_text_names_no_particular_call() {
    let err = MapError { code: libc::EINVAL };
    assert_eq!(
      err.to_string(),
      format!("virtual memory operation failed (os error {})", libc::EINVAL)
    );
  }

  #[test]
  fn set_errno_is_visible_to_io_error() {
    set_errno(libc::EINVAL);
    assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::EINVAL));
  }
}
