//! Large objects: one mapping per object, no caching.
//!
//! The mapping starts with a header page whose first word holds the total
//! mapped size; the caller gets the address exactly one page in. That makes
//! every large pointer page-aligned, which is how `free` recognizes it.

use core::ptr::NonNull;

use crate::{AllocError, PAGE_SIZE, align_up, diag, platform::PageMapper};

/// Maps `size` bytes (rounded up to pages) plus a header page.
pub(crate) fn alloc<M: PageMapper>(mapper: &M, size: usize) -> Result<NonNull<u8>, AllocError> {
  let total = checked_page_round(size)
    .and_then(|body| body.checked_add(PAGE_SIZE))
    .ok_or(AllocError::OutOfMemory)?;

  let head = mapper.map(total).map_err(|_| AllocError::OutOfMemory)?;
  Ok(unsafe { publish(head, total) })
}

/// Maps a region whose payload starts at a multiple of `alignment`.
///
/// Over-maps by `alignment`, then releases leading pages one at a time until
/// the page after the head lands on the boundary.
pub(crate) fn alloc_aligned<M: PageMapper>(
  mapper: &M,
  size: usize,
  alignment: usize,
) -> Result<NonNull<u8>, AllocError> {
  debug_assert!(alignment.is_power_of_two());
  let mut total = checked_page_round(size)
    .and_then(|body| body.checked_add(alignment))
    .and_then(|body| body.checked_add(PAGE_SIZE))
    .and_then(checked_page_round)
    .ok_or(AllocError::OutOfMemory)?;

  let mut head = mapper.map(total).map_err(|_| AllocError::OutOfMemory)?;
  while (head.as_ptr() as usize + PAGE_SIZE) & (alignment - 1) != 0 {
    release(mapper, head, PAGE_SIZE);
    head = unsafe { head.add(PAGE_SIZE) };
    total -= PAGE_SIZE;
  }

  Ok(unsafe { publish(head, total) })
}

/// # Safety
///
/// `head` must be the start of a fresh `total`-byte mapping.
#[inline]
unsafe fn publish(head: NonNull<u8>, total: usize) -> NonNull<u8> {
  unsafe {
    head.cast::<usize>().write(total);
    head.add(PAGE_SIZE)
  }
}

/// Total bytes of the mapping behind a large pointer, header page included.
///
/// # Safety
///
/// `ptr` must be a live pointer returned by [`alloc`] or [`alloc_aligned`].
#[inline]
pub(crate) unsafe fn mapped_size(ptr: NonNull<u8>) -> usize {
  unsafe { ptr.sub(PAGE_SIZE).cast::<usize>().read() }
}

/// Unmaps the whole mapping in one call.
///
/// # Safety
///
/// Same as [`mapped_size`]; `ptr` is dangling afterwards.
pub(crate) unsafe fn free<M: PageMapper>(mapper: &M, ptr: NonNull<u8>) {
  let total = unsafe { mapped_size(ptr) };
  release(mapper, unsafe { ptr.sub(PAGE_SIZE) }, total);
}

fn release<M: PageMapper>(mapper: &M, head: NonNull<u8>, len: usize) {
  if let Err(err) = unsafe { mapper.unmap(head, len) } {
    diag::fatal(format_args!(
      "large release of {len} bytes at {:p}: {err}",
      head
    ));
  }
}

#[inline]
fn checked_page_round(size: usize) -> Option<usize> {
  size.checked_add(PAGE_SIZE - 1).map(|_| align_up(size, PAGE_SIZE))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::{
    MapError,
    testing::{ExhaustedMapper, RecordingMapper},
  };

  #[test]
  fn header_page_records_mapping_size() {
    let mapper = RecordingMapper::default();
    let ptr = alloc(&mapper, 10_000).unwrap();

    assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, 0);
    assert_eq!(unsafe { mapped_size(ptr) }, 3 * PAGE_SIZE + PAGE_SIZE);
    unsafe { ptr.as_ptr().write_bytes(0xAB, 10_000) };

    unsafe { free(&mapper, ptr) };
    let stats = mapper.stats();
    assert_eq!(stats.mapped_bytes, 0);
    assert_eq!((stats.map_calls, stats.unmap_calls), (1, 1));
  }

  #[test]
  fn aligned_mapping_trims_front_pages() {
    let mapper = RecordingMapper::default();
    let alignment = 64 * PAGE_SIZE;
    let ptr = alloc_aligned(&mapper, 5 * PAGE_SIZE, alignment).unwrap();

    assert_eq!(ptr.as_ptr() as usize % alignment, 0);
    assert!(unsafe { mapped_size(ptr) } >= 5 * PAGE_SIZE + PAGE_SIZE);
    unsafe { ptr.as_ptr().write_bytes(0xCD, 5 * PAGE_SIZE) };

    // Leading pages go back one call each, in address order, up to the
    // header page.
    let (mapped_at, _) = mapper.maps()[0];
    let misalignment = (mapped_at + PAGE_SIZE) % alignment;
    let trimmed = (alignment - misalignment) % alignment / PAGE_SIZE;
    let expected: Vec<_> = (0..trimmed)
      .map(|i| (mapped_at + i * PAGE_SIZE, PAGE_SIZE))
      .collect();
    assert_eq!(mapper.unmaps(), expected);
    assert_eq!(mapped_at + trimmed * PAGE_SIZE, ptr.as_ptr() as usize - PAGE_SIZE);

    unsafe { free(&mapper, ptr) };
    assert_eq!(mapper.stats().mapped_bytes, 0);
  }

  /// Hands out mappings whose first page ends `skew_pages` pages past an
  /// `alignment` boundary, so trimming always has work to do.
  struct SkewedMapper<'a> {
    inner: &'a RecordingMapper,
    alignment: usize,
    skew_pages: usize,
  }

  impl PageMapper for SkewedMapper<'_> {
    fn map(&self, size: usize) -> Result<NonNull<u8>, MapError> {
      let slack = self.alignment + self.skew_pages * PAGE_SIZE;
      let base = self.inner.map(size + slack)?;
      let start = base.as_ptr() as usize;
      let head = align_up(start + PAGE_SIZE, self.alignment) + self.skew_pages * PAGE_SIZE - PAGE_SIZE;

      unsafe {
        if head > start {
          self.inner.unmap(base, head - start)?;
        }
        let end = start + size + slack;
        if head + size < end {
          self.inner.unmap(base.add(head + size - start), end - head - size)?;
        }
        Ok(base.add(head - start))
      }
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, size: usize) -> Result<(), MapError> {
      unsafe { self.inner.unmap(ptr, size) }
    }
  }

  #[test]
  fn misaligned_mapping_releases_each_leading_page() {
    let recorder = RecordingMapper::default();
    let alignment = 64 * PAGE_SIZE;
    let mapper = SkewedMapper {
      inner: &recorder,
      alignment,
      skew_pages: 5,
    };

    let ptr = alloc_aligned(&mapper, PAGE_SIZE, alignment).unwrap();
    assert_eq!(ptr.as_ptr() as usize % alignment, 0);

    let trimmed = 64 - 5;
    let head = ptr.as_ptr() as usize - PAGE_SIZE - trimmed * PAGE_SIZE;
    let expected: Vec<_> = (0..trimmed)
      .map(|i| (head + i * PAGE_SIZE, PAGE_SIZE))
      .collect();
    let unmaps = recorder.unmaps();
    assert_eq!(unmaps[unmaps.len() - trimmed..], expected[..]);

    unsafe { free(&mapper, ptr) };
    assert_eq!(recorder.stats().mapped_bytes, 0);
  }

  #[test]
  fn overflowing_request_is_out_of_memory() {
    let mapper = RecordingMapper::default();
    assert_eq!(alloc(&mapper, usize::MAX - 10), Err(AllocError::OutOfMemory));
    assert_eq!(
      alloc_aligned(&mapper, usize::MAX - PAGE_SIZE, 2 * PAGE_SIZE),
      Err(AllocError::OutOfMemory)
    );
    assert_eq!(mapper.stats().map_calls, 0);
  }

  #[test]
  fn mapper_failure_is_out_of_memory() {
    assert_eq!(alloc(&ExhaustedMapper, PAGE_SIZE), Err(AllocError::OutOfMemory));
  }
}
