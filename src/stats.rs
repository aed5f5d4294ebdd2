//! Mapping counters.
//!
//! All counters use `Relaxed` ordering. A snapshot taken while other threads
//! map or unmap may be transiently inconsistent; `mapped_bytes` clamps
//! negative transients to zero. Diagnostic use only.

use core::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

/// Point-in-time view of a [`MapCounters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapStats {
  /// Bytes currently mapped through this mapper.
  pub mapped_bytes: usize,
  /// Successful `map` calls.
  pub map_calls: usize,
  /// Successful `unmap` calls.
  pub unmap_calls: usize,
}

pub struct MapCounters {
  mapped_bytes: AtomicIsize,
  map_calls: AtomicUsize,
  unmap_calls: AtomicUsize,
}

impl MapCounters {
  pub const fn new() -> Self {
    Self {
      mapped_bytes: AtomicIsize::new(0),
      map_calls: AtomicUsize::new(0),
      unmap_calls: AtomicUsize::new(0),
    }
  }

  #[inline]
  fn delta(size: usize) -> isize {
    size.min(isize::MAX as usize) as isize
  }

  #[inline]
  pub fn record_map(&self, size: usize) {
    self.mapped_bytes.fetch_add(Self::delta(size), Ordering::Relaxed);
    self.map_calls.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub fn record_unmap(&self, size: usize) {
    self.mapped_bytes.fetch_sub(Self::delta(size), Ordering::Relaxed);
    self.unmap_calls.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> MapStats {
    MapStats {
      mapped_bytes: self.mapped_bytes.load(Ordering::Relaxed).max(0) as usize,
      map_calls: self.map_calls.load(Ordering::Relaxed),
      unmap_calls: self.unmap_calls.load(Ordering::Relaxed),
    }
  }
}

impl Default for MapCounters {
  fn default() -> Self {
    Self::new()
  }
}

/// Process-wide counters fed by [`crate::platform::OsMapper`].
pub(crate) static OS_COUNTERS: MapCounters = MapCounters::new();
