use core::{
  hint,
  sync::atomic::{AtomicBool, Ordering},
};

/// CAS attempts before giving the processor away.
const SPIN_LIMIT: u32 = 16;

/// One-bit lock guarding a bucket header. Not reentrant. Never held across a
/// call into the page mapper.
#[repr(transparent)]
pub(crate) struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub(crate) const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  fn try_lock(&self) -> bool {
    self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_ok()
  }

  #[inline]
  pub(crate) fn lock(&self) {
    loop {
      for _ in 0..SPIN_LIMIT {
        if self.try_lock() {
          return;
        }
        hint::spin_loop();
      }
      std::thread::yield_now();
    }
  }

  #[inline]
  pub(crate) fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }
}
