//! Thread-local slot for the per-thread allocator state.
//!
//! The slot is unusable re-entrantly (registering the TLS destructor may
//! itself call `calloc` under `c_api`) and after it was torn down at thread
//! exit. In both cases the request runs against a transient `ThreadState` that
//! is dropped right after: its cache drains immediately and a bucket it opened
//! stays alive only through the objects it handed out.
//!
//! Thread exit drops the slot's `ThreadState`, whose `Drop` drains the cache.

use core::cell::{Cell, UnsafeCell};

use crate::{heap::ThreadState, platform::OsMapper};

thread_local! {
  static STATE: UnsafeCell<ThreadState<OsMapper>> = const { UnsafeCell::new(ThreadState::new(OsMapper)) };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

pub(crate) fn with_state<R, F: FnMut(&mut ThreadState<OsMapper>) -> R>(mut f: F) -> R {
  if let Some(result) = with_thread_state(&mut f) {
    return result;
  }
  let mut transient = ThreadState::new(OsMapper);
  f(&mut transient)
}

fn with_thread_state<R, F: FnMut(&mut ThreadState<OsMapper>) -> R>(f: &mut F) -> Option<R> {
  let entered = IN_ALLOC.try_with(|flag| !flag.replace(true)).ok()?;
  if !entered {
    return None;
  }

  let result = STATE
    .try_with(|cell| {
      // IN_ALLOC guarantees no other `&mut` to this thread's state is live.
      let state = unsafe { &mut *cell.get() };
      f(state)
    })
    .ok();

  let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  result
}
