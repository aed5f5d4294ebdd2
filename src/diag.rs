//! Allocation-free stderr diagnostics.
//!
//! Anything that could allocate is off limits here: a formatted line is built
//! in a fixed stack buffer and handed to `write(2)` directly.

use core::fmt::{self, Write};

const LINE_CAPACITY: usize = 256;

struct LineBuffer {
  bytes: [u8; LINE_CAPACITY],
  len: usize,
}

impl LineBuffer {
  const fn new() -> Self {
    Self {
      bytes: [0; LINE_CAPACITY],
      len: 0,
    }
  }

  fn as_bytes(&self) -> &[u8] {
    &self.bytes[..self.len]
  }
}

impl Write for LineBuffer {
  // Truncates instead of failing so a long line still gets printed.
  fn write_str(&mut self, s: &str) -> fmt::Result {
    let room = LINE_CAPACITY - 1 - self.len;
    let take = s.len().min(room);
    self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
    self.len += take;
    Ok(())
  }
}

fn emit(args: fmt::Arguments<'_>) {
  let mut line = LineBuffer::new();
  let _ = line.write_str("bucket-malloc: ");
  let _ = line.write_fmt(args);
  line.bytes[line.len] = b'\n';
  line.len += 1;

  let out = line.as_bytes();
  unsafe { libc::write(libc::STDERR_FILENO, out.as_ptr().cast(), out.len()) };
}

/// Prints one line and aborts. Used when the OS refuses to unmap memory this
/// allocator mapped itself.
#[cold]
pub(crate) fn fatal(args: fmt::Arguments<'_>) -> ! {
  emit(args);
  std::process::abort()
}

#[cfg(feature = "trace")]
pub(crate) fn event(args: fmt::Arguments<'_>) {
  emit(args);
}

/// Emits one stderr line per call when built with `--features trace`.
macro_rules! trace {
  ($($arg:tt)*) => {
    #[cfg(feature = "trace")]
    $crate::diag::event(format_args!($($arg)*));
  };
}

pub(crate) use trace;
