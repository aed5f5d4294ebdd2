use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// bucket-malloc alloc/free throughput.
fn bucket_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = bucket_malloc::malloc(size);
      black_box(ptr);
      bucket_malloc::free(ptr);
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

/// Keeps a window of live objects so buckets actually fill and close.
fn bucket_malloc_window(size: usize) {
  let mut window = [core::ptr::null_mut(); 64];
  for i in 0..OPS as usize {
    unsafe {
      let slot = &mut window[i % 64];
      bucket_malloc::free(*slot);
      *slot = bucket_malloc::malloc(size);
      black_box(*slot);
    }
  }
  for ptr in window {
    unsafe { bucket_malloc::free(ptr) };
  }
}

fn libc_window(size: usize) {
  let mut window = [core::ptr::null_mut(); 64];
  for i in 0..OPS as usize {
    unsafe {
      let slot = &mut window[i % 64];
      libc::free(*slot);
      *slot = libc::malloc(size);
      black_box(*slot);
    }
  }
  for ptr in window {
    unsafe { libc::free(ptr) };
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("malloc_throughput");

  for size in [16, 64, 256, 1024, 4096] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("bucket-malloc", size), &size, |b, &size| {
      b.iter(|| bucket_malloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

fn benchmark_live_window(c: &mut Criterion) {
  let mut group = c.benchmark_group("live_window");

  for size in [16, 128, 1024] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("bucket-malloc", size), &size, |b, &size| {
      b.iter(|| bucket_malloc_window(size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_window(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput, benchmark_live_window);
criterion_main!(benches);
