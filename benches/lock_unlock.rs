//! Lock/unlock and refcount benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use hwbuffer::prelude::*;

fn rgba(size: u32) -> HardwareBuffer {
    let desc = BufferDescriptor::new(size, size, PixelFormat::R8G8B8A8Unorm)
        .with_usage(Usage::CPU_READ | Usage::CPU_WRITE);
    HardwareBuffer::allocate(&desc).unwrap()
}

fn bench_acquire_release(c: &mut Criterion) {
    let buffer = rgba(64);
    c.bench_function("acquire_release", |b| {
        b.iter(|| {
            let extra = buffer.acquire();
            std::hint::black_box(&extra);
            extra.release();
        });
    });
}

fn bench_lock_unlock(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_unlock");

    for size in [64u32, 512, 2048] {
        let buffer = rgba(size);
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("read", size), &buffer, |b, buffer| {
            b.iter(|| {
                let session = buffer.lock(Usage::CPU_READ, Fence::signaled(), None).unwrap();
                std::hint::black_box(session.address());
                session.unlock().unwrap();
            });
        });
        group.bench_with_input(BenchmarkId::new("write", size), &buffer, |b, buffer| {
            b.iter(|| {
                let session = buffer.lock(Usage::CPU_WRITE, Fence::signaled(), None).unwrap();
                std::hint::black_box(session.address());
                session.unlock().unwrap();
            });
        });
    }

    group.finish();
}

fn bench_lock_with_fence(c: &mut Criterion) {
    let buffer = rgba(64);
    c.bench_function("lock_signaled_eventfd", |b| {
        b.iter(|| {
            let fence = Fence::new().unwrap();
            fence.signal().unwrap();
            let session = buffer.lock(Usage::CPU_READ, fence, None).unwrap();
            session.unlock().unwrap();
        });
    });
}

criterion_group!(benches, bench_acquire_release, bench_lock_unlock, bench_lock_with_fence);
criterion_main!(benches);
