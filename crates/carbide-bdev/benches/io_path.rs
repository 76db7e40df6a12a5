//! I/O path benchmarks.
//!
//! Benchmarks the submit/complete round trip through the in-memory driver.

use std::hint::black_box;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use carbide_bdev::{BdevConfig, CompletionHandler, Device, IoContext};
use carbide_nvme::{MemDriver, Status};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

const BLOCK: u64 = 4096;
const BLOCKS: u64 = 4096;

struct Ignore;

impl CompletionHandler for Ignore {
    fn io_complete(&self, _owner: u64, _status: Status) {}
}

fn open_device() -> Device {
    let driver = Arc::new(MemDriver::new());
    driver.add_device("bench0", BLOCK, BLOCKS);
    let mut device = Device::new(driver, Arc::new(Ignore), BdevConfig::default());
    device.open("bench0").unwrap();
    device
}

// ============================================================================
// Async Write Benchmarks
// ============================================================================

fn bench_async_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("bdev_write");

    for size in [4096usize, 16384, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        let device = open_device();
        let data = Bytes::from(vec![0u8; size]);

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            let ioc = IoContext::new(1);
            b.iter(|| {
                device
                    .aio_write(0, black_box(data.clone()), &ioc, false)
                    .unwrap();
                ioc.aio_wait();
            });
        });
    }

    group.finish();
}

fn bench_write_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("bdev_write_batch");

    for depth in [4u64, 16, 64] {
        group.throughput(Throughput::Elements(depth));
        let device = open_device();
        let data = Bytes::from(vec![0u8; BLOCK as usize]);

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            let ioc = IoContext::new(1);
            b.iter(|| {
                for i in 0..depth {
                    device
                        .aio_write(i * BLOCK, black_box(data.clone()), &ioc, false)
                        .unwrap();
                }
                ioc.aio_wait();
            });
        });
    }

    group.finish();
}

// ============================================================================
// Sync Read Benchmarks
// ============================================================================

fn bench_sync_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("bdev_read");

    for size in [4096usize, 16384, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        let device = open_device();
        let ioc = IoContext::new(1);
        device
            .aio_write(0, Bytes::from(vec![7u8; size]), &ioc, false)
            .unwrap();
        ioc.aio_wait();

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut buf = BytesMut::with_capacity(size);
                device
                    .read(black_box(0), size as u64, &mut buf, &ioc, false)
                    .unwrap();
                let _ = black_box(buf);
            });
        });
    }

    group.finish();
}

// ============================================================================
// Flush Benchmarks
// ============================================================================

fn bench_flush(c: &mut Criterion) {
    let device = open_device();
    c.bench_function("bdev_flush", |b| {
        b.iter(|| device.flush().unwrap());
    });
}

// ============================================================================
// Criterion Configuration
// ============================================================================

criterion_group!(
    io_path_benches,
    bench_async_write,
    bench_write_batch,
    bench_sync_read,
    bench_flush
);

criterion_main!(io_path_benches);
