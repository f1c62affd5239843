use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use memmap2::MmapOptions;
use std::fs::OpenOptions;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use video_ring_core::{RingBufferConfig, RingBufferShm};

const PACKET_SIZE: u32 = 64;
const NUM_BUFFERS: u32 = 512;

fn open_ring(file: &tempfile::NamedTempFile, config: &RingBufferConfig, init: bool) -> RingBufferShm {
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .open(file.path())
        .expect("failed to open temp file for benchmark");
    if init {
        f.set_len(config.required_region_size() as u64)
            .expect("failed to size backing file for benchmark");
    }
    let mmap = unsafe {
        MmapOptions::new()
            .len(config.required_region_size())
            .map_mut(&f)
            .expect("failed to map region for benchmark")
    };
    if init {
        unsafe { RingBufferShm::init(mmap, config.clone()).expect("failed to init ring") }
    } else {
        unsafe { RingBufferShm::attach(mmap).expect("failed to attach to ring") }
    }
}

fn bench_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("RingBuffer_Throughput");
    let config = RingBufferConfig::new(PACKET_SIZE, NUM_BUFFERS);

    for msg_count in [10_000u32, 100_000, 1_000_000].iter() {
        for num_readers in [1usize, 2, 4].iter() {
            let parameter = (*msg_count, *num_readers);
            let id = BenchmarkId::new(
                "write_and_read",
                format!("{msg_count} msgs, {num_readers} readers"),
            );
            group.bench_with_input(id, &parameter, |b, &(num_msgs, num_readers)| {
                b.iter_custom(|_| {
                    let file = tempfile::NamedTempFile::new()
                        .expect("failed to create temp file for benchmark");
                    let writer = Arc::new(open_ring(&file, &config, true));
                    for id in 1..=num_readers as i32 {
                        writer.add_reader(id).expect("failed to add reader");
                    }

                    let start = Instant::now();
                    let mut handles = Vec::new();
                    for id in 1..=num_readers as i32 {
                        let reader = open_ring(&file, &config, false);
                        handles.push(thread::spawn(move || {
                            let mut read = 0u32;
                            while read < num_msgs {
                                match reader.wait_read(id, 1, Duration::from_secs(5)) {
                                    Ok(()) => {
                                        let borrow = reader.begin_read(id, num_msgs - read).unwrap();
                                        let n = borrow.granted;
                                        reader.end_read(id, borrow, n).unwrap();
                                        read += n;
                                    }
                                    Err(_) => break,
                                }
                            }
                        }));
                    }

                    let mut written = 0u32;
                    while written < num_msgs {
                        match writer.begin_write(num_msgs - written) {
                            Ok(mut borrow) => {
                                let n = borrow.granted;
                                if n == 0 {
                                    drop(borrow);
                                    writer
                                        .wait_write(1, Duration::from_secs(5))
                                        .expect("writer starved during benchmark");
                                    continue;
                                }
                                for byte in borrow.data_mut().iter_mut() {
                                    *byte = 0xAB;
                                }
                                writer.end_write(borrow, n).expect("end_write failed");
                                written += n;
                            }
                            Err(_) => {
                                writer
                                    .wait_write(1, Duration::from_secs(5))
                                    .expect("writer starved during benchmark");
                            }
                        }
                    }

                    for h in handles {
                        h.join().expect("reader thread panicked");
                    }
                    start.elapsed()
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_throughput);
criterion_main!(benches);
