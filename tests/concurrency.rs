use hsa_pool::runtime::SimHandle;
use hsa_pool::{PoolConfig, PooledStorageManager, SimulatedDevice};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

const THREADS: usize = 8;
const ITERATIONS: usize = 2_000;
const SIZES: [u64; 5] = [64, 128, 256, 512, 1024];
const MAX_HELD: usize = 4;

type SharedPool = PooledStorageManager<Arc<SimulatedDevice>>;

fn shared_pool(total: u64, reserve: u32) -> (Arc<SimulatedDevice>, Arc<SharedPool>) {
    let dev = Arc::new(SimulatedDevice::new(total));
    let config = PoolConfig::new().with_reserve_percent(reserve);
    let pool = Arc::new(PooledStorageManager::new(dev.clone(), config).unwrap());
    (dev, pool)
}

/// All threads cycle through the same few sizes, so most requests are pool hits.
fn shared_sizes(t: usize, i: usize) -> u64 {
    SIZES[(t * 7 + i * 13) % SIZES.len()]
}

/// 128 distinct sizes per thread, at most 1080 bytes each. Thread 0 alone asks for more
/// distinct bucket keys in its first 128 iterations than a 64 KiB device can hold.
fn mostly_distinct_sizes(t: usize, i: usize) -> u64 {
    64 + ((t * 16 + i) % 128) as u64 * 8
}

/// Each worker allocates and frees a rolling window of blocks, checking that no handle is
/// ever given to two holders at once.
fn run_workers(pool: &Arc<SharedPool>, size_of: fn(usize, usize) -> u64) {
    let checked_out: Arc<Mutex<HashSet<SimHandle>>> = Arc::new(Mutex::new(HashSet::new()));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let pool = Arc::clone(pool);
            let checked_out = Arc::clone(&checked_out);
            thread::spawn(move || {
                let mut held: Vec<(SimHandle, u64)> = Vec::new();
                for i in 0..ITERATIONS {
                    let size = size_of(t, i);
                    let handle = pool.alloc(size).expect("allocation within capacity");
                    assert!(
                        checked_out.lock().insert(handle),
                        "handle {handle:?} handed out twice"
                    );
                    held.push((handle, size));

                    if held.len() > MAX_HELD || i % 5 == 0 {
                        let (h, s) = held.remove(0);
                        checked_out.lock().remove(&h);
                        pool.free(h, s);
                    }
                }
                for (h, s) in held {
                    checked_out.lock().remove(&h);
                    pool.free(h, s);
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert!(checked_out.lock().is_empty());
}

#[test]
fn concurrent_alloc_free_keeps_accounting_exact() {
    let (dev, pool) = shared_pool(1 << 30, 5);
    run_workers(&pool, shared_sizes);

    // Everything is back in the pool: used memory is exactly what the device holds for us.
    let stats = pool.stats();
    assert_eq!(stats.used_bytes, dev.live_bytes());
    assert_eq!(stats.pooled_bytes, stats.used_bytes);
    assert!(stats.reuse_hits > 0);

    pool.release_all();
    assert_eq!(pool.used_memory(), 0);
    assert_eq!(dev.live_handles(), 0);
    assert_eq!(dev.counters().failed_frees, 0);
}

#[test]
fn concurrent_flushes_under_tight_capacity() {
    // Enough room for every checked-out block, but not for an ever-growing pool on top.
    let (dev, pool) = shared_pool(64 * 1024, 25);
    run_workers(&pool, mostly_distinct_sizes);

    let stats = pool.stats();
    assert!(stats.flushes > 0, "tight capacity never forced a flush");
    assert!(stats.native_allocations > 0);
    assert_eq!(stats.used_bytes, dev.live_bytes());
    assert_eq!(stats.pooled_bytes, stats.used_bytes);
    pool.release_all();
    assert_eq!(dev.live_bytes(), 0);
    assert_eq!(dev.counters().failed_frees, 0);
}

#[test]
fn concurrent_release_all_never_double_frees() {
    let (dev, pool) = shared_pool(1 << 30, 5);

    let flusher = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            for _ in 0..500 {
                pool.release_all();
                thread::yield_now();
            }
        })
    };
    run_workers(&pool, shared_sizes);
    flusher.join().unwrap();

    pool.release_all();
    pool.release_all();
    assert_eq!(pool.used_memory(), 0);
    assert_eq!(dev.live_handles(), 0);
    assert_eq!(dev.counters().failed_frees, 0);
}
