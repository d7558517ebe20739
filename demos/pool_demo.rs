use hsa_pool::{
    DeviceRuntime, KfdRuntime, PoolResult, PooledStorageManager, SimulatedDevice,
};
use tracing_subscriber::EnvFilter;

/// Simulates a few layers repeatedly requesting and releasing activation buffers.
fn run<R: DeviceRuntime>(pool: &PooledStorageManager<R>) -> PoolResult<()> {
    let layer_sizes: [u64; 4] = [4 << 20, 16 << 20, 4 << 20, 1 << 20];

    for step in 0..8 {
        let mut live = Vec::new();
        for &size in &layer_sizes {
            live.push((pool.alloc(size)?, size));
        }
        for (handle, size) in live {
            pool.free(handle, size);
        }

        let stats = pool.stats();
        println!(
            "step {step}: used {:>10} B, pooled {:>10} B in {} blocks, {} native allocs, {} reuses",
            stats.used_bytes,
            stats.pooled_bytes,
            stats.pooled_blocks,
            stats.native_allocations,
            stats.reuse_hits
        );
    }

    pool.release_all();
    println!("after release: used {} B", pool.used_memory());
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let use_kfd = std::env::args().any(|a| a == "--kfd");

    let result = if use_kfd {
        println!("--- Pooling on the first KFD GPU node ---");
        KfdRuntime::open()
            .inspect(|rt| {
                let node = rt.node();
                println!(
                    "node {} (gpu_id {:#x}, {}): {} B VRAM",
                    node.node_id,
                    node.gpu_id,
                    node.render_node_path(),
                    node.total_memory()
                );
            })
            .and_then(PooledStorageManager::from_env)
            .and_then(|pool| run(&pool))
    } else {
        println!("--- Pooling on a simulated 1 GiB device ---");
        PooledStorageManager::from_env(SimulatedDevice::new(1 << 30)).and_then(|pool| run(&pool))
    };

    if let Err(e) = result {
        eprintln!("Demo failed: {e}");
        std::process::exit(1);
    }
}
