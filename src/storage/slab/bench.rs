//! Benchmarks for the allocator hot paths

#[cfg(test)]
mod bench {
    use crate::storage::slab::{segment, SlabAlloc};
    use std::time::Instant;

    /// Benchmark chunk reuse (steady-state allocation)
    #[test]
    fn bench_alloc_free_reuse() {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();

        // Warm up one slab large enough for the whole working set
        let warm = alloc.alloc(64 * 1024).unwrap();
        unsafe { segment::init_header(warm.addr, 64 * 1024, 64 * 1024) };
        alloc.free(warm.ref_, warm.addr as *const u8);

        let start = Instant::now();
        for _ in 0..100_000 {
            let m = alloc.alloc(64).unwrap();
            unsafe { segment::init_header(m.addr, 64, 64) };
            alloc.free(m.ref_, m.addr as *const u8);
        }
        let elapsed = start.elapsed();
        println!("Reuse path: {:?} for 100k alloc/free cycles", elapsed);

        alloc.verify();
    }

    /// Benchmark slab growth (cold allocation)
    #[test]
    fn bench_slab_growth() {
        let mut alloc = SlabAlloc::new();
        alloc.attach_empty();

        let start = Instant::now();
        let mut total = 0usize;
        for _ in 0..24 {
            let m = alloc.alloc(4096).unwrap();
            total += 4096;
            let _ = m;
        }
        let elapsed = start.elapsed();
        println!(
            "Grow path: {:?} to place {} KiB across {} bytes of slabs",
            elapsed,
            total / 1024,
            alloc.get_total_size() - alloc.get_baseline()
        );
    }
}
