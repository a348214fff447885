//! Property tests for the device memory pool

use std::sync::Arc;

use graphforge::memory::align_up;
use graphforge::{Device, DevicePtr, ForgeError, HostDevice, MemoryPool};
use proptest::prelude::*;

const CAPACITY: usize = 256 * 1024;
const ALIGN: usize = 512;

fn pool() -> MemoryPool {
    let device: Arc<dyn Device> = Arc::new(HostDevice::new(1 << 30));
    MemoryPool::reserve(device, CAPACITY, ALIGN).unwrap()
}

#[derive(Debug, Clone)]
enum Op {
    Alloc(usize),
    Free(usize),
    Contiguous(Vec<usize>),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1usize..8192).prop_map(Op::Alloc),
        (0usize..64).prop_map(Op::Free),
        prop::collection::vec(0usize..2048, 1..5).prop_map(Op::Contiguous),
    ]
}

proptest! {
    #[test]
    fn prop_live_blocks_never_overlap(ops in prop::collection::vec(op(), 1..80)) {
        let pool = pool();
        // (ptr, charged bytes) of every tracked allocation
        let mut live: Vec<(DevicePtr, usize)> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => match pool.allocate(size) {
                    Ok(ptr) => live.push((ptr, align_up(size, ALIGN))),
                    Err(ForgeError::OutOfMemory { .. }) => {}
                    Err(e) => panic!("unexpected error: {}", e),
                },
                Op::Free(pick) => {
                    if !live.is_empty() {
                        let (ptr, _) = live.remove(pick % live.len());
                        pool.free(ptr).unwrap();
                    }
                }
                Op::Contiguous(sizes) => {
                    let total: usize = sizes.iter().sum();
                    if total == 0 {
                        continue;
                    }
                    if let Ok(ptrs) = pool.allocate_contiguous(&sizes) {
                        for pair in ptrs.windows(2).zip(&sizes) {
                            let (window, size) = pair;
                            prop_assert_eq!(window[1], window[0].offset(*size));
                        }
                        let reserved = align_up(total, ALIGN);
                        let last = sizes.iter().rposition(|&s| s > 0).unwrap();
                        let mut consumed = 0;
                        for (i, (&ptr, &size)) in ptrs.iter().zip(&sizes).enumerate() {
                            if size == 0 {
                                continue;
                            }
                            let charged = if i == last { reserved - consumed } else { size };
                            live.push((ptr, charged));
                            consumed += charged;
                        }
                    }
                }
            }

            let mut sorted = live.clone();
            sorted.sort();
            for pair in sorted.windows(2) {
                prop_assert!(pair[0].0.offset(pair[0].1) <= pair[1].0);
            }
            let stats = pool.stats();
            prop_assert_eq!(stats.in_use, live.iter().map(|(_, size)| size).sum::<usize>());
            prop_assert_eq!(pool.live_allocations(), live.len());
            prop_assert!(stats.peak_in_use >= stats.in_use);
        }

        for (ptr, _) in live {
            pool.free(ptr).unwrap();
        }
        let stats = pool.stats();
        prop_assert_eq!(stats.in_use, 0);
        prop_assert_eq!(stats.fragment_count, 1);
        prop_assert_eq!(stats.largest_free_block, CAPACITY);
    }

    #[test]
    fn prop_allocations_are_aligned(ops in prop::collection::vec(op(), 1..80)) {
        let pool = pool();
        let mut live: Vec<DevicePtr> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    if let Ok(ptr) = pool.allocate(size) {
                        prop_assert_eq!(ptr.offset_from(pool.base()) % ALIGN, 0);
                        live.push(ptr);
                    }
                }
                // Frees single members of packed groups as well.
                Op::Free(pick) => {
                    if !live.is_empty() {
                        let ptr = live.remove(pick % live.len());
                        pool.free(ptr).unwrap();
                    }
                }
                Op::Contiguous(sizes) => {
                    if sizes.iter().sum::<usize>() == 0 {
                        continue;
                    }
                    if let Ok(ptrs) = pool.allocate_contiguous(&sizes) {
                        prop_assert_eq!(ptrs[0].offset_from(pool.base()) % ALIGN, 0);
                        for (ptr, &size) in ptrs.into_iter().zip(&sizes) {
                            if size > 0 {
                                live.push(ptr);
                            }
                        }
                    }
                }
            }
        }
    }
}

#[test]
fn test_pool_shared_across_threads() {
    let pool = Arc::new(pool());
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let ptr = pool.allocate(100 + t * 50 + i).unwrap();
                    pool.free(ptr).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert_eq!(stats.allocation_count, 800);
    assert_eq!(stats.free_count, 800);
}
