use core::ptr::null_mut;

use segalloc::allocators::{RawAlloc, ToyHeap};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use test_log::test;

fn validate(allocator: &RawAlloc<ToyHeap>, live_count: usize) {
    let (validity, stats) = allocator.stats();
    assert!(validity.is_valid(), "invalid heap: {:?}", validity);

    // Every byte between start and end is a block, slack, or the gap.
    assert_eq!(
        stats.used_bytes + stats.free_bytes + stats.slack + stats.gap_bytes,
        stats.heap_bytes,
    );
    // Every free block in the walk is filed in the table and vice versa.
    assert_eq!(stats.free_blocks, stats.free_list_len);
    // Live slots and used blocks must agree.
    assert_eq!(live_count, stats.used_blocks);
}

/// Random allocate/release churn with a full validity check after every
/// step. `skip` displaces the first break extension to run the same churn
/// over a gapped heap.
fn run_stress(skip: usize) {
    let mut allocator = RawAlloc::new(ToyHeap::default());
    allocator.heap.grower_mut().skip_next = skip;

    // An array of pointer slots; null means not allocated.
    let mut pointers: [(*mut u8, usize); 128] = [(null_mut(), 0); 128];
    let mut live_count: usize = 0;

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = rand::distributions::Uniform::new_inclusive(1usize, 16);

    for step in 0..1024 * 10 {
        let chosen = pointers.choose_mut(&mut rng).unwrap();
        let &mut (ptr, size) = chosen;

        if ptr.is_null() {
            // Allocate into the empty slot.
            let new_size = range.sample(&mut rng) * range.sample(&mut rng);
            let new_ptr = unsafe { allocator.allocate(new_size) };
            log::info!("step {}: allocated {:?} ({} bytes)", step, new_ptr, new_size);
            assert!(!new_ptr.is_null(), "allocation of {} bytes failed", new_size);

            // Scribble over the payload; the validity walk will catch us if
            // the allocator handed out bytes it still needs.
            unsafe { core::ptr::write_bytes(new_ptr, 0xa5, new_size) };

            *chosen = (new_ptr, new_size);
            live_count += 1;
        } else {
            log::info!("step {}: releasing {:?} ({} bytes)", step, ptr, size);
            unsafe { allocator.release(ptr) };
            *chosen = (null_mut(), 0);
            live_count -= 1;
        }

        validate(&allocator, live_count);
    }

    // Drain whatever is still live and check the end state.
    for &(ptr, _) in pointers.iter() {
        if !ptr.is_null() {
            unsafe { allocator.release(ptr) };
            live_count -= 1;
        }
    }
    validate(&allocator, live_count);

    let (_, stats) = allocator.stats();
    assert_eq!(stats.used_blocks, 0);
    // Maximal coalescing leaves at most one free block per side of the gap.
    assert!(stats.free_blocks <= 2, "stats: {:?}", stats);
    if skip > 0 {
        assert!(allocator.heap.gap().is_some());
    }
}

#[test]
fn test_stress() {
    run_stress(0);
}

#[test]
fn test_stress_across_gap() {
    run_stress(256);
}
