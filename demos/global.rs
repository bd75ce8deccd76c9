//! Uses the allocator as the global allocator for a normal std program and
//! checks heap validity along the way.

use segalloc::UnixAllocator;

// This is the line that routes every Rust allocation in the process through
// the hybrid allocator.
#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::new();

fn main() {
    env_logger::init();
    println!("Hello from segalloc!");

    let s: String = "abc".to_owned();
    println!("Got a string: {}", s);

    let mut v = vec![0usize, 1, 2, 3];
    for n in 10..2048 {
        v.push(n);
    }
    println!("Got a vec of {} elements", v.len());

    let (validity, stats) = ALLOCATOR.stats();
    println!("stats: {:?}", stats);
    assert!(validity.is_valid(), "heap invalid: {:?}", validity);

    drop(v);
    drop(s);

    let (validity, stats) = ALLOCATOR.stats();
    println!("after drops: {:?}", stats);
    assert!(validity.is_valid(), "heap invalid: {:?}", validity);
}
