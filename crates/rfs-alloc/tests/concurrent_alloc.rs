//! Allocators racing on shared bitmaps from plain OS threads.

use rfs_alloc::{AllocOptions, AllocationHint, Allocator, Geometry, MemQuota, format_bitmaps};
use rfs_error::RfsError;
use rfs_journal::{Journal, MemJournal};
use rfs_types::{BlockNumber, BlockSize, ObjectKey};
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

fn geometry(block_size: u32, block_count: u64) -> Geometry {
    Geometry::new(BlockSize::new(block_size).unwrap(), block_count).unwrap()
}

#[test]
fn one_free_bit_goes_to_exactly_one_thread() {
    const THREADS: usize = 2;

    for _round in 0..50 {
        let g = geometry(4096, 100);
        let mut images = format_bitmaps(&g);
        for byte in &mut images[0] {
            *byte = 0xFF;
        }
        // Only block 50 is free.
        images[0][6] = 0b1111_1011;
        let journal = Arc::new(MemJournal::new(g.bits_per_bitmap()));
        let alloc = Arc::new(
            Allocator::from_images(
                g,
                &images,
                AllocOptions::default(),
                journal.clone(),
                Arc::new(MemQuota::new()),
            )
            .unwrap(),
        );
        assert_eq!(alloc.free_blocks(), 1);

        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                let journal = Arc::clone(&journal);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let txn = journal.begin().unwrap();
                    barrier.wait();
                    let hint = AllocationHint::formatted(ObjectKey::new(1, 2));
                    let result = alloc.allocate_blocks(&txn, &hint, 1);
                    journal.commit(txn).unwrap();
                    result
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0], &vec![BlockNumber(50)]);
        assert!(
            results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|err| matches!(err, RfsError::NoSpace))
        );
        assert_eq!(alloc.free_blocks(), 0);
        alloc.check_consistency().unwrap();
    }
}

#[test]
fn parallel_allocations_never_overlap() {
    const THREADS: u32 = 8;
    const ROUNDS: u32 = 60;

    let g = geometry(512, 20_000);
    let journal = Arc::new(MemJournal::new(g.bits_per_bitmap()));
    let alloc = Arc::new(
        Allocator::new_formatted(
            g,
            AllocOptions::default(),
            journal.clone(),
            Arc::new(MemQuota::new()),
        )
        .unwrap(),
    );
    let initial = alloc.free_blocks();
    let barrier = Arc::new(Barrier::new(THREADS as usize));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let alloc = Arc::clone(&alloc);
            let journal = Arc::clone(&journal);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut kept = Vec::new();
                for round in 0..ROUNDS {
                    let txn = journal.begin().unwrap();
                    // Every thread competes for the same locality half the time.
                    let dir = if round % 2 == 0 { 3 } else { 3 + t };
                    let hint = AllocationHint::formatted(ObjectKey::new(dir, round));
                    let got = alloc.allocate_blocks(&txn, &hint, 1 + round % 4).unwrap();
                    if round % 3 == 0 {
                        for &block in &got {
                            alloc.free_block(&txn, block, None, false).unwrap();
                        }
                    } else {
                        kept.extend(got);
                    }
                    journal.commit(txn).unwrap();
                }
                kept
            })
        })
        .collect();

    let mut seen = BTreeSet::new();
    for handle in handles {
        for block in handle.join().unwrap() {
            assert!(seen.insert(block), "{block:?} handed to two threads");
        }
    }
    for &block in &seen {
        assert!(alloc.is_block_in_use(block).unwrap());
    }
    assert_eq!(alloc.free_blocks(), initial - seen.len() as u64);
    alloc.check_consistency().unwrap();
    let stats = alloc.stats();
    assert_eq!(stats.freed as usize + seen.len(), stats.allocated as usize);
}
