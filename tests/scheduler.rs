//! End-to-end tests of the scheduler, comparing parallel execution of blocks
//! against sequential execution.

#![warn(clippy::all)]


use occdb::encoding::Value as _;
use occdb::error::{Error, Result};
use occdb::storage::{Engine as _, Memory};
use occdb::{Canceller, Config, Scheduler, View};
use setup::{config, dump, engine, increment, key, random_block, read, sequential, Txn};

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

/// Runs random blocks with 1, 2, and 8 workers, and checks that the results
/// and final state match sequential execution.
#[test]
fn sequential_equivalence() -> Result<()> {
    for workers in [1, 2, 8] {
        for seed in 0..5 {
            let block = random_block(seed, 200, 16);
            let (expect_results, expect_state) = sequential(engine(16), &block)?;

            let scheduler = Scheduler::new(engine(16), config(workers))?;
            let receipts = scheduler.process_all(&block)?;
            let results: Vec<_> = receipts.iter().map(|r| r.result.clone()).collect();
            assert_eq!(results, expect_results, "workers={workers} seed={seed}");
            assert_eq!(dump(&scheduler)?, expect_state, "workers={workers} seed={seed}");
            for (i, receipt) in receipts.iter().enumerate() {
                assert_eq!(receipt.index, i);
            }
        }
    }
    Ok(())
}

/// [T0: A=1, T1: B=A+1, T2: A=2] commits A=2 and B=2.
#[test]
fn read_after_write() -> Result<()> {
    let block: Vec<Txn> = vec![
        Box::new(|view: &mut View<Memory>| -> Result<Vec<u8>> {
            view.set(b"A", 1u64.encode());
            Ok(vec![])
        }),
        Box::new(|view: &mut View<Memory>| -> Result<Vec<u8>> {
            let b = read(view, b"A")? + 1;
            view.set(b"B", b.encode());
            Ok(b.encode())
        }),
        Box::new(|view: &mut View<Memory>| -> Result<Vec<u8>> {
            view.set(b"A", 2u64.encode());
            Ok(vec![])
        }),
    ];
    for workers in [1, 3] {
        let scheduler = Scheduler::new(Memory::new(), config(workers))?;
        let receipts = scheduler.process_all(&block)?;
        assert_eq!(receipts[1].result, Ok(2u64.encode()));
        assert_eq!(
            dump(&scheduler)?,
            vec![(b"A".to_vec(), 2u64.encode()), (b"B".to_vec(), 2u64.encode())]
        );
    }
    Ok(())
}

/// A fully conflicting block converges without the sequential fallback, since
/// the lowest non-final transaction becomes final at least every other round.
#[test]
fn convergence() -> Result<()> {
    let count = 30;
    let block: Vec<Txn> = (0..count).map(|_| increment(b"counter".to_vec())).collect();
    let scheduler = Scheduler::new(
        Memory::new(),
        Config { workers: 8, validation_workers: 8, max_iterations: 2 * count + 1 },
    )?;
    let receipts = scheduler.process_all(&block)?;
    for (i, receipt) in receipts.iter().enumerate() {
        assert_eq!(receipt.result, Ok((i as u64 + 1).encode()));
    }
    assert_eq!(scheduler.engine().read().get(b"counter")?, Some((count as u64).encode()));

    let stats = scheduler.stats();
    assert!(!stats.synchronous);
    assert!(stats.rounds <= 2 * count + 1);
    Ok(())
}

/// A transaction that reads a value a lower transaction later overwrites is
/// always re-executed.
#[test]
fn no_missed_invalidation() -> Result<()> {
    for _ in 0..20 {
        let block: Vec<Txn> = vec![
            Box::new(|view: &mut View<Memory>| -> Result<Vec<u8>> {
                std::thread::sleep(Duration::from_millis(5));
                view.set(&key(0), 100u64.encode());
                Ok(vec![])
            }),
            Box::new(|view: &mut View<Memory>| -> Result<Vec<u8>> {
                let value = read(view, &key(0))?;
                view.set(&key(1), value.encode());
                Ok(value.encode())
            }),
        ];
        let scheduler = Scheduler::new(engine(2), config(2))?;
        let receipts = scheduler.process_all(&block)?;
        assert_eq!(receipts[1].result, Ok(100u64.encode()));
        assert_eq!(scheduler.engine().read().get(&key(1))?, Some(100u64.encode()));
    }
    Ok(())
}

/// A transaction summing a range through an iterator is re-executed when a
/// lower transaction changes the value of a key it already saw.
#[test]
fn iterator_value_changed() -> Result<()> {
    let x = key(0);
    for _ in 0..5 {
        // Txn 0 only writes once txn 1 has iterated, so txn 1's first attempt
        // always sums the engine's value.
        let (iterated_tx, iterated_rx) = crossbeam::channel::bounded(1);
        let (x0, x1) = (x.clone(), x.clone());
        let block: Vec<Txn> = vec![
            Box::new(move |view: &mut View<Memory>| -> Result<Vec<u8>> {
                iterated_rx.recv_timeout(Duration::from_secs(10))?;
                view.set(&x0, 5u64.encode());
                Ok(vec![])
            }),
            Box::new(move |view: &mut View<Memory>| -> Result<Vec<u8>> {
                let mut sum = 0u64;
                for item in view.iterator(x1.clone()..=x1.clone())? {
                    let (_, value) = item?;
                    sum += u64::decode(&value)?;
                }
                let _ = iterated_tx.try_send(());
                view.set(b"sum", sum.encode());
                Ok(sum.encode())
            }),
        ];
        let mut engine = Memory::new();
        engine.set(&x, 1u64.encode())?;

        let scheduler = Scheduler::new(engine, config(2))?;
        let receipts = scheduler.process_all(&block)?;
        assert_eq!(receipts[1].result, Ok(5u64.encode()));
        assert!(receipts[1].incarnation > 0);
        assert_eq!(scheduler.engine().read().get(b"sum")?, Some(5u64.encode()));
    }
    Ok(())
}

/// 1000 panicking transactions all complete exactly once, without deadlocking
/// the pools.
#[test]
fn panics_complete() -> Result<()> {
    let (tx, rx) = crossbeam::channel::bounded(1);
    std::thread::spawn(move || {
        let block: Vec<Txn> = (0..1000)
            .map(|i| -> Txn {
                Box::new(move |view: &mut View<Memory>| -> Result<Vec<u8>> {
                    view.set(&key(i), vec![1]);
                    panic!("txn {i} panicked")
                })
            })
            .collect();
        let result = Scheduler::new(Memory::new(), config(8)).and_then(|scheduler| {
            let receipts = scheduler.process_all(&block)?;
            Ok((receipts, scheduler.stats(), dump(&scheduler)?))
        });
        let _ = tx.send(result);
    });

    let (receipts, stats, state) = rx.recv_timeout(Duration::from_secs(60))??;
    assert_eq!(receipts.len(), 1000);
    for (i, receipt) in receipts.into_iter().enumerate() {
        assert_eq!(receipt.result, Err(Error::Panic(format!("txn {i} panicked"))));
    }
    assert_eq!(stats.executions, 1000);
    assert_eq!(stats.panics, 1000);
    assert!(state.is_empty());
    Ok(())
}

/// Transactions iterating over ranges that lower transactions insert into
/// and delete from.
#[test]
fn iterators() -> Result<()> {
    let mut block: Vec<Txn> = Vec::new();
    for i in 0..20u64 {
        // Insert even keys, delete odd keys.
        block.push(Box::new(move |view: &mut View<Memory>| -> Result<Vec<u8>> {
            match i % 2 {
                0 => view.set(&key(20 + i), i.encode()),
                _ => view.delete(&key(i)),
            }
            Ok(vec![])
        }));
        // Count live keys.
        block.push(Box::new(|view: &mut View<Memory>| -> Result<Vec<u8>> {
            let count = view.iterator(key(0)..)?.count() as u64;
            view.set(b"count", count.encode());
            Ok(count.encode())
        }));
    }
    let (expect, _) = sequential(engine(20), &block)?;

    let scheduler = Scheduler::new(engine(20), config(8))?;
    let receipts = scheduler.process_all(&block)?;
    let results: Vec<_> = receipts.into_iter().map(|r| r.result).collect();
    assert_eq!(results, expect);
    assert_eq!(scheduler.engine().read().get(b"count")?, Some(20u64.encode()));
    Ok(())
}

/// Cancelling a batch errors without writing anything.
#[test]
fn cancel() -> Result<()> {
    let (canceller, token) = Canceller::new();
    let canceller = Arc::new(canceller);
    let block: Vec<Txn> = (0..100)
        .map(|i| -> Txn {
            let canceller = canceller.clone();
            Box::new(move |view: &mut View<Memory>| -> Result<Vec<u8>> {
                if i == 10 {
                    canceller.cancel();
                }
                view.set(&key(i), vec![1]);
                Ok(vec![])
            })
        })
        .collect();

    let scheduler = Scheduler::new(Memory::new(), config(4))?.with_cancel(token);
    assert_eq!(scheduler.process_all(&block), Err(Error::Cancelled));
    assert!(dump(&scheduler)?.is_empty());
    Ok(())
}
