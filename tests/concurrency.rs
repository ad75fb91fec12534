//! Many threads sharing one pool.

use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use arenapool::{Pool, PoolConfig};
use proptest::prelude::Rng;
use proptest::test_runner::{RngAlgorithm, TestRng};

const THREADS: usize = 20;
const CYCLES: usize = 4000;
const DEADLINE: Duration = Duration::from_secs(120);

fn fill(ptr: *mut u8, len: usize, tag: u8) {
  unsafe { ptr.write_bytes(tag, len) };
}

fn check(ptr: *const u8, len: usize, tag: u8) {
  let bytes = unsafe { core::slice::from_raw_parts(ptr, len) };
  assert!(bytes.iter().all(|&b| b == tag), "block at {ptr:p} was overwritten");
}

/// Seeded per worker so a failure replays the same sequence.
fn worker_rng(idx: usize) -> TestRng {
  let mut seed = [0u8; 32];
  seed[..8].copy_from_slice(&(idx as u64 + 1).to_le_bytes());
  TestRng::from_seed(RngAlgorithm::ChaCha, &seed)
}

#[test]
fn randomized_churn_finishes_without_corruption() {
  let pool = Arc::new(Pool::new().unwrap());
  let (done, finished) = mpsc::channel();

  let handles: Vec<_> = (0..THREADS)
    .map(|idx| {
      let pool = Arc::clone(&pool);
      let done = done.clone();
      thread::spawn(move || {
        let tag = idx as u8 + 1;
        let mut rng = worker_rng(idx);
        let mut live: Vec<(usize, usize)> = Vec::new();

        for _ in 0..CYCLES {
          if !live.is_empty() && rng.next_u64() % 3 == 0 {
            let (addr, size) = live.swap_remove(rng.next_u64() as usize % live.len());
            check(addr as *const u8, size, tag);
            unsafe { pool.free(addr as *mut u8) };
          } else {
            let size = 1 + rng.next_u64() as usize % 4096;
            let ptr = pool.malloc(size);
            assert!(!ptr.is_null());
            fill(ptr, size, tag);
            live.push((ptr as usize, size));
          }
        }

        while !live.is_empty() {
          let (addr, size) = live.swap_remove(rng.next_u64() as usize % live.len());
          check(addr as *const u8, size, tag);
          unsafe { pool.free(addr as *mut u8) };
        }
        let _ = done.send(idx);
      })
    })
    .collect();
  drop(done);

  for _ in 0..THREADS {
    finished
      .recv_timeout(DEADLINE)
      .expect("worker did not finish in time");
  }
  for handle in handles {
    handle.join().unwrap();
  }

  let snap = pool.dump();
  for arena in &snap.arenas {
    assert_eq!(arena.free_size, arena.size, "arena #{} leaked", arena.id);
    assert_eq!(arena.blocks.len(), 1);
  }
  assert_eq!(pool.dump_counters().bytes_allocated, 0);
}

#[test]
fn concurrent_growth_respects_limit() {
  let max = 6;
  let pool = Pool::with_config(PoolConfig::builder().arena_pages(1).max_arenas(max).build()).unwrap();
  let big = 2 * pool.page_size();

  let served: usize = thread::scope(|s| {
    let handles: Vec<_> = (0..16)
      .map(|_| s.spawn(|| pool.malloc(big) as usize))
      .collect();
    handles
      .into_iter()
      .map(|h| h.join().unwrap())
      .filter(|&addr| addr != 0)
      .count()
  });

  assert!(served >= 1);
  assert!(served <= max - 1);
  assert!(pool.arena_count() <= max);
  assert_eq!(pool.dump_counters().arena_count as usize, pool.arena_count());
}

#[test]
fn cross_thread_free() {
  let pool = Pool::with_config(PoolConfig::builder().arena_pages(8).build()).unwrap();
  let addrs: Vec<usize> = thread::scope(|s| {
    s.spawn(|| (0..256).map(|i| pool.malloc(16 + i) as usize).collect())
      .join()
      .unwrap()
  });
  thread::scope(|s| {
    for chunk in addrs.chunks(64) {
      let pool = &pool;
      s.spawn(move || {
        for &addr in chunk {
          unsafe { pool.free(addr as *mut u8) };
        }
      });
    }
  });

  let snap = pool.dump();
  let used: usize = snap
    .arenas
    .iter()
    .map(|a| a.size - a.free_size)
    .sum();
  assert_eq!(used, 0);
  assert!(snap.arenas.iter().all(|a| a.blocks.len() == 1));
}
