//! Segregated free lists.
//!
//! One bucket per size class. Each bucket is a doubly linked list threaded
//! through the payloads of its free blocks ([`FreeLink`]); the bucket itself
//! keeps head, tail and count, so appends and unlinks are O(1). Membership is
//! decided only by the block's current size: callers must unlink a block
//! before resizing it.
//!
//! The bucket table is a plain array so an arena's metadata never needs the
//! global allocator.

use crate::block::{BUCKET_COUNT, FreeLink, NIL, Region, class_size, size_class};

#[derive(Clone, Copy, Debug)]
struct Bucket {
  count: usize,
  head: usize,
  tail: usize,
}

impl Bucket {
  const EMPTY: Self = Self {
    count: 0,
    head: NIL,
    tail: NIL,
  };
}

pub struct FreeLists {
  buckets: [Bucket; BUCKET_COUNT],
}

impl FreeLists {
  pub const fn new() -> Self {
    Self {
      buckets: [Bucket::EMPTY; BUCKET_COUNT],
    }
  }

  #[cfg(test)]
  fn count(&self, class: usize) -> usize {
    self.buckets[class].count
  }

  /// Appends the free block at `off` to the tail of its bucket.
  pub fn insert(&mut self, region: &mut Region, off: usize) {
    let header = region.header(off);
    debug_assert!(!header.in_use(), "inserting in-use block at {off}");
    let bucket = &mut self.buckets[size_class(header.size)];

    region.set_link(
      off,
      FreeLink {
        prev: bucket.tail,
        next: NIL,
      },
    );
    if bucket.tail == NIL {
      bucket.head = off;
    } else {
      let mut tail = region.link(bucket.tail);
      tail.next = off;
      region.set_link(bucket.tail, tail);
    }
    bucket.tail = off;
    bucket.count += 1;
  }

  /// Unlinks the free block at `off` from the bucket matching its size.
  pub fn remove(&mut self, region: &mut Region, off: usize) {
    let header = region.header(off);
    let bucket = &mut self.buckets[size_class(header.size)];
    debug_assert!(bucket.count > 0, "removing {off} from an empty bucket");

    let link = region.link(off);
    if link.prev == NIL {
      bucket.head = link.next;
    } else {
      let mut prev = region.link(link.prev);
      prev.next = link.next;
      region.set_link(link.prev, prev);
    }
    if link.next == NIL {
      bucket.tail = link.prev;
    } else {
      let mut next = region.link(link.next);
      next.prev = link.prev;
      region.set_link(link.next, next);
    }
    bucket.count -= 1;
  }

  /// Finds a free block with at least `size` payload bytes.
  ///
  /// Buckets are scanned upward from the request's class to the first
  /// non-empty one; only that bucket is searched. Below the top bucket every
  /// entry fits. The top bucket mixes sizes, so it is walked first-fit and
  /// may return a larger block than a later entry would have offered.
  pub fn find_first_fit(&self, region: &Region, size: usize) -> Option<usize> {
    let class = (size_class(size)..BUCKET_COUNT).find(|&c| self.buckets[c].count > 0)?;

    let mut cursor = self.buckets[class].head;
    while cursor != NIL {
      if region.header(cursor).size >= size {
        return Some(cursor);
      }
      cursor = region.link(cursor).next;
    }
    None
  }

  /// `(smallest block size, count)` for every non-empty bucket.
  pub fn histogram(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
    self
      .buckets
      .iter()
      .enumerate()
      .filter(|(_, b)| b.count > 0)
      .map(|(class, b)| (class_size(class), b.count))
  }

  /// Number of non-empty buckets.
  pub fn occupied(&self) -> usize {
    self.buckets.iter().filter(|b| b.count > 0).count()
  }
}

impl Default for FreeLists {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::{BlockHeader, HEADER_SIZE};
  use crate::os;

  /// Lays out free blocks of the given payload sizes back to back.
  fn carve(sizes: &[usize]) -> (Region, Vec<usize>) {
    let total: usize = sizes.iter().map(|s| s + HEADER_SIZE).sum();
    let mut region = Region::map(os::align_up(total, os::page_size())).unwrap();
    let mut offsets = Vec::new();
    let mut off = 0;
    for &size in sizes {
      region.set_header(off, BlockHeader::new(size, NIL, 0));
      offsets.push(off);
      off += size + HEADER_SIZE;
    }
    (region, offsets)
  }

  #[test]
  fn insert_appends_and_remove_unlinks_anywhere() {
    let (mut region, offs) = carve(&[64, 64, 64, 64]);
    let mut lists = FreeLists::new();
    for &off in &offs {
      lists.insert(&mut region, off);
    }
    assert_eq!(lists.count(size_class(64)), 4);
    assert_eq!(lists.occupied(), 1);

    // Interior, head, then tail.
    lists.remove(&mut region, offs[2]);
    lists.remove(&mut region, offs[0]);
    lists.remove(&mut region, offs[3]);
    assert_eq!(lists.count(size_class(64)), 1);
    assert_eq!(lists.find_first_fit(&region, 64), Some(offs[1]));

    lists.remove(&mut region, offs[1]);
    assert_eq!(lists.occupied(), 0);
    assert_eq!(lists.find_first_fit(&region, 64), None);
  }

  #[test]
  fn first_fit_scans_upward_to_a_non_empty_class() {
    let (mut region, offs) = carve(&[32, 128, 256]);
    let mut lists = FreeLists::new();
    for &off in &offs {
      lists.insert(&mut region, off);
    }
    assert_eq!(lists.find_first_fit(&region, 32), Some(offs[0]));
    assert_eq!(lists.find_first_fit(&region, 64), Some(offs[1]));
    assert_eq!(lists.find_first_fit(&region, 160), Some(offs[2]));
    assert_eq!(lists.find_first_fit(&region, 288), None);
  }

  #[test]
  fn top_bucket_is_first_fit_not_best_fit() {
    let top = class_size(BUCKET_COUNT - 1);
    let (mut region, offs) = carve(&[top + 10 * HEADER_SIZE, top, top + HEADER_SIZE]);
    let mut lists = FreeLists::new();
    for &off in &offs {
      lists.insert(&mut region, off);
    }
    assert_eq!(lists.count(BUCKET_COUNT - 1), 3);
    // The first entry is the largest, and it wins.
    assert_eq!(lists.find_first_fit(&region, top), Some(offs[0]));
    assert_eq!(lists.find_first_fit(&region, top + 11 * HEADER_SIZE), None);
  }

  #[test]
  fn histogram_reports_non_empty_buckets() {
    let (mut region, offs) = carve(&[64, 64, 96]);
    let mut lists = FreeLists::new();
    for &off in &offs {
      lists.insert(&mut region, off);
    }
    assert_eq!(lists.histogram().collect::<Vec<_>>(), vec![(64, 2), (96, 1)]);
    assert_eq!(lists.occupied(), 2);
  }
}
