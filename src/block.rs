//! Block header layout and size-class indexing.
//!
//! Every block in an arena is a header followed by its payload:
//!
//! ```text
//!   offset                 offset + HEADER_SIZE            offset + HEADER_SIZE + size
//!   ┌──────────────────────┬───────────────────────────────┐
//!   │ BlockHeader (32 B)   │ payload (size bytes)          │ next block header ...
//!   └──────────────────────┴───────────────────────────────┘
//!                          ▲
//!                          └── pointer handed to the caller
//! ```
//!
//! Headers never hold addresses. The physical predecessor is an offset into
//! the owning arena and the owner is an arena id, so a header stays valid no
//! matter where the arena table keeps its records.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::error::PoolError;
use crate::os;

/// Size of a block header; also the allocation granule.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Number of free-list buckets per arena. The last one is a catch-all.
pub const BUCKET_COUNT: usize = 1025;

/// Marks an absent offset (no predecessor, empty list end).
pub const NIL: usize = usize::MAX;

/// Written into every live header; lets `free` reject foreign pointers.
pub const BLOCK_MAGIC: u32 = 0x4152_4E41; // "ARNA"

pub const FLAG_IN_USE: u32 = 0x01;

const _: () = assert!(HEADER_SIZE == 32);
const _: () = assert!(HEADER_SIZE.is_power_of_two());
const _: () = assert!(BUCKET_COUNT >= 2);

#[repr(C, align(32))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
  /// Payload bytes, header excluded.
  pub size: usize,
  /// Arena offset of the physical predecessor, or [`NIL`].
  pub prev: usize,
  /// Id of the owning arena.
  pub arena: u32,
  pub flags: u32,
  pub magic: u32,
}

impl BlockHeader {
  pub const fn new(size: usize, prev: usize, arena: u32) -> Self {
    Self {
      size,
      prev,
      arena,
      flags: 0,
      magic: BLOCK_MAGIC,
    }
  }

  /// What an absorbed header looks like after a merge.
  pub const fn zeroed() -> Self {
    Self {
      size: 0,
      prev: 0,
      arena: 0,
      flags: 0,
      magic: 0,
    }
  }

  #[inline]
  pub const fn in_use(&self) -> bool {
    self.flags & FLAG_IN_USE != 0
  }

  #[inline]
  pub fn set_in_use(&mut self, in_use: bool) {
    if in_use {
      self.flags |= FLAG_IN_USE;
    } else {
      self.flags &= !FLAG_IN_USE;
    }
  }

  /// Bytes the block occupies in its arena.
  #[inline]
  pub const fn span(&self) -> usize {
    self.size + HEADER_SIZE
  }
}

/// Rounds a request up to the allocation granule. `None` on overflow.
#[inline]
pub const fn round_size(size: usize) -> Option<usize> {
  match size.checked_add(HEADER_SIZE - 1) {
    Some(v) => Some(v & !(HEADER_SIZE - 1)),
    None => None,
  }
}

/// Bucket index for a block (or request) of `size` payload bytes.
#[inline]
pub const fn size_class(size: usize) -> usize {
  let class = (size / HEADER_SIZE).saturating_sub(1);
  if class < BUCKET_COUNT - 1 {
    class
  } else {
    BUCKET_COUNT - 1
  }
}

/// Smallest payload size filed under `class`.
#[inline]
pub const fn class_size(class: usize) -> usize {
  (class + 1) * HEADER_SIZE
}

// =============================================================================
// Region
// =============================================================================

/// Intrusive free-list links, kept in the payload of a free block.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeLink {
  pub prev: usize,
  pub next: usize,
}

const _: () = assert!(size_of::<FreeLink>() <= HEADER_SIZE);

/// An owned anonymous mapping, addressed by byte offsets.
///
/// Every accessor works on offsets relative to the mapping base; neighbor
/// discovery is bounds-checked against the mapping length. Writers need
/// `&mut self`, so whoever owns the region (an arena, behind its lock) is the
/// only one able to reshape the block chain.
pub struct Region {
  base: NonNull<u8>,
  len: usize,
}

// The region is plain memory; exclusive access is arranged by its owner.
unsafe impl Send for Region {}

impl Region {
  /// Maps `len` bytes. `len` must be a multiple of the page size.
  pub fn map(len: usize) -> Result<Self, PoolError> {
    let base = os::map(len)?;
    Ok(Self { base, len })
  }

  #[inline]
  pub fn base(&self) -> NonNull<u8> {
    self.base
  }

  #[inline]
  pub fn contains(&self, ptr: *const u8) -> bool {
    let base = self.base.as_ptr() as usize;
    let addr = ptr as usize;
    addr >= base && addr < base + self.len
  }

  /// Header offset for a payload pointer handed out by this region.
  pub fn block_of(&self, payload: *const u8) -> Option<usize> {
    if !self.contains(payload) {
      return None;
    }
    let rel = payload as usize - self.base.as_ptr() as usize;
    if rel < HEADER_SIZE || rel % HEADER_SIZE != 0 {
      return None;
    }
    Some(rel - HEADER_SIZE)
  }

  #[inline]
  pub fn payload(&self, off: usize) -> NonNull<u8> {
    debug_assert!(off + HEADER_SIZE <= self.len);
    unsafe { self.base.add(off + HEADER_SIZE) }
  }

  /// Offset of the block physically following the one at `off`.
  #[inline]
  pub fn next_of(&self, off: usize, size: usize) -> Option<usize> {
    let next = off.checked_add(HEADER_SIZE)?.checked_add(size)?;
    if next < self.len { Some(next) } else { None }
  }

  #[inline]
  pub fn header(&self, off: usize) -> BlockHeader {
    debug_assert!(off % HEADER_SIZE == 0 && off + HEADER_SIZE <= self.len);
    unsafe { self.base.as_ptr().add(off).cast::<BlockHeader>().read() }
  }

  #[inline]
  pub fn set_header(&mut self, off: usize, header: BlockHeader) {
    debug_assert!(off % HEADER_SIZE == 0 && off + HEADER_SIZE <= self.len);
    unsafe { self.base.as_ptr().add(off).cast::<BlockHeader>().write(header) }
  }

  /// Applies `f` to the header at `off` and writes it back.
  #[inline]
  pub fn update(&mut self, off: usize, f: impl FnOnce(&mut BlockHeader)) {
    let mut header = self.header(off);
    f(&mut header);
    self.set_header(off, header);
  }

  /// Zeroes a header that has been absorbed by a neighbor.
  #[inline]
  pub fn clear_header(&mut self, off: usize) {
    debug_assert!(off + HEADER_SIZE <= self.len);
    unsafe { self.base.as_ptr().add(off).write_bytes(0, HEADER_SIZE) }
  }

  #[inline]
  pub fn link(&self, off: usize) -> FreeLink {
    unsafe { self.payload(off).as_ptr().cast::<FreeLink>().read() }
  }

  #[inline]
  pub fn set_link(&mut self, off: usize, link: FreeLink) {
    unsafe { self.payload(off).as_ptr().cast::<FreeLink>().write(link) }
  }
}

impl Drop for Region {
  fn drop(&mut self) {
    log::debug!("unmapping region {:p} ({} bytes)", self.base, self.len);
    unsafe { os::unmap(self.base, self.len) };
  }
}
