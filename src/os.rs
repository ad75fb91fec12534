// =============================================================================
// Platform
// =============================================================================

use core::ptr::{NonNull, null_mut};

use crate::error::PoolError;

/// Page size assumed when the host refuses to report one.
pub const FALLBACK_PAGE_SIZE: usize = 4096;

/// Queries the host page size. Called once per pool.
pub fn page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size <= 0 {
    FALLBACK_PAGE_SIZE
  } else {
    size as usize
  }
}

/// Maps `size` bytes of zeroed, private, anonymous memory.
pub fn map(size: usize) -> Result<NonNull<u8>, PoolError> {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    return Err(PoolError::Map { size, errno });
  }

  NonNull::new(ptr as *mut u8).ok_or(PoolError::Map { size, errno: 0 })
}

/// Returns a region obtained from [`map`] to the OS.
///
/// # Safety
/// `ptr` and `size` must describe exactly one live mapping, and nothing may
/// touch it afterwards.
pub unsafe fn unmap(ptr: NonNull<u8>, size: usize) {
  let rc = unsafe { libc::munmap(ptr.as_ptr().cast(), size) };
  if rc != 0 {
    log::error!(
      "munmap({:p}, {}) failed: {}",
      ptr,
      size,
      std::io::Error::last_os_error()
    );
  }
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn page_size_is_power_of_two() {
    assert!(page_size().is_power_of_two());
  }

  #[test]
  fn align_up_rounds_to_multiple() {
    assert_eq!(align_up(0, 4096), 0);
    assert_eq!(align_up(1, 4096), 4096);
    assert_eq!(align_up(4096, 4096), 4096);
    assert_eq!(align_up(4097, 32), 4128);
  }

  #[test]
  fn mapped_memory_is_zeroed_and_writable() {
    let size = page_size() * 2;
    let ptr = map(size).unwrap();
    unsafe {
      let bytes = core::slice::from_raw_parts_mut(ptr.as_ptr(), size);
      assert!(bytes.iter().all(|&b| b == 0));
      bytes.fill(0xA5);
      assert_eq!(bytes[size - 1], 0xA5);
      unmap(ptr, size);
    }
  }
}
