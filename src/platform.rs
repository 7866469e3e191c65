//! Platform memory adapter: query, reserve, protect and release pages.

use crate::error::{Error, Result};
use region::Protection;
use std::ops::Range;

/// A fixed-size slab of virtual memory reserved, committed and owned by
/// its [`TrampolineRegion`](crate::trampoline::region::TrampolineRegion).
pub struct MappedRegion {
  map: mmap::MemoryMap,
}

impl MappedRegion {
  /// Reserves and commits `size` bytes within `max_distance` of
  /// `preferred_address`, preferring addresses after it (macOS refuses
  /// fixed mappings before the process image) and falling back to
  /// addresses before it.
  pub fn allocate_near(preferred_address: usize, size: usize, max_distance: u64) -> Result<Self> {
    let range = (preferred_address.saturating_sub(max_distance as usize))
      ..(preferred_address.saturating_add(max_distance as usize));

    free_region_after(preferred_address as *const (), range.clone())
      .chain(free_region_before(preferred_address as *const (), range))
      .filter_map(|candidate| candidate.ok())
      .find_map(|address| Self::allocate_fixed(address, size))
      .ok_or(Error::OutOfRange)
  }

  fn allocate_fixed(address: *const (), size: usize) -> Option<Self> {
    mmap::MemoryMap::new(
      size,
      &[
        mmap::MapOption::MapReadable,
        mmap::MapOption::MapWritable,
        mmap::MapOption::MapAddr(address as *const _),
      ],
    )
    .ok()
    .map(|map| MappedRegion { map })
  }

  pub fn address(&self) -> usize {
    self.map.data() as usize
  }

  pub fn len(&self) -> usize {
    self.map.len()
  }

  /// Marks the region executable (and no longer writable) once its
  /// chunks have been fully initialized.
  pub fn protect_executable(&self) -> Result<()> {
    unsafe {
      region::protect(self.map.data(), self.map.len(), Protection::READ_EXECUTE)?;
    }
    Ok(())
  }

  /// Restores write access, e.g. to initialize another chunk. Keeps
  /// `EXECUTE` set: other chunks already built in this region may be
  /// executing concurrently on another thread for the whole time this
  /// region is unprotected for the mutation.
  pub fn protect_writable(&self) -> Result<()> {
    unsafe {
      region::protect(self.map.data(), self.map.len(), Protection::READ_WRITE_EXECUTE)?;
    }
    Ok(())
  }
}

enum SearchDirection {
  Before,
  After,
}

/// Walks `region::query` starting at `origin`, yielding the address of
/// each free (unmapped) gap it finds, in the given direction, bounded by
/// `range`.
struct FreeRegionIter {
  range: Range<usize>,
  search: SearchDirection,
  current: usize,
}

impl FreeRegionIter {
  fn new(origin: *const (), range: Range<usize>, search: SearchDirection) -> Self {
    FreeRegionIter { range, current: origin as usize, search }
  }
}

impl Iterator for FreeRegionIter {
  type Item = Result<*const ()>;

  fn next(&mut self) -> Option<Self::Item> {
    let page_size = region::page::size();

    while self.current > 0 && self.range.contains(&self.current) {
      match region::query(self.current as *const ()) {
        Ok(found) => {
          self.current = match self.search {
            SearchDirection::Before => found.lower().saturating_sub(page_size),
            SearchDirection::After => found.upper(),
          };
        },
        Err(region::Error::FreeMemory) => {
          let result = self.current as *const ();
          self.current = match self.search {
            SearchDirection::Before => self.current.saturating_sub(page_size),
            SearchDirection::After => self.current + page_size,
          };
          return Some(Ok(result));
        },
        Err(other) => return Some(Err(other.into())),
      }
    }

    None
  }
}

fn free_region_after(origin: *const (), range: Range<usize>) -> impl Iterator<Item = Result<*const ()>> {
  FreeRegionIter::new(origin, range, SearchDirection::After)
}

fn free_region_before(origin: *const (), range: Range<usize>) -> impl Iterator<Item = Result<*const ()>> {
  FreeRegionIter::new(origin, range, SearchDirection::Before)
}

/// Whether `address` currently falls within an executable mapping.
pub fn is_executable_address(address: *const ()) -> Result<bool> {
  Ok(region::query(address)?.protection.contains(Protection::EXECUTE))
}

/// The number of bytes of readable memory starting at `address`, up to
/// `max_bytes`, obtained by walking the containing region(s)' protection
/// entries.
pub fn size_of_readable_region(address: *const (), max_bytes: usize) -> Result<usize> {
  let mut remaining = max_bytes;
  let mut cursor = address as usize;
  let mut total = 0usize;

  while remaining > 0 {
    let found = match region::query(cursor as *const ()) {
      Ok(found) => found,
      Err(region::Error::FreeMemory) => break,
      Err(other) => return Err(other.into()),
    };
    if !found.protection.contains(Protection::READ) {
      break;
    }
    let available = found.upper().saturating_sub(cursor).min(remaining);
    if available == 0 {
      break;
    }
    total += available;
    remaining -= available;
    cursor = found.upper();
  }

  Ok(total)
}

#[cfg(windows)]
pub fn system_allocation_granularity() -> usize {
  use std::mem::MaybeUninit;
  use winapi::um::sysinfoapi::GetSystemInfo;
  unsafe {
    let mut info = MaybeUninit::uninit();
    GetSystemInfo(info.as_mut_ptr());
    info.assume_init().dwAllocationGranularity as usize
  }
}

#[cfg(not(windows))]
pub fn system_allocation_granularity() -> usize {
  region::page::size()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn current_function_is_executable() {
    let marker = is_executable_address as *const ();
    assert!(is_executable_address(marker).unwrap());
  }

  #[test]
  fn readable_region_never_exceeds_max_bytes() {
    let marker = is_executable_address as *const ();
    let size = size_of_readable_region(marker, 8).unwrap();
    assert!(size <= 8);
  }

  #[test]
  fn allocate_near_returns_a_writable_region() {
    let marker = is_executable_address as *const () as usize;
    let region = MappedRegion::allocate_near(marker, system_allocation_granularity(), 0x1000_0000)
      .unwrap();
    assert!(region.len() >= system_allocation_granularity());
  }
}
