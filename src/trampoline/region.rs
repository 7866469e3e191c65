//! A fixed-address memory mapping subdivided into
//! [`TrampolineChunk`]s, with the first chunk's storage overlaid by a
//! bookkeeping header.
//!
//! Rust has no safe union of non-`Copy` types, so this is one mapped
//! allocation addressed by raw pointer casts: chunk 0's storage is
//! reinterpreted as a [`RegionHeader`] and permanently excluded from
//! allocation.

use crate::error::{Error, Result};
use crate::platform::MappedRegion;
use crate::trampoline::chunk::TrampolineChunk;
use std::mem;

/// Marks a mapping as belonging to this engine, written once at
/// allocation time. Not load-bearing for correctness (nothing else reads
/// a region's signature back), but gives a debugger something
/// recognizable to search for.
pub const REGION_SIGNATURE: u32 = 0x5A59_5258; // "ZYRX"

/// The bookkeeping block overlaid onto chunk 0's storage.
#[repr(C)]
pub struct RegionHeader {
  pub signature: u32,
  pub number_of_unused_chunks: usize,
}

/// A mapped, fixed-size slab of [`TrampolineChunk`]s. Chunk index 0 is
/// reserved for the [`RegionHeader`]; usable chunks are indices
/// `1..chunks_per_region`.
pub struct TrampolineRegion {
  mapping: MappedRegion,
  chunks_per_region: usize,
}

impl TrampolineRegion {
  /// Reserves and commits a new region as close as possible to
  /// `preferred_address`, sized for `chunks_per_region` chunks (including
  /// the reserved header slot), and initializes its header.
  pub fn allocate(
    preferred_address: usize,
    chunks_per_region: usize,
    max_distance: u64,
  ) -> Result<Self> {
    let size = chunks_per_region * mem::size_of::<TrampolineChunk>();
    let mapping = MappedRegion::allocate_near(preferred_address, size, max_distance)?;
    let region = TrampolineRegion { mapping, chunks_per_region };

    unsafe {
      region.header_ptr().write(RegionHeader {
        signature: REGION_SIGNATURE,
        number_of_unused_chunks: chunks_per_region - 1,
      });
      for index in 1..chunks_per_region {
        region.chunk_ptr(index).write(TrampolineChunk::empty());
      }
    }

    Ok(region)
  }

  pub fn base_address(&self) -> usize {
    self.mapping.address()
  }

  pub fn size(&self) -> usize {
    self.mapping.len()
  }

  pub fn chunks_per_region(&self) -> usize {
    self.chunks_per_region
  }

  fn header_ptr(&self) -> *mut RegionHeader {
    self.mapping.address() as *mut RegionHeader
  }

  fn chunk_ptr(&self, index: usize) -> *mut TrampolineChunk {
    debug_assert!(index >= 1 && index < self.chunks_per_region);
    (self.mapping.address() as *mut TrampolineChunk).wrapping_add(index)
  }

  pub fn header(&self) -> &RegionHeader {
    unsafe { &*self.header_ptr() }
  }

  fn header_mut(&mut self) -> &mut RegionHeader {
    unsafe { &mut *self.header_ptr() }
  }

  pub fn chunk(&self, index: usize) -> &TrampolineChunk {
    unsafe { &*self.chunk_ptr(index) }
  }

  pub fn chunk_mut(&mut self, index: usize) -> &mut TrampolineChunk {
    unsafe { &mut *self.chunk_ptr(index) }
  }

  /// Index (`1..chunks_per_region`) and address of the address of this
  /// region's first unused chunk, if any, by linear scan. Regions are
  /// kept small enough (a handful of chunks per page) that this is
  /// cheaper than a free list.
  pub fn find_unused_chunk(&self) -> Option<usize> {
    (1..self.chunks_per_region).find(|&index| !self.chunk(index).is_used)
  }

  /// Marks `index` used and decrements the header's unused counter.
  pub fn claim_chunk(&mut self, index: usize) {
    self.chunk_mut(index).is_used = true;
    self.header_mut().number_of_unused_chunks -= 1;
  }

  /// Resets `index` to empty and increments the header's unused counter.
  /// Returns the region's resulting unused-chunk count.
  pub fn release_chunk(&mut self, index: usize) -> usize {
    self.chunk_mut(index).reset();
    self.header_mut().number_of_unused_chunks += 1;
    self.header().number_of_unused_chunks
  }

  /// Whether every usable chunk in this region is currently unused —
  /// i.e. the region itself can be released back to the platform.
  pub fn is_entirely_unused(&self) -> bool {
    self.header().number_of_unused_chunks == self.chunks_per_region - 1
  }

  /// Recovers the chunk index addressed by `code_address`, given that it
  /// points somewhere inside this region's mapping.
  pub fn chunk_index_of(&self, code_address: usize) -> Result<usize> {
    let base = self.mapping.address();
    if code_address < base || code_address >= base + self.mapping.len() {
      return Err(Error::InvalidArgument);
    }
    let offset = code_address - base;
    Ok(offset / mem::size_of::<TrampolineChunk>())
  }

  pub fn protect_executable(&self) -> Result<()> {
    self.mapping.protect_executable()
  }

  pub fn protect_writable(&self) -> Result<()> {
    self.mapping.protect_writable()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fresh_region_has_all_non_header_chunks_free() {
    let region = TrampolineRegion::allocate(0, 4, 0x1000_0000).unwrap();
    assert_eq!(region.header().number_of_unused_chunks, 3);
    assert!(region.is_entirely_unused());
    assert_eq!(region.find_unused_chunk(), Some(1));
  }

  #[test]
  fn claim_and_release_round_trip() {
    let mut region = TrampolineRegion::allocate(0, 4, 0x1000_0000).unwrap();
    region.claim_chunk(1);
    assert!(region.chunk(1).is_used);
    assert_eq!(region.header().number_of_unused_chunks, 2);
    region.release_chunk(1);
    assert!(!region.chunk(1).is_used);
    assert!(region.is_entirely_unused());
  }

  #[test]
  fn chunk_index_of_recovers_the_right_slot() {
    let mut region = TrampolineRegion::allocate(0, 4, 0x1000_0000).unwrap();
    region.claim_chunk(2);
    let address = region.chunk(2).code_address() as usize;
    assert_eq!(region.chunk_index_of(address).unwrap(), 2);
  }
}
