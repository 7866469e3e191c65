//! Process-wide collection of trampoline regions.
//!
//! A `Vec` of mapped regions kept sorted by base address, searched for
//! one with a chunk reachable from a preferred address, grown on miss —
//! guarded by a single lazily-initialized mutex.

use crate::branch::RANGEOF_RELATIVE_JUMP;
use crate::error::{Error, Result};
use crate::platform;
use crate::reach::ReachWindow;
use crate::trampoline::chunk::TrampolineChunk;
use crate::trampoline::region::TrampolineRegion;
use lazy_static::lazy_static;
use std::mem;
use std::sync::Mutex;

lazy_static! {
  static ref POOL: Mutex<GlobalPool> = Mutex::new(GlobalPool::new());
}

/// Runs `f` with exclusive access to the process-wide pool.
///
/// Nothing external serializes access to trampoline memory in this
/// crate, so it owns a mutex of its own rather than assuming a caller
/// already holds one (see the concurrency notes in the crate's design
/// documentation).
pub fn with_pool<T>(f: impl FnOnce(&mut GlobalPool) -> Result<T>) -> Result<T> {
  let mut pool = POOL.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
  f(&mut pool)
}

/// Ordered collection of [`TrampolineRegion`]s, kept sorted by base
/// address so proximity search can short-circuit once it passes `hi`.
pub struct GlobalPool {
  regions: Vec<TrampolineRegion>,
  chunks_per_region: usize,
}

impl GlobalPool {
  fn new() -> Self {
    let chunks_per_region =
      (platform::system_allocation_granularity() / mem::size_of::<TrampolineChunk>()).max(2);
    GlobalPool { regions: Vec::new(), chunks_per_region }
  }

  /// Finds an unused chunk reachable from every address in `window`,
  /// allocating a new region near `preferred_address` if none exists.
  /// Returns `(region_index, chunk_index)`.
  pub fn find_or_allocate_chunk(
    &mut self,
    preferred_address: usize,
    window: ReachWindow,
  ) -> Result<(usize, usize)> {
    if let Some(found) = self.find_chunk(window) {
      return Ok(found);
    }
    let region_index = self.allocate_region(preferred_address, window)?;
    let chunk_index = self.regions[region_index]
      .find_unused_chunk()
      .expect("freshly allocated region has unused chunks");
    self.regions[region_index].claim_chunk(chunk_index);
    Ok((region_index, chunk_index))
  }

  /// Scans existing regions for one with a free chunk reachable from
  /// `window`, claiming the first one found.
  fn find_chunk(&mut self, window: ReachWindow) -> Option<(usize, usize)> {
    for (region_index, region) in self.regions.iter_mut().enumerate() {
      if !region_in_range(region, window) {
        continue;
      }
      if let Some(chunk_index) = region.find_unused_chunk() {
        region.claim_chunk(chunk_index);
        return Some((region_index, chunk_index));
      }
    }
    None
  }

  /// Reserves and inserts a new region near `preferred_address`, reachable
  /// from `window`. The maximum distance passed down is the tighter of
  /// the window bounds and the platform's reachable addressing range.
  fn allocate_region(&mut self, preferred_address: usize, window: ReachWindow) -> Result<usize> {
    let max_distance = RANGEOF_RELATIVE_JUMP as u64;
    let region =
      TrampolineRegion::allocate(preferred_address, self.chunks_per_region, max_distance)?;

    if !region_in_range(&region, window) {
      return Err(Error::OutOfRange);
    }

    let insert_at =
      self.regions.partition_point(|existing| existing.base_address() < region.base_address());
    self.regions.insert(insert_at, region);
    Ok(insert_at)
  }

  pub fn region(&self, index: usize) -> &TrampolineRegion {
    &self.regions[index]
  }

  pub fn region_mut(&mut self, index: usize) -> &mut TrampolineRegion {
    &mut self.regions[index]
  }

  /// Locates the region and chunk owning `code_address`, by binary
  /// search over the sorted region bases.
  pub fn locate(&self, code_address: usize) -> Result<(usize, usize)> {
    let region_index = self
      .regions
      .partition_point(|region| region.base_address() <= code_address)
      .checked_sub(1)
      .ok_or(Error::InvalidOperation)?;
    let region = &self.regions[region_index];
    let chunk_index = region.chunk_index_of(code_address)?;
    Ok((region_index, chunk_index))
  }

  /// Releases `chunk_index` in `region_index`, and removes (unmaps) the
  /// region entirely if it has no more used chunks.
  pub fn release_chunk(&mut self, region_index: usize, chunk_index: usize) -> Result<()> {
    let region = &mut self.regions[region_index];
    region.release_chunk(chunk_index);
    if region.is_entirely_unused() {
      self.regions.remove(region_index);
    }
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.regions.len()
  }

  pub fn is_empty(&self) -> bool {
    self.regions.is_empty()
  }
}

/// Whether every chunk in `region` (excluding the reserved header slot)
/// is within [`RANGEOF_RELATIVE_JUMP`] of both bounds of `window`. See
/// the reachability re-derivation in the crate's design documentation:
/// no extra chunk-size fudge term, computed from the region's own base
/// and extent.
fn region_in_range(region: &TrampolineRegion, window: ReachWindow) -> bool {
  let base = region.base_address() as i64;
  let end = (region.base_address() + region.size()) as i64;
  within_reach(base, window) && within_reach(end, window)
}

fn within_reach(address: i64, window: ReachWindow) -> bool {
  if window.is_unconstrained() {
    return true;
  }
  (address - window.lowest as i64).unsigned_abs() <= RANGEOF_RELATIVE_JUMP as u64
    && (address - window.highest as i64).unsigned_abs() <= RANGEOF_RELATIVE_JUMP as u64
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn find_or_allocate_grows_the_pool_from_empty() {
    let mut pool = GlobalPool::new();
    let window = ReachWindow::unconstrained();
    let (region_index, chunk_index) = pool.find_or_allocate_chunk(0x1000, window).unwrap();
    assert_eq!(region_index, 0);
    assert!(pool.region(region_index).chunk(chunk_index).is_used);
  }

  #[test]
  fn second_allocation_reuses_the_same_region_when_in_range() {
    let mut pool = GlobalPool::new();
    let window = ReachWindow::unconstrained();
    let (first_region, _) = pool.find_or_allocate_chunk(0x1000, window).unwrap();
    let (second_region, second_chunk) = pool.find_or_allocate_chunk(0x1000, window).unwrap();
    assert_eq!(first_region, second_region);
    assert_ne!(second_chunk, 0);
  }

  #[test]
  fn releasing_the_last_chunk_removes_the_region() {
    let mut pool = GlobalPool::new();
    let window = ReachWindow::unconstrained();
    let (region_index, chunk_index) = pool.find_or_allocate_chunk(0x1000, window).unwrap();
    pool.release_chunk(region_index, chunk_index).unwrap();
    assert!(pool.is_empty());
  }
}
