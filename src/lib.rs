//! A runtime x86/x86-64 trampoline engine.
//!
//! ## Intro
//!
//! This crate prepares trampolines for inline function hooking: given a
//! target function's address and a callback address, it relocates enough
//! of the target's prologue into executable memory that the target can
//! still be called through the trampoline after its own prologue has been
//! overwritten with a jump to the callback. Installing that jump — and
//! everything else an actual hook needs (disabling/enabling, calling
//! convention adaptation, thread freezing) — is outside this crate; it
//! only ever hands back a trampoline you can jump to.
//!
//! Handles several of the same edge cases a full detouring library does,
//! scoped to relocation:
//!
//! - Relative branches (`Jcc`, `JMP`, relative `CALL`).
//! - RIP-relative memory operands.
//! - `JCXZ`/`LOOP`-family short branches, which have no directly
//!   relocatable encoding and are expanded into an equivalent sequence.
//! - Reachability of the generated trampoline from every address the
//!   relocated code depends on (x86-64 only).
//!
//! ## Platforms
//!
//! Both `x86` and `x86-64` are supported.
//!
//! ## Flags
//!
//! [`create`] rewrites every relative-instruction class it knows how to.
//! [`create_ex`] accepts a [`CreateFlags`] bitmask to opt individual
//! classes (`CALL`, `JCXZ`, `LOOP`) out, failing with
//! [`Error::UnsupportedInstruction`] if the prologue needs one that isn't
//! permitted.

use std::sync::atomic::{AtomicBool, Ordering};

pub mod branch;
pub mod decoder;
pub mod error;
pub mod flags;
pub mod platform;
pub mod reach;
pub mod trampoline;

pub use error::{Error, Result};
pub use flags::CreateFlags;

use trampoline::builder;
use trampoline::chunk::MAX_CODE_SIZE;
use trampoline::pool;

static LOGGED_INIT: AtomicBool = AtomicBool::new(false);

fn log_init_once() {
  if !LOGGED_INIT.swap(true, Ordering::Relaxed) {
    log::trace!("trampoline engine pool initialized");
  }
}

/// An opaque handle to a prepared trampoline. Dropping this does
/// *nothing* — call [`free`] explicitly once nothing is executing inside
/// the trampoline any longer.
#[derive(Debug, Clone, Copy)]
pub struct Trampoline {
  code_address: *const (),
}

impl Trampoline {
  /// The address execution should jump (or call) into to run the
  /// relocated prologue followed by the back-jump to the original
  /// function.
  pub fn code_address(&self) -> *const () {
    self.code_address
  }
}

unsafe impl Send for Trampoline {}

/// Prepares a trampoline for `target`, relocating at least
/// `min_bytes_to_reloc` bytes of its prologue, with every rewrite class
/// enabled ([`CreateFlags::default`]).
///
/// # Safety
///
/// `target` must be a readable, executable address with at least
/// `min_bytes_to_reloc` bytes of valid code, and must not be concurrently
/// modified by another thread for the duration of this call.
pub unsafe fn create(
  target: *const (),
  callback: *const (),
  min_bytes_to_reloc: usize,
) -> Result<Trampoline> {
  create_ex(target, callback, min_bytes_to_reloc, CreateFlags::default())
}

/// As [`create`], but with explicit control over which relative
/// instruction classes the builder is permitted to rewrite.
///
/// # Safety
///
/// Same preconditions as [`create`].
pub unsafe fn create_ex(
  target: *const (),
  callback: *const (),
  min_bytes_to_reloc: usize,
  flags: CreateFlags,
) -> Result<Trampoline> {
  if target.is_null() || callback.is_null() || min_bytes_to_reloc < 1 {
    return Err(Error::InvalidArgument);
  }
  log_init_once();

  let readable_bytes = platform::size_of_readable_region(target, MAX_CODE_SIZE)?;
  if readable_bytes < min_bytes_to_reloc {
    return Err(Error::InvalidOperation);
  }

  let target_address = target as usize;
  let window = reach_window_for(target, target_address, readable_bytes, min_bytes_to_reloc)?;

  let (region_index, chunk_index) =
    pool::with_pool(|pool| pool.find_or_allocate_chunk(target_address, window))?;

  let result = pool::with_pool(|pool| {
    let region = pool.region_mut(region_index);
    region.protect_writable()?;

    let chunk_address = region.chunk(chunk_index).code_address() as usize;
    let build_result = builder::build(
      region.chunk_mut(chunk_index),
      chunk_address,
      target_address,
      callback as usize,
      min_bytes_to_reloc,
      readable_bytes,
      flags,
    );

    region.protect_executable()?;
    build_result.map(|()| chunk_address)
  });

  match result {
    Ok(chunk_address) => {
      log::debug!("trampoline ready at {:#x} for target {:#x}", chunk_address, target_address);
      Ok(Trampoline { code_address: chunk_address as *const () })
    },
    Err(error) => {
      // Roll back: release the chunk we just claimed so a failed build
      // never leaks a half-initialized trampoline.
      let _ = pool::with_pool(|pool| pool.release_chunk(region_index, chunk_index));
      log::warn!("trampoline creation failed for target {:#x}: {}", target_address, error);
      Err(error)
    },
  }
}

/// Computes the raw `[lowest, highest]` absolute addresses a trampoline
/// chunk for `target` must be able to reach with a `disp32`: the extremes
/// of the prologue's relative instructions (if any), widened to include
/// `target` itself. Unconstrained (and a no-op) on `x86`.
///
/// Errors with [`Error::InvalidOperation`] if those extremes are already
/// farther apart than a single `disp32` can span, since then no chunk
/// address could ever reach both.
fn reach_window_for(
  target: *const (),
  target_address: usize,
  readable_bytes: usize,
  min_bytes_to_reloc: usize,
) -> Result<reach::ReachWindow> {
  if !cfg!(target_arch = "x86_64") {
    return Ok(reach::ReachWindow::unconstrained());
  }

  let mut decoder = decoder::Decoder::new(decoder::MachineMode::Long64);
  let prologue =
    unsafe { std::slice::from_raw_parts(target as *const u8, readable_bytes) };
  let range = reach::address_range_of_relative_instructions(
    &mut decoder,
    target_address as u64,
    prologue,
    min_bytes_to_reloc,
  )?;

  let target_address = target_address as u64;
  let (lowest, highest) = match range {
    Some((lowest, highest)) => (lowest.min(target_address), highest.max(target_address)),
    None => (target_address, target_address),
  };

  if highest - lowest > branch::RANGEOF_RELATIVE_JUMP as u64 {
    return Err(Error::InvalidOperation);
  }

  Ok(reach::ReachWindow { lowest, highest })
}

/// Releases a trampoline's chunk, and the owning region if it was the
/// region's last used chunk.
///
/// # Safety
///
/// No code may still be executing inside `trampoline`'s relocated
/// prologue, and `trampoline` must not be freed twice.
pub unsafe fn free(trampoline: Trampoline) -> Result<()> {
  pool::with_pool(|pool| {
    let (region_index, chunk_index) = pool.locate(trampoline.code_address as usize)?;
    pool.region_mut(region_index).protect_writable()?;
    let released = pool.release_chunk(region_index, chunk_index);
    log::debug!("trampoline at {:#x} released", trampoline.code_address as usize);
    released
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use matches::assert_matches;

  #[test]
  fn create_rejects_null_target() {
    let err = unsafe { create(std::ptr::null(), std::ptr::null(), 5).unwrap_err() };
    assert_matches!(err, Error::InvalidArgument);
  }

  #[test]
  fn create_rejects_zero_min_bytes() {
    #[inline(never)]
    extern "C" fn target() -> i32 {
      5
    }
    let err =
      unsafe { create(target as *const (), target as *const (), 0).unwrap_err() };
    assert_matches!(err, Error::InvalidArgument);
  }

  #[test]
  fn create_and_free_round_trip_on_a_real_function() {
    #[inline(never)]
    extern "C" fn target(x: i32) -> i32 {
      std::hint::black_box(x) + 1
    }
    #[inline(never)]
    extern "C" fn callback(x: i32) -> i32 {
      x
    }

    let trampoline =
      unsafe { create(target as *const (), callback as *const (), 5).unwrap() };
    assert!(!trampoline.code_address().is_null());
    unsafe { free(trampoline).unwrap() };
  }

  #[test]
  fn freeing_twice_fails_on_the_second_call() {
    #[inline(never)]
    extern "C" fn target(x: i32) -> i32 {
      std::hint::black_box(x) * 2
    }
    #[inline(never)]
    extern "C" fn callback(x: i32) -> i32 {
      x
    }

    let trampoline =
      unsafe { create(target as *const (), callback as *const (), 5).unwrap() };
    unsafe { free(trampoline).unwrap() };
    assert!(unsafe { free(trampoline) }.is_err());
  }
}
