//! Reachability window for a prologue's relative instructions.
//!
//! On x64, every relative instruction relocated into a trampoline chunk
//! must still be able to reach its original target with a `disp32`. This
//! module finds the raw `[lowest, highest]` absolute target addresses
//! referenced by a prologue's relative instructions — not yet widened by
//! the reach range. The caller combines that with the trampoline's own
//! target address and applies `+/-RANGEOF_RELATIVE_JUMP` exactly once,
//! at the point a candidate chunk address is tested for reachability
//! (see `trampoline::pool`'s `within_reach`).

use crate::decoder::{Decoder, MachineMode};
use crate::error::Result;

/// The inclusive `[lowest, highest]` range of raw absolute addresses a
/// trampoline chunk must reach: either the extremes of the relative
/// instructions found in a prologue, or (if none were found) just the
/// target address itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReachWindow {
  pub lowest: u64,
  pub highest: u64,
}

impl ReachWindow {
  /// No constraint at all: used on architectures without the x64
  /// addressing limitation, where every address is already reachable.
  pub fn unconstrained() -> Self {
    ReachWindow { lowest: 0, highest: u64::MAX }
  }

  pub fn is_unconstrained(&self) -> bool {
    *self == Self::unconstrained()
  }
}

/// Scans the prologue bytes at `target` and returns the minimum and
/// maximum absolute target address referenced by any relative
/// instruction found within `min_bytes_to_reloc`, or `None` if none was.
///
/// Only meaningful on x64: on x86 every address is already within
/// 32-bit reach of every other, so callers never need this on that
/// architecture.
pub fn address_range_of_relative_instructions(
  decoder: &mut Decoder,
  target: u64,
  prologue: &[u8],
  min_bytes_to_reloc: usize,
) -> Result<Option<(u64, u64)>> {
  let mut range: Option<(u64, u64)> = None;
  let mut offset = 0usize;

  while offset < min_bytes_to_reloc && offset < prologue.len() {
    let instruction = decoder.decode_at(&prologue[offset..])?;
    if instruction.is_relative() {
      let absolute_target = instruction.compute_absolute_target(target + offset as u64)?;
      range = Some(match range {
        Some((lowest, highest)) => (lowest.min(absolute_target), highest.max(absolute_target)),
        None => (absolute_target, absolute_target),
      });
    }
    offset += instruction.length;
  }

  Ok(range)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn prologue_with_no_relative_instructions_has_no_range() {
    let mut decoder = Decoder::new(MachineMode::Long64);
    // `push rbp; mov rbp, rsp`
    let bytes = [0x55, 0x48, 0x89, 0xE5];
    let range =
      address_range_of_relative_instructions(&mut decoder, 0x1000, &bytes, bytes.len()).unwrap();
    assert_eq!(range, None);
  }

  #[test]
  fn short_jump_range_collapses_to_its_single_target() {
    let mut decoder = Decoder::new(MachineMode::Long64);
    // `EB 05` == `jmp +5` relative to address 0x1000
    let bytes = [0xEB, 0x05];
    let (lowest, highest) =
      address_range_of_relative_instructions(&mut decoder, 0x1000, &bytes, bytes.len())
        .unwrap()
        .unwrap();
    assert_eq!(lowest, highest);
    assert_eq!(lowest, 0x1000 + 2 + 5);
  }
}
