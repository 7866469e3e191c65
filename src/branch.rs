//! Pure byte-emission of jump encodings.
//!
//! Nothing here allocates or touches memory protection — every function
//! just writes bytes at a caller-supplied offset into a caller-owned
//! buffer, keeping "compute the bytes" separate from "find somewhere to
//! put them".

use std::mem;

/// Size of an absolute indirect jump (`FF 25 <disp32>` / `FF 25 <abs32>`).
pub const SIZEOF_ABSOLUTE_JUMP: usize = 6;
/// Size of a relative near jump (`E9 <disp32>`).
pub const SIZEOF_RELATIVE_JUMP: usize = 5;
/// Size of a relative near `Jcc` (`0F 8x <disp32>`).
pub const SIZEOF_RELATIVE_JCC: usize = 6;
/// Size of a short relative jump (`EB <disp8>`).
pub const SIZEOF_SHORT_JUMP: usize = 2;
/// The largest signed displacement a relative near branch can encode.
pub const RANGEOF_RELATIVE_JUMP: i64 = 0x7FFF_FFFF;

#[repr(packed)]
struct AbsoluteJump {
  opcode: u8,
  modrm: u8,
  disp32: i32,
}

/// Emits `jmp [rip+disp32]` (x64) / `jmp [abs32]` (x86) at `dst[0..]`,
/// dereferencing the pointer stored at `address_of_pointer_slot`. Returns
/// [`SIZEOF_ABSOLUTE_JUMP`].
///
/// On x86 there is no RIP-relative addressing, so `disp32` carries the
/// slot's absolute address directly; on x64 it carries the signed
/// displacement from the end of this instruction to the slot.
pub fn write_absolute_jump(dst: &mut [u8], at: usize, address_of_pointer_slot: usize) -> usize {
  let disp32 = if cfg!(target_arch = "x86_64") {
    let end_of_instruction = (dst.as_ptr() as usize) + at + SIZEOF_ABSOLUTE_JUMP;
    (address_of_pointer_slot as i64).wrapping_sub(end_of_instruction as i64) as i32
  } else {
    address_of_pointer_slot as i32
  };

  let encoded = AbsoluteJump { opcode: 0xFF, modrm: 0x25, disp32 };
  let bytes: [u8; SIZEOF_ABSOLUTE_JUMP] = unsafe { mem::transmute(encoded) };
  dst[at..at + SIZEOF_ABSOLUTE_JUMP].copy_from_slice(&bytes);
  SIZEOF_ABSOLUTE_JUMP
}

#[repr(packed)]
struct RelativeJump {
  opcode: u8,
  disp32: i32,
}

/// Emits `jmp rel32` at `dst[0..]`; `source` is the address `dst` will be
/// executed from once placed (so the displacement can be computed before
/// the buffer is copied anywhere). Returns [`SIZEOF_RELATIVE_JUMP`].
pub fn write_relative_jump(dst: &mut [u8], at: usize, source: usize, target: usize) -> usize {
  let end_of_instruction = source + at + SIZEOF_RELATIVE_JUMP;
  let disp32 = (target as i64).wrapping_sub(end_of_instruction as i64) as i32;
  let encoded = RelativeJump { opcode: 0xE9, disp32 };
  let bytes: [u8; SIZEOF_RELATIVE_JUMP] = unsafe { mem::transmute(encoded) };
  dst[at..at + SIZEOF_RELATIVE_JUMP].copy_from_slice(&bytes);
  SIZEOF_RELATIVE_JUMP
}

/// Size of a relative near `CALL` (`E8 <disp32>`).
pub const SIZEOF_RELATIVE_CALL: usize = 5;

#[repr(packed)]
struct RelativeCall {
  opcode: u8,
  disp32: i32,
}

/// Emits `call rel32` at `dst[0..]`. Used by the trampoline builder to
/// rewrite a relative `CALL` found in the prologue so it still reaches
/// its original target from the relocated position. Returns
/// [`SIZEOF_RELATIVE_CALL`].
pub fn write_relative_call(dst: &mut [u8], at: usize, source: usize, target: usize) -> usize {
  let end_of_instruction = source + at + SIZEOF_RELATIVE_CALL;
  let disp32 = (target as i64).wrapping_sub(end_of_instruction as i64) as i32;
  let encoded = RelativeCall { opcode: 0xE8, disp32 };
  let bytes: [u8; SIZEOF_RELATIVE_CALL] = unsafe { mem::transmute(encoded) };
  dst[at..at + SIZEOF_RELATIVE_CALL].copy_from_slice(&bytes);
  SIZEOF_RELATIVE_CALL
}

#[repr(packed)]
struct RelativeJcc {
  opcode0: u8,
  opcode1: u8,
  disp32: i32,
}

/// Emits a near conditional jump (`0F 8x disp32`) for the given condition
/// nibble. Returns [`SIZEOF_RELATIVE_JCC`].
pub fn write_relative_jcc(
  dst: &mut [u8],
  at: usize,
  source: usize,
  target: usize,
  condition: u8,
) -> usize {
  let end_of_instruction = source + at + SIZEOF_RELATIVE_JCC;
  let disp32 = (target as i64).wrapping_sub(end_of_instruction as i64) as i32;
  let encoded = RelativeJcc { opcode0: 0x0F, opcode1: 0x80 | (condition & 0x0F), disp32 };
  let bytes: [u8; SIZEOF_RELATIVE_JCC] = unsafe { mem::transmute(encoded) };
  dst[at..at + SIZEOF_RELATIVE_JCC].copy_from_slice(&bytes);
  SIZEOF_RELATIVE_JCC
}

#[repr(packed)]
struct ShortJump {
  opcode: u8,
  disp8: i8,
}

/// Emits `jmp rel8` at `dst[0..]`. Returns [`SIZEOF_SHORT_JUMP`]. Callers
/// must ensure the displacement fits in `i8`; this is used exclusively by
/// the fixed-shape `JCXZ`/`LOOP*` expansion thunk, where the displacement
/// is always a small, statically-known constant.
pub fn write_short_jump(dst: &mut [u8], at: usize, disp8: i8) -> usize {
  let encoded = ShortJump { opcode: 0xEB, disp8 };
  let bytes: [u8; SIZEOF_SHORT_JUMP] = unsafe { mem::transmute(encoded) };
  dst[at..at + SIZEOF_SHORT_JUMP].copy_from_slice(&bytes);
  SIZEOF_SHORT_JUMP
}

/// Total size of the [`write_jcxz_loop_thunk`] expansion.
pub const SIZEOF_JCXZ_LOOP_THUNK: usize = 2 + SIZEOF_SHORT_JUMP + SIZEOF_RELATIVE_JUMP;

/// `JCXZ`/`LOOP*` only encode an 8-bit displacement, far too short to
/// reach a trampoline's original target once relocated. Expands them
/// into an equivalent three-instruction sequence that falls through on
/// "don't branch" and reaches an arbitrary `target` on "branch":
///
/// ```text
/// <opcode> rel8=2      ; branch over the next short jump
/// jmp rel8=5           ; (not taken) skip the near jump below
/// jmp rel32 target     ; (taken) reach the original target
/// ```
///
/// `opcode` is the original instruction's first byte (`0xE0`/`0xE1`/`0xE2`
/// for `LOOPNE`/`LOOPE`/`LOOP`, `0xE3` for `JCXZ`/`JECXZ`/`JRCXZ`).
/// Returns [`SIZEOF_JCXZ_LOOP_THUNK`].
pub fn write_jcxz_loop_thunk(
  dst: &mut [u8],
  at: usize,
  source: usize,
  target: usize,
  opcode: u8,
) -> usize {
  dst[at] = opcode;
  dst[at + 1] = 2;
  write_short_jump(dst, at + 2, 5);
  write_relative_jump(dst, at + 2 + SIZEOF_SHORT_JUMP, source, target);
  SIZEOF_JCXZ_LOOP_THUNK
}

/// Returns whether a displacement can be represented as a relative near
/// branch's `disp32` (i.e. within `+/-2GiB`).
pub fn is_within_range(displacement: i64) -> bool {
  (-RANGEOF_RELATIVE_JUMP..=RANGEOF_RELATIVE_JUMP).contains(&displacement)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn relative_jump_round_trips_displacement() {
    let mut buf = [0u8; SIZEOF_RELATIVE_JUMP];
    write_relative_jump(&mut buf, 0, 0x1000, 0x2000);
    assert_eq!(buf[0], 0xE9);
    let disp = i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
    assert_eq!(disp, 0x2000 - (0x1000 + SIZEOF_RELATIVE_JUMP as i64) as i32);
  }

  #[test]
  fn absolute_jump_has_fixed_opcode() {
    let mut buf = [0u8; SIZEOF_ABSOLUTE_JUMP];
    write_absolute_jump(&mut buf, 0, 0x4000);
    assert_eq!(&buf[0..2], &[0xFF, 0x25]);
  }

  #[test]
  fn short_jump_encodes_rel8() {
    let mut buf = [0u8; SIZEOF_SHORT_JUMP];
    write_short_jump(&mut buf, 0, 5);
    assert_eq!(buf, [0xEB, 5]);
  }

  #[test]
  fn jcxz_thunk_preserves_the_original_opcode_and_falls_through_by_default() {
    let mut buf = [0u8; SIZEOF_JCXZ_LOOP_THUNK];
    write_jcxz_loop_thunk(&mut buf, 0, 0x1000, 0x9000, 0xE3);
    assert_eq!(buf[0], 0xE3);
    assert_eq!(buf[1], 2);
    assert_eq!(buf[2], 0xEB);
    assert_eq!(buf[3], 5);
    assert_eq!(buf[4], 0xE9);
  }

  #[test]
  fn relative_call_uses_e8_opcode() {
    let mut buf = [0u8; SIZEOF_RELATIVE_CALL];
    write_relative_call(&mut buf, 0, 0x1000, 0x2000);
    assert_eq!(buf[0], 0xE8);
  }
}
