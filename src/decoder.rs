//! A thin, safe façade over the external x86/x64 instruction decoder.
//!
//! The rest of the engine only ever sees [`DecodedInstruction`] — the
//! decoder crate itself (`udis86`, via the `udis` binding) is not named
//! anywhere outside this module.

use crate::error::{Error, Result};

/// The processor mode the decoder was initialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineMode {
  Long64,
  LongCompat32,
  Legacy32,
}

/// The effective address width of a decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressWidth {
  Bits32,
  Bits64,
}

/// The mnemonic classes the trampoline builder dispatches on. Everything
/// that isn't one of these named classes falls into `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mnemonic {
  Call,
  Jcxz,
  Loop,
  JmpRel,
  JccRel,
  Other,
}

/// A decoded instruction, safe to hold onto after the decoder has moved on.
#[derive(Debug, Clone)]
pub struct DecodedInstruction {
  pub length: usize,
  pub mnemonic: Mnemonic,
  pub machine_mode: MachineMode,
  pub address_width: AddressWidth,
  pub operand_width: u8,
  /// Raw bytes of the instruction, for verbatim copies.
  pub bytes: Vec<u8>,
  /// `Some((modrm_mod, modrm_rm))` if the instruction carries a ModRM byte.
  pub modrm: Option<(u8, u8)>,
  /// The signed displacement of a ModRM memory operand, if any.
  pub displacement: Option<i64>,
  /// Byte offset of the 4-byte displacement field within the instruction,
  /// for [`Self::has_pc_relative_memory_operand`] instructions only —
  /// `rm == 5` addressing never has a SIB byte, so the displacement
  /// immediately follows the ModRM byte. Lets the builder patch a
  /// relocated RIP-relative operand in place instead of re-encoding the
  /// whole instruction.
  pub pc_relative_displacement_offset: Option<usize>,
  /// `Some((value, is_signed, is_relative))` for the first immediate, if any.
  pub immediate: Option<(i64, bool, bool)>,
  /// The primary opcode byte, used to recover a `Jcc` condition code.
  pub primary_opcode: u8,
}

impl DecodedInstruction {
  /// Whether this instruction carries a relative operand: either a
  /// ModRM memory operand with `mod == 0, rm == 5` (EIP/RIP-relative), or
  /// a relative, signed immediate.
  pub fn is_relative(&self) -> bool {
    self.has_pc_relative_memory_operand() || matches!(self.immediate, Some((_, true, true)))
  }

  pub fn has_pc_relative_memory_operand(&self) -> bool {
    matches!(self.modrm, Some((0, 5)))
  }

  pub fn is_call(&self) -> bool {
    self.mnemonic == Mnemonic::Call
  }

  pub fn is_jcxz(&self) -> bool {
    self.mnemonic == Mnemonic::Jcxz
  }

  pub fn is_loop(&self) -> bool {
    self.mnemonic == Mnemonic::Loop
  }

  pub fn is_unconditional_jump(&self) -> bool {
    self.mnemonic == Mnemonic::JmpRel
  }

  pub fn is_conditional_jump(&self) -> bool {
    self.mnemonic == Mnemonic::JccRel
  }

  /// The condition nibble of a `Jcc`, derived from the primary opcode
  /// (`0x70..0x7F` for short form, `0x0F 0x80..0x8F` for near form).
  pub fn jcc_condition(&self) -> u8 {
    self.primary_opcode & 0x0F
  }

  /// Computes the absolute target address of a relative instruction.
  ///
  /// Preconditions: [`Self::is_relative`] is `true`. Two cases, matching
  /// the external decoder's own classification:
  ///
  /// 1. PC-relative memory operand (`modrm.mod == 0, modrm.rm == 5`): the
  ///    target is `runtime_address + length + disp`, computed modulo the
  ///    instruction's address width.
  /// 2. Relative branch: the target is `runtime_address + length +
  ///    immediate`, masked to 16 bits if the machine mode is 16/32-bit and
  ///    the operand width is 16.
  pub fn compute_absolute_target(&self, runtime_address: u64) -> Result<u64> {
    if self.has_pc_relative_memory_operand() {
      let disp = self.displacement.ok_or(Error::DecodeFailed)?;
      return Ok(match self.address_width {
        AddressWidth::Bits32 => {
          ((runtime_address as u32).wrapping_add(self.length as u32).wrapping_add(disp as u32))
            as u64
        },
        AddressWidth::Bits64 => {
          (runtime_address.wrapping_add(self.length as u64)).wrapping_add(disp as u64)
        },
      });
    }

    if let Some((value, true, true)) = self.immediate {
      let mut target = (runtime_address as i64)
        .wrapping_add(self.length as i64)
        .wrapping_add(value) as u64;
      match self.machine_mode {
        MachineMode::Long64 => {},
        MachineMode::LongCompat32 | MachineMode::Legacy32 => {
          if self.operand_width == 16 {
            target &= 0xFFFF;
          }
        },
      }
      return Ok(target);
    }

    // Callers never invoke this for non-relative instructions; reaching
    // here signals a decoder/caller mismatch rather than a recoverable
    // input error.
    unreachable!("compute_absolute_target called on a non-relative instruction")
  }
}

/// A decoder instance bound to one machine mode, wrapping the external
/// disassembler's initialization and instruction-stream state.
pub struct Decoder {
  inner: udis::ud,
  machine_mode: MachineMode,
}

impl Decoder {
  /// Creates a decoder for the given machine mode.
  pub fn new(machine_mode: MachineMode) -> Self {
    let mode_bits = match machine_mode {
      MachineMode::Long64 => 64,
      MachineMode::LongCompat32 | MachineMode::Legacy32 => 32,
    };
    unsafe {
      let mut ud: udis::ud = std::mem::zeroed();
      udis::ud_init(&mut ud);
      udis::ud_set_mode(&mut ud, mode_bits);
      Decoder { inner: ud, machine_mode }
    }
  }

  /// Decodes one instruction at the start of `buffer`.
  ///
  /// Fails with [`Error::DecodeFailed`] if `buffer` does not begin with a
  /// valid instruction (including a truncated prefix).
  pub fn decode_at(&mut self, buffer: &[u8]) -> Result<DecodedInstruction> {
    unsafe {
      udis::ud_set_input_buffer(&mut self.inner, buffer.as_ptr(), buffer.len());
    }

    let length = unsafe { udis::ud_disassemble(&mut self.inner) as usize };
    if length == 0 || length > buffer.len() {
      return Err(Error::DecodeFailed);
    }

    let mnemonic_code = unsafe { udis::ud_insn_mnemonic(&self.inner) };
    let operands = unsafe { self.inner.operand };

    let modrm = extract_modrm(&buffer[..length]);
    let pc_relative_displacement_offset =
      if matches!(modrm, Some((0, 5))) { modrm_offset(&buffer[..length]).map(|i| i + 1) } else { None };
    let displacement = operands
      .iter()
      .find(|op| op.otype == udis::ud_type::UD_OP_MEM)
      .map(|op| unsafe { op.lval.sdword as i64 });
    let immediate = operands.iter().find(|op| op.otype == udis::ud_type::UD_OP_JIMM).map(|op| {
      let value = unsafe {
        match op.size {
          8 => op.lval.sbyte as i64,
          16 => op.lval.sword as i64,
          32 => op.lval.sdword as i64,
          _ => op.lval.sqword,
        }
      };
      (value, true, true)
    });

    Ok(DecodedInstruction {
      length,
      mnemonic: classify(mnemonic_code),
      machine_mode: self.machine_mode,
      address_width: address_width_of(&self.machine_mode, &buffer[..length]),
      operand_width: unsafe { self.inner.opr_mode },
      bytes: buffer[..length].to_vec(),
      modrm,
      pc_relative_displacement_offset,
      displacement,
      immediate,
      primary_opcode: primary_opcode_of(&buffer[..length]),
    })
  }
}

/// Extracts `(mod, rm)` from the instruction's ModRM byte, if present.
/// Walks past legacy prefixes and a mandatory two-byte opcode escape; good
/// enough for the prologue shapes the trampoline builder ever sees
/// (the external decoder already validated the encoding is well-formed).
fn extract_modrm(bytes: &[u8]) -> Option<(u8, u8)> {
  let modrm = bytes[modrm_offset(bytes)?];
  Some((modrm >> 6, modrm & 0x7))
}

/// Byte offset of the ModRM byte within the instruction, walking past
/// legacy prefixes, an optional REX prefix, and the one- or two-byte
/// opcode.
fn modrm_offset(bytes: &[u8]) -> Option<usize> {
  let mut i = 0;
  while i < bytes.len() && is_legacy_prefix(bytes[i]) {
    i += 1;
  }
  if i < bytes.len() && (0x40..=0x4F).contains(&bytes[i]) {
    i += 1; // REX prefix (x64 only)
  }
  if i >= bytes.len() {
    return None;
  }
  if bytes[i] == 0x0F {
    i += 1;
  }
  if i >= bytes.len() {
    return None;
  }
  i += 1; // primary opcode byte
  if i >= bytes.len() {
    return None;
  }
  Some(i)
}

fn is_legacy_prefix(byte: u8) -> bool {
  matches!(byte, 0xF0 | 0xF2 | 0xF3 | 0x2E | 0x36 | 0x3E | 0x26 | 0x64 | 0x65 | 0x66 | 0x67)
}

fn primary_opcode_of(bytes: &[u8]) -> u8 {
  bytes.iter().copied().find(|&b| !is_legacy_prefix(b) && !(0x40..=0x4F).contains(&b)).unwrap_or(0)
}

fn address_width_of(mode: &MachineMode, bytes: &[u8]) -> AddressWidth {
  let has_addr_override = bytes.iter().take_while(|&&b| is_legacy_prefix(b)).any(|&b| b == 0x67);
  match mode {
    MachineMode::Long64 => {
      if has_addr_override {
        AddressWidth::Bits32
      } else {
        AddressWidth::Bits64
      }
    },
    MachineMode::LongCompat32 | MachineMode::Legacy32 => AddressWidth::Bits32,
  }
}

fn classify(mnemonic: udis::ud_mnemonic_code) -> Mnemonic {
  use udis::ud_mnemonic_code::*;
  match mnemonic {
    UD_Icall => Mnemonic::Call,
    UD_Ijcxz | UD_Ijecxz => Mnemonic::Jcxz,
    UD_Iloop | UD_Iloope | UD_Iloopne => Mnemonic::Loop,
    UD_Ijmp => Mnemonic::JmpRel,
    m if is_conditional_jump(m) => Mnemonic::JccRel,
    _ => Mnemonic::Other,
  }
}

fn is_conditional_jump(mnemonic: udis::ud_mnemonic_code) -> bool {
  use udis::ud_mnemonic_code::*;
  matches!(
    mnemonic,
    UD_Ijo
      | UD_Ijno
      | UD_Ijb
      | UD_Ijae
      | UD_Ijz
      | UD_Ijnz
      | UD_Ijbe
      | UD_Ija
      | UD_Ijs
      | UD_Ijns
      | UD_Ijp
      | UD_Ijnp
      | UD_Ijl
      | UD_Ijge
      | UD_Ijle
      | UD_Ijg
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn classifies_relative_mnemonics() {
    // `E2 FE` == `loop $`
    let mut decoder = Decoder::new(MachineMode::Long64);
    let instruction = decoder.decode_at(&[0xE2, 0xFE]).unwrap();
    assert!(instruction.is_loop());
    assert!(instruction.is_relative());
  }

  #[test]
  fn short_jump_is_relative() {
    let mut decoder = Decoder::new(MachineMode::Long64);
    let instruction = decoder.decode_at(&[0xEB, 0x05]).unwrap();
    assert!(instruction.is_unconditional_jump());
    assert!(instruction.is_relative());
    assert_eq!(instruction.length, 2);
  }

  #[test]
  fn non_relative_instruction_is_copied_verbatim() {
    // `55` == `push rbp`
    let mut decoder = Decoder::new(MachineMode::Long64);
    let instruction = decoder.decode_at(&[0x55]).unwrap();
    assert!(!instruction.is_relative());
    assert_eq!(instruction.length, 1);
  }

  #[test]
  fn truncated_prefix_fails_to_decode() {
    let mut decoder = Decoder::new(MachineMode::Long64);
    assert!(decoder.decode_at(&[]).is_err());
  }
}
