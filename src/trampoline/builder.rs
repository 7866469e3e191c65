//! Fills a claimed chunk with a relocated copy of a target's prologue.
//!
//! Walks the prologue instruction by instruction, copying
//! non-relative instructions verbatim and rewriting every relative one
//! (`CALL`/`JCXZ`/`LOOP`/`Jcc`/`JMP`/PC-relative `MOV`/`LEA`) so it still
//! reaches its original target once relocated.

#[cfg(not(target_arch = "x86_64"))]
use crate::branch::SIZEOF_RELATIVE_CALL;
use crate::branch::{self, SIZEOF_ABSOLUTE_JUMP, SIZEOF_JCXZ_LOOP_THUNK, SIZEOF_RELATIVE_JCC};
use crate::decoder::{Decoder, MachineMode};
use crate::error::{Error, Result};
use crate::flags::CreateFlags;
use crate::trampoline::chunk::{TranslationItem, TrampolineChunk};

/// Builds the relocated prologue, translation map and back-jump into
/// `chunk`, whose code buffer has already been placed at `chunk_address`
/// (the region has mapped it but not yet protected it executable).
///
/// `target` is the original function's address; `callback` is only used
/// on x64, where rewritten `CALL`s bounce through the chunk's indirect
/// `callback_jump` slot so a `CALL`ed function's own return address
/// still lands inside the relocated code. `min_bytes_to_reloc` bounds how
/// many original bytes get consumed; `readable_bytes` bounds how far the
/// decoder is allowed to look for the tail of the last instruction.
pub fn build(
  chunk: &mut TrampolineChunk,
  chunk_address: usize,
  target: usize,
  #[cfg_attr(not(target_arch = "x86_64"), allow(unused_variables))] callback: usize,
  min_bytes_to_reloc: usize,
  readable_bytes: usize,
  flags: CreateFlags,
) -> Result<()> {
  chunk.is_used = true;

  #[cfg(target_arch = "x86_64")]
  {
    chunk.callback_address = callback;
    branch::write_absolute_jump(
      &mut chunk.callback_jump,
      0,
      &chunk.callback_address as *const usize as usize,
    );
  }

  let mut decoder = Decoder::new(if cfg!(target_arch = "x86_64") {
    MachineMode::Long64
  } else {
    MachineMode::Legacy32
  });

  let mut bytes_read = 0usize;
  let mut bytes_written = 0usize;

  while bytes_read < min_bytes_to_reloc {
    if bytes_read >= readable_bytes {
      return Err(Error::InvalidOperation);
    }

    let original = unsafe {
      std::slice::from_raw_parts((target + bytes_read) as *const u8, readable_bytes - bytes_read)
    };
    let instruction = decoder.decode_at(original)?;
    let runtime_address = (target + bytes_read) as u64;

    let written = if instruction.is_relative() {
      rewrite_relative(
        chunk,
        bytes_written,
        chunk_address,
        runtime_address,
        &instruction,
        flags,
      )?
    } else {
      chunk.code_buffer[bytes_written..bytes_written + instruction.length]
        .copy_from_slice(&instruction.bytes);
      instruction.length
    };

    chunk.translation_map.push(TranslationItem {
      offset_original: bytes_read as u8,
      offset_trampoline: bytes_written as u8,
    });

    bytes_read += instruction.length;
    bytes_written += written;
  }

  chunk.backjump_address = target + bytes_read;
  branch::write_absolute_jump(
    &mut chunk.code_buffer,
    bytes_written,
    &chunk.backjump_address as *const usize as usize,
  );
  bytes_written += SIZEOF_ABSOLUTE_JUMP;

  for byte in &mut chunk.code_buffer[bytes_written..] {
    *byte = 0xCC;
  }

  chunk.code_buffer_size = bytes_written;
  chunk.original_code_size = bytes_read;
  chunk.original_code[..bytes_read].copy_from_slice(unsafe {
    std::slice::from_raw_parts(target as *const u8, bytes_read)
  });

  Ok(())
}

/// Dispatches a single relative instruction to its rewrite rule,
/// returning the number of bytes it occupies in the relocated code.
fn rewrite_relative(
  chunk: &mut TrampolineChunk,
  at: usize,
  chunk_address: usize,
  runtime_address: u64,
  instruction: &crate::decoder::DecodedInstruction,
  flags: CreateFlags,
) -> Result<usize> {
  if instruction.has_pc_relative_memory_operand() {
    // MOV/LEA/etc. addressing fixed data via RIP-relative displacement:
    // copy the instruction verbatim and patch just the 4-byte
    // displacement so it still points at the same absolute address.
    let absolute_operand_address = instruction.compute_absolute_target(runtime_address)?;
    let offset = instruction
      .pc_relative_displacement_offset
      .expect("pc-relative memory operand always carries a displacement offset");
    let mut bytes = instruction.bytes.clone();
    let new_disp = (absolute_operand_address as i64)
      .wrapping_sub((chunk_address + at + instruction.length) as i64);
    if !branch::is_within_range(new_disp) {
      return Err(Error::OutOfRange);
    }
    bytes[offset..offset + 4].copy_from_slice(&(new_disp as i32).to_le_bytes());
    chunk.code_buffer[at..at + instruction.length].copy_from_slice(&bytes);
    return Ok(instruction.length);
  }

  if instruction.is_call() {
    if !flags.contains(CreateFlags::REWRITE_CALL) {
      return Err(Error::UnsupportedInstruction);
    }
    let target = instruction.compute_absolute_target(runtime_address)?;
    #[cfg(target_arch = "x86_64")]
    {
      // Route through the chunk's indirect callback slot so the callee's
      // return address still resolves inside the relocated code, even if
      // `target` is out of `disp32` range from this chunk.
      let _ = target;
      let slot_address = &chunk.callback_jump as *const _ as usize;
      branch::write_absolute_jump(&mut chunk.code_buffer, at, slot_address);
      return Ok(SIZEOF_ABSOLUTE_JUMP);
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
      branch::write_relative_call(&mut chunk.code_buffer, at, chunk_address, target as usize);
      return Ok(SIZEOF_RELATIVE_CALL);
    }
  }

  if instruction.is_jcxz() {
    if !flags.contains(CreateFlags::REWRITE_JCXZ) {
      return Err(Error::UnsupportedInstruction);
    }
    let target = instruction.compute_absolute_target(runtime_address)?;
    branch::write_jcxz_loop_thunk(
      &mut chunk.code_buffer,
      at,
      chunk_address,
      target as usize,
      instruction.bytes[0],
    );
    return Ok(SIZEOF_JCXZ_LOOP_THUNK);
  }

  if instruction.is_loop() {
    if !flags.contains(CreateFlags::REWRITE_LOOP) {
      return Err(Error::UnsupportedInstruction);
    }
    let target = instruction.compute_absolute_target(runtime_address)?;
    branch::write_jcxz_loop_thunk(
      &mut chunk.code_buffer,
      at,
      chunk_address,
      target as usize,
      instruction.bytes[0],
    );
    return Ok(SIZEOF_JCXZ_LOOP_THUNK);
  }

  if instruction.is_conditional_jump() {
    let target = instruction.compute_absolute_target(runtime_address)?;
    branch::write_relative_jcc(
      &mut chunk.code_buffer,
      at,
      chunk_address,
      target as usize,
      instruction.jcc_condition(),
    );
    return Ok(SIZEOF_RELATIVE_JCC);
  }

  if instruction.is_unconditional_jump() {
    let target = instruction.compute_absolute_target(runtime_address)?;
    return Ok(branch::write_relative_jump(
      &mut chunk.code_buffer,
      at,
      chunk_address,
      target as usize,
    ));
  }

  Err(Error::UnsupportedInstruction)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::flags::CreateFlags;

  // `90 90 90 90 90 C3` — five NOPs then RET. No relative instructions,
  // so the builder just copies verbatim and appends the back-jump.
  #[test]
  fn plain_prologue_is_copied_verbatim_and_backjumps_home() {
    let target_bytes = [0x90u8, 0x90, 0x90, 0x90, 0x90, 0xC3];
    let target_address = target_bytes.as_ptr() as usize;

    let mut chunk = TrampolineChunk::empty();
    let chunk_address = chunk.code_buffer.as_ptr() as usize;

    build(
      &mut chunk,
      chunk_address,
      target_address,
      0,
      5,
      target_bytes.len(),
      CreateFlags::default(),
    )
    .unwrap();

    assert_eq!(&chunk.code_buffer[..5], &[0x90, 0x90, 0x90, 0x90, 0x90]);
    assert_eq!(chunk.code_buffer[5], 0xFF); // start of the absolute back-jump
    assert_eq!(chunk.original_code_size, 5);
    assert_eq!(chunk.translation_map.len(), 5);
  }

  #[test]
  fn short_loop_is_expanded_not_copied() {
    // `E2 FE` == `loop $` (branches back to itself)
    let target_bytes = [0xE2u8, 0xFE, 0x90];
    let target_address = target_bytes.as_ptr() as usize;

    let mut chunk = TrampolineChunk::empty();
    let chunk_address = chunk.code_buffer.as_ptr() as usize;

    build(
      &mut chunk,
      chunk_address,
      target_address,
      0,
      2,
      target_bytes.len(),
      CreateFlags::default(),
    )
    .unwrap();

    assert_eq!(chunk.code_buffer[0], 0xE2);
    assert_eq!(chunk.code_buffer[2], 0xEB);
  }

  #[test]
  fn relative_jump_after_a_leading_instruction_uses_the_chunk_base_once() {
    // `90` (NOP) then `EB 05` (`jmp +5`), so the rewritten jump lands at
    // offset 1 in the chunk rather than offset 0 — the case that hides a
    // doubled chunk-base offset in the displacement computation.
    let target_bytes = [0x90u8, 0xEB, 0x05, 0x90];
    let target_address = target_bytes.as_ptr() as usize;

    let mut chunk = TrampolineChunk::empty();
    let chunk_address = chunk.code_buffer.as_ptr() as usize;

    build(
      &mut chunk,
      chunk_address,
      target_address,
      0,
      3,
      target_bytes.len(),
      CreateFlags::default(),
    )
    .unwrap();

    assert_eq!(chunk.code_buffer[1], 0xE9);
    let disp = i32::from_le_bytes([
      chunk.code_buffer[2],
      chunk.code_buffer[3],
      chunk.code_buffer[4],
      chunk.code_buffer[5],
    ]);
    let expected_target = target_address + 1 + 2 + 5;
    let expected_end_of_instruction = chunk_address + 1 + branch::SIZEOF_RELATIVE_JUMP;
    assert_eq!(disp, (expected_target as i64 - expected_end_of_instruction as i64) as i32);
  }

  #[test]
  fn loop_rewrite_fails_without_the_flag() {
    let target_bytes = [0xE2u8, 0xFE, 0x90];
    let target_address = target_bytes.as_ptr() as usize;
    let mut chunk = TrampolineChunk::empty();
    let chunk_address = chunk.code_buffer.as_ptr() as usize;

    let result = build(
      &mut chunk,
      chunk_address,
      target_address,
      0,
      2,
      target_bytes.len(),
      CreateFlags::empty(),
    );
    assert!(matches!(result, Err(Error::UnsupportedInstruction)));
  }
}
