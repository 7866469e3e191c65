//! Fixed-layout trampoline chunk: the relocated prologue, its translation
//! map, and (on x64) the indirect callback jump.

use crate::branch::{SIZEOF_ABSOLUTE_JUMP, SIZEOF_RELATIVE_JUMP};

/// Upper bound on how many bytes of original prologue a chunk will ever
/// relocate. Sized for the worst realistic case (a run of prefixed,
/// multi-byte relative instructions) without wasting a page per chunk.
pub const MAX_CODE_SIZE: usize = 19;
/// [`MAX_CODE_SIZE`] plus room for the trailing back-jump to the target.
pub const MAX_CODE_SIZE_WITH_BACKJUMP: usize = 25;
/// Slack appended to the code buffer so that the `JCXZ`/`LOOP` expansion
/// thunk (short-jump-over-near-jump, a few bytes larger than the
/// instruction it replaces) never overflows the buffer.
pub const BONUS: usize = 16;
/// Capacity of a chunk's translation map: one entry per instruction that
/// could possibly fit in [`MAX_CODE_SIZE`], sized as `SIZEOF_RELATIVE_JUMP + 2`.
pub const MAX_TRANSLATION_ITEMS: usize = SIZEOF_RELATIVE_JUMP + 2;

/// One entry of a chunk's translation map: an original-prologue byte
/// offset paired with the corresponding offset inside the relocated copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct TranslationItem {
  pub offset_original: u8,
  pub offset_trampoline: u8,
}

/// A bounded sequence of [`TranslationItem`]s, one per relocated
/// instruction, in increasing offset order.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct TranslationMap {
  items: [TranslationItem; MAX_TRANSLATION_ITEMS],
  len: usize,
}

impl TranslationMap {
  pub fn new() -> Self {
    TranslationMap { items: [TranslationItem::default(); MAX_TRANSLATION_ITEMS], len: 0 }
  }

  /// Appends an entry. Panics if the map is already at capacity — the
  /// builder never relocates more instructions than the map can hold,
  /// since [`MAX_CODE_SIZE`] bounds both.
  pub fn push(&mut self, item: TranslationItem) {
    self.items[self.len] = item;
    self.len += 1;
  }

  pub fn as_slice(&self) -> &[TranslationItem] {
    &self.items[..self.len]
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Maps an offset into the original prologue to the corresponding
  /// offset into the relocated trampoline code, by locating the entry
  /// whose original offset is the greatest one not exceeding `offset`.
  pub fn translate(&self, offset: u8) -> Option<u8> {
    self
      .as_slice()
      .iter()
      .rev()
      .find(|item| item.offset_original <= offset)
      .map(|item| item.offset_trampoline + (offset - item.offset_original))
  }
}

impl Default for TranslationMap {
  fn default() -> Self {
    Self::new()
  }
}

/// One slot in a [`TrampolineRegion`](super::region::TrampolineRegion):
/// the relocated prologue, the appended back-jump, and (x64 only) the
/// indirect callback jump used by rewritten `CALL`s.
///
/// `repr(C)` gives this a fixed, predictable layout: a
/// [`TrampolineRegion`](super::region::TrampolineRegion) places these
/// directly inside its mapped pages and addresses them by index via
/// pointer arithmetic.
#[repr(C)]
pub struct TrampolineChunk {
  pub is_used: bool,

  /// Absolute address of the callback; the slot that
  /// `callback_jump`'s `FF 25` dereferences on x64.
  #[cfg(target_arch = "x86_64")]
  pub callback_address: usize,
  /// `jmp [rip+disp]` to `callback_address`, used as the target of
  /// rewritten relative/indirect `CALL`s so they still return into the
  /// relocated code rather than jumping past it.
  #[cfg(target_arch = "x86_64")]
  pub callback_jump: [u8; SIZEOF_ABSOLUTE_JUMP],

  /// Absolute address the trailing back-jump returns to: `target + original_code_size`.
  pub backjump_address: usize,

  pub code_buffer: [u8; MAX_CODE_SIZE_WITH_BACKJUMP + BONUS],
  pub code_buffer_size: usize,

  pub translation_map: TranslationMap,

  pub original_code: [u8; MAX_CODE_SIZE],
  pub original_code_size: usize,
}

impl TrampolineChunk {
  /// A chunk in its unused, zeroed state.
  pub fn empty() -> Self {
    TrampolineChunk {
      is_used: false,
      #[cfg(target_arch = "x86_64")]
      callback_address: 0,
      #[cfg(target_arch = "x86_64")]
      callback_jump: [0u8; SIZEOF_ABSOLUTE_JUMP],
      backjump_address: 0,
      code_buffer: [0u8; MAX_CODE_SIZE_WITH_BACKJUMP + BONUS],
      code_buffer_size: 0,
      translation_map: TranslationMap::new(),
      original_code: [0u8; MAX_CODE_SIZE],
      original_code_size: 0,
    }
  }

  /// The address of this chunk's relocated code, valid once the chunk
  /// has been placed inside a mapped region (callers compute this from
  /// the region base plus the chunk's index; this method only exposes
  /// the in-buffer pointer, used by the builder while it is still
  /// writing into a chunk at a known, already-mapped address).
  pub fn code_address(&self) -> *const u8 {
    self.code_buffer.as_ptr()
  }

  /// Resets a freed chunk back to its empty state, leaving the
  /// surrounding region's bookkeeping (unused-chunk counter) to the
  /// caller.
  pub fn reset(&mut self) {
    *self = TrampolineChunk::empty();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_chunk_is_unused_and_zeroed() {
    let chunk = TrampolineChunk::empty();
    assert!(!chunk.is_used);
    assert_eq!(chunk.code_buffer_size, 0);
    assert_eq!(chunk.original_code_size, 0);
    assert!(chunk.translation_map.is_empty());
  }

  #[test]
  fn translation_map_translates_within_an_instruction() {
    let mut map = TranslationMap::new();
    map.push(TranslationItem { offset_original: 0, offset_trampoline: 0 });
    map.push(TranslationItem { offset_original: 5, offset_trampoline: 7 });
    assert_eq!(map.translate(0), Some(0));
    assert_eq!(map.translate(6), Some(8));
  }

  #[test]
  fn reset_clears_usage_flag() {
    let mut chunk = TrampolineChunk::empty();
    chunk.is_used = true;
    chunk.original_code_size = 4;
    chunk.reset();
    assert!(!chunk.is_used);
    assert_eq!(chunk.original_code_size, 0);
  }
}
