//! Trampoline creation flags.

use bitflags::bitflags;

bitflags! {
  /// Controls which classes of relative instructions the trampoline builder
  /// is permitted to rewrite. An instruction whose class is not covered by
  /// the active flags causes [`create_ex`](crate::create_ex) to fail with
  /// [`Error::UnsupportedInstruction`](crate::error::Error::UnsupportedInstruction).
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
  pub struct CreateFlags: u32 {
    /// Permit rewriting relative and indirect `CALL` instructions.
    const REWRITE_CALL = 1 << 0;
    /// Permit rewriting `JCXZ`/`JECXZ`/`JRCXZ`.
    const REWRITE_JCXZ = 1 << 1;
    /// Permit rewriting `LOOP`/`LOOPE`/`LOOPNE`.
    const REWRITE_LOOP = 1 << 2;
  }
}

impl Default for CreateFlags {
  /// The flag set used by [`create`](crate::create): every rewrite class
  /// enabled.
  fn default() -> Self {
    CreateFlags::REWRITE_CALL | CreateFlags::REWRITE_JCXZ | CreateFlags::REWRITE_LOOP
  }
}
