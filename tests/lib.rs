use matches::assert_matches;
use std::mem;
use trampoline_engine::{create, create_ex, free, CreateFlags, Error};

type FnAdd = extern "C" fn(i32, i32) -> i32;

#[inline(never)]
extern "C" fn callback_stub(x: i32, y: i32) -> i32 {
  x - y
}

mod round_trip {
  use super::*;

  #[test]
  fn trampoline_behaves_like_the_original_function() {
    #[inline(never)]
    extern "C" fn add(x: i32, y: i32) -> i32 {
      unsafe { std::ptr::read_volatile(&x as *const i32) + y }
    }

    unsafe {
      let trampoline = create(add as *const (), callback_stub as *const (), 5)
        .expect("target is relocatable");

      let via_trampoline: FnAdd = mem::transmute(trampoline.code_address());

      // Nothing has patched `add` itself, so the relocated copy and a
      // direct call must agree for every input.
      assert_eq!(via_trampoline(10, 5), add(10, 5));
      assert_eq!(via_trampoline(-3, 7), add(-3, 7));

      free(trampoline).unwrap();
    }
  }
}

mod flags {
  use super::*;

  #[test]
  fn create_ex_with_default_flags_matches_create() {
    #[inline(never)]
    extern "C" fn mul(x: i32, y: i32) -> i32 {
      unsafe { std::ptr::read_volatile(&x as *const i32) * y }
    }

    unsafe {
      let trampoline =
        create_ex(mul as *const (), callback_stub as *const (), 5, CreateFlags::default())
          .unwrap();
      let via_trampoline: FnAdd = mem::transmute(trampoline.code_address());
      assert_eq!(via_trampoline(6, 7), mul(6, 7));
      free(trampoline).unwrap();
    }
  }

  #[test]
  fn invalid_argument_is_reported_for_null_target() {
    let err = unsafe { create(std::ptr::null(), std::ptr::null(), 5).unwrap_err() };
    assert_matches!(err, Error::InvalidArgument);
  }

  #[test]
  fn invalid_argument_is_reported_for_zero_min_bytes() {
    #[inline(never)]
    extern "C" fn noop() {}

    let err =
      unsafe { create(noop as *const (), callback_stub as *const (), 0).unwrap_err() };
    assert_matches!(err, Error::InvalidArgument);
  }
}

mod lifecycle {
  use super::*;

  #[test]
  fn chunk_is_reusable_after_being_freed() {
    #[inline(never)]
    extern "C" fn first(x: i32, y: i32) -> i32 {
      unsafe { std::ptr::read_volatile(&x as *const i32) + y }
    }
    #[inline(never)]
    extern "C" fn second(x: i32, y: i32) -> i32 {
      unsafe { std::ptr::read_volatile(&x as *const i32) + y + 1 }
    }

    unsafe {
      let first_trampoline = create(first as *const (), callback_stub as *const (), 5).unwrap();
      free(first_trampoline).unwrap();

      // Should succeed again, whether or not the freed chunk is reused —
      // the point is that `free` left the pool in a usable state.
      let second_trampoline = create(second as *const (), callback_stub as *const (), 5).unwrap();
      let via_trampoline: FnAdd = mem::transmute(second_trampoline.code_address());
      assert_eq!(via_trampoline(1, 2), second(1, 2));
      free(second_trampoline).unwrap();
    }
  }

  #[test]
  fn freeing_an_already_freed_trampoline_fails() {
    #[inline(never)]
    extern "C" fn target(x: i32, y: i32) -> i32 {
      unsafe { std::ptr::read_volatile(&x as *const i32) - y }
    }

    unsafe {
      let trampoline = create(target as *const (), callback_stub as *const (), 5).unwrap();
      free(trampoline).unwrap();
      assert!(free(trampoline).is_err());
    }
  }
}
