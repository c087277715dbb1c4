// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Safe interaction with untrusted user memory.
//!
//! A pointer arriving through a syscall is an *allegation* about the
//! caller's address space. Before the kernel touches it, the range has to
//! be checked: it must not be null, must not wrap, and must stay strictly
//! below the kernel window. A task that hands the kernel a pointer failing
//! those checks is terminated with `InvalidMemoryAccess` -- the error is
//! never returned to it, matching how a hardware fault during the copy
//! would be handled.
//!
//! The checked range is then accessed through the arch copy primitives.
//! Demand paging is a user-space affair, and the kernel never maps user
//! pages lazily, so post-validation copies do not fault on well-formed
//! systems.

use abi::ExceptionReason;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes};

use crate::config::KERNEL_BASE;
use crate::err::UserError;

/// Validates a user range for access. Zero-length ranges are fine; a null
/// base never is.
pub fn check_range(addr: u64, len: usize) -> Result<(), UserError> {
    let end = addr
        .checked_add(len as u64)
        .ok_or(UserError::Fatal(ExceptionReason::InvalidMemoryAccess))?;
    if addr == 0 || end > KERNEL_BASE {
        return Err(UserError::Fatal(ExceptionReason::InvalidMemoryAccess));
    }
    Ok(())
}

/// Reads a `T` out of user memory at `addr`.
pub fn read_obj<T: FromBytes + IntoBytes + Immutable>(
    addr: u64,
) -> Result<T, UserError> {
    let mut value = T::new_zeroed();
    let buf = value.as_mut_bytes();
    check_range(addr, buf.len())?;
    // Safety: range checked above; the arch layer owns faults within it.
    unsafe {
        crate::arch::copy_from_user_unchecked(buf, addr);
    }
    Ok(value)
}

/// Writes `value` into user memory at `addr`.
pub fn write_obj<T: IntoBytes + Immutable>(
    addr: u64,
    value: &T,
) -> Result<(), UserError> {
    let buf = value.as_bytes();
    check_range(addr, buf.len())?;
    // Safety: range checked above.
    unsafe {
        crate::arch::copy_to_user_unchecked(addr, buf);
    }
    Ok(())
}

/// Fills `buf` from user memory at `addr`.
pub fn read_bytes(addr: u64, buf: &mut [u8]) -> Result<(), UserError> {
    check_range(addr, buf.len())?;
    // Safety: range checked above.
    unsafe {
        crate::arch::copy_from_user_unchecked(buf, addr);
    }
    Ok(())
}

/// Copies `buf` to user memory at `addr`.
pub fn write_bytes(addr: u64, buf: &[u8]) -> Result<(), UserError> {
    check_range(addr, buf.len())?;
    // Safety: range checked above.
    unsafe {
        crate::arch::copy_to_user_unchecked(addr, buf);
    }
    Ok(())
}

/// Copies a NUL-terminated string of at most `buf.len()` bytes from user
/// memory, one byte at a time so the kernel never reads past the
/// terminator. The tail of `buf` is zero-filled.
pub fn read_cstr(addr: u64, buf: &mut [u8]) -> Result<(), UserError> {
    check_range(addr, buf.len())?;
    let mut done = false;
    for (i, slot) in buf.iter_mut().enumerate() {
        if done {
            *slot = 0;
            continue;
        }
        let mut byte = [0u8];
        // Safety: the whole window was range checked above.
        unsafe {
            crate::arch::copy_from_user_unchecked(&mut byte, addr + i as u64);
        }
        *slot = byte[0];
        if byte[0] == 0 {
            done = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_host_memory() {
        let src: u64 = 0xfeed_beef_cafe;
        let mut dst: u64 = 0;
        write_obj(&mut dst as *mut u64 as u64, &src).unwrap();
        assert_eq!(dst, src);
        let read: u64 = read_obj(&dst as *const u64 as u64).unwrap();
        assert_eq!(read, src);
    }

    #[test]
    fn rejects_null_and_kernel_pointers() {
        assert_eq!(
            read_obj::<u64>(0),
            Err(UserError::Fatal(ExceptionReason::InvalidMemoryAccess))
        );
        assert_eq!(
            read_obj::<u64>(KERNEL_BASE),
            Err(UserError::Fatal(ExceptionReason::InvalidMemoryAccess))
        );
        assert_eq!(
            write_bytes(u64::MAX - 2, &[0; 8]),
            Err(UserError::Fatal(ExceptionReason::InvalidMemoryAccess))
        );
    }

    #[test]
    fn cstr_copy_stops_at_terminator() {
        let src = *b"net\0XXXX";
        let mut buf = [0xffu8; 8];
        read_cstr(src.as_ptr() as u64, &mut buf).unwrap();
        assert_eq!(&buf, b"net\0\0\0\0\0");
    }

    #[test]
    fn cstr_copy_bounds_unterminated_names() {
        let src = *b"eightlet"; // no NUL inside the window
        let mut buf = [0u8; 8];
        read_cstr(src.as_ptr() as u64, &mut buf).unwrap();
        assert_eq!(&buf, b"eightlet");
    }
}
