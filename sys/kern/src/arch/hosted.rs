// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted stand-in for the architecture layer.
//!
//! This runs the kernel as an ordinary library on a development machine:
//! simulators and the test suite link against it. "User memory" is plain
//! host memory, the interrupt controller is a mask bitmap, and context
//! switching is the caller's problem (the test harness just calls the
//! scheduler and inspects the result). Everything a real port must provide
//! is here with the same names and signatures.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Log things from kernel context. Real ports route this at a debug
/// transport; here it either goes to stderr (feature `klog-stderr`) or
/// nowhere.
#[cfg(feature = "klog-stderr")]
macro_rules! klog {
    ($s:expr) => { eprintln!($s) };
    ($s:expr, $($tt:tt)*) => { eprintln!($s, $($tt)*) };
}

#[cfg(not(feature = "klog-stderr"))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {
        // Keep the format arguments type-checked even when discarded.
        if false {
            let _ = format_args!($s, $($tt)*);
        }
    };
}

/// Saved register state of a task.
///
/// A real port stores the full register file here and keeps it first in
/// the `Task` struct so the trap entry can find it. The hosted version
/// holds exactly what the portable kernel reads and writes: the syscall
/// descriptor, its arguments, the return word, and the program counter.
#[derive(Debug, Default)]
pub struct SavedState {
    nr: u64,
    args: [u64; 5],
    ret: i64,
    pc: u64,
    frame: [u64; abi::TRAP_FRAME_WORDS],
}

impl crate::task::ArchState for SavedState {
    fn syscall_descriptor(&self) -> u64 {
        self.nr
    }

    fn arg0(&self) -> u64 {
        self.args[0]
    }
    fn arg1(&self) -> u64 {
        self.args[1]
    }
    fn arg2(&self) -> u64 {
        self.args[2]
    }
    fn arg3(&self) -> u64 {
        self.args[3]
    }
    fn arg4(&self) -> u64 {
        self.args[4]
    }

    fn set_return_value(&mut self, v: i64) {
        self.ret = v;
    }

    fn return_value(&self) -> i64 {
        self.ret
    }

    fn set_entry(&mut self, pc: u64) {
        self.pc = pc;
    }

    fn trap_frame(&self) -> [u64; abi::TRAP_FRAME_WORDS] {
        self.frame
    }

    fn set_trap_frame(&mut self, frame: &[u64; abi::TRAP_FRAME_WORDS]) {
        self.frame = *frame;
    }
}

impl SavedState {
    /// Loads a syscall into the register record, as the trap entry would.
    pub fn set_syscall(&mut self, nr: u64, args: [u64; 5]) {
        self.nr = nr;
        self.args = args;
    }

    pub fn entry(&self) -> u64 {
        self.pc
    }
}

/// Copies `buf.len()` bytes of user memory at `src` into `buf`.
///
/// # Safety
///
/// The caller must have validated the range against the kernel window
/// (`umem` does); on this target the address must also be a real readable
/// host address, which test fixtures guarantee by handing out pointers to
/// live buffers.
pub unsafe fn copy_from_user_unchecked(buf: &mut [u8], src: u64) {
    unsafe {
        core::ptr::copy_nonoverlapping(
            src as usize as *const u8,
            buf.as_mut_ptr(),
            buf.len(),
        );
    }
}

/// Copies `buf` into user memory at `dst`. Same contract as
/// [`copy_from_user_unchecked`], for writing.
pub unsafe fn copy_to_user_unchecked(dst: u64, buf: &[u8]) {
    unsafe {
        core::ptr::copy_nonoverlapping(
            buf.as_ptr(),
            dst as usize as *mut u8,
            buf.len(),
        );
    }
}

/// Interrupt mask state, one bit per line, set = masked. Lines start
/// masked; ownership is what unmasks them.
static IRQ_MASKED: AtomicU64 = AtomicU64::new(!0);

pub fn enable_irq(irq: usize) {
    IRQ_MASKED.fetch_and(!(1 << irq as u64), Ordering::Relaxed);
}

pub fn disable_irq(irq: usize) {
    IRQ_MASKED.fetch_or(1 << irq as u64, Ordering::Relaxed);
}

pub fn irq_masked(irq: usize) -> bool {
    IRQ_MASKED.load(Ordering::Relaxed) & (1 << irq as u64) != 0
}

/// Index of the task that will run on return to user. A real port uses
/// this to find the register save area from the trap entry.
static CURRENT_TASK: AtomicUsize = AtomicUsize::new(0);

pub fn set_current_task(index: usize) {
    CURRENT_TASK.store(index, Ordering::Relaxed);
}

pub fn current_task() -> usize {
    CURRENT_TASK.load(Ordering::Relaxed)
}

pub fn reset() -> ! {
    panic!("SYSTEM RESET");
}
