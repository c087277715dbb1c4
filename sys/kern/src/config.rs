// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static kernel configuration.
//!
//! The system takes a single shape fixed at compile time; these constants
//! are that shape. Table geometry shared with userspace lives in `abi`.

/// Re-exported so kernel code has one place to look.
pub use abi::{IRQ_LINES, NUM_TASKS, PAGE_SIZE, TASK_NAME_LEN};

/// Timer interrupt rate. A tick is one millisecond.
pub const TICK_HZ: u32 = 1000;

/// Scheduling quantum, in ticks.
pub const TIME_SLICE_TICKS: u32 = 10;

/// Bytes in the kernel log ring.
pub const KLOG_LEN: usize = 4096;

/// Chunk size for staging user log bytes through kernel memory.
pub const LOG_CHUNK_LEN: usize = 256;

/// Longest accepted kernel debug command, including the terminator.
pub const KDEBUG_CMD_LEN: usize = 128;

/// Minimum length a task may declare for its bulk reception buffer.
pub const BULK_BUFFER_MIN: usize = 8192;

/// First virtual address owned by the kernel; user pointers must stay
/// strictly below it.
pub const KERNEL_BASE: u64 = 0xffff_8000_0000_0000;

/// Physical addresses below this hold the kernel image and may never be
/// handed to user mappings.
pub const KERNEL_PADDR_END: u64 = 0x0100_0000;

/// Physical range the kernel draws from when it needs page-table frames of
/// its own (boot image mapping, before any pager exists).
pub const KERNEL_FRAMES_BASE: u64 = 0x0040_0000;
pub const KERNEL_FRAMES_END: u64 = 0x0080_0000;

/// Frames available in the kernel's page-table frame pool.
pub const PT_POOL_FRAMES: usize = 64;

/// Page-table frames a single address space may consume before `link`
/// reports exhaustion.
pub const TABLES_PER_SPACE: usize = 16;
