// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Microkernel core.
//!
//! This is the application-independent portion of the operating system: the
//! task table and round-robin scheduler, the synchronous IPC rendezvous
//! engine with asynchronous notifications, IRQ and fault routing to
//! user-space pagers, and the per-task address-space mapping service.
//! Everything else -- drivers, file systems, program loading, even page
//! allocation policy -- lives in user tasks and talks to this core through
//! the nine system calls in [`syscalls`].
//!
//! # Design principles
//!
//! 1. Static configuration: the task table and every queue are fixed-size;
//!    the kernel never allocates.
//! 2. A single big kernel lock. Within a kernel entry execution is
//!    cooperative, so the data structures here need no finer locking.
//! 3. A strong preference for safe code; raw user-memory access is fenced
//!    off in [`umem`] and the arch layer.
//! 4. Simple and clear algorithms over fast and clever ones.
//!
//! The code outside [`arch`] is portable. Bare-metal targets supply the
//! trap entry, context switch, and user-copy primitives; the hosted arch
//! module stands in for them so the whole kernel can be exercised as an
//! ordinary library under `cargo test`.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
pub mod arch;

pub mod config;
pub mod err;
pub mod image;
pub mod ipc;
pub mod kdebug;
pub mod klog;
pub mod startup;
pub mod syscalls;
pub mod task;
pub mod umem;
pub mod vm;

#[cfg(test)]
pub(crate) mod testutil;
