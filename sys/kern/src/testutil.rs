// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures for kernel tests.
//!
//! Tests drive the kernel exactly the way a port would: load the syscall
//! registers, call the dispatcher, look at the return register and the
//! scheduling hint. "User memory" is boxed buffers owned by the test.
//!
//! The hosted interrupt mask is process-global, so each test that talks
//! to the interrupt controller uses its own line number.

use abi::{IpcFlags, Message, MsgType, Sysnum, TaskFlags};

use crate::startup::Kernel;
use crate::task::{ArchState, NextTask};

/// A kernel with `n` live tasks: slot 0 is the root task (tid 1, no
/// pager), the rest page off it.
pub(crate) fn kernel_with(n: usize) -> Box<Kernel> {
    let mut k = Box::new(Kernel::new());
    k.tasks
        .create(0, b"root", 0x1000, None, TaskFlags::empty())
        .unwrap();
    for i in 1..n {
        k.tasks
            .create(i, b"task", 0x1000, Some(0), TaskFlags::empty())
            .unwrap();
    }
    k
}

/// Issues a syscall from `caller` and returns its return register.
pub(crate) fn syscall(
    k: &mut Kernel,
    caller: usize,
    nr: Sysnum,
    args: [u64; 5],
) -> i64 {
    let _ = syscall_hint(k, caller, nr, args);
    k.tasks.task(caller).save().return_value()
}

/// Same, but hands back the scheduling hint instead.
pub(crate) fn syscall_hint(
    k: &mut Kernel,
    caller: usize,
    nr: Sysnum,
    args: [u64; 5],
) -> NextTask {
    k.tasks
        .task_mut(caller)
        .save_mut()
        .set_syscall(nr as u64, args);
    crate::syscalls::handle_syscall(k, caller)
}

/// A user-space message slot.
pub(crate) struct MsgSlot(Box<Message>);

impl MsgSlot {
    pub fn new() -> Self {
        Self(Box::new(Message::new(MsgType(0))))
    }

    pub fn filled(m: Message) -> Self {
        Self(Box::new(m))
    }

    pub fn addr(&mut self) -> u64 {
        &mut *self.0 as *mut Message as u64
    }

    pub fn get(&self) -> &Message {
        &self.0
    }

    pub fn set(&mut self, m: Message) {
        *self.0 = m;
    }
}

/// Issues an `Ipc` syscall against the message slot.
pub(crate) fn ipc(
    k: &mut Kernel,
    caller: usize,
    dst: i32,
    src: i32,
    slot: &mut MsgSlot,
    flags: IpcFlags,
) -> i64 {
    syscall(
        k,
        caller,
        Sysnum::Ipc,
        [
            dst as i64 as u64,
            src as i64 as u64,
            slot.addr(),
            flags.bits() as u64,
            0,
        ],
    )
}
