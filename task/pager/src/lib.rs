// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The root pager.
//!
//! The first user task. It pages for every other task, which makes it
//! the place where policy lives: which addresses demand-zero, who gets
//! physical frames, and how big payloads travel between tasks. The
//! kernel only moves one fixed-size message at a time; anything larger
//! goes through this server's bulk-transfer protocol ([`bulk`]), which
//! copies payloads page by page through the pager's own view of physical
//! memory.
//!
//! The code here is the server logic only. Physical memory access (the
//! temporary windows a port maps copy targets through) sits behind
//! [`PageOps`], and the kernel sits behind [`userlib::SysApi`]; the
//! entry point that wires both up is part of the board support.

#![cfg_attr(not(test), no_std)]

pub mod bulk;
pub mod pages;
pub mod server;

#[cfg(test)]
pub(crate) mod testsupport;

use abi::{Error, Message, MsgType, Tid, NUM_TASKS, SERVICE_NAME_LEN};
use kerncore::IndexQueue;
use userlib::SysApi;

use crate::pages::{FrameAlloc, PageArea};

/// Page areas a single task may hold.
pub const MAX_AREAS: usize = 32;

/// Registered services.
pub const MAX_SERVICES: usize = 16;

/// The demand-zero window: faults in here get a fresh zeroed frame
/// (.bss, heaps, stacks live here in the standard task layout).
pub const ZEROED_BASE: u64 = 0x0000_0001_0000_0000;
pub const ZEROED_END: u64 = 0x0000_0002_0000_0000;

/// The window handed out by the bump virtual allocator (`AllocPages`).
pub const FREE_VADDR_BASE: u64 = 0x0000_0010_0000_0000;
pub const FREE_VADDR_END: u64 = 0x0000_0020_0000_0000;

/// Physical memory access for copies the pager performs on behalf of
/// other tasks. A port implements this with a temporary mapping window;
/// tests implement it with plain buffers.
pub trait PageOps {
    /// Copies `len` bytes between physical addresses. Callers never ask
    /// for a copy that crosses a page boundary on either side.
    fn copy(&mut self, dst_paddr: u64, src_paddr: u64, len: usize);
    /// Zero-fills `len` bytes at a physical address.
    fn zero(&mut self, paddr: u64, len: usize);
}

pub(crate) fn page_down(addr: u64) -> u64 {
    addr & !(abi::PAGE_SIZE as u64 - 1)
}

/// What the pager knows about one task.
pub struct TaskRecord {
    pub(crate) in_use: bool,
    pub(crate) tid: Tid,
    pub(crate) name: [u8; SERVICE_NAME_LEN],
    /// Bump pointer for `AllocPages` virtual ranges.
    pub(crate) free_vaddr: u64,
    pub(crate) areas: [Option<PageArea>; MAX_AREAS],
    /// Declared bulk reception buffer; zero when none outstanding.
    pub(crate) bulk_buf: u64,
    pub(crate) bulk_len: u64,
    /// The last-completed transfer, consumed by `VerifyBulk`.
    pub(crate) recv_from: Tid,
    pub(crate) recv_id: u64,
    pub(crate) recv_len: u64,
    /// A `DoBulk` this task sent that is waiting for its receiver to
    /// accept.
    pub(crate) queued_send: Message,
    /// Tasks whose `DoBulk` toward *this* task is waiting, oldest first.
    pub(crate) bulk_waiters: IndexQueue<NUM_TASKS>,
    /// Service name this task is blocked looking up; all-zero when not.
    pub(crate) waiting_for: [u8; SERVICE_NAME_LEN],
}

impl TaskRecord {
    fn empty(index: usize) -> Self {
        Self {
            in_use: false,
            tid: Tid::from_index(index),
            name: [0; SERVICE_NAME_LEN],
            free_vaddr: FREE_VADDR_BASE,
            areas: [None; MAX_AREAS],
            bulk_buf: 0,
            bulk_len: 0,
            recv_from: Tid(0),
            recv_id: 0,
            recv_len: 0,
            queued_send: Message::new(MsgType(0)),
            bulk_waiters: IndexQueue::new(),
            waiting_for: [0; SERVICE_NAME_LEN],
        }
    }

    pub fn name(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).unwrap_or("(bad name)")
    }
}

#[derive(Copy, Clone)]
pub(crate) struct Service {
    pub name: [u8; SERVICE_NAME_LEN],
    pub task: Tid,
}

/// The pager's whole state.
pub struct Pager {
    pub(crate) tasks: [TaskRecord; NUM_TASKS],
    pub frames: FrameAlloc,
    pub(crate) services: [Option<Service>; MAX_SERVICES],
}

impl Pager {
    /// Builds the pager's state with itself registered as the initial
    /// task.
    pub fn new() -> Self {
        let mut p = Self {
            tasks: core::array::from_fn(TaskRecord::empty),
            frames: FrameAlloc::new(),
            services: [None; MAX_SERVICES],
        };
        // Index 0 is us.
        p.tasks[0].in_use = true;
        copy_name(&mut p.tasks[0].name, b"pager");
        p
    }

    /// Starts tracking a task this pager serves. The launcher calls this
    /// right after `Spawn`.
    pub fn register_task(&mut self, tid: Tid, name: &str) -> Result<(), Error> {
        let index = tid.index().ok_or(Error::InvalidArg)?;
        if self.tasks[index].in_use {
            return Err(Error::AlreadyExists);
        }
        let mut record = TaskRecord::empty(index);
        record.in_use = true;
        copy_name(&mut record.name, name.as_bytes());
        self.tasks[index] = record;
        Ok(())
    }

    pub fn task_in_use(&self, tid: Tid) -> bool {
        tid.index()
            .map(|i| self.tasks[i].in_use)
            .unwrap_or(false)
    }

    /// Grants a task an externally-arranged page area (boot mappings,
    /// shared buffers).
    pub fn grant_area(
        &mut self,
        tid: Tid,
        vaddr: u64,
        paddr: u64,
        num_pages: u32,
    ) -> Result<(), Error> {
        let index = self.live_index(tid).ok_or(Error::NotFound)?;
        self.tasks[index].add_area(vaddr, paddr, num_pages)
    }

    pub(crate) fn live_index(&self, tid: Tid) -> Option<usize> {
        let index = tid.index()?;
        self.tasks[index].in_use.then_some(index)
    }

    /// Tears a task down: destroys it in the kernel and forgets
    /// everything about it.
    pub(crate) fn kill(&mut self, sys: &mut impl SysApi, tid: Tid) {
        let Some(index) = self.live_index(tid) else {
            return;
        };
        let _ = sys.kill(tid);
        self.tasks[index] = TaskRecord::empty(index);
        for task in &mut self.tasks {
            task.bulk_waiters.remove(index);
        }
        for slot in &mut self.services {
            if slot.map(|s| s.task) == Some(tid) {
                *slot = None;
            }
        }
    }
}

impl Default for Pager {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn copy_name(dst: &mut [u8; SERVICE_NAME_LEN], src: &[u8]) {
    *dst = [0; SERVICE_NAME_LEN];
    let n = src
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(src.len())
        .min(SERVICE_NAME_LEN);
    dst[..n].copy_from_slice(&src[..n]);
}
