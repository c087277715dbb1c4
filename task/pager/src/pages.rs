// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Physical frame accounting and per-task page areas.
//!
//! The pager owns the general RAM range and hands frames out with
//! reference counts (shared mappings bump the count). What a task can
//! actually touch is described by its *page areas*: contiguous runs of
//! `vaddr -> paddr` translation that back both page-fault resolution and
//! the bulk copy path. Areas are established eagerly by `AllocPages` and
//! boot grants, and lazily by demand-zero faults.

use abi::{Error, FaultFlags, Tid, PAGE_SIZE};

use crate::{page_down, PageOps, Pager, TaskRecord, ZEROED_BASE, ZEROED_END};

/// Bottom of the RAM range the pager manages.
pub const RAM_BASE: u64 = 0x0200_0000;

/// Frames in the managed range.
pub const FRAME_COUNT: usize = 4096;

/// Reference-counted allocator over the managed frame range.
pub struct FrameAlloc {
    refs: [u16; FRAME_COUNT],
}

impl FrameAlloc {
    pub fn new() -> Self {
        Self {
            refs: [0; FRAME_COUNT],
        }
    }

    pub fn is_managed(&self, paddr: u64) -> bool {
        paddr >= RAM_BASE
            && paddr < RAM_BASE + (FRAME_COUNT * PAGE_SIZE) as u64
            && paddr as usize % PAGE_SIZE == 0
    }

    fn pfn(&self, paddr: u64) -> usize {
        ((paddr - RAM_BASE) as usize) / PAGE_SIZE
    }

    /// Allocates `n` contiguous frames, returning the physical address
    /// of the first.
    pub fn alloc(&mut self, n: usize) -> Option<u64> {
        if n == 0 || n > FRAME_COUNT {
            return None;
        }
        let mut run = 0;
        for i in 0..FRAME_COUNT {
            if self.refs[i] == 0 {
                run += 1;
                if run == n {
                    let start = i + 1 - n;
                    for r in &mut self.refs[start..=i] {
                        *r = 1;
                    }
                    return Some(RAM_BASE + (start * PAGE_SIZE) as u64);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Takes another reference on `n` frames starting at `paddr`, for
    /// sharing an existing physical range.
    pub fn incref(&mut self, paddr: u64, n: usize) -> Result<(), Error> {
        if !self.is_managed(paddr) || n == 0 {
            return Err(Error::InvalidArg);
        }
        let first = self.pfn(paddr);
        if first + n > FRAME_COUNT {
            return Err(Error::InvalidArg);
        }
        for i in first..first + n {
            self.refs[i] += 1;
        }
        Ok(())
    }

    /// Drops a reference on `n` frames starting at `paddr`.
    pub fn decref(&mut self, paddr: u64, n: usize) {
        if !self.is_managed(paddr) {
            return;
        }
        let first = self.pfn(paddr);
        for i in first..(first + n).min(FRAME_COUNT) {
            self.refs[i] = self.refs[i].saturating_sub(1);
        }
    }
}

impl Default for FrameAlloc {
    fn default() -> Self {
        Self::new()
    }
}

/// One contiguous run of translation owned by a task.
#[derive(Copy, Clone, Debug)]
pub struct PageArea {
    pub vaddr: u64,
    pub paddr: u64,
    pub num_pages: u32,
}

impl PageArea {
    fn translate(&self, vaddr: u64) -> Option<u64> {
        let size = self.num_pages as u64 * PAGE_SIZE as u64;
        if (self.vaddr..self.vaddr + size).contains(&vaddr) {
            Some(self.paddr + (vaddr - self.vaddr))
        } else {
            None
        }
    }
}

impl TaskRecord {
    /// Translates through the task's areas alone; no fault-in.
    pub(crate) fn area_lookup(&self, vaddr: u64) -> Option<u64> {
        self.areas
            .iter()
            .flatten()
            .find_map(|area| area.translate(vaddr))
    }

    pub(crate) fn add_area(
        &mut self,
        vaddr: u64,
        paddr: u64,
        num_pages: u32,
    ) -> Result<(), Error> {
        let slot = self
            .areas
            .iter_mut()
            .find(|a| a.is_none())
            .ok_or(Error::NoMemory)?;
        *slot = Some(PageArea {
            vaddr,
            paddr,
            num_pages,
        });
        Ok(())
    }

    /// Carves a fresh virtual range out of the task's free window.
    pub(crate) fn alloc_virt(&mut self, num_pages: usize) -> Option<u64> {
        let size = (num_pages * PAGE_SIZE) as u64;
        let vaddr = self.free_vaddr;
        if vaddr.checked_add(size)? > crate::FREE_VADDR_END {
            return None;
        }
        self.free_vaddr += size;
        Some(vaddr)
    }
}

impl Pager {
    /// Resolves a page-aligned address of `tid` to its backing frame,
    /// faulting in a demand-zero page when the address calls for one.
    ///
    /// `None` means the access is simply invalid -- either a permission
    /// failure on a present page or an address the task has no claim to
    /// -- and the caller is expected to kill the task.
    pub fn fault_in(
        &mut self,
        ops: &mut impl PageOps,
        tid: Tid,
        vaddr: u64,
        fault: FaultFlags,
    ) -> Option<u64> {
        let vaddr = page_down(vaddr);
        let index = self.live_index(tid)?;

        if fault.contains(FaultFlags::PRESENT) {
            // The translation exists; the task broke its permissions.
            return None;
        }

        if let Some(paddr) = self.tasks[index].area_lookup(vaddr) {
            return Some(paddr);
        }

        if (ZEROED_BASE..ZEROED_END).contains(&vaddr) {
            let paddr = self.frames.alloc(1)?;
            ops.zero(paddr, PAGE_SIZE);
            self.tasks[index].add_area(vaddr, paddr, 1).ok()?;
            return Some(paddr);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_finds_contiguous_runs() {
        let mut frames = FrameAlloc::new();
        let a = frames.alloc(2).unwrap();
        let b = frames.alloc(1).unwrap();
        assert_eq!(a, RAM_BASE);
        assert_eq!(b, RAM_BASE + 2 * PAGE_SIZE as u64);
        assert!(frames.alloc(FRAME_COUNT).is_none());
        frames.decref(a, 2);
        // The freed run is reusable.
        assert_eq!(frames.alloc(2), Some(RAM_BASE));
    }

    #[test]
    fn incref_requires_managed_frames() {
        let mut frames = FrameAlloc::new();
        assert_eq!(frames.incref(0x1000, 1), Err(Error::InvalidArg));
        assert_eq!(frames.incref(RAM_BASE + 1, 1), Err(Error::InvalidArg));
        assert_eq!(frames.incref(RAM_BASE, 2), Ok(()));
    }

    #[test]
    fn area_translation() {
        let mut record = TaskRecord::empty(1);
        record
            .add_area(0x10_0000, RAM_BASE, 2)
            .unwrap();
        assert_eq!(record.area_lookup(0x10_0000), Some(RAM_BASE));
        assert_eq!(
            record.area_lookup(0x10_1234),
            Some(RAM_BASE + 0x1234)
        );
        assert_eq!(record.area_lookup(0x10_2000), None);
        assert_eq!(record.area_lookup(0x0F_F000), None);
    }

    #[test]
    fn alloc_virt_is_a_bump_allocator() {
        let mut record = TaskRecord::empty(1);
        let first = record.alloc_virt(3).unwrap();
        let second = record.alloc_virt(1).unwrap();
        assert_eq!(first, crate::FREE_VADDR_BASE);
        assert_eq!(second, first + 3 * PAGE_SIZE as u64);
    }
}
