// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel state and startup.
//!
//! [`Kernel`] gathers the mutable state of the machine: the task table,
//! the log ring, the page-table frame pool, and the kernel's own little
//! frame allocator. A bare-metal port builds one of these in a static
//! and hands control to its idle loop; hosted code (simulators, tests)
//! just constructs one and drives it.

use abi::{Error, TaskFlags, Tid};

use crate::config::{KERNEL_FRAMES_BASE, KERNEL_FRAMES_END, PAGE_SIZE};
use crate::image;
use crate::klog::LogRing;
use crate::task::TaskTable;
use crate::vm::PageTablePool;

/// Bump allocator over the physical range reserved for kernel-owned
/// frames. Only boot-time mapping draws from it; everything after boot
/// gets its frames from the pager through the map syscall.
pub struct FrameBump {
    next: u64,
    end: u64,
}

impl FrameBump {
    pub fn new(base: u64, end: u64) -> Self {
        Self { next: base, end }
    }

    pub fn alloc(&mut self) -> Option<u64> {
        if self.next >= self.end {
            return None;
        }
        let frame = self.next;
        self.next += PAGE_SIZE as u64;
        Some(frame)
    }
}

/// Everything the kernel knows, in one place.
pub struct Kernel {
    pub tasks: TaskTable,
    pub klog: LogRing,
    pub pool: PageTablePool,
    pub kframes: FrameBump,
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            tasks: TaskTable::new(),
            klog: LogRing::new(),
            pool: PageTablePool::new(),
            kframes: FrameBump::new(KERNEL_FRAMES_BASE, KERNEL_FRAMES_END),
        }
    }

    /// Brings up the initial task from the embedded boot image, mapped
    /// at physical address `image_paddr`.
    ///
    /// The initial task is the only one the kernel creates itself; it
    /// has no pager and spawns everything else.
    pub fn boot(
        &mut self,
        image: &[u8],
        image_paddr: u64,
    ) -> Result<(), Error> {
        let (header, header_off) =
            image::locate(image).ok_or(Error::NotFound)?;
        klog!("boot image: entry={:#x}", header.entry);

        let init = self.tasks.lookup_unchecked(Tid::INIT)?;
        self.tasks.create(
            init,
            &header.name,
            header.entry,
            None,
            TaskFlags::empty(),
        )?;
        image::map_segments(
            self,
            init,
            image,
            image_paddr,
            &header,
            header_off,
        )
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bump_stops_at_the_end() {
        let mut frames = FrameBump::new(0x1000, 0x3000);
        assert_eq!(frames.alloc(), Some(0x1000));
        assert_eq!(frames.alloc(), Some(0x2000));
        assert_eq!(frames.alloc(), None);
    }
}
