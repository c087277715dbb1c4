// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-task address spaces.
//!
//! An [`AddrSpace`] maps user virtual pages to physical frames through a
//! four-level software page table. The kernel does not allocate: every
//! table frame is supplied by the caller (the pager hands one in through
//! the map syscall's `kpage` argument), and a walk that needs a frame it
//! was not given fails with `TryAgain` so the caller can fetch one and
//! retry. Frames adopted as page tables are tracked per space so teardown
//! can return them.
//!
//! Portable kernel code cannot dereference physical addresses, so adopted
//! frames live in a fixed [`PageTablePool`] keyed by physical address --
//! the stand-in for a direct map. Bare-metal ports would swap the pool's
//! storage for the real frames; the walker does not change.

use abi::{Error, MapFlags, PAGE_SIZE};

use crate::config::{KERNEL_BASE, PT_POOL_FRAMES, TABLES_PER_SPACE};

/// Entries per table frame.
const ENTRIES: usize = PAGE_SIZE / core::mem::size_of::<u64>();

/// Translation levels. Level 1 holds leaf entries.
const LEVELS: u32 = 4;

/// Mask selecting the frame address within a table entry.
const ENTRY_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

bitflags::bitflags! {
    /// Low attribute bits of a table entry.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const EXECUTABLE = 1 << 3;
    }
}

impl PteFlags {
    /// Translates the permission half of the map syscall's flag word.
    pub fn from_map_flags(f: MapFlags) -> Self {
        let mut p = Self::empty();
        if f.contains(MapFlags::WRITABLE) {
            p |= Self::WRITABLE;
        }
        if f.contains(MapFlags::USER) {
            p |= Self::USER;
        }
        if f.contains(MapFlags::EXECUTABLE) {
            p |= Self::EXECUTABLE;
        }
        p
    }
}

fn level_index(vaddr: u64, level: u32) -> usize {
    ((vaddr >> (12 + 9 * (level - 1))) & (ENTRIES as u64 - 1)) as usize
}

/// The kernel's supply of page-table frame storage, keyed by the physical
/// address of the frame that was adopted into it.
pub struct PageTablePool {
    frames: [[u64; ENTRIES]; PT_POOL_FRAMES],
    /// Physical address bound to each slot; 0 marks a free slot.
    bound: [u64; PT_POOL_FRAMES],
}

impl PageTablePool {
    pub fn new() -> Self {
        Self {
            frames: [[0; ENTRIES]; PT_POOL_FRAMES],
            bound: [0; PT_POOL_FRAMES],
        }
    }

    fn slot_of(&self, paddr: u64) -> Option<usize> {
        self.bound.iter().position(|&b| b == paddr)
    }

    /// Takes ownership of the frame at `paddr` for use as a page table,
    /// zeroing it. Fails with `NoMemory` when the pool has no slot left
    /// and `InvalidArg` for unusable or doubly-adopted frames.
    pub fn adopt(&mut self, paddr: u64) -> Result<(), Error> {
        if paddr == 0 || paddr as usize % PAGE_SIZE != 0 {
            return Err(Error::InvalidArg);
        }
        if self.slot_of(paddr).is_some() {
            return Err(Error::InvalidArg);
        }
        let free = self.slot_of(0).ok_or(Error::NoMemory)?;
        self.frames[free] = [0; ENTRIES];
        self.bound[free] = paddr;
        Ok(())
    }

    /// Returns the frame at `paddr` to its supplier.
    pub fn release(&mut self, paddr: u64) {
        if let Some(slot) = self.slot_of(paddr) {
            self.bound[slot] = 0;
        }
    }

    pub fn free_slots(&self) -> usize {
        self.bound.iter().filter(|&&b| b == 0).count()
    }

    fn table(&self, paddr: u64) -> Option<&[u64; ENTRIES]> {
        self.slot_of(paddr).map(|s| &self.frames[s])
    }

    fn table_mut(&mut self, paddr: u64) -> Option<&mut [u64; ENTRIES]> {
        self.slot_of(paddr).map(move |s| &mut self.frames[s])
    }

    /// Reads one entry of an adopted table. Panics if the table is gone;
    /// that would mean the kernel lost track of its own frames.
    fn entry(&self, table: u64, index: usize) -> u64 {
        match self.table(table) {
            Some(t) => t[index],
            None => panic!("page table frame {table:#x} not in pool"),
        }
    }

    fn set_entry(&mut self, table: u64, index: usize, value: u64) {
        match self.table_mut(table) {
            Some(t) => t[index] = value,
            None => panic!("page table frame {table:#x} not in pool"),
        }
    }
}

impl Default for PageTablePool {
    fn default() -> Self {
        Self::new()
    }
}

/// One task's virtual address map.
#[derive(Debug)]
pub struct AddrSpace {
    /// Physical address of the root table; 0 until the first link.
    root: u64,
    /// Table frames this space has adopted, for teardown.
    tables: [u64; TABLES_PER_SPACE],
    num_tables: usize,
}

impl AddrSpace {
    pub const fn new() -> Self {
        Self {
            root: 0,
            tables: [0; TABLES_PER_SPACE],
            num_tables: 0,
        }
    }

    /// Installs a translation from the page at `vaddr` to the frame at
    /// `paddr`.
    ///
    /// `kpage` optionally carries one caller-supplied frame. Each missing
    /// intermediate table consumes one frame; when the walk needs a frame
    /// and has none, it returns `TryAgain` and the caller comes back with
    /// a fresh `kpage`. Both addresses must be page-aligned (the syscall
    /// layer checks; internal callers are trusted).
    pub fn link(
        &mut self,
        pool: &mut PageTablePool,
        vaddr: u64,
        paddr: u64,
        mut kpage: Option<u64>,
        attrs: PteFlags,
    ) -> Result<(), Error> {
        debug_assert_eq!(vaddr as usize % PAGE_SIZE, 0);
        debug_assert_eq!(paddr as usize % PAGE_SIZE, 0);
        if vaddr >= KERNEL_BASE {
            return Err(Error::InvalidArg);
        }

        if self.root == 0 {
            self.root = self.grow(pool, &mut kpage)?;
        }

        let mut table = self.root;
        for level in (2..=LEVELS).rev() {
            let index = level_index(vaddr, level);
            let entry = pool.entry(table, index);
            let next = if entry & PteFlags::PRESENT.bits() == 0 {
                let frame = self.grow(pool, &mut kpage)?;
                pool.set_entry(
                    table,
                    index,
                    frame | (attrs | PteFlags::PRESENT).bits(),
                );
                frame
            } else {
                // Widen the path attributes to cover the new mapping.
                pool.set_entry(table, index, entry | attrs.bits());
                entry & ENTRY_ADDR_MASK
            };
            table = next;
        }

        pool.set_entry(
            table,
            level_index(vaddr, 1),
            paddr | (attrs | PteFlags::PRESENT).bits(),
        );
        Ok(())
    }

    /// Removes the translation for `vaddr`, if any.
    pub fn unlink(&mut self, pool: &mut PageTablePool, vaddr: u64) {
        let Some(leaf_table) = self.walk(pool, vaddr) else {
            return;
        };
        pool.set_entry(leaf_table, level_index(vaddr, 1), 0);
    }

    /// Looks up the frame backing `vaddr`. Returns `None` when unmapped.
    pub fn resolve(&self, pool: &PageTablePool, vaddr: u64) -> Option<u64> {
        let leaf_table = self.walk(pool, vaddr)?;
        let entry = pool.entry(leaf_table, level_index(vaddr, 1));
        if entry & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some(entry & ENTRY_ADDR_MASK)
    }

    /// Returns the space's adopted frames to the pool.
    pub fn destroy(&mut self, pool: &mut PageTablePool) {
        for &frame in &self.tables[..self.num_tables] {
            pool.release(frame);
        }
        self.tables = [0; TABLES_PER_SPACE];
        self.num_tables = 0;
        self.root = 0;
    }

    /// Walks down to the level-1 table covering `vaddr` without
    /// allocating. Returns its physical address.
    fn walk(&self, pool: &PageTablePool, vaddr: u64) -> Option<u64> {
        if self.root == 0 || vaddr >= KERNEL_BASE {
            return None;
        }
        let mut table = self.root;
        for level in (2..=LEVELS).rev() {
            let entry = pool.entry(table, level_index(vaddr, level));
            if entry & PteFlags::PRESENT.bits() == 0 {
                return None;
            }
            table = entry & ENTRY_ADDR_MASK;
        }
        Some(table)
    }

    /// Adopts the caller's `kpage` as a fresh table frame and records it
    /// against this space.
    fn grow(
        &mut self,
        pool: &mut PageTablePool,
        kpage: &mut Option<u64>,
    ) -> Result<u64, Error> {
        if self.num_tables == TABLES_PER_SPACE {
            return Err(Error::NoMemory);
        }
        let frame = kpage.take().ok_or(Error::TryAgain)?;
        pool.adopt(frame)?;
        self.tables[self.num_tables] = frame;
        self.num_tables += 1;
        Ok(frame)
    }
}

impl Default for AddrSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Links `vaddr -> paddr`, feeding the walk fresh frames from `alloc`
/// until it stops asking. This is how the kernel maps the boot image,
/// before any pager exists to run the retry loop.
pub fn link_retrying(
    space: &mut AddrSpace,
    pool: &mut PageTablePool,
    alloc: &mut dyn FnMut() -> Option<u64>,
    vaddr: u64,
    paddr: u64,
    attrs: PteFlags,
) -> Result<(), Error> {
    let mut kpage = None;
    loop {
        match space.link(pool, vaddr, paddr, kpage.take(), attrs) {
            Err(Error::TryAgain) => {
                kpage = Some(alloc().ok_or(Error::NoMemory)?);
            }
            other => return other,
        }
    }
}
