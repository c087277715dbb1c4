// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boot image handling.
//!
//! The kernel is linked with a single embedded image holding the initial
//! task. A header sits at one of a couple of well-known offsets
//! (architectures differ on alignment); it names the entry point and a
//! list of segment mappings. Data segments map straight onto the image's
//! physical pages; zeroed segments (.bss, stacks) are backed by fresh
//! kernel frames.

use abi::{
    Error, ImageHeader, ImageMapping, IMAGE_HEADER_OFFSETS, IMAGE_MAGIC,
    PAGE_SIZE,
};
use zerocopy::FromBytes;

use crate::startup::Kernel;
use crate::vm::{link_retrying, PteFlags};

/// Finds the boot image header, returning it and its byte offset.
pub fn locate(image: &[u8]) -> Option<(ImageHeader, usize)> {
    for &offset in &IMAGE_HEADER_OFFSETS {
        let Some(tail) = image.get(offset..) else {
            continue;
        };
        let Ok((header, _)) = ImageHeader::read_from_prefix(tail) else {
            continue;
        };
        if header.magic == IMAGE_MAGIC {
            return Some((header, offset));
        }
    }
    None
}

/// Reads the `index`th segment record following the header.
fn mapping(
    image: &[u8],
    header_off: usize,
    index: usize,
) -> Result<ImageMapping, Error> {
    let off = header_off
        + core::mem::size_of::<ImageHeader>()
        + index * core::mem::size_of::<ImageMapping>();
    let tail = image.get(off..).ok_or(Error::InvalidArg)?;
    ImageMapping::read_from_prefix(tail)
        .map(|(m, _)| m)
        .map_err(|_| Error::InvalidArg)
}

/// Maps every segment of the boot image into task `init`'s address
/// space, feeding the page-table walk from the kernel frame range.
pub fn map_segments(
    k: &mut Kernel,
    init: usize,
    image: &[u8],
    image_paddr: u64,
    header: &ImageHeader,
    header_off: usize,
) -> Result<(), Error> {
    let Kernel {
        tasks,
        pool,
        kframes,
        ..
    } = k;
    let space = tasks.task_mut(init).vm_mut();
    let mut alloc = || kframes.alloc();

    for i in 0..header.num_mappings as usize {
        let m = mapping(image, header_off, i)?;
        if m.vaddr as usize % PAGE_SIZE != 0
            || m.offset as usize % PAGE_SIZE != 0
        {
            return Err(Error::InvalidArg);
        }
        klog!(
            "boot image: {:#x} -> {:#x} ({} pages{})",
            m.vaddr,
            image_paddr + m.offset,
            m.num_pages,
            if m.zeroed != 0 { ", zeroed" } else { "" }
        );

        for page in 0..m.num_pages as u64 {
            let vaddr = m.vaddr + page * PAGE_SIZE as u64;
            let paddr = if m.zeroed != 0 {
                // Fresh kernel frame; the port zeroes it through its
                // physical window before user code can see it.
                alloc().ok_or(Error::NoMemory)?
            } else {
                image_paddr + m.offset + page * PAGE_SIZE as u64
            };
            link_retrying(
                space,
                pool,
                &mut alloc,
                vaddr,
                paddr,
                PteFlags::USER | PteFlags::WRITABLE,
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::TASK_NAME_LEN;
    use zerocopy::IntoBytes;

    fn header(entry: u64, num_mappings: u32) -> ImageHeader {
        let mut name = [0; TASK_NAME_LEN];
        name[..4].copy_from_slice(b"boot");
        ImageHeader {
            magic: IMAGE_MAGIC,
            num_mappings,
            entry,
            name,
        }
    }

    fn image_with_header_at(offset: usize, mappings: &[ImageMapping]) -> Vec<u8> {
        let mut image = vec![0u8; 0x20000];
        let h = header(0x40_0000, mappings.len() as u32);
        image[offset..offset + core::mem::size_of::<ImageHeader>()]
            .copy_from_slice(h.as_bytes());
        let mut off = offset + core::mem::size_of::<ImageHeader>();
        for m in mappings {
            image[off..off + core::mem::size_of::<ImageMapping>()]
                .copy_from_slice(m.as_bytes());
            off += core::mem::size_of::<ImageMapping>();
        }
        image
    }

    #[test]
    fn locates_header_at_either_offset() {
        for &offset in &IMAGE_HEADER_OFFSETS {
            let image = image_with_header_at(offset, &[]);
            let (h, at) = locate(&image).unwrap();
            assert_eq!(at, offset);
            assert_eq!(h.entry, 0x40_0000);
        }
    }

    #[test]
    fn rejects_images_without_magic() {
        let image = vec![0u8; 0x20000];
        assert!(locate(&image).is_none());
        assert!(locate(&[0u8; 16]).is_none());
    }

    #[test]
    fn boot_maps_data_and_zeroed_segments() {
        let image = image_with_header_at(
            0x1000,
            &[
                ImageMapping {
                    vaddr: 0x40_0000,
                    offset: 0x2000,
                    num_pages: 2,
                    zeroed: 0,
                },
                ImageMapping {
                    vaddr: 0x50_0000,
                    offset: 0,
                    num_pages: 1,
                    zeroed: 1,
                },
            ],
        );
        let image_paddr = 0x1000_0000;

        let mut k = Box::new(Kernel::new());
        k.boot(&image, image_paddr).unwrap();

        let init = k.tasks.lookup(abi::Tid::INIT).unwrap();
        assert_eq!(k.tasks.task(init).name(), "boot");
        let vm = k.tasks.task(init).vm();
        assert_eq!(
            vm.resolve(&k.pool, 0x40_0000),
            Some(image_paddr + 0x2000)
        );
        assert_eq!(
            vm.resolve(&k.pool, 0x40_1000),
            Some(image_paddr + 0x3000)
        );
        // The zeroed page is backed by a kernel frame, not image data.
        let bss = vm.resolve(&k.pool, 0x50_0000).unwrap();
        assert!(
            (crate::config::KERNEL_FRAMES_BASE
                ..crate::config::KERNEL_FRAMES_END)
                .contains(&bss)
        );
        assert_eq!(vm.resolve(&k.pool, 0x60_0000), None);
    }

    #[test]
    fn boot_without_an_image_is_an_error() {
        let mut k = Box::new(Kernel::new());
        assert_eq!(k.boot(&[0u8; 64], 0), Err(Error::NotFound));
    }
}
