// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mock collaborators for server tests: a recording kernel and a
//! byte-array "physical memory".

use std::collections::HashMap;

use abi::{
    Error, IpcFlags, MapFlags, Message, Notifications, SourceFilter,
    TaskFlags, Tid, PAGE_SIZE,
};
use userlib::SysApi;

use crate::PageOps;

/// Kernel stand-in that records what the server asked for.
pub struct MockSys {
    pub replies: Vec<(Tid, Message)>,
    pub kills: Vec<Tid>,
    pub maps: Vec<(Tid, u64, u64)>,
    pub map_try_agains: usize,
}

impl MockSys {
    pub fn new() -> Self {
        Self {
            replies: vec![],
            kills: vec![],
            maps: vec![],
            map_try_agains: 0,
        }
    }
}

impl SysApi for MockSys {
    fn ipc(
        &mut self,
        dst: Tid,
        _filter: SourceFilter,
        m: &mut Message,
        flags: IpcFlags,
    ) -> Result<(), Error> {
        assert!(
            flags.contains(IpcFlags::SEND),
            "server logic should only send"
        );
        self.replies.push((dst, *m));
        Ok(())
    }

    fn notify(&mut self, _: Tid, _: Notifications) -> Result<(), Error> {
        Ok(())
    }

    fn spawn(
        &mut self,
        _: Tid,
        _: &str,
        _: u64,
        _: Tid,
        _: TaskFlags,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn kill(&mut self, tid: Tid) -> Result<(), Error> {
        self.kills.push(tid);
        Ok(())
    }

    fn set_attrs(
        &mut self,
        _: u64,
        _: usize,
        _: u32,
    ) -> Result<Tid, Error> {
        Ok(Tid::INIT)
    }

    fn listen_irq(&mut self, _: u32, _: Tid) -> Result<(), Error> {
        Ok(())
    }

    fn map(
        &mut self,
        tid: Tid,
        vaddr: u64,
        src: u64,
        _kpage: u64,
        _flags: MapFlags,
    ) -> Result<(), Error> {
        if self.map_try_agains > 0 {
            self.map_try_agains -= 1;
            return Err(Error::TryAgain);
        }
        self.maps.push((tid, vaddr, src));
        Ok(())
    }

    fn write_log(&mut self, _: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

/// Physical memory as a map of frames, byte-addressed.
pub struct MockPages {
    frames: HashMap<u64, Vec<u8>>,
}

impl MockPages {
    pub fn new() -> Self {
        Self {
            frames: HashMap::new(),
        }
    }

    fn frame(&mut self, base: u64) -> &mut Vec<u8> {
        self.frames
            .entry(base)
            .or_insert_with(|| vec![0; PAGE_SIZE])
    }

    pub fn write(&mut self, paddr: u64, bytes: &[u8]) {
        for (i, &b) in bytes.iter().enumerate() {
            let addr = paddr + i as u64;
            let base = addr & !(PAGE_SIZE as u64 - 1);
            let off = (addr - base) as usize;
            self.frame(base)[off] = b;
        }
    }

    pub fn read(&mut self, paddr: u64, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let addr = paddr + i as u64;
                let base = addr & !(PAGE_SIZE as u64 - 1);
                let off = (addr - base) as usize;
                self.frame(base)[off]
            })
            .collect()
    }
}

impl PageOps for MockPages {
    fn copy(&mut self, dst_paddr: u64, src_paddr: u64, len: usize) {
        let bytes = self.read(src_paddr, len);
        self.write(dst_paddr, &bytes);
    }

    fn zero(&mut self, paddr: u64, len: usize) {
        self.write(paddr, &vec![0; len]);
    }
}
