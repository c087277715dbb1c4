// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task-side interface to the kernel.
//!
//! Server and driver code talks to the kernel through the [`SysApi`]
//! trait rather than raw syscall stubs. The bare-metal implementation is
//! a thin wrapper over the architecture's trap instruction and lives with
//! the arch support; everything above it -- servers included -- only sees
//! the trait, which is also what lets server logic run under test against
//! a mock kernel.

#![cfg_attr(not(test), no_std)]

use abi::{
    Error, IpcFlags, MapFlags, Message, Notifications, SourceFilter,
    TaskFlags, Tid,
};

/// The system call surface, one method per call, plus the IPC idioms
/// everything is built from.
pub trait SysApi {
    /// Raw rendezvous: send to `dst` and/or receive through `m`
    /// according to `flags`.
    fn ipc(
        &mut self,
        dst: Tid,
        filter: SourceFilter,
        m: &mut Message,
        flags: IpcFlags,
    ) -> Result<(), Error>;

    /// Posts notification bits to `dst`.
    fn notify(&mut self, dst: Tid, bits: Notifications) -> Result<(), Error>;

    fn spawn(
        &mut self,
        tid: Tid,
        name: &str,
        entry: u64,
        pager: Tid,
        flags: TaskFlags,
    ) -> Result<(), Error>;

    fn kill(&mut self, tid: Tid) -> Result<(), Error>;

    fn set_attrs(
        &mut self,
        bulk_ptr: u64,
        bulk_len: usize,
        timeout_ms: u32,
    ) -> Result<Tid, Error>;

    fn listen_irq(&mut self, irq: u32, listener: Tid) -> Result<(), Error>;

    fn map(
        &mut self,
        tid: Tid,
        vaddr: u64,
        src: u64,
        kpage: u64,
        flags: MapFlags,
    ) -> Result<(), Error>;

    fn write_log(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Open or closed receive.
    fn recv(
        &mut self,
        filter: SourceFilter,
        m: &mut Message,
    ) -> Result<(), Error> {
        self.ipc(Tid::KERNEL, filter, m, IpcFlags::RECV)
    }

    /// Blocking send.
    fn send(&mut self, dst: Tid, m: &mut Message) -> Result<(), Error> {
        self.ipc(dst, SourceFilter::Deny, m, IpcFlags::SEND)
    }

    /// Send, then wait for the peer's reply in the same slot.
    fn call(&mut self, dst: Tid, m: &mut Message) -> Result<(), Error> {
        self.ipc(dst, SourceFilter::Task(dst), m, IpcFlags::CALL)
    }

    /// Best-effort reply: servers must never block on a client, and a
    /// client that died mid-call is not the server's problem.
    fn reply(&mut self, dst: Tid, m: &mut Message) {
        let _ = self.ipc(
            dst,
            SourceFilter::Deny,
            m,
            IpcFlags::SEND | IpcFlags::NOBLOCK,
        );
    }

    /// Best-effort error reply.
    fn reply_err(&mut self, dst: Tid, err: Error) {
        let mut m = Message::error(err);
        self.reply(dst, &mut m);
    }
}

/// Installs one page of translation in `tid`, feeding the kernel fresh
/// kernel pages from `alloc_kpage` for as long as the table walk keeps
/// asking.
pub fn map_page(
    sys: &mut impl SysApi,
    tid: Tid,
    vaddr: u64,
    paddr: u64,
    flags: MapFlags,
    mut alloc_kpage: impl FnMut() -> Option<u64>,
) -> Result<(), Error> {
    loop {
        let kpage = alloc_kpage().ok_or(Error::NoMemory)?;
        match sys.map(tid, vaddr, paddr, kpage, flags | MapFlags::UPDATE) {
            Err(Error::TryAgain) => continue,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Mock kernel that needs a couple of kpages before a map sticks.
    struct Grumpy {
        tries_left: usize,
        mapped: Vec<(u64, u64, u64)>,
    }

    impl SysApi for Grumpy {
        fn ipc(
            &mut self,
            _: Tid,
            _: SourceFilter,
            _: &mut Message,
            _: IpcFlags,
        ) -> Result<(), Error> {
            unimplemented!()
        }
        fn notify(&mut self, _: Tid, _: Notifications) -> Result<(), Error> {
            unimplemented!()
        }
        fn spawn(
            &mut self,
            _: Tid,
            _: &str,
            _: u64,
            _: Tid,
            _: TaskFlags,
        ) -> Result<(), Error> {
            unimplemented!()
        }
        fn kill(&mut self, _: Tid) -> Result<(), Error> {
            unimplemented!()
        }
        fn set_attrs(
            &mut self,
            _: u64,
            _: usize,
            _: u32,
        ) -> Result<Tid, Error> {
            unimplemented!()
        }
        fn listen_irq(&mut self, _: u32, _: Tid) -> Result<(), Error> {
            unimplemented!()
        }
        fn map(
            &mut self,
            _: Tid,
            vaddr: u64,
            src: u64,
            kpage: u64,
            _: MapFlags,
        ) -> Result<(), Error> {
            if self.tries_left > 0 {
                self.tries_left -= 1;
                return Err(Error::TryAgain);
            }
            self.mapped.push((vaddr, src, kpage));
            Ok(())
        }
        fn write_log(&mut self, _: &[u8]) -> Result<(), Error> {
            unimplemented!()
        }
    }

    #[test]
    fn map_page_retries_until_the_walk_is_fed() {
        let mut sys = Grumpy {
            tries_left: 3,
            mapped: vec![],
        };
        let mut next = 0x9000;
        let result = map_page(
            &mut sys,
            Tid(2),
            0x4000,
            0x8000,
            MapFlags::WRITABLE,
            || {
                let p = next;
                next += 0x1000;
                Some(p)
            },
        );
        assert_eq!(result, Ok(()));
        // Three kpages consumed by retries, the fourth carried the final
        // attempt.
        assert_eq!(sys.mapped, vec![(0x4000, 0x8000, 0xC000)]);
    }

    #[test]
    fn map_page_surfaces_allocator_exhaustion() {
        let mut sys = Grumpy {
            tries_left: 99,
            mapped: vec![],
        };
        let mut kpages_left = 2;
        let result =
            map_page(&mut sys, Tid(2), 0, 0, MapFlags::empty(), || {
                if kpages_left == 0 {
                    None
                } else {
                    kpages_left -= 1;
                    Some(0x1000)
                }
            });
        assert_eq!(result, Err(Error::NoMemory));
    }
}
