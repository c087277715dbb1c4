// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The bulk transfer protocol.
//!
//! Payloads too big for the kernel's inline message slot travel through
//! three messages to this server:
//!
//! - `ACCEPT_BULK`: a receiver declares where payloads may land. One
//!   outstanding acceptance per task.
//! - `DO_BULK`: a sender asks for a copy into a receiver's accepted
//!   buffer. If the receiver has not accepted yet, the request parks
//!   (the sender sits in its own IPC call the whole time) and completes
//!   when acceptance arrives.
//! - `VERIFY_BULK`: the receiver confirms the transfer it believes just
//!   happened, consuming the record of it.
//!
//! The copy runs page by page through the pager's translation of both
//! tasks. A task whose buffer does not actually resolve is killed on
//! the spot: a bad source quietly (there is nobody honest to answer),
//! a bad destination with `Unavailable` to the innocent sender.

use abi::{
    AcceptBulkMsg, DoBulkMsg, DoBulkReply, Error, FaultFlags, Message,
    MsgType, Tid, VerifyBulkMsg, VerifyBulkReply, PAGE_SIZE,
};
use userlib::SysApi;

use crate::{page_down, PageOps, Pager};

/// Handles `ACCEPT_BULK`. On success `m` holds the reply.
pub fn handle_accept(
    p: &mut Pager,
    sys: &mut impl SysApi,
    ops: &mut impl PageOps,
    m: &mut Message,
) -> Result<(), Error> {
    let receiver = m.src;
    let req: AcceptBulkMsg = m.read().ok_or(Error::InvalidArg)?;
    let index = p.live_index(receiver).ok_or(Error::NotFound)?;

    if req.addr == 0 || req.len == 0 {
        return Err(Error::InvalidArg);
    }
    if p.tasks[index].bulk_buf != 0 {
        return Err(Error::AlreadyExists);
    }
    p.tasks[index].bulk_buf = req.addr;
    p.tasks[index].bulk_len = req.len;

    // The oldest parked sender, if any, gets its copy now.
    if let Some(sender_index) = p.tasks[index].bulk_waiters.pop_front() {
        if p.tasks[sender_index].in_use {
            let sender = p.tasks[sender_index].tid;
            let mut queued = p.tasks[sender_index].queued_send;
            match handle_send(p, sys, ops, &mut queued) {
                Ok(()) => sys.reply(sender, &mut queued),
                Err(Error::DontReply) => {}
                Err(e) => sys.reply_err(sender, e),
            }
        }
    }

    *m = Message::new(MsgType::ACCEPT_BULK_REPLY);
    Ok(())
}

/// Handles `DO_BULK`. On success `m` holds the reply; `DontReply` means
/// the request parked behind a missing acceptance.
pub fn handle_send(
    p: &mut Pager,
    sys: &mut impl SysApi,
    ops: &mut impl PageOps,
    m: &mut Message,
) -> Result<(), Error> {
    let sender = m.src;
    let req: DoBulkMsg = m.read().ok_or(Error::InvalidArg)?;
    let sender_index = p.live_index(sender).ok_or(Error::NotFound)?;
    let dst_index = p.live_index(req.dst).ok_or(Error::NotFound)?;

    if p.tasks[dst_index].bulk_buf == 0 {
        // No acceptance yet: remember the request; acceptance will
        // replay it.
        p.tasks[sender_index].queued_send = *m;
        if !p.tasks[dst_index].bulk_waiters.push_back(sender_index) {
            return Err(Error::NoMemory);
        }
        return Err(Error::DontReply);
    }

    let len = req.len.min(p.tasks[dst_index].bulk_len);
    let mut remaining = len;
    let mut src_buf = req.addr;
    let mut dst_buf = p.tasks[dst_index].bulk_buf;
    while remaining > 0 {
        let src_off = src_buf % PAGE_SIZE as u64;
        let dst_off = dst_buf % PAGE_SIZE as u64;
        let n = remaining
            .min(PAGE_SIZE as u64 - src_off)
            .min(PAGE_SIZE as u64 - dst_off);

        let src_paddr = match resolve_copy_page(p, ops, sender, src_buf) {
            Some(paddr) => paddr,
            None => {
                // The sender lied about its own buffer.
                p.kill(sys, sender);
                return Err(Error::DontReply);
            }
        };
        let dst_paddr = match resolve_copy_page(p, ops, req.dst, dst_buf) {
            Some(paddr) => paddr,
            None => {
                p.kill(sys, req.dst);
                return Err(Error::Unavailable);
            }
        };

        ops.copy(dst_paddr + dst_off, src_paddr + src_off, n as usize);
        remaining -= n;
        src_buf += n;
        dst_buf += n;
    }

    let dst = &mut p.tasks[dst_index];
    dst.recv_from = sender;
    dst.recv_id = dst.bulk_buf;
    dst.recv_len = len;
    dst.bulk_buf = 0;
    dst.bulk_len = 0;

    *m = Message::with(
        MsgType::DO_BULK_REPLY,
        DoBulkReply { id: dst.recv_id },
    );
    Ok(())
}

/// Handles `VERIFY_BULK`: the receiver's claim must match the recorded
/// transfer exactly, and matching consumes the record.
pub fn handle_verify(p: &mut Pager, m: &mut Message) -> Result<(), Error> {
    let receiver = m.src;
    let req: VerifyBulkMsg = m.read().ok_or(Error::InvalidArg)?;
    let index = p.live_index(receiver).ok_or(Error::NotFound)?;

    let t = &mut p.tasks[index];
    if req.src != t.recv_from
        || req.id != t.recv_id
        || req.len != t.recv_len
    {
        return Err(Error::InvalidArg);
    }

    *m = Message::with(
        MsgType::VERIFY_BULK_REPLY,
        VerifyBulkReply {
            received_at: t.recv_id,
        },
    );
    t.recv_from = Tid(0);
    t.recv_id = 0;
    t.recv_len = 0;
    Ok(())
}

/// Resolves one byte address of a copy participant to its frame. The
/// initial task's addresses are already physical.
fn resolve_copy_page(
    p: &mut Pager,
    ops: &mut impl PageOps,
    tid: Tid,
    addr: u64,
) -> Option<u64> {
    if tid == Tid::INIT {
        return Some(page_down(addr));
    }
    p.fault_in(ops, tid, page_down(addr), FaultFlags::USER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pages::RAM_BASE;
    use crate::testsupport::{MockPages, MockSys};

    const ALICE: Tid = Tid(2);
    const BOB: Tid = Tid(3);

    fn pager() -> Pager {
        let mut p = Pager::new();
        p.register_task(ALICE, "alice").unwrap();
        p.register_task(BOB, "bob").unwrap();
        // Alice: 2 pages at 0x10_0000; Bob: 2 pages at 0x20_0000.
        p.grant_area(ALICE, 0x10_0000, RAM_BASE, 2).unwrap();
        p.grant_area(BOB, 0x20_0000, RAM_BASE + 0x2000, 2).unwrap();
        p.frames.incref(RAM_BASE, 1).unwrap();
        p.frames.incref(RAM_BASE + 0x1000, 1).unwrap();
        p.frames.incref(RAM_BASE + 0x2000, 1).unwrap();
        p.frames.incref(RAM_BASE + 0x3000, 1).unwrap();
        p
    }

    fn accept(addr: u64, len: u64) -> Message {
        let mut m =
            Message::with(MsgType::ACCEPT_BULK, AcceptBulkMsg { addr, len });
        m.src = BOB;
        m
    }

    fn send(dst: Tid, addr: u64, len: u64) -> Message {
        let mut m = Message::with(
            MsgType::DO_BULK,
            DoBulkMsg {
                addr,
                len,
                dst,
                reserved: 0,
            },
        );
        m.src = ALICE;
        m
    }

    #[test]
    fn accept_then_send_copies_across_pages() {
        let mut p = pager();
        let mut sys = MockSys::new();
        let mut ops = MockPages::new();

        // Payload crosses Alice's first page boundary.
        let payload: Vec<u8> = (0..0x180u64).map(|i| i as u8).collect();
        ops.write(RAM_BASE + 0xF80, &payload);

        let mut m = accept(0x20_0100, 0x1000);
        handle_accept(&mut p, &mut sys, &mut ops, &mut m).unwrap();
        assert_eq!(m.ty, MsgType::ACCEPT_BULK_REPLY);

        let mut m = send(BOB, 0x10_0F80, 0x180);
        handle_send(&mut p, &mut sys, &mut ops, &mut m).unwrap();
        assert_eq!(m.ty, MsgType::DO_BULK_REPLY);
        let reply: DoBulkReply = m.read().unwrap();
        assert_eq!(reply.id, 0x20_0100);

        // Landed at Bob's buffer offset, across his page boundary too?
        // 0x20_0100 is offset 0x100 into his first page (frame +0x2000).
        assert_eq!(ops.read(RAM_BASE + 0x2100, 0x180), payload);

        // Transfer recorded and consumed exactly once.
        let bi = p.live_index(BOB).unwrap();
        assert_eq!(p.tasks[bi].recv_from, ALICE);
        assert_eq!(p.tasks[bi].recv_len, 0x180);
        assert_eq!(p.tasks[bi].bulk_buf, 0);

        let mut v = Message::with(
            MsgType::VERIFY_BULK,
            VerifyBulkMsg {
                id: 0x20_0100,
                len: 0x180,
                src: ALICE,
                reserved: 0,
            },
        );
        v.src = BOB;
        handle_verify(&mut p, &mut v).unwrap();
        assert_eq!(v.ty, MsgType::VERIFY_BULK_REPLY);
        let vr: VerifyBulkReply = v.read().unwrap();
        assert_eq!(vr.received_at, 0x20_0100);

        let mut again = Message::with(
            MsgType::VERIFY_BULK,
            VerifyBulkMsg {
                id: 0x20_0100,
                len: 0x180,
                src: ALICE,
                reserved: 0,
            },
        );
        again.src = BOB;
        assert_eq!(
            handle_verify(&mut p, &mut again),
            Err(Error::InvalidArg)
        );
    }

    #[test]
    fn send_before_accept_parks_and_replays() {
        let mut p = pager();
        let mut sys = MockSys::new();
        let mut ops = MockPages::new();
        ops.write(RAM_BASE, b"queued payload");

        let mut m = send(BOB, 0x10_0000, 14);
        assert_eq!(
            handle_send(&mut p, &mut sys, &mut ops, &mut m),
            Err(Error::DontReply)
        );
        assert!(sys.replies.is_empty());

        let mut m = accept(0x20_0000, 0x1000);
        handle_accept(&mut p, &mut sys, &mut ops, &mut m).unwrap();

        // The parked sender got its reply out of band.
        assert_eq!(sys.replies.len(), 1);
        let (to, reply) = &sys.replies[0];
        assert_eq!(*to, ALICE);
        assert_eq!(reply.ty, MsgType::DO_BULK_REPLY);
        assert_eq!(ops.read(RAM_BASE + 0x2000, 14), b"queued payload");
    }

    #[test]
    fn one_outstanding_acceptance_per_task() {
        let mut p = pager();
        let mut sys = MockSys::new();
        let mut ops = MockPages::new();

        let mut m = accept(0x20_0000, 0x1000);
        handle_accept(&mut p, &mut sys, &mut ops, &mut m).unwrap();
        let mut m = accept(0x20_1000, 0x1000);
        assert_eq!(
            handle_accept(&mut p, &mut sys, &mut ops, &mut m),
            Err(Error::AlreadyExists)
        );
        let mut m = accept(0, 0x1000);
        assert_eq!(
            handle_accept(&mut p, &mut sys, &mut ops, &mut m),
            Err(Error::InvalidArg)
        );
    }

    #[test]
    fn copies_truncate_to_the_accepted_length() {
        let mut p = pager();
        let mut sys = MockSys::new();
        let mut ops = MockPages::new();
        ops.write(RAM_BASE, &[0xAAu8; 0x400]);

        let mut m = accept(0x20_0000, 0x100);
        handle_accept(&mut p, &mut sys, &mut ops, &mut m).unwrap();
        let mut m = send(BOB, 0x10_0000, 0x400);
        handle_send(&mut p, &mut sys, &mut ops, &mut m).unwrap();

        let bi = p.live_index(BOB).unwrap();
        assert_eq!(p.tasks[bi].recv_len, 0x100);
        assert_eq!(ops.read(RAM_BASE + 0x2000, 0x100), vec![0xAA; 0x100]);
        // Nothing past the accepted window.
        assert_eq!(ops.read(RAM_BASE + 0x2100, 1), vec![0]);
    }

    #[test]
    fn unresolvable_source_kills_the_sender() {
        let mut p = pager();
        let mut sys = MockSys::new();
        let mut ops = MockPages::new();

        let mut m = accept(0x20_0000, 0x1000);
        handle_accept(&mut p, &mut sys, &mut ops, &mut m).unwrap();

        // Alice names a buffer she has no claim to.
        let mut m = send(BOB, 0x9999_0000, 0x10);
        assert_eq!(
            handle_send(&mut p, &mut sys, &mut ops, &mut m),
            Err(Error::DontReply)
        );
        assert_eq!(sys.kills, vec![ALICE]);
        assert!(!p.task_in_use(ALICE));
    }

    #[test]
    fn unresolvable_destination_kills_it_and_reports_unavailable() {
        let mut p = pager();
        let mut sys = MockSys::new();
        let mut ops = MockPages::new();

        // Bob accepts a buffer outside anything he owns.
        let mut m = accept(0x7777_0000, 0x1000);
        handle_accept(&mut p, &mut sys, &mut ops, &mut m).unwrap();

        let mut m = send(BOB, 0x10_0000, 0x10);
        assert_eq!(
            handle_send(&mut p, &mut sys, &mut ops, &mut m),
            Err(Error::Unavailable)
        );
        assert_eq!(sys.kills, vec![BOB]);
    }

    #[test]
    fn demand_zero_window_faults_in_during_copy() {
        let mut p = pager();
        let mut sys = MockSys::new();
        let mut ops = MockPages::new();
        ops.write(RAM_BASE, b"to the heap");

        // Bob accepts a buffer in the demand-zero window he has never
        // touched; the copy faults the page in.
        let mut m = accept(crate::ZEROED_BASE + 0x40, 0x1000);
        handle_accept(&mut p, &mut sys, &mut ops, &mut m).unwrap();
        let mut m = send(BOB, 0x10_0000, 11);
        handle_send(&mut p, &mut sys, &mut ops, &mut m).unwrap();

        let bi = p.live_index(BOB).unwrap();
        let frame = p.tasks[bi]
            .area_lookup(crate::ZEROED_BASE)
            .expect("page should have faulted in");
        assert_eq!(ops.read(frame + 0x40, 11), b"to the heap");
    }
}
