// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The pager's message loop.
//!
//! One open receive, one dispatch. Kernel-originated messages (faults,
//! exceptions) are authenticated by their source ID -- a task can write
//! any *payload* it likes, but only the kernel sends from ID zero, so a
//! forged fault just gets dropped.

use abi::{
    AllocPagesMsg, AllocPagesReply, Error, ExceptionMsg, ExceptionReason,
    FaultFlags, LookupReply, Message, MsgType, PageFaultMsg, ServiceNameMsg,
    SourceFilter, Tid,
};
use userlib::SysApi;

use crate::{copy_name, page_down, PageOps, Pager, Service};

/// Receives and handles messages forever. The board support constructs
/// the pager state and its collaborators, then parks here.
pub fn run(
    p: &mut Pager,
    sys: &mut impl SysApi,
    ops: &mut impl PageOps,
) -> ! {
    loop {
        let mut m = Message::new(MsgType(0));
        match sys.recv(SourceFilter::Any, &mut m) {
            Ok(()) => handle_message(p, sys, ops, &mut m),
            Err(_) => continue,
        }
    }
}

/// Dispatches one incoming message.
pub fn handle_message(
    p: &mut Pager,
    sys: &mut impl SysApi,
    ops: &mut impl PageOps,
    m: &mut Message,
) {
    let src = m.src;
    match m.ty {
        t if t.is(MsgType::ACCEPT_BULK) => {
            let r = crate::bulk::handle_accept(p, sys, ops, m);
            finish(sys, src, r, m);
        }
        t if t.is(MsgType::DO_BULK) => {
            let r = crate::bulk::handle_send(p, sys, ops, m);
            finish(sys, src, r, m);
        }
        t if t.is(MsgType::VERIFY_BULK) => {
            let r = crate::bulk::handle_verify(p, m);
            finish(sys, src, r, m);
        }
        t if t.is(MsgType::EXCEPTION) => handle_exception(p, sys, src, m),
        t if t.is(MsgType::PAGE_FAULT) => {
            handle_page_fault(p, sys, ops, src, m)
        }
        t if t.is(MsgType::SERVE) => {
            let r = handle_serve(p, sys, src, m);
            finish(sys, src, r, m);
        }
        t if t.is(MsgType::LOOKUP) => {
            let r = handle_lookup(p, src, m);
            finish(sys, src, r, m);
        }
        t if t.is(MsgType::ALLOC_PAGES) => {
            let r = handle_alloc_pages(p, src, m);
            finish(sys, src, r, m);
        }
        _ => {
            // Unknown message; nothing sensible to do with it.
        }
    }
}

fn finish(
    sys: &mut impl SysApi,
    src: Tid,
    result: Result<(), Error>,
    m: &mut Message,
) {
    match result {
        Ok(()) => sys.reply(src, m),
        Err(Error::DontReply) => {}
        Err(e) => sys.reply_err(src, e),
    }
}

fn handle_exception(
    p: &mut Pager,
    sys: &mut impl SysApi,
    src: Tid,
    m: &Message,
) {
    if src != Tid::KERNEL {
        // Forged; ignore.
        return;
    }
    let Some(e) = m.read::<ExceptionMsg>() else {
        return;
    };
    // Grace exits and crashes end the same way; the reason only matters
    // for whoever is watching the logs.
    p.kill(sys, e.task);
}

fn handle_page_fault(
    p: &mut Pager,
    sys: &mut impl SysApi,
    ops: &mut impl PageOps,
    src: Tid,
    m: &Message,
) {
    if src != Tid::KERNEL {
        return;
    }
    let Some(pf) = m.read::<PageFaultMsg>() else {
        return;
    };
    let fault = FaultFlags::from_bits_truncate(pf.fault);

    match p.fault_in(ops, pf.task, pf.vaddr, fault) {
        Some(paddr) => {
            let frames = &mut p.frames;
            let mapped = userlib::map_page(
                sys,
                pf.task,
                page_down(pf.vaddr),
                paddr,
                abi::MapFlags::WRITABLE,
                || frames.alloc(1),
            );
            match mapped {
                Ok(()) => {
                    let mut r = Message::new(MsgType::PAGE_FAULT_REPLY);
                    sys.reply(pf.task, &mut r);
                }
                Err(_) => p.kill(sys, pf.task),
            }
        }
        None => {
            // Invalid access; there is no mapping to be had.
            p.kill(sys, pf.task);
        }
    }
}

fn handle_serve(
    p: &mut Pager,
    sys: &mut impl SysApi,
    src: Tid,
    m: &mut Message,
) -> Result<(), Error> {
    let req: ServiceNameMsg = m.read().ok_or(Error::InvalidArg)?;
    let slot = p
        .services
        .iter_mut()
        .find(|s| s.is_none())
        .ok_or(Error::NoMemory)?;
    *slot = Some(Service {
        name: req.name,
        task: src,
    });

    // Anyone parked on this name gets its answer now.
    for task in &mut p.tasks {
        if task.in_use && task.waiting_for[0] != 0 && task.waiting_for == req.name
        {
            task.waiting_for = [0; abi::SERVICE_NAME_LEN];
            let mut r = Message::with(
                MsgType::LOOKUP_REPLY,
                LookupReply {
                    task: src,
                    reserved: 0,
                },
            );
            sys.reply(task.tid, &mut r);
        }
    }

    *m = Message::new(MsgType::SERVE_REPLY);
    Ok(())
}

fn handle_lookup(
    p: &mut Pager,
    src: Tid,
    m: &mut Message,
) -> Result<(), Error> {
    let req: ServiceNameMsg = m.read().ok_or(Error::InvalidArg)?;
    if let Some(service) = p
        .services
        .iter()
        .flatten()
        .find(|s| s.name == req.name)
    {
        *m = Message::with(
            MsgType::LOOKUP_REPLY,
            LookupReply {
                task: service.task,
                reserved: 0,
            },
        );
        return Ok(());
    }

    // Not registered yet: park the caller until somebody serves it.
    let index = p.live_index(src).ok_or(Error::NotFound)?;
    copy_name(&mut p.tasks[index].waiting_for, &req.name);
    Err(Error::DontReply)
}

fn handle_alloc_pages(
    p: &mut Pager,
    src: Tid,
    m: &mut Message,
) -> Result<(), Error> {
    let req: AllocPagesMsg = m.read().ok_or(Error::InvalidArg)?;
    let index = p.live_index(src).ok_or(Error::NotFound)?;
    let num_pages = req.num_pages as usize;
    if num_pages == 0 {
        return Err(Error::InvalidArg);
    }

    let paddr = if req.paddr != 0 {
        // Caller wants a specific physical range (device-adjacent
        // buffers); it must be in managed RAM.
        p.frames.incref(req.paddr, num_pages)?;
        req.paddr
    } else {
        p.frames.alloc(num_pages).ok_or(Error::NoMemory)?
    };

    let Some(vaddr) = p.tasks[index].alloc_virt(num_pages) else {
        p.frames.decref(paddr, num_pages);
        return Err(Error::NoMemory);
    };
    p.tasks[index].add_area(vaddr, paddr, num_pages as u32)?;

    *m = Message::with(
        MsgType::ALLOC_PAGES_REPLY,
        AllocPagesReply { vaddr, paddr },
    );
    Ok(())
}
