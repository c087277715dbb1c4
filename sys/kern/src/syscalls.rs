// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall implementation.
//!
//! The arch trap entry saves the caller's registers and calls
//! [`handle_syscall`]. Syscalls are implemented by functions with the
//! signature
//!
//! ```ignore
//! fn syscall(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError>;
//! ```
//!
//! On success each implementation has written the caller's return
//! register (or left the caller blocked, to be completed by its peer);
//! the `NextTask` is a scheduling hint. A `UserError` is either recorded
//! as a negative return word or, for fatal misbehavior, routes the caller
//! to its pager -- the common wrapper at the bottom of `handle_syscall`
//! takes care of both, reducing code in each syscall.

use core::convert::TryFrom;

use abi::{
    Error, IpcFlags, MapFlags, Message, Notifications, SourceFilter, Sysnum,
    TaskFlags, Tid,
};

use crate::config::{
    BULK_BUFFER_MIN, KDEBUG_CMD_LEN, KERNEL_PADDR_END, LOG_CHUNK_LEN,
    PAGE_SIZE, TASK_NAME_LEN,
};
use crate::err::UserError;
use crate::ipc;
use crate::startup::Kernel;
use crate::task::{ArchState, NextTask};
use crate::umem;
use crate::vm::PteFlags;

/// Entry point for a syscall by `caller`, whose registers are already
/// saved. Returns the scheduling decision for the arch layer to apply.
pub fn handle_syscall(k: &mut Kernel, caller: usize) -> NextTask {
    let nr = k.tasks.task(caller).save().syscall_descriptor();
    let res = match Sysnum::try_from(nr) {
        Ok(Sysnum::Spawn) => sys_spawn(k, caller),
        Ok(Sysnum::Kill) => sys_kill(k, caller),
        Ok(Sysnum::SetAttrs) => sys_set_attrs(k, caller),
        Ok(Sysnum::Ipc) => sys_ipc(k, caller),
        Ok(Sysnum::ListenIrq) => sys_listen_irq(k, caller),
        Ok(Sysnum::WriteLog) => sys_write_log(k, caller),
        Ok(Sysnum::ReadLog) => sys_read_log(k, caller),
        Ok(Sysnum::Kdebug) => sys_kdebug(k, caller),
        Ok(Sysnum::Map) => sys_map(k, caller),
        Err(()) => Err(Error::InvalidArg.into()),
    };
    match res {
        Ok(hint) => hint,
        Err(UserError::Recoverable(e)) => {
            k.tasks
                .task_mut(caller)
                .save_mut()
                .set_return_value(e.code());
            NextTask::Same
        }
        Err(UserError::Fatal(reason)) => k.tasks.force_exit(caller, reason),
    }
}

/// Writes the success return word and keeps the caller running.
fn success(k: &mut Kernel, caller: usize, value: i64) -> NextTask {
    k.tasks
        .task_mut(caller)
        .save_mut()
        .set_return_value(value);
    NextTask::Same
}

/// `Spawn(tid, name, entry, pager, flags)`: initializes and starts a
/// task in an unused slot.
fn sys_spawn(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let save = k.tasks.task(caller).save();
    let (tid, name_ptr, entry, pager_tid, flags_raw) = (
        save.arg0() as i32,
        save.arg1(),
        save.arg2(),
        save.arg3() as i32,
        save.arg4() as u32,
    );

    let target = k.tasks.lookup_unchecked(Tid(tid))?;
    if target == caller {
        return Err(Error::InvalidArg.into());
    }
    let pager = k.tasks.lookup(Tid(pager_tid))?;
    let flags =
        TaskFlags::from_bits(flags_raw).ok_or(Error::InvalidArg)?;

    let mut name = [0u8; TASK_NAME_LEN];
    umem::read_cstr(name_ptr, &mut name)?;

    k.tasks.create(target, &name, entry, Some(pager), flags)?;
    Ok(success(k, caller, 0))
}

/// `Kill(tid)`: destroys a task, or exits the caller when `tid` is zero.
fn sys_kill(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let tid = k.tasks.task(caller).save().arg0() as i32;
    if tid == 0 {
        return Ok(k
            .tasks
            .force_exit(caller, abi::ExceptionReason::GraceExit));
    }

    let victim = k.tasks.lookup(Tid(tid))?;
    if victim == caller {
        return Err(Error::InvalidArg.into());
    }
    // Reaping a task is for its pager (or the root of the system).
    if k.tasks.task(caller).tid() != Tid::INIT
        && k.tasks.task(victim).pager() != Some(caller)
    {
        return Err(Error::NotPermitted.into());
    }

    let Kernel {
        tasks, pool, klog, ..
    } = k;
    tasks.destroy(pool, victim, Some(caller))?;
    klog.forget_listener(victim);
    Ok(success(k, caller, 0))
}

/// `SetAttrs(bulk_ptr, bulk_len, timeout_ms)`: adjusts per-task knobs
/// and tells the caller its own ID.
fn sys_set_attrs(
    k: &mut Kernel,
    caller: usize,
) -> Result<NextTask, UserError> {
    let save = k.tasks.task(caller).save();
    let (bulk_ptr, bulk_len, timeout_ms) =
        (save.arg0(), save.arg1() as usize, save.arg2() as u32);

    if bulk_ptr != 0 {
        // The buffer itself belongs to the bulk protocol; the kernel
        // only polices the declared size.
        if bulk_len < BULK_BUFFER_MIN {
            return Err(Error::TooSmall.into());
        }
        umem::check_range(bulk_ptr, bulk_len)?;
    }
    if timeout_ms != 0 {
        k.tasks.task_mut(caller).set_timeout_ms(timeout_ms);
    }
    let tid = k.tasks.task(caller).tid().0 as i64;
    Ok(success(k, caller, tid))
}

/// `Ipc(dst, src_filter, msg, flags)`: the rendezvous, notification
/// post, or both halves of a call.
fn sys_ipc(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let args = ipc::ipc_args(k.tasks.task(caller).save());
    let flags =
        IpcFlags::from_bits(args.flags_raw).ok_or(Error::InvalidArg)?;
    if flags.contains(IpcFlags::KERNEL) {
        return Err(Error::InvalidArg.into());
    }
    let filter = SourceFilter::from_raw(args.filter_raw)?;

    if flags.contains(IpcFlags::NOTIFY) {
        if flags.intersects(IpcFlags::SEND | IpcFlags::RECV) {
            return Err(Error::InvalidArg.into());
        }
        let dst = k.tasks.lookup(Tid(args.dst_raw))?;
        // Under NOTIFY the message register carries the bits.
        let bits = Notifications::from_bits_truncate(args.msg_ptr);
        let hint = if k.tasks.notify(dst, bits) {
            NextTask::Specific(dst)
        } else {
            NextTask::Same
        };
        return Ok(success(k, caller, 0).combine(hint));
    }

    if !flags.intersects(IpcFlags::SEND | IpcFlags::RECV) {
        return Err(Error::InvalidArg.into());
    }

    let dst = if flags.contains(IpcFlags::SEND) {
        Some(k.tasks.lookup(Tid(args.dst_raw))?)
    } else {
        None
    };

    if flags.contains(IpcFlags::SEND) {
        let mut m: Message = umem::read_obj(args.msg_ptr)?;
        m.src = k.tasks.task(caller).tid();
        k.tasks.task_mut(caller).stage_message(m);
    } else {
        // Receive-only: the slot must at least be plausible before we
        // let a sender complete us into it.
        umem::check_range(args.msg_ptr, core::mem::size_of::<Message>())?;
    }

    ipc::user_ipc(&mut k.tasks, caller, dst, filter, flags)
}

/// `ListenIrq(irq, listener)`: claims or releases an interrupt line.
fn sys_listen_irq(
    k: &mut Kernel,
    caller: usize,
) -> Result<NextTask, UserError> {
    let save = k.tasks.task(caller).save();
    let (irq, listener) = (save.arg0() as usize, save.arg1() as i32);

    if listener != 0 {
        let target = k.tasks.lookup(Tid(listener))?;
        k.tasks.listen_irq(target, irq)?;
    } else {
        k.tasks.unlisten_irq(irq)?;
    }
    Ok(success(k, caller, 0))
}

/// `WriteLog(buf, len)`: appends user bytes to the kernel log.
fn sys_write_log(
    k: &mut Kernel,
    caller: usize,
) -> Result<NextTask, UserError> {
    let save = k.tasks.task(caller).save();
    let (buf, len) = (save.arg0(), save.arg1() as usize);

    let mut kbuf = [0u8; LOG_CHUNK_LEN];
    let mut copied = 0;
    while copied < len {
        let n = (len - copied).min(LOG_CHUNK_LEN);
        umem::read_bytes(buf + copied as u64, &mut kbuf[..n])?;
        k.klog.write(&kbuf[..n]);
        copied += n;
    }

    let hint = match k.klog.listener() {
        Some(listener) if len > 0 => {
            if k.tasks.notify(listener, Notifications::NEW_DATA) {
                NextTask::Specific(listener)
            } else {
                NextTask::Same
            }
        }
        _ => NextTask::Same,
    };
    Ok(success(k, caller, 0).combine(hint))
}

/// `ReadLog(buf, len, listen)`: drains the kernel log and optionally
/// subscribes the caller to `NEW_DATA` notifications.
fn sys_read_log(
    k: &mut Kernel,
    caller: usize,
) -> Result<NextTask, UserError> {
    let save = k.tasks.task(caller).save();
    let (buf, len, listen) =
        (save.arg0(), save.arg1() as usize, save.arg2());

    let mut kbuf = [0u8; LOG_CHUNK_LEN];
    let mut copied = 0;
    while copied < len {
        let n = k.klog.read(&mut kbuf[..(len - copied).min(LOG_CHUNK_LEN)]);
        if n == 0 {
            break;
        }
        umem::write_bytes(buf + copied as u64, &kbuf[..n])?;
        copied += n;
    }

    k.klog
        .set_listener(if listen != 0 { Some(caller) } else { None });
    Ok(success(k, caller, copied as i64))
}

/// `Kdebug(cmd)`: runs a kernel debug command.
fn sys_kdebug(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let cmd_ptr = k.tasks.task(caller).save().arg0();
    let mut cmd = [0u8; KDEBUG_CMD_LEN];
    umem::read_cstr(cmd_ptr, &mut cmd)?;
    let end = cmd.iter().position(|&b| b == 0).unwrap_or(cmd.len());
    let cmd =
        core::str::from_utf8(&cmd[..end]).map_err(|_| Error::InvalidArg)?;

    let value = crate::kdebug::run(k, cmd)?;
    Ok(success(k, caller, value))
}

/// Turns a caller-relative address into a physical one: through the
/// caller's own map normally, or taken as already-physical for the
/// initial task, which runs before any paging exists. Kernel frames are
/// never handed out.
fn resolve_caller_paddr(
    k: &Kernel,
    caller: usize,
    vaddr: u64,
) -> Result<u64, Error> {
    if k.tasks.task(caller).tid() == Tid::INIT {
        if vaddr < KERNEL_PADDR_END {
            return Err(Error::NotFound);
        }
        Ok(vaddr)
    } else {
        k.tasks
            .task(caller)
            .vm()
            .resolve(&k.pool, vaddr)
            .ok_or(Error::NotFound)
    }
}

/// `Map(tid, vaddr, src, kpage, flags)`: installs or removes one page of
/// translation in the target task, with `kpage` backing any intermediate
/// table the walk needs.
fn sys_map(k: &mut Kernel, caller: usize) -> Result<NextTask, UserError> {
    let save = k.tasks.task(caller).save();
    let (tid, vaddr, src, kpage, flags_raw) = (
        save.arg0() as i32,
        save.arg1(),
        save.arg2(),
        save.arg3(),
        save.arg4() as u32,
    );

    if vaddr as usize % PAGE_SIZE != 0
        || src as usize % PAGE_SIZE != 0
        || kpage as usize % PAGE_SIZE != 0
    {
        return Err(Error::InvalidArg.into());
    }
    let flags = MapFlags::from_bits(flags_raw).ok_or(Error::InvalidArg)?;
    if !flags.intersects(MapFlags::UPDATE | MapFlags::DELETE) {
        return Err(Error::InvalidArg.into());
    }

    let target = k.tasks.lookup(Tid(tid))?;
    if target != caller
        && k.tasks.task(caller).tid() != Tid::INIT
        && k.tasks.task(target).pager() != Some(caller)
    {
        return Err(Error::NotPermitted.into());
    }

    let src_paddr = resolve_caller_paddr(k, caller, src)?;
    let kpage_paddr = resolve_caller_paddr(k, caller, kpage)?;

    let Kernel { tasks, pool, .. } = k;
    let space = tasks.task_mut(target).vm_mut();
    if flags.contains(MapFlags::DELETE) {
        space.unlink(pool, vaddr);
    }
    if flags.contains(MapFlags::UPDATE) {
        let attrs = PteFlags::from_map_flags(flags) | PteFlags::USER;
        space.link(pool, vaddr, src_paddr, Some(kpage_paddr), attrs)?;
    }
    Ok(success(k, caller, 0))
}
