// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The synchronous rendezvous engine.
//!
//! A send and a receive meet in the middle: whichever side arrives first
//! blocks (unless it asked not to), and the side that arrives second
//! finishes *both* operations. There is no blocking inside the kernel --
//! a sleeping task's syscall is completed from the waker's context by
//! writing its saved return register and handing it back to the
//! scheduler. The staged outgoing message of a blocked sender lives in
//! its own TCB; a completed receive lands in the receiver's TCB buffer
//! and its user-space message slot.
//!
//! The kernel itself uses the same rendezvous to talk to pagers: exits
//! deliver exception messages, page faults and ABI hooks perform a full
//! call and wait for the reply. Those operations have no syscall to
//! complete, so the TCB records what kind of kernel wait is in progress
//! and the reply path dispatches on it.

use abi::{
    Error, ExceptionReason, IpcFlags, Message, MsgType, Notifications,
    NotificationsMsg, PageFaultMsg, SourceFilter,
};

use crate::err::UserError;
use crate::task::{ArchState, KernelWait, NextTask, TaskState, TaskTable};

/// The register assignment of the `Ipc` syscall.
pub(crate) struct IpcArgs {
    pub dst_raw: i32,
    pub filter_raw: i32,
    /// Pointer to the caller's message slot; doubles as the notification
    /// bits under `NOTIFY`.
    pub msg_ptr: u64,
    pub flags_raw: u32,
}

pub(crate) fn ipc_args(save: &crate::arch::SavedState) -> IpcArgs {
    IpcArgs {
        dst_raw: save.arg0() as i32,
        filter_raw: save.arg1() as i32,
        msg_ptr: save.arg2(),
        flags_raw: save.arg3() as u32,
    }
}

enum SendOutcome {
    /// Message handed over; destination is runnable.
    Delivered,
    /// Caller is parked on the destination's sender queue.
    Queued,
}

enum RecvOutcome {
    /// A message landed and the return register is written.
    Done,
    /// Caller is filtered and blocked.
    Blocked,
}

/// Runs a user `Ipc` operation for `caller`, whose outgoing message (if
/// sending) has already been staged and stamped.
///
/// On `Ok`, either the caller's return register holds its result or the
/// caller has blocked and will be completed later; the hint says whether
/// a switch is warranted. Recoverable errors are left to the dispatcher
/// to record.
pub fn user_ipc(
    tasks: &mut TaskTable,
    caller: usize,
    dst: Option<usize>,
    filter: SourceFilter,
    flags: IpcFlags,
) -> Result<NextTask, UserError> {
    let mut hint = NextTask::Same;

    if flags.contains(IpcFlags::SEND) {
        let dst = dst.ok_or(Error::InvalidArg)?;
        match send_phase(tasks, caller, dst, flags)? {
            SendOutcome::Delivered => {
                hint = hint.combine(NextTask::Specific(dst));
            }
            SendOutcome::Queued => {
                // The receive half, if any, continues when the
                // destination takes the message.
                return Ok(NextTask::Other);
            }
        }
    }

    if flags.contains(IpcFlags::RECV) {
        match recv_phase(tasks, caller, filter, flags)? {
            RecvOutcome::Done => {}
            RecvOutcome::Blocked => hint = hint.combine(NextTask::Other),
        }
    }

    if tasks.task(caller).state() == TaskState::Runnable {
        tasks.task_mut(caller).save_mut().set_return_value(0);
    }
    Ok(hint)
}

/// Tries to move `caller`'s staged message to `dst`; parks the caller on
/// the sender queue if `dst` is not ready for it.
fn send_phase(
    tasks: &mut TaskTable,
    caller: usize,
    dst: usize,
    flags: IpcFlags,
) -> Result<SendOutcome, Error> {
    if try_deliver_now(tasks, caller, dst) {
        return Ok(SendOutcome::Delivered);
    }
    if flags.contains(IpcFlags::NOBLOCK) {
        return Err(Error::WouldBlock);
    }
    tasks.queue_sender(dst, caller);
    if tasks.task(caller).state() == TaskState::Runnable {
        tasks.block(caller);
    }
    Ok(SendOutcome::Queued)
}

/// Completes a receive for `caller`: notifications first, then the
/// longest-waiting matching sender, then park (or `WouldBlock`).
fn recv_phase(
    tasks: &mut TaskTable,
    caller: usize,
    filter: SourceFilter,
    flags: IpcFlags,
) -> Result<RecvOutcome, Error> {
    // Pending notifications outrank queued messages, whatever the
    // filter says: they are higher-priority events, not peers.
    if !tasks.task(caller).notifications().is_empty() {
        let summary =
            tasks.task_mut(caller).snapshot_and_clear_notifications();
        let msg = Message::with(
            MsgType::NOTIFICATIONS,
            NotificationsMsg {
                bits: summary.bits(),
            },
        );
        finish_local_receive(tasks, caller, msg);
        return Ok(RecvOutcome::Done);
    }

    if let Some(sender) = tasks.pop_matching_sender(caller, filter) {
        let msg = tasks.task(sender).staged_message();
        finish_local_receive(tasks, caller, msg);
        continue_after_send(tasks, sender);
        return Ok(RecvOutcome::Done);
    }

    if flags.contains(IpcFlags::NOBLOCK) {
        return Err(Error::WouldBlock);
    }

    tasks.task_mut(caller).set_src(filter);
    if tasks.task(caller).state() == TaskState::Runnable {
        tasks.block(caller);
    }
    Ok(RecvOutcome::Blocked)
}

/// Checks whether `dst` is blocked in a receive that accepts `caller`
/// right now, and if so hands the staged message over. The destination
/// ends up runnable (or exited, if it misbehaved).
fn try_deliver_now(tasks: &mut TaskTable, caller: usize, dst: usize) -> bool {
    let sender_tid = tasks.task(caller).tid();
    let d = tasks.task(dst);
    let ready = d.state() == TaskState::Blocked
        && !d.parked()
        && d.src().accepts(sender_tid);
    if !ready {
        return false;
    }
    let msg = tasks.task(caller).staged_message();
    deliver(tasks, dst, msg);
    true
}

/// Delivers `msg` to the blocked receiver `r`, completing whatever kind
/// of wait it is in.
fn deliver(tasks: &mut TaskTable, r: usize, msg: Message) {
    match tasks.task(r).kernel_wait() {
        None => complete_blocked_receive(tasks, r, msg),
        Some(KernelWait::PageFault) => {
            // Any reply resumes the faulter; the pager has installed the
            // mapping (or killed the task) before replying.
            tasks.task_mut(r).stage_message(msg);
            tasks.task_mut(r).set_kernel_wait(None);
            tasks.task_mut(r).set_src(SourceFilter::Deny);
            tasks.resume(r);
        }
        Some(KernelWait::AbiHook) => {
            tasks.task_mut(r).stage_message(msg);
            tasks.task_mut(r).set_kernel_wait(None);
            tasks.task_mut(r).set_src(SourceFilter::Deny);
            let frame = msg
                .ty
                .is(MsgType::ABI_HOOK_REPLY)
                .then(|| msg.read::<abi::AbiHookMsg>())
                .flatten();
            match frame {
                Some(reply) => {
                    tasks
                        .task_mut(r)
                        .save_mut()
                        .set_trap_frame(&reply.frame);
                    tasks.resume(r);
                }
                None => {
                    klog!(
                        "{}: invalid abi hook reply (type={})",
                        tasks.task(r).name(),
                        msg.ty.0
                    );
                    let _ = tasks.force_exit(
                        r,
                        ExceptionReason::InvalidMsgFromPager,
                    );
                }
            }
        }
    }
}

/// Finishes a receive whose receiver is (or was) executing the receive
/// itself: stores the message in the TCB and the caller's message slot
/// and writes the success return. Does not touch scheduling state.
///
/// Returns `false` if the receiver's buffer turned out to be bad, in
/// which case the receiver has been routed to its pager instead.
fn finish_local_receive(
    tasks: &mut TaskTable,
    r: usize,
    msg: Message,
) -> bool {
    tasks.task_mut(r).stage_message(msg);
    tasks.task_mut(r).set_src(SourceFilter::Deny);
    let msg_ptr = ipc_args(tasks.task(r).save()).msg_ptr;
    match crate::umem::write_obj(msg_ptr, &msg) {
        Ok(()) => {
            tasks.task_mut(r).save_mut().set_return_value(0);
            true
        }
        Err(_) => {
            // Validated at syscall entry, so this is a task whose buffer
            // stopped being plausible; it joins its ancestors.
            let _ =
                tasks.force_exit(r, ExceptionReason::InvalidMemoryAccess);
            false
        }
    }
}

/// Delivers `msg` to a receiver that is blocked waiting for it, and makes
/// it runnable. Also the landing path for notification summaries.
pub(crate) fn complete_blocked_receive(
    tasks: &mut TaskTable,
    r: usize,
    msg: Message,
) {
    if finish_local_receive(tasks, r, msg) {
        tasks.resume(r);
    }
}

/// Picks up a sender whose staged message has just been consumed: either
/// it returns to userspace with success, or -- for a call -- it rolls
/// straight into its receive phase.
fn continue_after_send(tasks: &mut TaskTable, s: usize) {
    if tasks.task(s).parked() {
        // Exit notification delivered; the task stays down.
        return;
    }

    if tasks.task(s).kernel_wait().is_some() {
        // Kernel-originated call: now wait for the pager's reply. The
        // filter was set when the call began; nothing to do but stay
        // blocked.
        return;
    }

    let args = ipc_args(tasks.task(s).save());
    let flags = IpcFlags::from_bits_truncate(args.flags_raw);
    if !flags.contains(IpcFlags::RECV) {
        tasks.task_mut(s).save_mut().set_return_value(0);
        tasks.resume(s);
        return;
    }

    // Validated when the syscall was first dispatched.
    let filter = SourceFilter::from_raw(args.filter_raw)
        .unwrap_or(SourceFilter::Deny);
    match recv_phase(tasks, s, filter, flags) {
        Ok(RecvOutcome::Done) => {
            if !tasks.task(s).parked()
                && tasks.task(s).state() == TaskState::Blocked
            {
                tasks.resume(s);
            }
        }
        Ok(RecvOutcome::Blocked) => {}
        Err(e) => {
            tasks.task_mut(s).save_mut().set_return_value(e.code());
            tasks.resume(s);
        }
    }
}

/// Completes the send of a task that was queued against a destination
/// that has been destroyed. The `ABORTED` notification was just posted;
/// consuming it here is the wakeup check the sender would otherwise run.
pub(crate) fn abort_queued_sender(tasks: &mut TaskTable, s: usize) {
    if tasks.task(s).parked() {
        // An exiting task's pager vanished; nothing left to tell it.
        return;
    }
    if tasks.task(s).kernel_wait().is_some() {
        let _ = tasks.force_exit(s, ExceptionReason::AbortedKernelIpc);
        return;
    }
    tasks
        .task_mut(s)
        .clear_notifications(Notifications::ABORTED);
    tasks
        .task_mut(s)
        .save_mut()
        .set_return_value(Error::Aborted.code());
    tasks.resume(s);
}

/// Sends `sender`'s staged message to `dst` on the kernel's behalf
/// without any completion for the sender: used by the exit path, where
/// the sender is already parked.
pub(crate) fn kernel_send(
    tasks: &mut TaskTable,
    sender: usize,
    dst: usize,
) -> Result<(), Error> {
    if tasks.task(dst).state() == TaskState::Unused {
        return Err(Error::InvalidArg);
    }
    if !try_deliver_now(tasks, sender, dst) {
        tasks.queue_sender(dst, sender);
    }
    Ok(())
}

/// Performs a kernel-originated call to `caller`'s pager: sends the
/// staged message and leaves the caller blocked awaiting the reply,
/// tagged with what kind of reply handling it needs.
pub(crate) fn kernel_call(
    tasks: &mut TaskTable,
    caller: usize,
    wait: KernelWait,
) -> Result<NextTask, Error> {
    let pager = tasks.task(caller).pager().ok_or(Error::InvalidArg)?;
    tasks.task_mut(caller).set_kernel_wait(Some(wait));
    if !try_deliver_now(tasks, caller, pager) {
        tasks.queue_sender(pager, caller);
    }
    let pager_tid = tasks.task(pager).tid();
    tasks
        .task_mut(caller)
        .set_src(SourceFilter::Task(pager_tid));
    if tasks.task(caller).state() == TaskState::Runnable {
        tasks.block(caller);
    }
    Ok(NextTask::Other)
}

/// Routes a page fault in the running task to its pager and blocks the
/// task until the pager replies.
///
/// # Panics
///
/// If the initial task faults; it has no pager and the system cannot
/// proceed without it.
pub fn handle_page_fault(
    tasks: &mut TaskTable,
    current: usize,
    vaddr: u64,
    ip: u64,
    fault: abi::FaultFlags,
) -> NextTask {
    klog!(
        "page fault: {}: addr={:#x}, ip={:#x}",
        tasks.task(current).name(),
        vaddr,
        ip
    );
    if tasks.task(current).pager().is_none() {
        panic!("page fault in the initial task at {vaddr:#x}");
    }

    let msg = Message::with(
        MsgType::PAGE_FAULT,
        PageFaultMsg {
            vaddr,
            ip,
            task: tasks.task(current).tid(),
            fault: fault.bits(),
        },
    );
    tasks.task_mut(current).stage_message(msg);
    match kernel_call(tasks, current, KernelWait::PageFault) {
        Ok(hint) => hint,
        Err(_) => {
            tasks.force_exit(current, ExceptionReason::AbortedKernelIpc)
        }
    }
}

/// Relays a trap of an ABI-emulated task to its pager and blocks until
/// the pager supplies the frame to resume with.
#[cfg(feature = "abi-emu")]
pub fn abi_emu_hook(
    tasks: &mut TaskTable,
    current: usize,
    hook: u32,
) -> NextTask {
    let msg = Message::with(
        MsgType::ABI_HOOK,
        abi::AbiHookMsg {
            frame: tasks.task(current).save().trap_frame(),
            task: tasks.task(current).tid(),
            hook,
        },
    );
    tasks.task_mut(current).stage_message(msg);
    match kernel_call(tasks, current, KernelWait::AbiHook) {
        Ok(hint) => hint,
        Err(_) => {
            tasks.force_exit(current, ExceptionReason::AbortedKernelIpc)
        }
    }
}
