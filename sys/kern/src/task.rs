// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of tasks.
//!
//! The fields of [`Task`] are private to this module so task interactions
//! stay consistent across state changes -- resuming a task must enqueue
//! it, destroying one must sweep it out of every queue, and so on. The
//! IPC engine gets narrowly-scoped crate-private accessors instead of the
//! raw fields.

use abi::{
    Error, ExceptionReason, ExceptionMsg, Message, MsgType, Notifications,
    SourceFilter, TaskFlags, Tid,
};
use kerncore::IndexQueue;

use crate::config::{IRQ_LINES, NUM_TASKS, TASK_NAME_LEN, TIME_SLICE_TICKS};
use crate::vm::{AddrSpace, PageTablePool};

/// Queue of task indices; capacity is the table size because a task sits
/// on at most one queue of each kind.
pub(crate) type TaskQueue = IndexQueue<NUM_TASKS>;

/// Lifecycle state of a task slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum TaskState {
    /// The slot is empty.
    #[default]
    Unused,
    /// Running now, or queued waiting for the CPU.
    Runnable,
    /// Waiting inside an IPC operation (or parked on the way out).
    Blocked,
}

/// What a task blocked in a *kernel-originated* call is waiting for. Such
/// a task has no syscall to complete; the reply handling differs instead.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum KernelWait {
    /// Pager reply to a page fault; any reply resumes the task.
    PageFault,
    /// Pager reply to an ABI emulation hook; the reply frame is spliced
    /// back into the task's registers.
    AbiHook,
}

/// Interface the `arch::SavedState` type must implement. This gives
/// architecture-independent access to the syscall registers.
pub trait ArchState: Default + core::fmt::Debug {
    /// Reads the syscall descriptor (number).
    fn syscall_descriptor(&self) -> u64;

    /// Reads syscall argument register 0.
    fn arg0(&self) -> u64;
    /// Reads syscall argument register 1.
    fn arg1(&self) -> u64;
    /// Reads syscall argument register 2.
    fn arg2(&self) -> u64;
    /// Reads syscall argument register 3.
    fn arg3(&self) -> u64;
    /// Reads syscall argument register 4.
    fn arg4(&self) -> u64;

    /// Writes the syscall return word.
    fn set_return_value(&mut self, v: i64);
    /// Reads back the syscall return word.
    fn return_value(&self) -> i64;

    /// Points the task at its entry point during creation.
    fn set_entry(&mut self, pc: u64);

    /// Snapshots the trap frame relayed through ABI emulation hooks.
    fn trap_frame(&self) -> [u64; abi::TRAP_FRAME_WORDS];
    /// Splices a pager-supplied trap frame back into the task.
    fn set_trap_frame(&mut self, frame: &[u64; abi::TRAP_FRAME_WORDS]);
}

/// A task control block.
#[derive(Debug)]
pub struct Task {
    /// Saved machine state of the user program.
    ///
    /// NOTE: bare-metal ports rely on this field coming first.
    save: crate::arch::SavedState,
    /// Stable ID, slot index plus one. Fixed at table init.
    tid: Tid,
    state: TaskState,
    name: [u8; TASK_NAME_LEN],
    flags: TaskFlags,
    /// Table index of the pager; `None` only for the initial task.
    pager: Option<usize>,
    /// How many tasks name this one as their pager.
    ref_count: u32,
    /// Remaining scheduling ticks.
    quantum: u32,
    /// Milliseconds until a `TIMER` notification; zero disables.
    timeout_ms: u32,
    notifications: Notifications,
    /// The inline message buffer: a blocked sender's staged message, and
    /// the landing area for received ones.
    m: Message,
    /// Receive accept filter; `Deny` whenever the task is not receiving.
    src: SourceFilter,
    /// Tasks blocked sending to this one, in arrival order.
    senders: TaskQueue,
    vm: AddrSpace,
    /// Set on the way out: the task's exception message is in flight (or
    /// delivered) and the task must never run again.
    parked: bool,
    kernel_wait: Option<KernelWait>,
}

impl Task {
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn name(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TASK_NAME_LEN);
        core::str::from_utf8(&self.name[..end]).unwrap_or("(bad name)")
    }

    pub fn flags(&self) -> TaskFlags {
        self.flags
    }

    pub fn pager(&self) -> Option<usize> {
        self.pager
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    pub fn notifications(&self) -> Notifications {
        self.notifications
    }

    pub fn src(&self) -> SourceFilter {
        self.src
    }

    pub fn message(&self) -> &Message {
        &self.m
    }

    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    pub fn save(&self) -> &crate::arch::SavedState {
        &self.save
    }

    pub fn save_mut(&mut self) -> &mut crate::arch::SavedState {
        &mut self.save
    }

    pub fn set_timeout_ms(&mut self, ms: u32) {
        self.timeout_ms = ms;
    }

    pub(crate) fn set_src(&mut self, src: SourceFilter) {
        self.src = src;
    }

    pub(crate) fn stage_message(&mut self, m: Message) {
        self.m = m;
    }

    pub(crate) fn staged_message(&self) -> Message {
        self.m
    }

    pub(crate) fn parked(&self) -> bool {
        self.parked
    }

    pub(crate) fn kernel_wait(&self) -> Option<KernelWait> {
        self.kernel_wait
    }

    pub(crate) fn set_kernel_wait(&mut self, w: Option<KernelWait>) {
        self.kernel_wait = w;
    }

    pub(crate) fn post(&mut self, bits: Notifications) {
        self.notifications |= bits;
    }

    pub(crate) fn clear_notifications(&mut self, bits: Notifications) {
        self.notifications &= !bits;
    }

    /// Takes the whole pending set, as delivered in a `NOTIFICATIONS`
    /// message.
    pub(crate) fn snapshot_and_clear_notifications(&mut self) -> Notifications {
        core::mem::take(&mut self.notifications)
    }

    pub(crate) fn vm_mut(&mut self) -> &mut AddrSpace {
        &mut self.vm
    }

    pub fn vm(&self) -> &AddrSpace {
        &self.vm
    }

    fn set_name(&mut self, name: &[u8]) {
        self.name = [0; TASK_NAME_LEN];
        let n = name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name.len())
            .min(TASK_NAME_LEN);
        self.name[..n].copy_from_slice(&name[..n]);
    }
}

impl Default for Task {
    fn default() -> Self {
        Self {
            save: Default::default(),
            tid: Tid(0),
            state: TaskState::Unused,
            name: [0; TASK_NAME_LEN],
            flags: TaskFlags::empty(),
            pager: None,
            ref_count: 0,
            quantum: 0,
            timeout_ms: 0,
            notifications: Notifications::empty(),
            m: Message::new(MsgType(0)),
            src: SourceFilter::Deny,
            senders: TaskQueue::new(),
            vm: AddrSpace::new(),
            parked: false,
            kernel_wait: None,
        }
    }
}

/// Return value for operations that can have scheduling implications. This
/// is `must_use` because forgetting to act on a needed context switch
/// would be bad.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum NextTask {
    /// Keep running whatever was running.
    Same,
    /// Switch, next task to be chosen by the scheduler.
    Other,
    /// Switch, and we already know to what.
    Specific(usize),
}

impl NextTask {
    pub fn combine(self, other: Self) -> Self {
        use NextTask::*;

        match (self, other) {
            (x, y) if x == y => x,
            // Competing specific recommendations degrade to Other.
            (Specific(_), Specific(_)) => Other,
            (Specific(x), _) | (_, Specific(x)) => Specific(x),
            (Other, _) | (_, Other) => Other,
            (Same, Same) => Same,
        }
    }
}

/// The task table, the runqueue threaded through it, and the IRQ
/// ownership map.
pub struct TaskTable {
    tasks: [Task; NUM_TASKS],
    /// Runnable tasks excluding whichever is current on a CPU, in
    /// round-robin order.
    runqueue: TaskQueue,
    irq_owners: [Option<usize>; IRQ_LINES],
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            tasks: core::array::from_fn(|i| Task {
                tid: Tid::from_index(i),
                ..Default::default()
            }),
            runqueue: TaskQueue::new(),
            irq_owners: [None; IRQ_LINES],
        }
    }

    pub fn task(&self, index: usize) -> &Task {
        &self.tasks[index]
    }

    pub fn task_mut(&mut self, index: usize) -> &mut Task {
        &mut self.tasks[index]
    }

    /// Resolves a task ID to a live slot. Rejects IDs that are out of
    /// range *and* slots not in use.
    pub fn lookup(&self, tid: Tid) -> Result<usize, Error> {
        let index = self.lookup_unchecked(tid)?;
        if self.tasks[index].state == TaskState::Unused {
            return Err(Error::InvalidArg);
        }
        Ok(index)
    }

    /// Resolves a task ID to a slot, in use or not.
    pub fn lookup_unchecked(&self, tid: Tid) -> Result<usize, Error> {
        tid.index().ok_or(Error::InvalidArg)
    }

    /// Initializes a task slot.
    pub fn create(
        &mut self,
        index: usize,
        name: &[u8],
        entry: u64,
        pager: Option<usize>,
        flags: TaskFlags,
    ) -> Result<(), Error> {
        if self.tasks[index].state != TaskState::Unused {
            return Err(Error::AlreadyExists);
        }

        if flags.contains(TaskFlags::ABI_EMU) && !cfg!(feature = "abi-emu") {
            klog!("abi emulation is not enabled");
            return Err(Error::Unavailable);
        }

        let task = &mut self.tasks[index];
        task.state = TaskState::Blocked;
        task.flags = flags;
        task.pager = pager;
        task.ref_count = 0;
        task.quantum = 0;
        task.timeout_ms = 0;
        task.notifications = Notifications::empty();
        task.src = SourceFilter::Deny;
        task.m = Message::new(MsgType(0));
        task.senders.clear();
        task.parked = false;
        task.kernel_wait = None;
        task.vm = AddrSpace::new();
        task.save = Default::default();
        task.save.set_entry(entry);
        task.set_name(name);

        if let Some(pager) = pager {
            self.tasks[pager].ref_count += 1;
        }

        klog!(
            "new task #{}: {} (pager={:?})",
            index + 1,
            self.tasks[index].name(),
            pager
        );
        self.resume(index);
        Ok(())
    }

    /// Frees a task slot and unhooks it from everything.
    ///
    /// `current` is whoever is asking; a task cannot destroy itself (it
    /// exits instead, and its *pager* destroys it).
    pub fn destroy(
        &mut self,
        pool: &mut PageTablePool,
        victim: usize,
        current: Option<usize>,
    ) -> Result<(), Error> {
        if Some(victim) == current {
            return Err(Error::InvalidArg);
        }
        if self.tasks[victim].tid == Tid::INIT {
            klog!("tried to destroy the init task");
            return Err(Error::InvalidArg);
        }
        if self.tasks[victim].state == TaskState::Unused {
            return Err(Error::InvalidArg);
        }
        if self.tasks[victim].ref_count > 0 {
            klog!(
                "{} (#{}) is still referenced by {} tasks",
                self.tasks[victim].name(),
                victim + 1,
                self.tasks[victim].ref_count
            );
            return Err(Error::InUse);
        }

        klog!("destroying {}...", self.tasks[victim].name());
        self.runqueue.remove(victim);
        for task in &mut self.tasks {
            task.senders.remove(victim);
        }
        self.tasks[victim].vm.destroy(pool);
        self.tasks[victim].state = TaskState::Unused;

        if let Some(pager) = self.tasks[victim].pager {
            self.tasks[pager].ref_count -= 1;
        }

        // Abort the IPC operations of everything queued against the
        // victim.
        let mut senders = core::mem::take(&mut self.tasks[victim].senders);
        while let Some(sender) = senders.pop_front() {
            self.tasks[sender].post(Notifications::ABORTED);
            crate::ipc::abort_queued_sender(self, sender);
        }

        // Release IRQ ownership.
        for irq in 0..IRQ_LINES {
            if self.irq_owners[irq] == Some(victim) {
                crate::arch::disable_irq(irq);
                self.irq_owners[irq] = None;
            }
        }

        Ok(())
    }

    /// Suspends a task. Don't forget to update its `src` filter as well!
    pub(crate) fn block(&mut self, index: usize) {
        debug_assert_eq!(self.tasks[index].state, TaskState::Runnable);
        self.tasks[index].state = TaskState::Blocked;
        // The current task is not on the runqueue, but simulation
        // harnesses drive tasks that are; keep the queue honest.
        self.runqueue.remove(index);
    }

    /// Makes a task runnable and queues it at the tail.
    pub(crate) fn resume(&mut self, index: usize) {
        debug_assert_eq!(self.tasks[index].state, TaskState::Blocked);
        self.tasks[index].state = TaskState::Runnable;
        if !self.runqueue.push_back(index) {
            panic!("runqueue overflow");
        }
    }

    /// Picks the next task to run after `current`, round-robin. `None`
    /// means the CPU should idle. The picked task gets a fresh quantum.
    pub fn select(&mut self, current: Option<usize>) -> Option<usize> {
        if let Some(current) = current {
            if self.tasks[current].state == TaskState::Runnable
                && !self.runqueue.push_back(current)
            {
                panic!("runqueue overflow");
            }
        }
        let next = self.runqueue.pop_front()?;
        self.tasks[next].quantum = TIME_SLICE_TICKS;
        Some(next)
    }

    /// Handles a timer tick.
    ///
    /// On the bootstrap processor the tick also drives the per-task
    /// millisecond timeouts; every CPU burns quantum. `current` is `None`
    /// when the CPU was idling, which always wants a reschedule so a
    /// newly-runnable task gets on.
    pub fn tick(&mut self, current: Option<usize>, is_bsp: bool) -> NextTask {
        let mut sched_hint = NextTask::Same;

        if is_bsp {
            for index in 0..NUM_TASKS {
                if self.tasks[index].state == TaskState::Unused
                    || self.tasks[index].timeout_ms == 0
                {
                    continue;
                }
                self.tasks[index].timeout_ms -= 1;
                if self.tasks[index].timeout_ms == 0 {
                    let hint = if self.notify(index, Notifications::TIMER) {
                        NextTask::Specific(index)
                    } else {
                        NextTask::Same
                    };
                    sched_hint = sched_hint.combine(hint);
                }
            }
        }

        match current {
            Some(current) => {
                let quantum = self.tasks[current].quantum.saturating_sub(1);
                self.tasks[current].quantum = quantum;
                if quantum == 0 {
                    sched_hint = sched_hint.combine(NextTask::Other);
                }
            }
            None => sched_hint = sched_hint.combine(NextTask::Other),
        }
        sched_hint
    }

    /// Posts notification bits to a task.
    ///
    /// A target blocked in an open receive hears about them right away as
    /// a `NOTIFICATIONS` message and becomes runnable (returns `true`);
    /// otherwise the bits sit pending until its next receive.
    pub fn notify(&mut self, target: usize, bits: Notifications) -> bool {
        let t = &self.tasks[target];
        let receptive = t.state == TaskState::Blocked
            && !t.parked
            && t.kernel_wait.is_none()
            && t.src == SourceFilter::Any;
        if receptive {
            self.tasks[target].post(bits);
            let summary =
                self.tasks[target].snapshot_and_clear_notifications();
            let msg = Message::with(
                MsgType::NOTIFICATIONS,
                abi::NotificationsMsg {
                    bits: summary.bits(),
                },
            );
            crate::ipc::complete_blocked_receive(self, target, msg);
            true
        } else {
            self.tasks[target].post(bits);
            false
        }
    }

    /// Grants `target` ownership of an IRQ line and unmasks it.
    pub fn listen_irq(
        &mut self,
        target: usize,
        irq: usize,
    ) -> Result<(), Error> {
        if irq >= IRQ_LINES {
            return Err(Error::InvalidArg);
        }
        if self.irq_owners[irq].is_some() {
            return Err(Error::AlreadyExists);
        }
        self.irq_owners[irq] = Some(target);
        crate::arch::enable_irq(irq);
        klog!(
            "enabled IRQ: task={}, line={}",
            self.tasks[target].name(),
            irq
        );
        Ok(())
    }

    /// Masks an IRQ line and clears its ownership.
    pub fn unlisten_irq(&mut self, irq: usize) -> Result<(), Error> {
        if irq >= IRQ_LINES {
            return Err(Error::InvalidArg);
        }
        crate::arch::disable_irq(irq);
        self.irq_owners[irq] = None;
        Ok(())
    }

    pub fn irq_owner(&self, irq: usize) -> Option<usize> {
        self.irq_owners[irq]
    }

    /// Routes a hardware interrupt to its owner, if any.
    pub fn handle_irq(&mut self, irq: usize) -> NextTask {
        match self.irq_owners[irq] {
            Some(owner) => {
                if self.notify(owner, Notifications::IRQ) {
                    NextTask::Specific(owner)
                } else {
                    NextTask::Same
                }
            }
            None => NextTask::Same,
        }
    }

    /// Terminates a task by routing an exception message to its pager and
    /// parking the task until the pager destroys it.
    ///
    /// # Panics
    ///
    /// If the victim is the initial task, which has no pager; the system
    /// cannot continue without it.
    pub fn force_exit(
        &mut self,
        victim: usize,
        reason: ExceptionReason,
    ) -> NextTask {
        if self.tasks[victim].parked {
            // Already on its way out.
            return NextTask::Other;
        }
        let Some(pager) = self.tasks[victim].pager else {
            panic!("the initial task exited: {reason:?}");
        };

        klog!("{}: exiting ({:?})", self.tasks[victim].name(), reason);

        // The victim will never run again: pull it out of the scheduler
        // and out of any rendezvous it was part of.
        self.runqueue.remove(victim);
        for task in &mut self.tasks {
            task.senders.remove(victim);
        }
        let victim_tid = self.tasks[victim].tid;
        self.tasks[victim].parked = true;
        self.tasks[victim].kernel_wait = None;
        self.tasks[victim].state = TaskState::Blocked;
        self.tasks[victim].src = SourceFilter::Deny;
        self.tasks[victim].stage_message(Message::with(
            MsgType::EXCEPTION,
            ExceptionMsg {
                task: victim_tid,
                reason: reason as u32,
            },
        ));

        let r = crate::ipc::kernel_send(self, victim, pager);
        if let Err(e) = r {
            klog!(
                "{}: exception delivery failed ({})",
                self.tasks[victim].name(),
                e.name()
            );
        }
        NextTask::Other
    }

    /// Appends `sender` to `dst`'s sender queue.
    pub(crate) fn queue_sender(&mut self, dst: usize, sender: usize) {
        debug_assert!(!self.tasks[dst].senders.contains(sender));
        if !self.tasks[dst].senders.push_back(sender) {
            panic!("sender queue overflow");
        }
    }

    /// Removes and returns the first queued sender of `r` that passes
    /// `filter`. Matching is by sender task ID; kernel-originated
    /// messages ride their sending task.
    pub(crate) fn pop_matching_sender(
        &mut self,
        r: usize,
        filter: SourceFilter,
    ) -> Option<usize> {
        let mut queue = core::mem::take(&mut self.tasks[r].senders);
        let hit = queue.pop_where(|s| filter.accepts(self.tasks[s].tid));
        self.tasks[r].senders = queue;
        hit
    }

    /// Whether `sender` is queued against `dst` (test support).
    pub fn sender_queued(&self, dst: usize, sender: usize) -> bool {
        self.tasks[dst].senders.contains(sender)
    }

    /// Iterates live task indices.
    pub fn live_tasks(&self) -> impl Iterator<Item = usize> + '_ {
        (0..NUM_TASKS).filter(|&i| self.tasks[i].state != TaskState::Unused)
    }

    pub fn runqueue_contains(&self, index: usize) -> bool {
        self.runqueue.contains(index)
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(n: usize) -> TaskTable {
        let mut table = TaskTable::new();
        table
            .create(0, b"boot", 0x1000, None, TaskFlags::empty())
            .unwrap();
        for i in 1..n {
            table
                .create(i, b"task", 0x1000, Some(0), TaskFlags::empty())
                .unwrap();
        }
        table
    }

    #[test]
    fn slots_carry_their_tid_forever() {
        let table = table_with(3);
        for i in 0..NUM_TASKS {
            assert_eq!(table.task(i).tid(), Tid::from_index(i));
        }
    }

    #[test]
    fn lookup_rejects_dead_and_silly_ids() {
        let table = table_with(2);
        assert_eq!(table.lookup(Tid(1)), Ok(0));
        assert_eq!(table.lookup(Tid(2)), Ok(1));
        assert_eq!(table.lookup(Tid(0)), Err(Error::InvalidArg));
        assert_eq!(table.lookup(Tid(-4)), Err(Error::InvalidArg));
        assert_eq!(
            table.lookup(Tid(NUM_TASKS as i32 + 1)),
            Err(Error::InvalidArg)
        );
        // Slot 5 exists but is unused.
        assert_eq!(table.lookup(Tid(6)), Err(Error::InvalidArg));
        assert_eq!(table.lookup_unchecked(Tid(6)), Ok(5));
    }

    #[test]
    fn create_rejects_occupied_slots() {
        let mut table = table_with(2);
        assert_eq!(
            table.create(1, b"again", 0, Some(0), TaskFlags::empty()),
            Err(Error::AlreadyExists)
        );
    }

    #[cfg(not(feature = "abi-emu"))]
    #[test]
    fn create_rejects_abi_emu_without_the_feature() {
        let mut table = table_with(1);
        assert_eq!(
            table.create(1, b"emu", 0, Some(0), TaskFlags::ABI_EMU),
            Err(Error::Unavailable)
        );
        assert_eq!(table.task(1).state(), TaskState::Unused);
    }

    #[test]
    fn create_then_destroy_restores_unused() {
        let mut table = table_with(2);
        let mut pool = PageTablePool::new();
        assert_eq!(table.task(1).state(), TaskState::Runnable);
        assert!(table.runqueue_contains(1));
        assert_eq!(table.task(0).ref_count(), 1);

        table.destroy(&mut pool, 1, Some(0)).unwrap();
        assert_eq!(table.task(1).state(), TaskState::Unused);
        assert!(!table.runqueue_contains(1));
        assert_eq!(table.task(0).ref_count(), 0);
        assert_eq!(table.task(1).tid(), Tid(2));

        // The slot is reusable.
        table
            .create(1, b"reborn", 0, Some(0), TaskFlags::empty())
            .unwrap();
        assert_eq!(table.task(1).state(), TaskState::Runnable);
    }

    #[test]
    fn destroy_refuses_self_init_and_empty_slots() {
        let mut table = table_with(3);
        let mut pool = PageTablePool::new();
        assert_eq!(
            table.destroy(&mut pool, 2, Some(2)),
            Err(Error::InvalidArg)
        );
        assert_eq!(
            table.destroy(&mut pool, 0, Some(2)),
            Err(Error::InvalidArg)
        );
        assert_eq!(
            table.destroy(&mut pool, 7, Some(2)),
            Err(Error::InvalidArg)
        );
    }

    #[test]
    fn destroy_refuses_pagers_in_use() {
        let mut table = table_with(2);
        let mut pool = PageTablePool::new();
        // Task 2 pages for task 3.
        table
            .create(2, b"child", 0, Some(1), TaskFlags::empty())
            .unwrap();
        assert_eq!(table.destroy(&mut pool, 1, Some(0)), Err(Error::InUse));
        table.destroy(&mut pool, 2, Some(0)).unwrap();
        table.destroy(&mut pool, 1, Some(0)).unwrap();
    }

    #[test]
    fn scheduler_is_round_robin_fifo() {
        let mut table = table_with(4);
        // Runqueue: 0, 1, 2, 3 in creation order.
        let first = table.select(None).unwrap();
        assert_eq!(first, 0);
        // 0 still runnable: goes to the tail when it yields.
        assert_eq!(table.select(Some(0)), Some(1));
        assert_eq!(table.select(Some(1)), Some(2));
        assert_eq!(table.select(Some(2)), Some(3));
        assert_eq!(table.select(Some(3)), Some(0));
    }

    #[test]
    fn select_skips_blocked_current_and_idles_when_empty() {
        let mut table = table_with(1);
        assert_eq!(table.select(None), Some(0));
        table.block(0);
        assert_eq!(table.select(Some(0)), None);
        table.resume(0);
        assert_eq!(table.select(None), Some(0));
    }

    #[test]
    fn select_assigns_a_fresh_quantum() {
        let mut table = table_with(1);
        let picked = table.select(None).unwrap();
        let hint = table.tick(Some(picked), false);
        assert_eq!(hint, NextTask::Same);
        for _ in 1..TIME_SLICE_TICKS - 1 {
            let _ = table.tick(Some(picked), false);
        }
        assert_eq!(table.tick(Some(picked), false), NextTask::Other);
    }

    #[test]
    fn tick_when_idle_asks_for_a_switch() {
        let mut table = table_with(1);
        assert_eq!(table.tick(None, false), NextTask::Other);
    }

    #[test]
    fn bsp_tick_drives_timeouts() {
        let mut table = table_with(2);
        table.task_mut(1).set_timeout_ms(3);
        for _ in 0..2 {
            let _ = table.tick(Some(0), true);
            assert!(!table
                .task(1)
                .notifications()
                .contains(Notifications::TIMER));
        }
        let _ = table.tick(Some(0), true);
        assert!(table
            .task(1)
            .notifications()
            .contains(Notifications::TIMER));
        // Timeout is one-shot.
        assert_eq!(table.task(1).timeout_ms(), 0);
        let _ = table.tick(Some(0), true);
    }

    #[test]
    fn secondary_cpu_ticks_leave_timeouts_alone() {
        let mut table = table_with(2);
        table.task_mut(1).set_timeout_ms(1);
        let _ = table.tick(Some(0), false);
        assert_eq!(table.task(1).timeout_ms(), 1);
    }

    #[test]
    fn notify_runnable_task_just_sets_bits() {
        let mut table = table_with(2);
        assert!(!table.notify(1, Notifications::IRQ));
        assert_eq!(table.task(1).notifications(), Notifications::IRQ);
        assert!(!table.notify(1, Notifications::TIMER));
        assert_eq!(
            table.task(1).notifications(),
            Notifications::IRQ | Notifications::TIMER
        );
    }

    #[test]
    fn irq_lines_have_one_owner() {
        let mut table = table_with(3);
        let mut pool = PageTablePool::new();
        assert!(crate::arch::irq_masked(17));
        table.listen_irq(1, 17).unwrap();
        assert!(!crate::arch::irq_masked(17));
        assert_eq!(table.listen_irq(2, 17), Err(Error::AlreadyExists));
        assert_eq!(table.listen_irq(1, IRQ_LINES), Err(Error::InvalidArg));

        // Destroying the owner frees and masks the line.
        table.destroy(&mut pool, 1, Some(0)).unwrap();
        assert_eq!(table.irq_owner(17), None);
        assert!(crate::arch::irq_masked(17));
        table.listen_irq(2, 17).unwrap();
        table.unlisten_irq(17).unwrap();
        assert_eq!(table.irq_owner(17), None);
        assert!(crate::arch::irq_masked(17));
    }

    #[test]
    fn irq_notification_reaches_the_owner() {
        let mut table = table_with(2);
        table.listen_irq(1, 9).unwrap();
        let _ = table.handle_irq(9);
        assert!(table.task(1).notifications().contains(Notifications::IRQ));
        // Unowned lines are ignored.
        assert_eq!(table.handle_irq(10), NextTask::Same);
    }

    #[test]
    fn next_task_combine_prefers_information() {
        use NextTask::*;
        assert_eq!(Same.combine(Same), Same);
        assert_eq!(Same.combine(Other), Other);
        assert_eq!(Specific(3).combine(Same), Specific(3));
        assert_eq!(Specific(3).combine(Specific(3)), Specific(3));
        assert_eq!(Specific(3).combine(Specific(4)), Other);
        assert_eq!(Other.combine(Specific(4)), Specific(4));
    }
}
