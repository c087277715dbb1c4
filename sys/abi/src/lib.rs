// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and task code.
//!
//! Everything in here is part of the contract between the kernel and
//! userspace: task naming, error codes, flag words, syscall numbers, the
//! fixed-size message record, and the boot image header. Types that cross
//! the user/kernel boundary as raw bytes derive the `zerocopy` traits so
//! both sides agree on their layout.

#![cfg_attr(not(test), no_std)]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of slots in the task table. Task IDs run from 1 to `NUM_TASKS`
/// inclusive.
pub const NUM_TASKS: usize = 32;

/// Number of hardware interrupt lines the kernel tracks ownership for.
pub const IRQ_LINES: usize = 64;

/// Maximum length of a task name, including nothing -- names are not
/// NUL-terminated, just padded.
pub const TASK_NAME_LEN: usize = 16;

/// Page size shared by every address-space operation.
pub const PAGE_SIZE: usize = 4096;

/// Names a task slot.
///
/// Task IDs are stable small integers starting at 1; slot `i` of the task
/// table always holds ID `i + 1`. ID 0 is reserved for the kernel itself:
/// messages originated by the kernel (exceptions, page faults,
/// notification summaries) carry it as their source.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct Tid(pub i32);

impl Tid {
    /// Source ID used by kernel-originated messages.
    pub const KERNEL: Self = Self(0);
    /// The initial task: the bootstrap server / root pager. It has no
    /// pager of its own and cannot be destroyed.
    pub const INIT: Self = Self(1);

    /// Fabricates the ID for a table slot.
    pub const fn from_index(index: usize) -> Self {
        Self(index as i32 + 1)
    }

    /// Returns the table slot for this ID, or `None` if the ID can never
    /// name a slot (zero, negative, or past the end of the table).
    pub fn index(self) -> Option<usize> {
        if self.0 >= 1 && self.0 <= NUM_TASKS as i32 {
            Some(self.0 as usize - 1)
        } else {
            None
        }
    }
}

/// The receive-side accept filter of a task.
///
/// `Deny` doubles as the resting state: a task that is not receiving
/// accepts nothing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SourceFilter {
    /// Open receive: accept a message from any task, and kernel
    /// notifications.
    Any,
    /// Closed receive: accept only from this task.
    Task(Tid),
    /// Not receiving.
    Deny,
}

impl SourceFilter {
    /// Decodes the raw syscall representation: 0 is `Any`, -1 is `Deny`,
    /// and a valid task ID is a closed receive. Anything else is an error.
    pub fn from_raw(raw: i32) -> Result<Self, Error> {
        match raw {
            0 => Ok(Self::Any),
            -1 => Ok(Self::Deny),
            t if Tid(t).index().is_some() => Ok(Self::Task(Tid(t))),
            _ => Err(Error::InvalidArg),
        }
    }

    /// Checks whether a message from `src` passes this filter. Kernel
    /// messages (`src` 0) pass only the open filter.
    pub fn accepts(self, src: Tid) -> bool {
        match self {
            Self::Any => true,
            Self::Task(t) => t == src,
            Self::Deny => false,
        }
    }
}

/// Error codes returned from system calls and used between servers.
///
/// On the wire these are small negative integers; `DontReply` never leaves
/// userspace, it is the in-band "no reply for you yet" sentinel used by
/// servers that park requests.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum Error {
    NoMemory = -1,
    NotPermitted = -2,
    WouldBlock = -3,
    Aborted = -4,
    TooLarge = -5,
    TooSmall = -6,
    NotFound = -7,
    InvalidArg = -8,
    AlreadyExists = -9,
    Unavailable = -10,
    NotAcceptable = -11,
    Empty = -12,
    DontReply = -13,
    InUse = -14,
    End = -15,
    TryAgain = -16,
}

impl Error {
    /// The syscall-word encoding of this error.
    pub const fn code(self) -> i64 {
        self as i32 as i64
    }

    /// Decodes a negative syscall word back into an error.
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            -1 => Self::NoMemory,
            -2 => Self::NotPermitted,
            -3 => Self::WouldBlock,
            -4 => Self::Aborted,
            -5 => Self::TooLarge,
            -6 => Self::TooSmall,
            -7 => Self::NotFound,
            -8 => Self::InvalidArg,
            -9 => Self::AlreadyExists,
            -10 => Self::Unavailable,
            -11 => Self::NotAcceptable,
            -12 => Self::Empty,
            -13 => Self::DontReply,
            -14 => Self::InUse,
            -15 => Self::End,
            -16 => Self::TryAgain,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::NoMemory => "no memory",
            Self::NotPermitted => "not permitted",
            Self::WouldBlock => "would block",
            Self::Aborted => "aborted",
            Self::TooLarge => "too large",
            Self::TooSmall => "too small",
            Self::NotFound => "not found",
            Self::InvalidArg => "invalid argument",
            Self::AlreadyExists => "already exists",
            Self::Unavailable => "unavailable",
            Self::NotAcceptable => "not acceptable",
            Self::Empty => "empty",
            Self::DontReply => "don't reply",
            Self::InUse => "in use",
            Self::End => "end",
            Self::TryAgain => "try again",
        }
    }
}

/// Encodes a syscall result as the single return word: non-negative values
/// pass through, errors become their negative codes.
pub fn encode_result(r: Result<i64, Error>) -> i64 {
    match r {
        Ok(v) => v,
        Err(e) => e.code(),
    }
}

/// Splits a syscall return word back into a result.
pub fn decode_result(word: i64) -> Result<i64, Error> {
    if word >= 0 {
        Ok(word)
    } else {
        Err(Error::from_code(word).unwrap_or(Error::InvalidArg))
    }
}

bitflags::bitflags! {
    /// Pending asynchronous event bits, one word per task.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct Notifications: u64 {
        /// The task's millisecond timeout reached zero.
        const TIMER = 1 << 0;
        /// An interrupt fired on a line the task owns.
        const IRQ = 1 << 1;
        /// A task this one was blocked on has been destroyed.
        const ABORTED = 1 << 2;
        /// New data is available (kernel log, servers).
        const NEW_DATA = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Per-task capability bits, fixed at creation.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
    #[repr(transparent)]
    pub struct TaskFlags: u32 {
        /// The task may perform direct I/O.
        const IO = 1 << 0;
        /// Syscall ABI emulation hooks fire for this task.
        const ABI_EMU = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Options to the `Ipc` syscall.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct IpcFlags: u32 {
        const SEND = 1 << 0;
        const RECV = 1 << 1;
        /// Fail with `WouldBlock` instead of sleeping.
        const NOBLOCK = 1 << 2;
        /// Post notification bits instead of a message; exclusive with
        /// `SEND`/`RECV`.
        const NOTIFY = 1 << 3;
        /// The message names an out-of-line bulk payload (user-space
        /// protocol; the kernel only carries the bit).
        const BULK = 1 << 4;
        /// Reserved to kernel-originated calls; rejected from userspace.
        const KERNEL = 1 << 5;
    }
}

impl IpcFlags {
    /// Send plus receive: the classic client call.
    pub const CALL: Self = Self::SEND.union(Self::RECV);
}

bitflags::bitflags! {
    /// Options to the `Map` syscall.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct MapFlags: u32 {
        /// Install the translation.
        const UPDATE = 1 << 0;
        /// Remove any existing translation first.
        const DELETE = 1 << 1;
        const WRITABLE = 1 << 2;
        const USER = 1 << 3;
        const EXECUTABLE = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Page fault condition bits, as delivered to pagers.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct FaultFlags: u32 {
        /// The translation existed; this is a permission failure, not a
        /// missing page.
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
    }
}

/// Why a task is being torn down, as reported to its pager in an
/// `EXCEPTION` message.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ExceptionReason {
    /// The task asked to exit.
    GraceExit = 0,
    /// The kernel ran out of memory servicing the task.
    NoKernelMemory = 1,
    /// The task's pager replied with a message the kernel did not expect.
    InvalidMsgFromPager = 2,
    /// The task handed the kernel a pointer it may not use.
    InvalidMemoryAccess = 3,
    /// The task executed an illegal operation.
    InvalidOp = 4,
    /// A kernel-originated IPC on the task's behalf failed.
    AbortedKernelIpc = 5,
}

impl core::convert::TryFrom<u32> for ExceptionReason {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, ()> {
        match x {
            0 => Ok(Self::GraceExit),
            1 => Ok(Self::NoKernelMemory),
            2 => Ok(Self::InvalidMsgFromPager),
            3 => Ok(Self::InvalidMemoryAccess),
            4 => Ok(Self::InvalidOp),
            5 => Ok(Self::AbortedKernelIpc),
            _ => Err(()),
        }
    }
}

/// Enumeration of syscall numbers.
#[repr(u64)]
pub enum Sysnum {
    Spawn = 1,
    Kill = 2,
    SetAttrs = 3,
    Ipc = 4,
    ListenIrq = 5,
    WriteLog = 6,
    ReadLog = 7,
    Kdebug = 8,
    Map = 9,
}

/// We're using an explicit `TryFrom` impl for `Sysnum` instead of
/// `FromPrimitive` to keep the kernel free of `num-traits`.
impl core::convert::TryFrom<u64> for Sysnum {
    type Error = ();

    fn try_from(x: u64) -> Result<Self, ()> {
        match x {
            1 => Ok(Self::Spawn),
            2 => Ok(Self::Kill),
            3 => Ok(Self::SetAttrs),
            4 => Ok(Self::Ipc),
            5 => Ok(Self::ListenIrq),
            6 => Ok(Self::WriteLog),
            7 => Ok(Self::ReadLog),
            8 => Ok(Self::Kdebug),
            9 => Ok(Self::Map),
            _ => Err(()),
        }
    }
}

/// The message type word.
///
/// Non-negative values combine a 16-bit message ID with flag bits saying
/// whether the payload names an inline string or an out-of-line bulk
/// buffer. Negative values are error replies carrying an `Error` code,
/// which lets servers answer a request without a dedicated reply type.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable,
    KnownLayout,
)]
#[repr(transparent)]
pub struct MsgType(pub i32);

impl MsgType {
    /// Payload carries a pointer to an inline NUL-terminated string.
    pub const STR: i32 = 1 << 30;
    /// Payload names an out-of-line bulk buffer.
    pub const BULK: i32 = 1 << 29;

    pub const NOTIFICATIONS: Self = Self(1);
    pub const EXCEPTION: Self = Self(2);
    pub const PAGE_FAULT: Self = Self(3);
    pub const PAGE_FAULT_REPLY: Self = Self(4);
    pub const ABI_HOOK: Self = Self(5);
    pub const ABI_HOOK_REPLY: Self = Self(6);

    pub const ACCEPT_BULK: Self = Self(7);
    pub const ACCEPT_BULK_REPLY: Self = Self(8);
    pub const DO_BULK: Self = Self(9);
    pub const DO_BULK_REPLY: Self = Self(10);
    pub const VERIFY_BULK: Self = Self(11);
    pub const VERIFY_BULK_REPLY: Self = Self(12);

    pub const SERVE: Self = Self(13);
    pub const SERVE_REPLY: Self = Self(14);
    pub const LOOKUP: Self = Self(15);
    pub const LOOKUP_REPLY: Self = Self(16);
    pub const ALLOC_PAGES: Self = Self(17);
    pub const ALLOC_PAGES_REPLY: Self = Self(18);

    /// The 16-bit message ID, with the flag bits stripped.
    pub fn id(self) -> u16 {
        self.0 as u16
    }

    pub fn has_bulk(self) -> bool {
        self.0 >= 0 && self.0 & Self::BULK != 0
    }

    /// The error carried by an error reply, if this is one.
    pub fn as_error(self) -> Option<Error> {
        if self.0 < 0 {
            Error::from_code(self.0 as i64)
        } else {
            None
        }
    }

    /// Compares message IDs, ignoring the flag bits.
    pub fn is(self, other: Self) -> bool {
        self.0 >= 0 && other.0 >= 0 && self.id() == other.id()
    }
}

/// Byte length of the payload area of a message.
pub const MSG_PAYLOAD_LEN: usize = 152;

/// The fixed-size IPC message record.
///
/// Exactly one of these fits in the per-task inline buffer; larger
/// payloads go through the bulk protocol. The payload area is typed by
/// the message type word: use [`Message::with`] and [`Message::read`] to
/// move structured payloads in and out.
#[derive(
    Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct Message {
    pub ty: MsgType,
    /// Sending task, stamped by the kernel during delivery; 0 for
    /// kernel-originated messages.
    pub src: Tid,
    pub payload: [u8; MSG_PAYLOAD_LEN],
}

impl Message {
    pub fn new(ty: MsgType) -> Self {
        Self {
            ty,
            src: Tid::KERNEL,
            payload: [0; MSG_PAYLOAD_LEN],
        }
    }

    /// Builds a message with a structured payload.
    pub fn with<T: IntoBytes + Immutable>(ty: MsgType, payload: T) -> Self {
        let mut m = Self::new(ty);
        let bytes = payload.as_bytes();
        m.payload[..bytes.len()].copy_from_slice(bytes);
        m
    }

    /// Builds an error reply.
    pub fn error(e: Error) -> Self {
        Self::new(MsgType(e.code() as i32))
    }

    /// Reads the payload as `T`. Payload types are all (much) smaller
    /// than the payload area, so this only fails for malformed types.
    pub fn read<T: FromBytes>(&self) -> Option<T> {
        T::read_from_prefix(&self.payload).ok().map(|(v, _)| v)
    }
}

impl core::fmt::Debug for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Message")
            .field("ty", &self.ty)
            .field("src", &self.src)
            .finish_non_exhaustive()
    }
}

/// Payload of a `NOTIFICATIONS` message: the snapshot of the pending
/// bitset, which the kernel clears on delivery.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct NotificationsMsg {
    pub bits: u64,
}

/// Payload of an `EXCEPTION` message, sent to a task's pager when the
/// task exits or faults fatally.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ExceptionMsg {
    pub task: Tid,
    /// An `ExceptionReason`, kept raw for layout.
    pub reason: u32,
}

/// Payload of a `PAGE_FAULT` message, sent to the faulting task's pager.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct PageFaultMsg {
    pub vaddr: u64,
    pub ip: u64,
    pub task: Tid,
    /// `FaultFlags`, kept raw for layout.
    pub fault: u32,
}

/// Number of machine words in the trap frame relayed by ABI emulation
/// hooks. The arch layer defines the actual register assignment.
pub const TRAP_FRAME_WORDS: usize = 16;

/// Payload of an `ABI_HOOK` message and its reply.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct AbiHookMsg {
    pub frame: [u64; TRAP_FRAME_WORDS],
    pub task: Tid,
    pub hook: u32,
}

/// Payload of `ACCEPT_BULK`: the receiver's declaration of its reception
/// buffer.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct AcceptBulkMsg {
    pub addr: u64,
    pub len: u64,
}

/// Payload of `DO_BULK`: a sender's request to copy into `dst`'s accepted
/// buffer.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct DoBulkMsg {
    pub addr: u64,
    pub len: u64,
    pub dst: Tid,
    pub reserved: u32,
}

/// Payload of `DO_BULK_REPLY`: names the destination buffer the payload
/// landed in, which the receiver quotes back in `VERIFY_BULK`.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct DoBulkReply {
    pub id: u64,
}

/// Payload of `VERIFY_BULK`: the receiver's claim about the transfer it
/// is consuming.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct VerifyBulkMsg {
    pub id: u64,
    pub len: u64,
    pub src: Tid,
    pub reserved: u32,
}

/// Payload of `VERIFY_BULK_REPLY`.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct VerifyBulkReply {
    pub received_at: u64,
}

/// Maximum length of a registered service name.
pub const SERVICE_NAME_LEN: usize = 32;

/// Payload of `SERVE` and `LOOKUP`: a padded service name.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ServiceNameMsg {
    pub name: [u8; SERVICE_NAME_LEN],
}

/// Payload of `LOOKUP_REPLY`.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct LookupReply {
    pub task: Tid,
    pub reserved: u32,
}

/// Payload of `ALLOC_PAGES`: `paddr` of zero means "any frame"; nonzero
/// requests that specific physical range.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct AllocPagesMsg {
    pub paddr: u64,
    pub num_pages: u64,
}

/// Payload of `ALLOC_PAGES_REPLY`.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct AllocPagesReply {
    pub vaddr: u64,
    pub paddr: u64,
}

/// Magic number at the start of a boot image header, so the kernel knows
/// it is not mapping uninitialized flash.
pub const IMAGE_MAGIC: u32 = 0xB007_AB1E;

/// Candidate offsets of the header within the embedded image; which one
/// is used depends on the architecture's alignment requirements.
pub const IMAGE_HEADER_OFFSETS: [usize; 2] = [0x1000, 0x10000];

/// Boot image header. `num_mappings` `ImageMapping` records follow
/// immediately.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ImageHeader {
    pub magic: u32,
    pub num_mappings: u32,
    /// Entry point of the initial task.
    pub entry: u64,
    /// Name for the initial task, padded.
    pub name: [u8; TASK_NAME_LEN],
}

/// One segment of the boot image to map into the initial task.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout,
)]
#[repr(C)]
pub struct ImageMapping {
    /// Where the segment lands in the initial task's address space.
    pub vaddr: u64,
    /// Byte offset of the segment's data within the image.
    pub offset: u64,
    pub num_pages: u32,
    /// Nonzero for segments backed by fresh zeroed frames instead of
    /// image data (.bss, stacks).
    pub zeroed: u32,
}
